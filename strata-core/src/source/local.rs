//! Built-in `local://` source.
//!
//! Materializes a named directory under the configured context root into a
//! committed snapshot. This is the one source the daemon ships with;
//! registry and git pullers are plugins.

use crate::cache::{CacheManager, ImmutableRef};
use crate::error::{Result, StrataError};
use crate::source::{Identifier, Source};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct LocalSource {
    cache: CacheManager,
    /// Directory under which named contexts are resolved.
    root: PathBuf,
}

impl LocalSource {
    pub fn new(cache: CacheManager, root: impl Into<PathBuf>) -> Self {
        Self { cache, root: root.into() }
    }
}

#[async_trait]
impl Source for LocalSource {
    fn scheme(&self) -> &'static str {
        "local"
    }

    async fn pull(&self, id: &Identifier) -> Result<ImmutableRef> {
        let Identifier::Local { name, .. } = id else {
            return Err(StrataError::InvalidIdentifier { identifier: id.to_string() });
        };
        // Context names are plain directory names, never paths.
        if name.contains('/') || name.contains("..") {
            return Err(StrataError::InvalidIdentifier { identifier: id.to_string() });
        }
        let context = self.root.join(name);
        if !context.is_dir() {
            return Err(StrataError::NotFound { id: id.to_string() });
        }

        let active = self.cache.new_mutable(None).await?;
        let mounts = active.mount(false).await?;
        let target = mounts
            .first()
            .map(|m| m.source.clone())
            .ok_or_else(|| StrataError::Internal("local source got no mounts".to_string()))?;
        copy_context(&context, &target)?;
        info!(name, id = active.id(), "imported local context");
        active.commit()
    }
}

fn copy_context(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src).map_err(|e| StrataError::Io { path: src.into(), source: e })? {
        let entry = entry.map_err(|e| StrataError::Io { path: src.into(), source: e })?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ty = entry.file_type().map_err(|e| StrataError::Io { path: from.clone(), source: e })?;
        if ty.is_dir() {
            fs::create_dir_all(&to).map_err(|e| StrataError::Io { path: to.clone(), source: e })?;
            copy_context(&from, &to)?;
        } else if ty.is_file() {
            fs::copy(&from, &to).map_err(|e| StrataError::Io { path: to, source: e })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManagerOpt;
    use crate::content::{MemoryContentStore, MemoryLeaseManager};
    use crate::snapshot::local::DirSnapshotter;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(root: &Path) -> CacheManager {
        CacheManager::new(CacheManagerOpt {
            root: root.to_path_buf(),
            snapshotter: Arc::new(DirSnapshotter::new(root.join("snapshots")).unwrap()),
            content_store: Arc::new(MemoryContentStore::new()),
            lease_manager: Arc::new(MemoryLeaseManager::new()),
            identity_mapping: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_pull_local_context() {
        let tmp = TempDir::new().unwrap();
        let contexts = tmp.path().join("contexts");
        fs::create_dir_all(contexts.join("app/subdir")).unwrap();
        fs::write(contexts.join("app/main.txt"), b"content").unwrap();
        fs::write(contexts.join("app/subdir/nested.txt"), b"more").unwrap();

        let cache = manager(tmp.path());
        let source = LocalSource::new(cache, &contexts);

        let id = Identifier::from_op("local://app", &HashMap::new()).unwrap();
        let snap = source.pull(&id).await.unwrap();

        let mounts = snap.mount(true).await.unwrap();
        assert!(mounts[0].source.join("main.txt").exists());
        assert!(mounts[0].source.join("subdir/nested.txt").exists());
    }

    #[tokio::test]
    async fn test_pull_rejects_traversal_and_missing() {
        let tmp = TempDir::new().unwrap();
        let cache = manager(tmp.path());
        let source = LocalSource::new(cache, tmp.path().join("contexts"));

        let id = Identifier::Local { name: "../escape".to_string(), session_id: None };
        assert!(source.pull(&id).await.is_err());

        let id = Identifier::Local { name: "missing".to_string(), session_id: None };
        assert!(matches!(source.pull(&id).await, Err(StrataError::NotFound { .. })));
    }
}
