//! Naive directory snapshotter.
//!
//! Stores every snapshot as a plain directory under the configured root and
//! copies the parent tree on prepare. No copy-on-write, no overlays; this
//! exists so the engine can run end to end on any filesystem and so tests
//! have real storage to exercise. Views are bind mounts of the committed
//! tree tracked by a marker file.

use crate::error::{Result, StrataError};
use crate::snapshot::{Mount, Snapshotter};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct DirSnapshotter {
    root: PathBuf,
}

impl DirSnapshotter {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StrataError::Io { path: root.clone(), source: e })?;
        Ok(Self { root })
    }

    fn dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn fs_dir(&self, key: &str) -> PathBuf {
        self.dir(key).join("fs")
    }

    fn view_marker(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.view", key))
    }

    fn bind_mount(path: PathBuf, writable: bool) -> Vec<Mount> {
        vec![Mount {
            mount_type: "bind".to_string(),
            source: path,
            options: vec!["rbind".to_string(), if writable { "rw" } else { "ro" }.to_string()],
        }]
    }
}

#[async_trait]
impl Snapshotter for DirSnapshotter {
    fn name(&self) -> &'static str {
        "dir"
    }

    async fn prepare(&self, key: &str, parent: Option<&str>) -> Result<()> {
        let fs_dir = self.fs_dir(key);
        if fs_dir.exists() {
            return Err(StrataError::Snapshotter {
                key: key.to_string(),
                reason: "snapshot already exists".to_string(),
            });
        }
        fs::create_dir_all(&fs_dir)
            .map_err(|e| StrataError::Io { path: fs_dir.clone(), source: e })?;
        if let Some(parent) = parent {
            let parent_fs = self.fs_dir(parent);
            if !parent_fs.exists() {
                return Err(StrataError::Snapshotter {
                    key: key.to_string(),
                    reason: format!("parent snapshot {} does not exist", parent),
                });
            }
            copy_tree(&parent_fs, &fs_dir)?;
        }
        debug!(key, ?parent, "prepared snapshot");
        Ok(())
    }

    async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let fs_dir = self.fs_dir(key);
        if !fs_dir.exists() {
            return Err(StrataError::NotFound { id: key.to_string() });
        }
        Ok(Self::bind_mount(fs_dir, true))
    }

    async fn commit(&self, name: &str, key: &str) -> Result<()> {
        let src = self.dir(key);
        let dst = self.dir(name);
        if !src.exists() {
            return Err(StrataError::NotFound { id: key.to_string() });
        }
        if dst.exists() {
            return Err(StrataError::Snapshotter {
                key: name.to_string(),
                reason: "commit target already exists".to_string(),
            });
        }
        fs::rename(&src, &dst).map_err(|e| StrataError::Io { path: dst, source: e })?;
        debug!(key, name, "committed snapshot");
        Ok(())
    }

    async fn view(&self, key: &str, parent: &str) -> Result<Vec<Mount>> {
        let parent_fs = self.fs_dir(parent);
        if !parent_fs.exists() {
            return Err(StrataError::NotFound { id: parent.to_string() });
        }
        let marker = self.view_marker(key);
        fs::write(&marker, parent.as_bytes())
            .map_err(|e| StrataError::Io { path: marker, source: e })?;
        Ok(Self::bind_mount(parent_fs, false))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let marker = self.view_marker(key);
        if marker.exists() {
            fs::remove_file(&marker).map_err(|e| StrataError::Io { path: marker, source: e })?;
            return Ok(());
        }
        let dir = self.dir(key);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| StrataError::Io { path: dir, source: e })?;
        }
        Ok(())
    }

    async fn usage(&self, key: &str) -> Result<i64> {
        let dir = self.dir(key);
        if !dir.exists() {
            return Err(StrataError::NotFound { id: key.to_string() });
        }
        tree_size(&dir)
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src).map_err(|e| StrataError::Io { path: src.into(), source: e })? {
        let entry = entry.map_err(|e| StrataError::Io { path: src.into(), source: e })?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ty = entry.file_type().map_err(|e| StrataError::Io { path: from.clone(), source: e })?;
        if ty.is_dir() {
            fs::create_dir_all(&to).map_err(|e| StrataError::Io { path: to.clone(), source: e })?;
            copy_tree(&from, &to)?;
        } else if ty.is_symlink() {
            let target =
                fs::read_link(&from).map_err(|e| StrataError::Io { path: from, source: e })?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &to)
                .map_err(|e| StrataError::Io { path: to, source: e })?;
        } else {
            fs::copy(&from, &to).map_err(|e| StrataError::Io { path: to, source: e })?;
        }
    }
    Ok(())
}

fn tree_size(dir: &Path) -> Result<i64> {
    let mut total = 0i64;
    for entry in fs::read_dir(dir).map_err(|e| StrataError::Io { path: dir.into(), source: e })? {
        let entry = entry.map_err(|e| StrataError::Io { path: dir.into(), source: e })?;
        let meta =
            entry.metadata().map_err(|e| StrataError::Io { path: entry.path(), source: e })?;
        if meta.is_dir() {
            total += tree_size(&entry.path())?;
        } else {
            total += meta.len() as i64;
        }
    }
    Ok(total)
}
