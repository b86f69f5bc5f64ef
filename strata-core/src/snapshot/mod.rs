//! Snapshot driver interface.
//!
//! The ref store drives an external snapshotter through this trait; the
//! on-disk driver itself is a collaborator. A snapshot is either *active*
//! (writable, keyed) or *committed* (immutable, named). Mounts describe how
//! a snapshot is exposed to a worker.

use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;

pub mod local;

/// A single mount entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Filesystem type, e.g. "bind" or "overlay".
    pub mount_type: String,
    /// Mount source path.
    pub source: PathBuf,
    /// Mount options.
    pub options: Vec<String>,
}

/// One uid/gid range remapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Process-wide uid/gid remap table shared by all mounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMapping {
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
}

/// Driver interface for snapshot storage.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create a new active snapshot keyed by `key`, layered on the
    /// committed snapshot `parent` when given.
    async fn prepare(&self, key: &str, parent: Option<&str>) -> Result<()>;

    /// Mounts for an active snapshot.
    async fn mounts(&self, key: &str) -> Result<Vec<Mount>>;

    /// Commit the active snapshot `key` under the immutable name `name`.
    /// The active key is consumed.
    async fn commit(&self, name: &str, key: &str) -> Result<()>;

    /// Create a short-lived view snapshot `key` of the committed snapshot
    /// `parent` and return its mounts.
    async fn view(&self, key: &str, parent: &str) -> Result<Vec<Mount>>;

    /// Remove a snapshot or view. Removing an unknown key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Disk usage of a snapshot in bytes.
    async fn usage(&self, key: &str) -> Result<i64>;
}

/// Rewrite mounts to be read-only.
///
/// Overlay mounts absorb the upper layer into `lowerdir` and drop
/// `workdir`; all other mounts have `rw` stripped and `ro` appended.
pub fn readonly(mounts: Vec<Mount>) -> Vec<Mount> {
    mounts
        .into_iter()
        .map(|mut m| {
            if m.mount_type == "overlay" {
                m.options = readonly_overlay(m.options);
            } else {
                m.options.retain(|o| o != "rw");
                m.options.push("ro".to_string());
            }
            m
        })
        .collect()
}

fn readonly_overlay(opts: Vec<String>) -> Vec<String> {
    let mut upper = None;
    let mut out = Vec::with_capacity(opts.len());
    for o in opts {
        if let Some(u) = o.strip_prefix("upperdir=") {
            upper = Some(u.to_string());
        } else if !o.starts_with("workdir=") {
            out.push(o);
        }
    }
    if let Some(upper) = upper {
        for o in out.iter_mut() {
            if let Some(lower) = o.strip_prefix("lowerdir=") {
                *o = format!("lowerdir={}:{}", upper, lower);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(mount_type: &str, options: &[&str]) -> Mount {
        Mount {
            mount_type: mount_type.to_string(),
            source: PathBuf::from("/src"),
            options: options.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_readonly_bind() {
        let out = readonly(vec![mount("bind", &["rbind", "rw"])]);
        assert_eq!(out[0].options, vec!["rbind", "ro"]);
    }

    #[test]
    fn test_readonly_overlay_absorbs_upper() {
        let out = readonly(vec![mount(
            "overlay",
            &["index=off", "lowerdir=/l2:/l1", "upperdir=/up", "workdir=/work"],
        )]);
        assert_eq!(out[0].options, vec!["index=off", "lowerdir=/up:/l2:/l1"]);
    }

    #[test]
    fn test_readonly_overlay_without_upper() {
        let out = readonly(vec![mount("overlay", &["lowerdir=/l1", "workdir=/work"])]);
        assert_eq!(out[0].options, vec!["lowerdir=/l1"]);
    }
}
