//! Worker seam.
//!
//! The solver hands a worker fully resolved mounts plus process metadata;
//! what "running a process" means (namespaces, VMs, chroots) is the
//! worker's business. Stdout/stderr sinks wrap writes into progress log
//! events upstream.

pub mod local;

use crate::snapshot::Mount;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;

/// Process metadata for an exec operation.
#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub cwd: String,
}

#[async_trait]
pub trait Worker: Send + Sync {
    /// Run the process described by `meta` against `mounts` (destination
    /// path -> resolved mount set), streaming output into the sinks.
    async fn exec(
        &self,
        meta: &Meta,
        mounts: &HashMap<String, Vec<Mount>>,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> anyhow::Result<()>;
}
