//! Development worker.
//!
//! Runs argv directly on the host against the root mount's directory with
//! no isolation whatsoever. Good enough to exercise the engine end to end;
//! a production worker is a separate component.

use crate::snapshot::Mount;
use crate::worker::{Meta, Worker};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use tokio::process::Command;
use tracing::debug;

#[derive(Default)]
pub struct LocalWorker {}

impl LocalWorker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Worker for LocalWorker {
    async fn exec(
        &self,
        meta: &Meta,
        mounts: &HashMap<String, Vec<Mount>>,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> anyhow::Result<()> {
        let root = mounts
            .get("/")
            .and_then(|m| m.first())
            .map(|m| m.source.clone())
            .ok_or_else(|| anyhow!("no root mount"))?;
        let (program, rest) = meta.args.split_first().ok_or_else(|| anyhow!("empty argv"))?;

        let cwd = root.join(meta.cwd.trim_start_matches('/'));
        std::fs::create_dir_all(&cwd).with_context(|| format!("creating cwd {:?}", cwd))?;

        let mut cmd = Command::new(program);
        cmd.args(rest).current_dir(&cwd).env("STRATA_ROOT_MOUNT", &root);
        for pair in &meta.env {
            if let Some((k, v)) = pair.split_once('=') {
                cmd.env(k, v);
            }
        }

        debug!(args = ?meta.args, root = %root.display(), "exec");
        let output = cmd.output().await.with_context(|| format!("spawning {}", program))?;
        stdout.write_all(&output.stdout).ok();
        stderr.write_all(&output.stderr).ok();
        if !output.status.success() {
            bail!("process exited with {}", output.status);
        }
        Ok(())
    }
}
