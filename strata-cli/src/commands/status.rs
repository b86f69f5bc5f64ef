//! Status command: stream live progress for an in-flight build.

use crate::client::StrataClient;
use anyhow::Result;
use colored::Colorize;
use std::io::Write;

pub async fn status(id: &str) -> Result<()> {
    let mut client = StrataClient::connect().await?;
    let mut stream = client.status(id).await?;

    while let Some(msg) = stream.message().await? {
        for v in &msg.vertexes {
            let state = if v.completed_ms != 0 {
                "done".green()
            } else if v.started_ms != 0 {
                "running".cyan()
            } else {
                "pending".dimmed()
            };
            println!("{:>8} {} {}", state, short_digest(&v.digest).dimmed(), v.name);
        }
        for l in &msg.logs {
            if l.stream == 2 {
                std::io::stderr().write_all(&l.data).ok();
            } else {
                std::io::stdout().write_all(&l.data).ok();
            }
        }
    }
    Ok(())
}

fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    hex.chars().take(12).collect()
}
