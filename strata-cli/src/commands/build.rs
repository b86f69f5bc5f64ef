//! Build command: turn a JSON plan into a definition and solve it while
//! streaming status.

use crate::client::StrataClient;
use anyhow::{Context, Result};
use colored::Colorize;
use serde::Deserialize;
use std::io::Write;
use strata_api::strata::v1::Definition;
use strata_core::llb;

/// A linear build plan: one source followed by a chain of commands, each
/// layered on the previous step's output.
#[derive(Debug, Deserialize)]
struct BuildPlan {
    /// Scheme-qualified source identifier, e.g. "local://app".
    source: String,
    /// Commands to run in order (argv form).
    #[serde(default)]
    steps: Vec<Vec<String>>,
    /// KEY=VALUE pairs applied to every step.
    #[serde(default)]
    env: Vec<String>,
    /// Working directory for every step.
    #[serde(default)]
    cwd: Option<String>,
}

fn marshal_plan(plan: &BuildPlan) -> Result<Definition> {
    let mut state = llb::source(&plan.source);
    for step in &plan.steps {
        let mut run = state.run(step.clone());
        for pair in &plan.env {
            if let Some((k, v)) = pair.split_once('=') {
                run = run.env(k, v);
            }
        }
        if let Some(cwd) = &plan.cwd {
            run = run.cwd(cwd);
        }
        state = run.build().root();
    }
    let def = state.marshal().context("failed to marshal build plan")?;
    Ok(Definition { def: def.def })
}

pub async fn build(plan_path: &str, id: Option<String>) -> Result<()> {
    let content = std::fs::read_to_string(plan_path)
        .with_context(|| format!("failed to read plan {}", plan_path))?;
    let plan: BuildPlan = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse plan {}", plan_path))?;
    let definition = marshal_plan(&plan)?;

    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    println!("{} {}", "Building".green().bold(), id);

    let client = StrataClient::connect().await?;

    // Subscribe before the solve lands; the daemon holds the status call
    // until the job registers.
    let mut status_client = client.clone();
    let status_id = id.clone();
    let streamer = tokio::spawn(async move {
        let mut stream = status_client.status(&status_id).await?;
        while let Some(msg) = stream.message().await? {
            for v in &msg.vertexes {
                if v.completed_ms != 0 {
                    println!("{} {}", "✓".green(), v.name);
                } else if v.started_ms != 0 {
                    println!("{} {}", "▶".cyan(), v.name.cyan());
                }
            }
            for l in &msg.logs {
                if l.stream == 2 {
                    std::io::stderr().write_all(&l.data).ok();
                } else {
                    std::io::stdout().write_all(&l.data).ok();
                }
            }
        }
        anyhow::Ok(())
    });

    let mut solve_client = client;
    let solve_res = solve_client.solve(&id, definition).await;
    let stream_res = streamer.await;

    solve_res?;
    stream_res??;
    println!("{} {}", "Built".green().bold(), id);
    Ok(())
}
