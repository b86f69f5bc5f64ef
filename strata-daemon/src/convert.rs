//! Domain → proto conversions for the control surface.

use std::time::{SystemTime, UNIX_EPOCH};
use strata_api::strata::v1 as pb;
use strata_core::{SolveStatus, VertexLog, VertexStatus};

fn unix_ms(t: Option<SystemTime>) -> i64 {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok()).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn vertex(v: &VertexStatus) -> pb::Vertex {
    pb::Vertex {
        digest: v.digest.to_string(),
        name: v.name.clone(),
        inputs: v.inputs.iter().map(|d| d.to_string()).collect(),
        started_ms: unix_ms(v.started),
        completed_ms: unix_ms(v.completed),
    }
}

fn vertex_log(l: &VertexLog) -> pb::VertexLog {
    pb::VertexLog {
        stream: l.stream,
        data: l.data.clone(),
        timestamp_ms: unix_ms(Some(l.timestamp)),
    }
}

pub fn solve_status(s: &SolveStatus) -> pb::StatusResponse {
    pb::StatusResponse {
        vertexes: s.vertexes.iter().map(vertex).collect(),
        logs: s.logs.iter().map(vertex_log).collect(),
    }
}

/// Flatten an error chain into one line for RPC status messages.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        out.push_str(": ");
        out.push_str(&e.to_string());
        source = e.source();
    }
    out
}
