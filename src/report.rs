//! Result aggregation and reporting.

use std::path::Path;

use log::{error, info};
use serde::Serialize;

use crate::error::Result;
use crate::executor::DaemonHandle;
use crate::types::{Database, ExecutionResult, Outcome};

/// Failed if the command never completed or wrote to stderr.
pub fn is_error(result: &ExecutionResult) -> bool {
    result.is_error()
}

/// One `finished cmd ...` paragraph per result, newline joined.
pub fn render(results: &[ExecutionResult]) -> String {
    results
        .iter()
        .map(|r| {
            let output = match &r.outcome {
                Outcome::Completed(out) => out.to_string(),
                Outcome::Failed { error } => error.to_string(),
            };
            format!(
                "finished cmd {} at {} with output:\n{}",
                r.target.command, r.target.host, output
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write the rendered report to `out`, or to the log when no path is given.
pub fn write(results: &[ExecutionResult], out: Option<&Path>) -> Result<()> {
    let text = render(results);
    match out {
        Some(path) => std::fs::write(path, text)?,
        None => info!("{}", text),
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Shutdown,
    Benchmark,
}

#[derive(Debug, Serialize)]
pub struct Phase {
    pub name: String,
    pub results: Vec<ExecutionResult>,
}

impl Phase {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_error()).count()
    }
}

/// Everything a run dispatched, grouped by phase in execution order.
#[derive(Debug, Serialize)]
pub struct Report {
    pub database: Database,
    pub action: Action,
    pub phases: Vec<Phase>,
    #[serde(serialize_with = "serialize_handles")]
    pub local: Vec<DaemonHandle>,
}

impl Report {
    pub fn new(database: Database, action: Action) -> Self {
        Self {
            database,
            action,
            phases: Vec::new(),
            local: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, results: Vec<ExecutionResult>) {
        self.phases.push(Phase {
            name: name.into(),
            results,
        });
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// All results in dispatch order.
    pub fn results(&self) -> Vec<ExecutionResult> {
        self.phases
            .iter()
            .flat_map(|p| p.results.iter().cloned())
            .collect()
    }

    pub fn failed(&self) -> usize {
        self.phases.iter().map(Phase::failed).sum()
    }

}

/// Log error counts, then write the text of every report to `out` (or the
/// log) and, when `json` is set, all reports there as one JSON array.
pub fn emit(reports: &[Report], out: Option<&Path>, json: Option<&Path>) -> Result<()> {
    for report in reports {
        let failed = report.failed();
        if failed > 0 {
            error!("{} {:?}: {} commands reported errors", report.database, report.action, failed);
        }
    }
    let results: Vec<ExecutionResult> = reports.iter().flat_map(Report::results).collect();
    write(&results, out)?;
    if let Some(path) = json {
        std::fs::write(path, serde_json::to_string_pretty(reports)?)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct HandleSummary<'a> {
    label: &'a str,
    pid: Option<u32>,
}

fn serialize_handles<S>(handles: &[DaemonHandle], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(handles.iter().map(|h| HandleSummary {
        label: &h.label,
        pid: h.pid(),
    }))
}
