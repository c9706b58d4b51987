use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::types::Role;

/// Orchestration-level failures. Any of these aborts the run.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid network address: {0:?}")]
    InvalidAddress(String),

    #[error("address book is missing hosts for the {0} group")]
    MissingRoleGroup(Role),

    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("topology error: {0}")]
    Topology(String),

    #[error("phase '{phase}' failed: {failed} of {total} targets reported errors")]
    PhaseFailed {
        phase: String,
        failed: usize,
        total: usize,
    },

    #[error("admin command {command} failed: {reason}")]
    Admin { command: String, reason: String },

    #[error("cannot patch config: {0}")]
    ConfigPatch(String),
}

pub type Result<T> = std::result::Result<T, DeployError>;

/// Failure of a single dispatched command. Stored inside results, never raised.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecError {
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("io error while running command: {0}")]
    Io(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout(_))
    }
}
