//! Data structures shared by the executor and the lifecycle orchestrators.
//!
//! The address book is the static topology of a run: three ordered role
//! groups loaded once from JSON. Command targets pair a host with the
//! command to run there; execution results pair each target with what
//! came back.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, ExecError, Result};

/// Role groups of the address book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Write masters (redis) or query routers (mongodb).
    Primary,
    /// Replicas (redis) or shard members (mongodb).
    Data,
    /// Sentinels (redis) or config servers (mongodb).
    Auxiliary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("main"),
            Role::Data => f.write_str("data"),
            Role::Auxiliary => f.write_str("misc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Database {
    Redis,
    Mongodb,
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Database::Redis => f.write_str("redis"),
            Database::Mongodb => f.write_str("mongodb"),
        }
    }
}

/// Static cluster topology, grouped by role.
///
/// Iteration order is primary, data, auxiliary. That order is the default
/// dispatch order for topology-wide batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddressBook {
    #[serde(rename = "main", default)]
    pub primary: Vec<String>,
    #[serde(default)]
    pub data: Vec<String>,
    #[serde(rename = "misc", default)]
    pub auxiliary: Vec<String>,
}

impl AddressBook {
    /// Load and validate an address book. A path without an extension gets `.json`.
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        let mut path = PathBuf::from(path.as_ref());
        if path.extension().is_none() {
            path.set_extension("json");
        }
        let raw = std::fs::read_to_string(&path)?;
        let book: AddressBook = serde_json::from_str(&raw)?;
        book.validate()?;
        Ok(book)
    }

    /// Either every group is populated or every group is empty.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        for role in [Role::Primary, Role::Data, Role::Auxiliary] {
            if self.group(role).is_empty() {
                return Err(DeployError::MissingRoleGroup(role));
            }
        }
        for host in self.iter() {
            validate_host(host)?;
        }
        Ok(())
    }

    /// An empty book is a valid value that makes every operation a no-op.
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.data.is_empty() && self.auxiliary.is_empty()
    }

    pub fn group(&self, role: Role) -> &[String] {
        match role {
            Role::Primary => &self.primary,
            Role::Data => &self.data,
            Role::Auxiliary => &self.auxiliary,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.primary
            .iter()
            .chain(self.data.iter())
            .chain(self.auxiliary.iter())
    }

    /// Distinct hosts in iteration order.
    pub fn hosts(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for host in self.iter() {
            if !seen.contains(&host.as_str()) {
                seen.push(host.as_str());
            }
        }
        seen
    }
}

/// Accepts IP literals and RFC 1123 host names.
pub fn validate_host(host: &str) -> Result<()> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let invalid = || DeployError::InvalidAddress(host.to_string());
    if host.is_empty() || host.len() > 253 {
        return Err(invalid());
    }
    // dotted all-numeric strings that failed to parse are malformed IPs
    if host.split('.').all(|l| l.chars().all(|c| c.is_ascii_digit())) {
        return Err(invalid());
    }
    for label in host.trim_end_matches('.').split('.') {
        let ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !ok {
            return Err(invalid());
        }
    }
    Ok(())
}

/// What to do on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// A shell command line executed on the host.
    Shell { line: String },
    /// Copy a local file to `dest` on the host.
    Push { source: PathBuf, dest: String },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Shell { line } => f.write_str(line),
            Command::Push { source, dest } => write!(f, "push {} -> {}", source.display(), dest),
        }
    }
}

/// One remote execution unit: who runs what, where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandTarget {
    pub user: String,
    pub host: String,
    pub command: Command,
}

impl CommandTarget {
    pub fn shell(user: &str, host: &str, line: impl Into<String>) -> Result<Self> {
        validate_host(host)?;
        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            command: Command::Shell { line: line.into() },
        })
    }

    pub fn push(user: &str, host: &str, source: impl Into<PathBuf>, dest: impl Into<String>) -> Result<Self> {
        validate_host(host)?;
        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            command: Command::Push {
                source: source.into(),
                dest: dest.into(),
            },
        })
    }
}

impl fmt::Display for CommandTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.command, self.host)
    }
}

/// Captured standard streams of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stdout)?;
        if !self.stderr.is_empty() {
            write!(f, "{}", self.stderr)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed(Output),
    Failed { error: ExecError },
}

/// Result of one dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub target: CommandTarget,
    pub outcome: Outcome,
}

impl ExecutionResult {
    pub fn completed(target: CommandTarget, output: Output) -> Self {
        Self {
            target,
            outcome: Outcome::Completed(output),
        }
    }

    pub fn failed(target: CommandTarget, error: ExecError) -> Self {
        Self {
            target,
            outcome: Outcome::Failed { error },
        }
    }

    /// Failed if the command never completed or wrote anything to stderr.
    pub fn is_error(&self) -> bool {
        match &self.outcome {
            Outcome::Completed(out) => !out.stderr.is_empty(),
            Outcome::Failed { .. } => true,
        }
    }

    pub fn output(&self) -> Option<&Output> {
        match &self.outcome {
            Outcome::Completed(out) => Some(out),
            Outcome::Failed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> AddressBook {
        AddressBook {
            primary: vec!["10.0.0.1".into()],
            data: vec!["10.0.0.2".into(), "10.0.0.3".into()],
            auxiliary: vec!["10.0.0.4".into()],
        }
    }

    #[test]
    fn iteration_order_is_primary_data_auxiliary() {
        let order: Vec<_> = book().iter().cloned().collect();
        assert_eq!(order, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
    }

    #[test]
    fn partially_populated_book_is_rejected() {
        let mut b = book();
        b.auxiliary.clear();
        assert!(matches!(
            b.validate(),
            Err(DeployError::MissingRoleGroup(Role::Auxiliary))
        ));
        assert!(AddressBook::default().validate().is_ok());
    }

    #[test]
    fn hosts_are_deduplicated_in_order() {
        let mut b = book();
        b.auxiliary.push("10.0.0.1".into());
        assert_eq!(b.hosts(), vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
    }

    #[test]
    fn parses_role_group_key_names() {
        let raw = r#"{"main": ["a.example"], "data": ["10.1.1.1"], "misc": ["node-3"]}"#;
        let b: AddressBook = serde_json::from_str(raw).unwrap();
        assert_eq!(b.primary, vec!["a.example"]);
        assert_eq!(b.auxiliary, vec!["node-3"]);
        assert!(b.validate().is_ok());
    }

    #[test]
    fn host_syntax() {
        assert!(validate_host("10.0.0.1").is_ok());
        assert!(validate_host("::1").is_ok());
        assert!(validate_host("db-1.cluster.local").is_ok());
        assert!(validate_host("10.0.0").is_err());
        assert!(validate_host("999.1.1.1").is_err());
        assert!(validate_host("-bad.host").is_err());
        assert!(validate_host("has space").is_err());
        assert!(validate_host("").is_err());
    }

    #[test]
    fn stderr_marks_result_as_error() {
        let target = CommandTarget::shell("cc", "10.0.0.1", "true").unwrap();
        let clean = ExecutionResult::completed(target.clone(), Output::default());
        assert!(!clean.is_error());

        let noisy = ExecutionResult::completed(
            target.clone(),
            Output {
                stderr: "fatal: already exists".into(),
                ..Default::default()
            },
        );
        assert!(noisy.is_error());

        let timed_out = ExecutionResult::failed(
            target,
            ExecError::Timeout(std::time::Duration::from_secs(8)),
        );
        assert!(timed_out.is_error());
    }

    #[test]
    fn outcome_tag_survives_exit_code() {
        let target = CommandTarget::shell("cc", "10.0.0.1", "true").unwrap();
        let done = ExecutionResult::completed(
            target,
            Output {
                stdout: "ok\n".into(),
                exit_code: Some(0),
                ..Default::default()
            },
        );

        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["outcome"]["status"], "completed");
        assert_eq!(json["outcome"]["exit_code"], 0);
        assert_eq!(json["outcome"]["stdout"], "ok\n");
    }

    #[test]
    fn invalid_host_rejected_at_construction() {
        assert!(matches!(
            CommandTarget::shell("cc", "not a host", "ls"),
            Err(DeployError::InvalidAddress(_))
        ));
    }
}
