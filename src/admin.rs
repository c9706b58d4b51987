//! Database admin clients.
//!
//! The orchestrators never speak a wire protocol themselves. Admin
//! commands are rendered as invocations of the stock shells (`mongosh`,
//! `redis-cli`) on a member host and shipped through the executor like
//! any other command, so they batch and time out the same way.

use serde_json::{json, Value};

use crate::error::{DeployError, Result};
use crate::executor::{quote, Dispatcher};
use crate::types::{CommandTarget, ExecutionResult};

/// Renders admin commands for one database kind.
pub trait AdminClient: Send + Sync {
    /// Target that runs `command` against the daemon at `host:port`.
    fn command_target(&self, user: &str, host: &str, port: u16, command: &Value) -> Result<CommandTarget>;

    /// Target that asks the daemon at `host:port` to shut down.
    fn shutdown_target(&self, user: &str, host: &str, port: u16) -> Result<CommandTarget>;

    /// Decoded reply of a finished admin command, if it reported success.
    fn parse_reply(&self, result: &ExecutionResult) -> Option<Value>;
}

pub struct MongoShell {
    program: String,
}

impl MongoShell {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn eval(&self, host: &str, port: u16, script: &str) -> String {
        format!(
            "{} --host {} --port {} --quiet --eval {}",
            self.program,
            host,
            port,
            quote(script)
        )
    }
}

impl AdminClient for MongoShell {
    fn command_target(&self, user: &str, host: &str, port: u16, command: &Value) -> Result<CommandTarget> {
        let script = format!("JSON.stringify(db.adminCommand({}))", command);
        CommandTarget::shell(user, host, self.eval(host, port, &script))
    }

    fn shutdown_target(&self, user: &str, host: &str, port: u16) -> Result<CommandTarget> {
        // the server drops the connection while answering
        let script = "try { db.adminCommand({shutdown: 1, force: true}) } catch (e) {}";
        CommandTarget::shell(user, host, self.eval(host, port, script))
    }

    fn parse_reply(&self, result: &ExecutionResult) -> Option<Value> {
        if result.is_error() {
            return None;
        }
        let out = result.output()?;
        let line = out.stdout.lines().rev().find(|l| !l.trim().is_empty())?;
        let reply: Value = serde_json::from_str(line.trim()).ok()?;
        let ok = reply.get("ok").and_then(Value::as_f64).unwrap_or(0.0);
        (ok == 1.0).then_some(reply)
    }
}

pub struct RedisCli {
    program: String,
}

impl Default for RedisCli {
    fn default() -> Self {
        Self {
            program: "redis-cli".into(),
        }
    }
}

impl RedisCli {
    /// `redis-cli --cluster create` over every node, run from `host`.
    pub fn cluster_create_target(&self, user: &str, host: &str, nodes: &[String]) -> Result<CommandTarget> {
        let line = format!(
            "{} --cluster create {} --cluster-replicas 0 --cluster-yes",
            self.program,
            nodes.join(" ")
        );
        CommandTarget::shell(user, host, line)
    }
}

impl AdminClient for RedisCli {
    fn command_target(&self, user: &str, host: &str, port: u16, command: &Value) -> Result<CommandTarget> {
        let words = command
            .as_array()
            .ok_or_else(|| DeployError::Admin {
                command: command.to_string(),
                reason: "redis commands are arrays of words".into(),
            })?
            .iter()
            .map(|w| match w {
                Value::String(s) => quote(s),
                other => quote(&other.to_string()),
            })
            .collect::<Vec<_>>();
        let line = format!("{} -h {} -p {} {}", self.program, host, port, words.join(" "));
        CommandTarget::shell(user, host, line)
    }

    fn shutdown_target(&self, user: &str, host: &str, port: u16) -> Result<CommandTarget> {
        let line = format!("{} -h {} -p {} shutdown nosave", self.program, host, port);
        CommandTarget::shell(user, host, line)
    }

    fn parse_reply(&self, result: &ExecutionResult) -> Option<Value> {
        if result.is_error() {
            return None;
        }
        let out = result.output()?.stdout.trim();
        if out.starts_with("ERR") || out.starts_with("(error)") {
            return None;
        }
        Some(Value::String(out.to_string()))
    }
}

/// A dispatched admin command and its decoded reply, if it succeeded.
#[derive(Debug, Clone)]
pub struct AdminReply {
    pub result: ExecutionResult,
    pub reply: Option<Value>,
}

impl AdminReply {
    pub fn is_ok(&self) -> bool {
        self.reply.is_some()
    }
}

/// Run admin commands concurrently, one per `(host, port, command)`.
pub async fn run_admin_commands(
    dispatcher: &dyn Dispatcher,
    client: &dyn AdminClient,
    user: &str,
    commands: &[(&str, u16, Value)],
) -> Result<Vec<AdminReply>> {
    let targets = commands
        .iter()
        .map(|(host, port, doc)| client.command_target(user, host, *port, doc))
        .collect::<Result<Vec<_>>>()?;
    let results = dispatcher.execute(targets).await?;
    Ok(results
        .into_iter()
        .map(|result| AdminReply {
            reply: client.parse_reply(&result),
            result,
        })
        .collect())
}

/// Run one admin command.
pub async fn run_admin_command(
    dispatcher: &dyn Dispatcher,
    client: &dyn AdminClient,
    user: &str,
    host: &str,
    port: u16,
    command: &Value,
) -> Result<AdminReply> {
    run_admin_commands(dispatcher, client, user, &[(host, port, command.clone())])
        .await?
        .pop()
        .ok_or_else(|| DeployError::Admin {
            command: command.to_string(),
            reason: "no result returned".into(),
        })
}

/// Error for an admin command whose reply was missing or not ok.
pub fn admin_failure(command: &Value, reply: &AdminReply) -> DeployError {
    let reason = match reply.result.output() {
        Some(out) => format!("{} {}", out.stdout.trim(), out.stderr.trim()).trim().to_string(),
        None => crate::report::render(std::slice::from_ref(&reply.result)),
    };
    DeployError::Admin {
        command: command.to_string(),
        reason,
    }
}

/// `replSetInitiate` document naming every member of the set.
pub fn repl_set_initiate(set_name: &str, port: u16, members: &[String], config_server: bool) -> Value {
    let members: Vec<Value> = members
        .iter()
        .enumerate()
        .map(|(i, m)| json!({ "_id": i, "host": format!("{}:{}", m, port) }))
        .collect();
    let mut config = json!({ "_id": set_name, "members": members });
    if config_server {
        config["configsvr"] = Value::Bool(true);
    }
    json!({ "replSetInitiate": config })
}

/// `addShard` document for a shard replica set.
pub fn add_shard(set_name: &str, port: u16, members: &[String]) -> Value {
    let hosts: Vec<String> = members.iter().map(|m| format!("{}:{}", m, port)).collect();
    json!({ "addShard": format!("{}/{}", set_name, hosts.join(",")) })
}

pub fn ping() -> Value {
    json!({ "ping": 1 })
}
