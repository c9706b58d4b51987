//! Common test utilities for integration tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use deploy_cluster::config::Config;
use deploy_cluster::error::Result;
use deploy_cluster::executor::{DaemonHandle, Dispatcher, LaunchSpec};
use deploy_cluster::types::{AddressBook, CommandTarget, ExecutionResult, Output};

type Responder = Box<dyn Fn(&CommandTarget) -> Output + Send + Sync>;

/// Dispatcher that records every batch and answers from a responder
/// instead of running anything.
pub struct RecordingDispatcher {
    local: HashSet<String>,
    batches: Mutex<Vec<Vec<CommandTarget>>>,
    launched: Mutex<Vec<LaunchSpec>>,
    responder: Responder,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self {
            local: HashSet::new(),
            batches: Mutex::new(Vec::new()),
            launched: Mutex::new(Vec::new()),
            responder: Box::new(default_response),
        }
    }

    /// Treat these hosts as this machine.
    pub fn with_local<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CommandTarget) -> Output + Send + Sync + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    pub fn batches(&self) -> Vec<Vec<CommandTarget>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(Vec::len).collect()
    }

    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.launched.lock().unwrap().clone()
    }

    /// Command lines of every recorded target, flattened in dispatch order.
    pub fn lines(&self) -> Vec<String> {
        self.batches()
            .into_iter()
            .flatten()
            .map(|t| t.command.to_string())
            .collect()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn is_self(&self, host: &str) -> Result<bool> {
        Ok(self.local.contains(host))
    }

    async fn execute(&self, targets: Vec<CommandTarget>) -> Result<Vec<ExecutionResult>> {
        self.batches.lock().unwrap().push(targets.clone());
        Ok(targets
            .into_iter()
            .map(|t| {
                let out = (self.responder)(&t);
                ExecutionResult::completed(t, out)
            })
            .collect())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<DaemonHandle> {
        self.launched.lock().unwrap().push(spec.clone());
        let child = tokio::process::Command::new("true").spawn()?;
        Ok(DaemonHandle::new(spec.label.clone(), child))
    }
}

/// Admin shells answer ok, everything else succeeds silently.
pub fn default_response(target: &CommandTarget) -> Output {
    let line = target.command.to_string();
    if line.contains("adminCommand") {
        ok_output("{\"ok\":1}\n")
    } else {
        Output::default()
    }
}

pub fn ok_output(stdout: &str) -> Output {
    Output {
        stdout: stdout.into(),
        exit_code: Some(0),
        ..Default::default()
    }
}

pub fn err_output(stderr: &str) -> Output {
    Output {
        stderr: stderr.into(),
        exit_code: Some(1),
        ..Default::default()
    }
}

/// One primary, two data hosts, one auxiliary host.
pub fn small_book() -> AddressBook {
    AddressBook {
        primary: vec!["10.0.0.1".into()],
        data: vec!["10.0.0.2".into(), "10.0.0.3".into()],
        auxiliary: vec!["10.0.0.4".into()],
    }
}

/// Config with fast readiness retries and the topology document under `dir`.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.local_root = dir.to_path_buf();
    config.mongodb.topology = dir.join("cluster.json");
    config.readiness.initial_delay_ms = 1;
    config.readiness.max_delay_ms = 2;
    config
}

pub fn write_topology(path: &Path) {
    let doc = serde_json::json!({
        "log": "",
        "mongos": { "port": 27017, "members": [] },
        "configs": { "set_name": "cfg", "port": 27019, "members": [] },
        "shards": { "set_name": "rs0", "port": 27018, "members": [] },
    });
    std::fs::write(path, doc.to_string()).expect("Failed to write topology");
}
