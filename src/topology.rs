//! MongoDB cluster topology document.
//!
//! The document is read, overwritten from the address book, and persisted
//! once per deployment cycle, before any daemon is started.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};
use crate::types::AddressBook;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub port: u16,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub set_name: String,
    pub port: u16,
    pub members: Vec<String>,
}

impl ReplicaSet {
    /// `set/host:port,host:port` as taken by `--configdb`.
    pub fn connection_string(&self) -> String {
        let hosts: Vec<String> = self
            .members
            .iter()
            .map(|m| format!("{}:{}", m, self.port))
            .collect();
        format!("{}/{}", self.set_name, hosts.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    #[serde(rename = "log")]
    pub log_path: String,
    #[serde(rename = "mongos")]
    pub router: Router,
    #[serde(rename = "configs")]
    pub config_servers: ReplicaSet,
    pub shards: ReplicaSet,
}

impl ClusterTopology {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Topology(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Overwrite every member list from the address book.
    pub fn merge(&mut self, book: &AddressBook, log_path: impl Into<String>) {
        self.log_path = log_path.into();
        self.router.members = book.primary.clone();
        self.config_servers.members = book.auxiliary.clone();
        self.shards.members = book.data.clone();
    }

    /// Read, merge, and persist in one step.
    pub fn materialize(path: &Path, book: &AddressBook, log_path: impl Into<String>) -> Result<Self> {
        let mut topology = Self::load(path)?;
        topology.merge(book, log_path);
        topology.save(path)?;
        Ok(topology)
    }
}
