use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Login used for every ssh/scp target.
    pub user: String,
    /// Repository cloned onto each host; it carries the role config files.
    pub repo_url: String,
    /// Checkout directory on remote hosts, relative to the login's home.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_root: Option<String>,
    /// Checkout directory on this machine.
    pub local_root: PathBuf,
    pub address_book: PathBuf,
    pub command_timeout_secs: u64,
    pub bench_timeout_secs: u64,
    pub ssh: SshConfig,
    pub redis: RedisConfig,
    pub mongodb: MongoConfig,
    pub readiness: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    pub program: String,
    pub copy_program: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    /// Primaries with replicas and sentinels.
    Sentinel,
    /// Every node joins one redis cluster.
    Cluster,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub port: u16,
    pub sentinel_port: u16,
    pub master_name: String,
    pub mode: RedisMode,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MongoConfig {
    /// Cluster topology document on this machine.
    pub topology: PathBuf,
    /// Where the topology document is copied on every other host.
    pub remote_topology: String,
    pub shell: String,
    pub router_conf: String,
}

/// Exponential backoff used while waiting on a freshly started daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exp = 1u64 << attempt.min(16);
        let ms = self.initial_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: "cc".into(),
            repo_url: "https://github.com/billybimbob/storage-deployments.git".into(),
            remote_root: None,
            local_root: PathBuf::from("."),
            address_book: PathBuf::from("deployment/ip-addresses.json"),
            command_timeout_secs: 8,
            bench_timeout_secs: 600,
            ssh: SshConfig {
                program: "ssh".into(),
                copy_program: "scp".into(),
                options: vec![
                    "-o".into(),
                    "BatchMode=yes".into(),
                    "-o".into(),
                    "StrictHostKeyChecking=accept-new".into(),
                    "-o".into(),
                    "LogLevel=ERROR".into(),
                ],
            },
            redis: RedisConfig {
                port: 6379,
                sentinel_port: 26379,
                master_name: "mymaster".into(),
                mode: RedisMode::Sentinel,
            },
            mongodb: MongoConfig {
                topology: PathBuf::from("deployment/cluster.json"),
                remote_topology: "cluster.json".into(),
                shell: "mongosh".into(),
                router_conf: "mongos.conf".into(),
            },
            readiness: RetryPolicy {
                attempts: 6,
                initial_delay_ms: 500,
                max_delay_ms: 8000,
            },
        }
    }
}

impl Config {
    pub fn load(extra: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("deploy.toml"))
            .merge(Json::file("deploy.json"));

        if let Some(path) = extra {
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }

        let config: Config = figment
            .merge(Env::prefixed("DEPLOY_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.command_timeout_secs == 0 {
            anyhow::bail!("command_timeout_secs must be positive");
        }

        Ok(config)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn bench_timeout(&self) -> Duration {
        Duration::from_secs(self.bench_timeout_secs)
    }

    /// Checkout folder name on remote hosts, the repository stem by default.
    pub fn remote_root(&self) -> String {
        if let Some(root) = &self.remote_root {
            return root.clone();
        }
        let last = self
            .repo_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        last.trim_end_matches(".git").to_string()
    }
}
