//! Redis master/replica/sentinel (or redis cluster) lifecycle.
//!
//! Start order: primaries, then sentinels and replicas together (both attach
//! to a primary at startup), then in cluster mode a single `--cluster create`
//! from the first primary. Shutdown runs the other way round: replicas and
//! sentinels first so they detach before their primary disappears.

use async_trait::async_trait;
use log::info;
use rand::seq::SliceRandom;

use super::{conf_path, ensure_phase, log_dir, placements, ClusterLifecycle, Deployment, Placement};
use crate::admin::{AdminClient, RedisCli};
use crate::config::RedisMode;
use crate::error::{DeployError, Result};
use crate::executor::LaunchSpec;
use crate::report::Report;
use crate::types::{CommandTarget, Database, Role};

pub const PHASE_PRIMARY_START: &str = "primary-start";
pub const PHASE_SECONDARY_START: &str = "secondary-start";
pub const PHASE_CLUSTER_CREATE: &str = "cluster-create";
pub const PHASE_SECONDARY_SHUTDOWN: &str = "secondary-shutdown";
pub const PHASE_PRIMARY_SHUTDOWN: &str = "primary-shutdown";

/// Config file names per role, inside `deployment/redis/confs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfs {
    pub primary: String,
    pub replica: String,
    pub sentinel: String,
    pub cluster: String,
}

impl Default for RedisConfs {
    fn default() -> Self {
        Self {
            primary: "master.conf".into(),
            replica: "slave.conf".into(),
            sentinel: "sentinel.conf".into(),
            cluster: "cluster.conf".into(),
        }
    }
}

pub struct RedisLifecycle<'a> {
    deploy: Deployment<'a>,
    confs: RedisConfs,
    cli: RedisCli,
}

impl<'a> RedisLifecycle<'a> {
    pub fn new(deploy: Deployment<'a>) -> Self {
        Self {
            deploy,
            confs: RedisConfs::default(),
            cli: RedisCli::default(),
        }
    }

    pub fn with_confs(mut self, confs: RedisConfs) -> Self {
        self.confs = confs;
        self
    }

    fn mode(&self) -> RedisMode {
        self.deploy.config.redis.mode
    }

    fn quorum(&self) -> usize {
        self.deploy.book.auxiliary.len() / 2 + 1
    }

    /// Launch spec for a placement, rooted at `root`.
    fn node_spec(&self, root: &str, placement: &Placement) -> LaunchSpec {
        let settings = &self.deploy.config.redis;
        let logs = format!("{}/{}", root, log_dir(Database::Redis));

        let (name, conf, port) = match (self.mode(), placement.role) {
            (RedisMode::Cluster, _) => ("cluster", &self.confs.cluster, settings.port),
            (RedisMode::Sentinel, Role::Primary) => ("master", &self.confs.primary, settings.port),
            (RedisMode::Sentinel, Role::Data) => ("slave", &self.confs.replica, settings.port),
            (RedisMode::Sentinel, Role::Auxiliary) => {
                ("sentinel", &self.confs.sentinel, settings.sentinel_port)
            }
        };

        let mut args = vec![
            conf_path(root, Database::Redis, conf),
            "--port".to_string(),
            port.to_string(),
            "--logfile".to_string(),
            format!("{}/{}.log", logs, name),
        ];

        match (self.mode(), placement.role, &placement.upstream) {
            (RedisMode::Cluster, _, _) => {
                args.extend(["--cluster-enabled".to_string(), "yes".to_string()]);
            }
            (RedisMode::Sentinel, Role::Data, Some(master)) => {
                args.extend(["--replicaof".to_string(), master.clone(), settings.port.to_string()]);
            }
            (RedisMode::Sentinel, Role::Auxiliary, Some(master)) => {
                args.extend([
                    "--sentinel".to_string(),
                    "--sentinel".to_string(),
                    "monitor".to_string(),
                    settings.master_name.clone(),
                    master.clone(),
                    settings.port.to_string(),
                    self.quorum().to_string(),
                ]);
            }
            _ => {}
        }

        LaunchSpec {
            label: format!("redis {} {}", name, placement.host),
            program: "redis-server".into(),
            args,
            dirs: vec![logs],
            detach_args: vec!["--daemonize".into(), "yes".into()],
        }
    }

    /// Sentinels then replicas, each pointed at a randomly chosen primary.
    fn secondary_placements(&self) -> Vec<Placement> {
        let book = self.deploy.book;
        let mut placed = placements(book, &[Role::Auxiliary, Role::Data]);
        if self.mode() == RedisMode::Sentinel {
            let mut rng = rand::thread_rng();
            for p in &mut placed {
                p.upstream = book.primary.choose(&mut rng).cloned();
            }
        }
        placed
    }

    fn shutdown_port(&self, role: Role) -> u16 {
        let settings = &self.deploy.config.redis;
        match (self.mode(), role) {
            (RedisMode::Sentinel, Role::Auxiliary) => settings.sentinel_port,
            _ => settings.port,
        }
    }

    async fn create_cluster(&self, report: &mut Report) -> Result<()> {
        let book = self.deploy.book;
        let port = self.deploy.config.redis.port;
        let nodes: Vec<String> = book.hosts().iter().map(|h| format!("{}:{}", h, port)).collect();

        let first = book
            .primary
            .first()
            .ok_or(DeployError::MissingRoleGroup(Role::Primary))?;

        info!("creating redis cluster over {:?}", nodes);
        let target = self.cli.cluster_create_target(self.deploy.user(), first, &nodes)?;
        let results = self.deploy.dispatcher.execute(vec![target]).await?;
        let failed = results.iter().filter(|r| r.is_error()).count();
        let total = results.len();
        report.push(PHASE_CLUSTER_CREATE, results);
        ensure_phase(PHASE_CLUSTER_CREATE, failed, total)
    }
}

#[async_trait]
impl<'a> ClusterLifecycle for RedisLifecycle<'a> {
    fn database(&self) -> Database {
        Database::Redis
    }

    async fn start_into(&self, report: &mut Report) -> Result<()> {
        self.deploy.book.validate()?;
        if self.deploy.book.is_empty() {
            return Ok(());
        }
        self.deploy.fetch(report).await?;

        info!("starting redis primaries");
        let primaries = placements(self.deploy.book, &[Role::Primary]);
        let starts = self
            .deploy
            .start_daemons(&primaries, |root, p| self.node_spec(root, p))
            .await?;
        self.deploy.record(report, PHASE_PRIMARY_START, starts)?;

        info!("starting redis sentinels and replicas");
        let secondaries = self.secondary_placements();
        let starts = self
            .deploy
            .start_daemons(&secondaries, |root, p| self.node_spec(root, p))
            .await?;
        self.deploy.record(report, PHASE_SECONDARY_START, starts)?;

        if self.mode() == RedisMode::Cluster {
            self.create_cluster(report).await?;
        }

        Ok(())
    }

    async fn shutdown_into(&self, report: &mut Report) -> Result<()> {
        let book = self.deploy.book;
        book.validate()?;
        if book.is_empty() {
            return Ok(());
        }
        let user = self.deploy.user();

        info!("stopping redis replicas and sentinels");
        let mut targets = Vec::new();
        for role in [Role::Data, Role::Auxiliary] {
            for host in book.group(role) {
                targets.push(self.cli.shutdown_target(user, host, self.shutdown_port(role))?);
            }
        }
        let results = self.deploy.dispatcher.execute(targets).await?;
        report.push(PHASE_SECONDARY_SHUTDOWN, results);

        info!("stopping redis primaries");
        let targets = book
            .primary
            .iter()
            .map(|h| self.cli.shutdown_target(user, h, self.shutdown_port(Role::Primary)))
            .collect::<Result<Vec<CommandTarget>>>()?;
        let results = self.deploy.dispatcher.execute(targets).await?;
        report.push(PHASE_PRIMARY_SHUTDOWN, results);

        Ok(())
    }
}
