//! MongoDB sharded cluster lifecycle.
//!
//! 1. merge the address book into the topology document and persist it
//! 2. copy the document to every other host
//! 3. start config-server and shard members
//! 4. initiate both replica sets from their first member
//! 5. start the routers against the config-server set
//! 6. register the shard set through the first router that answers a ping
//!
//! Shutdown stops shard and config members first, routers last.

use async_trait::async_trait;
use log::{info, warn};
use serde_json::Value;
use tokio::time::sleep;

use super::{conf_path, ensure_phase, log_dir, placements, ClusterLifecycle, Deployment, Placement};
use crate::admin::{
    self, add_shard, admin_failure, ping, repl_set_initiate, AdminClient, AdminReply, MongoShell,
};
use crate::error::{DeployError, Result};
use crate::executor::LaunchSpec;
use crate::report::Report;
use crate::topology::{ClusterTopology, ReplicaSet};
use crate::types::{CommandTarget, Database, ExecutionResult, Role};

pub const PHASE_DISTRIBUTE: &str = "distribute";
pub const PHASE_MEMBER_START: &str = "member-start";
pub const PHASE_INITIATE: &str = "replset-initiate";
pub const PHASE_ROUTER_START: &str = "router-start";
pub const PHASE_REGISTER: &str = "shard-register";
pub const PHASE_MEMBER_SHUTDOWN: &str = "member-shutdown";
pub const PHASE_ROUTER_SHUTDOWN: &str = "router-shutdown";

pub struct MongoLifecycle<'a> {
    deploy: Deployment<'a>,
    shell: MongoShell,
    router_conf: String,
}

impl<'a> MongoLifecycle<'a> {
    pub fn new(deploy: Deployment<'a>) -> Self {
        Self {
            shell: MongoShell::new(deploy.config.mongodb.shell.clone()),
            router_conf: deploy.config.mongodb.router_conf.clone(),
            deploy,
        }
    }

    /// Use a different router config file inside `deployment/mongodb/confs`.
    pub fn with_router_conf(mut self, file: impl Into<String>) -> Self {
        self.router_conf = file.into();
        self
    }

    fn member_spec(&self, root: &str, topology: &ClusterTopology, placement: &Placement) -> LaunchSpec {
        let (set, role_flag, kind) = match placement.role {
            Role::Auxiliary => (&topology.config_servers, "--configsvr", "configs"),
            _ => (&topology.shards, "--shardsvr", "shards"),
        };
        let logs = format!("{}/{}", root, topology.log_path);
        let dbpath = format!("{}/data/mongodb/{}-{}", root, set.set_name, placement.index);

        LaunchSpec {
            label: format!("mongod {} {}", kind, placement.host),
            program: "mongod".into(),
            args: vec![
                role_flag.to_string(),
                "--replSet".into(),
                set.set_name.clone(),
                "--port".into(),
                set.port.to_string(),
                "--bind_ip".into(),
                placement.host.clone(),
                "--dbpath".into(),
                dbpath.clone(),
                "--logpath".into(),
                format!("{}/{}-{}.log", logs, kind, placement.index),
            ],
            dirs: vec![logs, dbpath],
            detach_args: vec!["--fork".into()],
        }
    }

    fn router_spec(&self, root: &str, topology: &ClusterTopology, placement: &Placement) -> LaunchSpec {
        let logs = format!("{}/{}", root, topology.log_path);
        LaunchSpec {
            label: format!("mongos {}", placement.host),
            program: "mongos".into(),
            args: vec![
                "--config".into(),
                conf_path(root, Database::Mongodb, &self.router_conf),
                "--configdb".into(),
                topology.config_servers.connection_string(),
                "--port".into(),
                topology.router.port.to_string(),
                "--bind_ip".into(),
                placement.host.clone(),
                "--logpath".into(),
                format!("{}/mongos-{}.log", logs, placement.index),
            ],
            dirs: vec![logs],
            detach_args: vec!["--fork".into()],
        }
    }

    async fn distribute(&self, report: &mut Report) -> Result<()> {
        let cfg = &self.deploy.config.mongodb;
        let targets = self
            .deploy
            .remote_hosts()
            .await?
            .iter()
            .map(|h| CommandTarget::push(self.deploy.user(), h, cfg.topology.clone(), cfg.remote_topology.clone()))
            .collect::<Result<Vec<_>>>()?;
        let results = self.deploy.dispatcher.execute(targets).await?;
        let failed = results.iter().filter(|r| r.is_error()).count();
        let total = results.len();
        report.push(PHASE_DISTRIBUTE, results);
        ensure_phase(PHASE_DISTRIBUTE, failed, total)
    }

    /// One `replSetInitiate` per set, each sent to the set's first member.
    async fn initiate(&self, topology: &ClusterTopology, report: &mut Report) -> Result<()> {
        let configs = &topology.config_servers;
        let shards = &topology.shards;
        let commands = vec![
            (
                first_member(configs)?,
                configs.port,
                repl_set_initiate(&configs.set_name, configs.port, &configs.members, true),
            ),
            (
                first_member(shards)?,
                shards.port,
                repl_set_initiate(&shards.set_name, shards.port, &shards.members, false),
            ),
        ];

        let replies = admin::run_admin_commands(
            self.deploy.dispatcher,
            &self.shell,
            self.deploy.user(),
            &commands,
        )
        .await?;

        let failure = commands
            .iter()
            .zip(&replies)
            .find(|(_, reply)| !reply.is_ok())
            .map(|((_, _, doc), reply)| admin_failure(doc, reply));

        report.push(PHASE_INITIATE, replies.into_iter().map(|r| r.result).collect());
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Poll every router with a ping until one answers, backing off between rounds.
    async fn ready_router(&self, topology: &ClusterTopology, log: &mut Vec<ExecutionResult>) -> Result<String> {
        let policy = &self.deploy.config.readiness;
        let port = topology.router.port;
        let commands: Vec<(&str, u16, Value)> = topology
            .router
            .members
            .iter()
            .map(|m| (m.as_str(), port, ping()))
            .collect();

        for attempt in 0..policy.attempts {
            let replies = admin::run_admin_commands(
                self.deploy.dispatcher,
                &self.shell,
                self.deploy.user(),
                &commands,
            )
            .await?;
            let ready = replies
                .iter()
                .position(AdminReply::is_ok)
                .map(|i| commands[i].0.to_string());
            log.extend(replies.into_iter().map(|r| r.result));

            if let Some(host) = ready {
                info!("router {} is ready", host);
                return Ok(host);
            }
            if attempt + 1 < policy.attempts {
                let delay = policy.delay(attempt);
                warn!("no router answered yet, retrying in {:?}", delay);
                sleep(delay).await;
            }
        }

        Err(DeployError::PhaseFailed {
            phase: PHASE_REGISTER.to_string(),
            failed: topology.router.members.len(),
            total: topology.router.members.len(),
        })
    }

    async fn register_shards(&self, topology: &ClusterTopology, report: &mut Report) -> Result<()> {
        let mut log = Vec::new();
        let outcome = self.register_shards_inner(topology, &mut log).await;
        report.push(PHASE_REGISTER, log);
        outcome
    }

    async fn register_shards_inner(&self, topology: &ClusterTopology, log: &mut Vec<ExecutionResult>) -> Result<()> {
        let router = self.ready_router(topology, log).await?;
        let shards = &topology.shards;
        let doc = add_shard(&shards.set_name, shards.port, &shards.members);
        let policy = &self.deploy.config.readiness;

        for attempt in 0..policy.attempts {
            let reply = admin::run_admin_command(
                self.deploy.dispatcher,
                &self.shell,
                self.deploy.user(),
                &router,
                topology.router.port,
                &doc,
            )
            .await?;
            let ok = reply.is_ok();
            log.push(reply.result.clone());
            if ok {
                info!("registered shard set {} via {}", shards.set_name, router);
                return Ok(());
            }
            warn!("{}", admin_failure(&doc, &reply));
            if attempt + 1 < policy.attempts {
                sleep(policy.delay(attempt)).await;
            }
        }

        Err(DeployError::PhaseFailed {
            phase: PHASE_REGISTER.to_string(),
            failed: policy.attempts,
            total: policy.attempts,
        })
    }
}

fn first_member(set: &ReplicaSet) -> Result<&str> {
    set.members
        .first()
        .map(String::as_str)
        .ok_or_else(|| DeployError::Topology(format!("replica set {} has no members", set.set_name)))
}

#[async_trait]
impl<'a> ClusterLifecycle for MongoLifecycle<'a> {
    fn database(&self) -> Database {
        Database::Mongodb
    }

    async fn start_into(&self, report: &mut Report) -> Result<()> {
        let book = self.deploy.book;
        book.validate()?;
        if book.is_empty() {
            return Ok(());
        }
        self.deploy.fetch(report).await?;

        info!("writing cluster topology");
        let topology = ClusterTopology::materialize(
            &self.deploy.config.mongodb.topology,
            book,
            log_dir(Database::Mongodb),
        )?;
        self.distribute(report).await?;

        info!("starting config servers and shard members");
        let members = placements(book, &[Role::Auxiliary, Role::Data]);
        let starts = self
            .deploy
            .start_daemons(&members, |root, p| self.member_spec(root, &topology, p))
            .await?;
        self.deploy.record(report, PHASE_MEMBER_START, starts)?;

        info!("initiating replica sets");
        self.initiate(&topology, report).await?;

        info!("starting routers");
        let routers = placements(book, &[Role::Primary]);
        let starts = self
            .deploy
            .start_daemons(&routers, |root, p| self.router_spec(root, &topology, p))
            .await?;
        self.deploy.record(report, PHASE_ROUTER_START, starts)?;

        info!("registering shards");
        self.register_shards(&topology, report).await?;

        Ok(())
    }

    async fn shutdown_into(&self, report: &mut Report) -> Result<()> {
        self.deploy.book.validate()?;
        if self.deploy.book.is_empty() {
            return Ok(());
        }
        let topology = ClusterTopology::load(&self.deploy.config.mongodb.topology)?;
        let user = self.deploy.user();
        let book = self.deploy.book;

        info!("stopping shard and config members");
        let mut targets = Vec::new();
        for host in &book.data {
            targets.push(self.shell.shutdown_target(user, host, topology.shards.port)?);
        }
        for host in &book.auxiliary {
            targets.push(self.shell.shutdown_target(user, host, topology.config_servers.port)?);
        }
        let results = self.deploy.dispatcher.execute(targets).await?;
        report.push(PHASE_MEMBER_SHUTDOWN, results);

        info!("stopping routers");
        let targets = book
            .primary
            .iter()
            .map(|h| self.shell.shutdown_target(user, h, topology.router.port))
            .collect::<Result<Vec<_>>>()?;
        let results = self.deploy.dispatcher.execute(targets).await?;
        report.push(PHASE_ROUTER_SHUTDOWN, results);

        Ok(())
    }
}
