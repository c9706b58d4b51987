//! Cluster lifecycle orchestration.
//!
//! Each database kind implements [`ClusterLifecycle`] as a fixed sequence of
//! executor batches. A phase only starts once the previous batch has fully
//! resolved, and a phase in which every target failed aborts the run.

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::config::Config;
use crate::error::{DeployError, ExecError, Result};
use crate::executor::{DaemonStart, Dispatcher, LaunchSpec};
use crate::report::{Action, Report};
use crate::types::{AddressBook, CommandTarget, Database, ExecutionResult, Role};

pub mod mongodb;
pub mod redis;

pub use mongodb::MongoLifecycle;
pub use redis::{RedisConfs, RedisLifecycle};

pub const PHASE_CLONE: &str = "clone";
pub const PHASE_PULL: &str = "pull";

#[async_trait]
pub trait ClusterLifecycle: Send + Sync {
    fn database(&self) -> Database;

    /// Fetch the deployment repository everywhere and bring the cluster up,
    /// filing each phase into `report` as it resolves. On error the report
    /// still holds every phase that ran, the failed one included.
    async fn start_into(&self, report: &mut Report) -> Result<()>;

    /// Stop every daemon, dependents before the hosts they attach to.
    async fn shutdown_into(&self, report: &mut Report) -> Result<()>;

    async fn start(&self) -> Result<Report> {
        let mut report = Report::new(self.database(), Action::Start);
        self.start_into(&mut report).await?;
        Ok(report)
    }

    async fn shutdown(&self) -> Result<Report> {
        let mut report = Report::new(self.database(), Action::Shutdown);
        self.shutdown_into(&mut report).await?;
        Ok(report)
    }
}

/// Where one daemon goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub role: Role,
    /// Position of the host inside its role group.
    pub index: usize,
    pub host: String,
    /// Host this daemon attaches to at startup, if any.
    pub upstream: Option<String>,
}

/// Placements for the given role groups, in the order the roles are listed.
pub fn placements(book: &AddressBook, roles: &[Role]) -> Vec<Placement> {
    roles
        .iter()
        .flat_map(|&role| {
            book.group(role)
                .iter()
                .enumerate()
                .map(move |(index, host)| Placement {
                    role,
                    index,
                    host: host.clone(),
                    upstream: None,
                })
        })
        .collect()
}

/// Everything an orchestrator needs for one run.
#[derive(Clone, Copy)]
pub struct Deployment<'a> {
    pub dispatcher: &'a dyn Dispatcher,
    pub book: &'a AddressBook,
    pub config: &'a Config,
}

impl<'a> Deployment<'a> {
    pub fn new(dispatcher: &'a dyn Dispatcher, book: &'a AddressBook, config: &'a Config) -> Self {
        Self {
            dispatcher,
            book,
            config,
        }
    }

    pub fn user(&self) -> &str {
        &self.config.user
    }

    /// Checkout root as seen from a host: local for this machine, remote otherwise.
    pub fn root(&self, local: bool) -> String {
        if local {
            self.config.local_root.display().to_string()
        } else {
            self.config.remote_root()
        }
    }

    /// Distinct hosts of the book that are not this machine.
    pub async fn remote_hosts(&self) -> Result<Vec<String>> {
        let mut hosts = Vec::new();
        for host in self.book.hosts() {
            if !self.dispatcher.is_self(host).await? {
                hosts.push(host.to_string());
            }
        }
        Ok(hosts)
    }

    /// Clone the deployment repository on every remote host, pulling where
    /// the clone fails because a checkout is already there.
    pub async fn fetch(&self, report: &mut Report) -> Result<()> {
        let hosts = self.remote_hosts().await?;
        if hosts.is_empty() {
            return Ok(());
        }
        debug!("cloning repo for addrs {:?}", hosts);

        let clone = format!("git clone --quiet {}", self.config.repo_url);
        let targets = hosts
            .iter()
            .map(|h| CommandTarget::shell(self.user(), h, clone.as_str()))
            .collect::<Result<Vec<_>>>()?;
        let results = self.dispatcher.execute(targets).await?;

        let failed: Vec<&str> = results
            .iter()
            .filter(|r| r.is_error())
            .map(|r| r.target.host.as_str())
            .collect();

        let pull = if failed.is_empty() {
            None
        } else {
            debug!("pulling git for addrs {:?}", failed);
            let line = format!("cd {} && git pull --quiet", self.config.remote_root());
            let targets = failed
                .iter()
                .map(|h| CommandTarget::shell(self.user(), h, line.as_str()))
                .collect::<Result<Vec<_>>>()?;
            Some(self.dispatcher.execute(targets).await?)
        };

        report.push(PHASE_CLONE, results);
        if let Some(pull) = pull {
            report.push(PHASE_PULL, pull);
        }
        Ok(())
    }

    /// Start one daemon per placement. Placements on this machine are launched
    /// here and kept as handles; the rest go out as a single batch.
    pub async fn start_daemons<F>(&self, placements: &[Placement], build: F) -> Result<Vec<DaemonStart>>
    where
        F: Fn(&str, &Placement) -> LaunchSpec + Send + Sync,
    {
        let mut slots: Vec<Option<DaemonStart>> = Vec::with_capacity(placements.len());
        let mut remote = Vec::new();
        let mut remote_slots = Vec::new();

        for placement in placements {
            if self.dispatcher.is_self(&placement.host).await? {
                let spec = build(&self.root(true), placement);
                let start = match self.dispatcher.launch(&spec).await {
                    Ok(handle) => DaemonStart::Handle(handle),
                    Err(e) => {
                        warn!("local launch of {} failed: {}", spec.label, e);
                        let target = CommandTarget::shell(self.user(), &placement.host, spec.shell_line())?;
                        DaemonStart::Dispatched(ExecutionResult::failed(
                            target,
                            ExecError::Spawn {
                                program: spec.program.clone(),
                                reason: e.to_string(),
                            },
                        ))
                    }
                };
                slots.push(Some(start));
            } else {
                let spec = build(&self.root(false), placement);
                remote.push(CommandTarget::shell(self.user(), &placement.host, spec.shell_line())?);
                remote_slots.push(slots.len());
                slots.push(None);
            }
        }

        let results = if remote.is_empty() {
            Vec::new()
        } else {
            self.dispatcher.execute(remote).await?
        };
        for (slot, result) in remote_slots.into_iter().zip(results) {
            slots[slot] = Some(DaemonStart::Dispatched(result));
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// File the starts of one phase into the report and fail the run if
    /// nothing in the phase came up.
    pub fn record(&self, report: &mut Report, phase: &str, starts: Vec<DaemonStart>) -> Result<()> {
        let total = starts.len();
        let failed = starts.iter().filter(|s| s.is_error()).count();
        let mut results = Vec::new();
        for start in starts {
            match start {
                DaemonStart::Handle(handle) => report.local.push(handle),
                DaemonStart::Dispatched(result) => results.push(result),
            }
        }
        report.push(phase, results);
        info!("phase {}: {} of {} started", phase, total - failed, total);
        ensure_phase(phase, failed, total)
    }
}

/// A phase fails as a whole only when every one of its targets failed.
pub fn ensure_phase(phase: &str, failed: usize, total: usize) -> Result<()> {
    if total > 0 && failed == total {
        return Err(DeployError::PhaseFailed {
            phase: phase.to_string(),
            failed,
            total,
        });
    }
    Ok(())
}

/// `<root>/deployment/<db>/confs/<file>`
pub fn conf_path(root: &str, database: Database, file: &str) -> String {
    format!("{}/deployment/{}/confs/{}", root, database, file)
}

/// Log directory relative to a checkout root.
pub fn log_dir(database: Database) -> String {
    format!("monitor_and_graphs/logs/{}", database)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placements_follow_role_order() {
        let book = AddressBook {
            primary: vec!["10.0.0.1".into()],
            data: vec!["10.0.0.2".into(), "10.0.0.3".into()],
            auxiliary: vec!["10.0.0.4".into()],
        };
        let placed = placements(&book, &[Role::Auxiliary, Role::Data]);
        let hosts: Vec<_> = placed.iter().map(|p| (p.role, p.index, p.host.as_str())).collect();
        assert_eq!(
            hosts,
            vec![
                (Role::Auxiliary, 0, "10.0.0.4"),
                (Role::Data, 0, "10.0.0.2"),
                (Role::Data, 1, "10.0.0.3"),
            ]
        );
    }

    #[test]
    fn phase_fails_only_when_everything_failed() {
        assert!(ensure_phase("p", 0, 0).is_ok());
        assert!(ensure_phase("p", 2, 3).is_ok());
        assert!(matches!(
            ensure_phase("p", 3, 3),
            Err(DeployError::PhaseFailed { failed: 3, total: 3, .. })
        ));
    }

    #[test]
    fn layout_paths() {
        assert_eq!(
            conf_path("storage-deployments", Database::Redis, "master.conf"),
            "storage-deployments/deployment/redis/confs/master.conf"
        );
        assert_eq!(log_dir(Database::Mongodb), "monitor_and_graphs/logs/mongodb");
    }
}
