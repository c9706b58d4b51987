//! Parameter sweeps: start, benchmark and stop the cluster once per
//! `(parameter, value)` pair, each time with freshly patched configs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{error, info};
use serde::Deserialize;
use serde_json::Value;

use crate::bench::BenchmarkDriver;
use crate::conf;
use crate::config::RedisMode;
use crate::error::Result;
use crate::executor::Dispatcher;
use crate::lifecycle::{
    conf_path, ensure_phase, ClusterLifecycle, Deployment, MongoLifecycle, RedisConfs, RedisLifecycle,
};
use crate::load::{LoadSource, LOAD_SIZES};
use crate::report::{Action, Report};
use crate::types::{CommandTarget, Database};

pub const PHASE_PUSH_CONFS: &str = "push-confs";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParameterSweep {
    pub redis: BTreeMap<String, Vec<Value>>,
    pub mongodb: BTreeMap<String, Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepCase {
    pub param: String,
    pub value: Value,
}

impl SweepCase {
    /// Value as it appears in a config line.
    fn rendered(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl ParameterSweep {
    pub fn from_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Every `(param, value)` pair for one database, params in key order.
    pub fn cases(&self, database: Database) -> Vec<SweepCase> {
        let params = match database {
            Database::Redis => &self.redis,
            Database::Mongodb => &self.mongodb,
        };
        params
            .iter()
            .flat_map(|(param, values)| {
                values.iter().map(move |value| SweepCase {
                    param: param.clone(),
                    value: value.clone(),
                })
            })
            .collect()
    }
}

pub struct SweepRunner<'a> {
    deploy: Deployment<'a>,
    bench: &'a dyn Dispatcher,
    load: &'a dyn LoadSource,
    bench_sizes: Vec<usize>,
}

impl<'a> SweepRunner<'a> {
    /// `bench` dispatches the benchmark replays, usually with a longer timeout.
    pub fn new(deploy: Deployment<'a>, bench: &'a dyn Dispatcher, load: &'a dyn LoadSource) -> Self {
        Self {
            deploy,
            bench,
            load,
            bench_sizes: LOAD_SIZES.to_vec(),
        }
    }

    pub fn with_bench_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.bench_sizes = sizes;
        self
    }

    pub async fn run(&self, sweep: &ParameterSweep, database: Database) -> Result<Vec<Report>> {
        let mut reports = Vec::new();
        self.run_into(sweep, database, &mut reports).await?;
        Ok(reports)
    }

    /// Run every case, appending reports as they complete. On error `reports`
    /// keeps everything up to and including the failed step.
    pub async fn run_into(
        &self,
        sweep: &ParameterSweep,
        database: Database,
        reports: &mut Vec<Report>,
    ) -> Result<()> {
        let cases = sweep.cases(database);
        if cases.is_empty() {
            return Ok(());
        }

        // confs are pushed into the remote checkouts, so they must exist first
        let mut fetch = Report::new(database, Action::Start);
        let fetched = self.deploy.fetch(&mut fetch).await;
        reports.push(fetch);
        fetched?;

        for case in cases {
            info!("sweep {}: {} = {}", database, case.param, case.rendered());
            self.run_case(database, &case, reports).await?;
        }
        Ok(())
    }

    async fn run_case(&self, database: Database, case: &SweepCase, reports: &mut Vec<Report>) -> Result<()> {
        let patched = self.patch(database, case)?;
        let mut push = Report::new(database, Action::Start);
        let pushed = self.push_confs(&patched, &mut push).await;
        reports.push(push);
        pushed?;

        let names: Vec<String> = patched.iter().map(|p| file_name(p)).collect();
        let lifecycle: Box<dyn ClusterLifecycle + '_> = match database {
            Database::Redis => Box::new(RedisLifecycle::new(self.deploy).with_confs(self.redis_confs(&names))),
            Database::Mongodb => {
                let mut mongo = MongoLifecycle::new(self.deploy);
                if let Some(name) = names.first() {
                    mongo = mongo.with_router_conf(name.clone());
                }
                Box::new(mongo)
            }
        };

        let mut start = Report::new(database, Action::Start);
        let started = lifecycle.start_into(&mut start).await;
        reports.push(start);
        if let Err(e) = started {
            error!("start with {} = {} failed: {}", case.param, case.rendered(), e);
            let mut stop = Report::new(database, Action::Shutdown);
            if let Err(stop_err) = lifecycle.shutdown_into(&mut stop).await {
                error!("shutdown after failed start also failed: {}", stop_err);
            }
            reports.push(stop);
            return Err(e);
        }

        let driver = BenchmarkDriver::for_cluster(
            self.bench,
            self.load,
            self.deploy.config,
            self.deploy.book,
            database,
        )?
        .with_sizes(self.bench_sizes.clone());
        reports.push(driver.run().await);

        let mut stop = Report::new(database, Action::Shutdown);
        let stopped = lifecycle.shutdown_into(&mut stop).await;
        reports.push(stop);
        stopped
    }

    fn confs_dir(&self, database: Database) -> PathBuf {
        self.deploy
            .config
            .local_root
            .join("deployment")
            .join(database.to_string())
            .join("confs")
    }

    /// Config files the current mode starts daemons from.
    fn sources(&self, database: Database) -> Vec<String> {
        let confs = RedisConfs::default();
        match (database, self.deploy.config.redis.mode) {
            (Database::Redis, RedisMode::Sentinel) => vec![confs.primary, confs.replica, confs.sentinel],
            (Database::Redis, RedisMode::Cluster) => vec![confs.cluster],
            (Database::Mongodb, _) => vec![self.deploy.config.mongodb.router_conf.clone()],
        }
    }

    fn patch(&self, database: Database, case: &SweepCase) -> Result<Vec<PathBuf>> {
        let dir = self.confs_dir(database);
        self.sources(database)
            .iter()
            .map(|name| {
                let source = dir.join(name);
                match database {
                    Database::Redis => conf::patch_redis(&source, &case.param, &case.rendered()),
                    Database::Mongodb => conf::patch_mongo(&source, &case.param, case.value.clone()),
                }
            })
            .collect()
    }

    /// Copy patched files into the confs directory of every remote checkout.
    async fn push_confs(&self, patched: &[PathBuf], report: &mut Report) -> Result<()> {
        let database = report.database;
        let root = self.deploy.config.remote_root();
        let mut targets = Vec::new();
        for host in self.deploy.remote_hosts().await? {
            for path in patched {
                let dest = conf_path(&root, database, &file_name(path));
                targets.push(CommandTarget::push(self.deploy.user(), &host, path.clone(), dest)?);
            }
        }
        if targets.is_empty() {
            return Ok(());
        }
        let results = self.deploy.dispatcher.execute(targets).await?;
        let failed = results.iter().filter(|r| r.is_error()).count();
        let total = results.len();
        report.push(PHASE_PUSH_CONFS, results);
        ensure_phase(PHASE_PUSH_CONFS, failed, total)
    }

    fn redis_confs(&self, names: &[String]) -> RedisConfs {
        let mut confs = RedisConfs::default();
        match self.deploy.config.redis.mode {
            RedisMode::Sentinel => {
                if let [primary, replica, sentinel] = names {
                    confs.primary = primary.clone();
                    confs.replica = replica.clone();
                    confs.sentinel = sentinel.clone();
                }
            }
            RedisMode::Cluster => {
                if let Some(cluster) = names.first() {
                    confs.cluster = cluster.clone();
                }
            }
        }
        confs
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
