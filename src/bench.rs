//! Benchmark driver.
//!
//! Replays generated command lists from this machine against the first
//! primary of a running cluster and appends wall-clock start/end stamps to a
//! timestamp log. Nothing here fails the run: errors are logged and the
//! next workload proceeds.

use std::path::{Path, PathBuf};

use chrono::Local;
use log::{error, info, warn};
use tokio::io::AsyncWriteExt;

use crate::config::{Config, RedisMode};
use crate::error::Result;
use crate::executor::{quote, Dispatcher};
use crate::load::{LoadSource, Operation, BENCH_COLLECTION, BENCH_DB, BENCH_KEY, LOAD_SIZES};
use crate::report::{Action, Report};
use crate::topology::ClusterTopology;
use crate::types::{AddressBook, CommandTarget, Database};

/// Host used for commands that must run on this machine.
const LOOPBACK: &str = "127.0.0.1";

pub struct BenchmarkDriver<'a> {
    dispatcher: &'a dyn Dispatcher,
    load: &'a dyn LoadSource,
    user: String,
    database: Database,
    host: String,
    port: u16,
    redis_cluster: bool,
    mongo_shell: String,
    work_dir: PathBuf,
    timestamps: PathBuf,
    sizes: Vec<usize>,
}

impl<'a> BenchmarkDriver<'a> {
    pub fn new(
        dispatcher: &'a dyn Dispatcher,
        load: &'a dyn LoadSource,
        config: &Config,
        database: Database,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let work_dir = config.local_root.join("load_generation").join("load-output");
        Self {
            dispatcher,
            load,
            user: config.user.clone(),
            database,
            host: host.into(),
            port,
            redis_cluster: config.redis.mode == RedisMode::Cluster,
            mongo_shell: config.mongodb.shell.clone(),
            timestamps: work_dir.join(format!("{}-timestamps.log", database)),
            work_dir,
            sizes: LOAD_SIZES.to_vec(),
        }
    }

    /// Driver aimed at the first primary: the redis master port, or the router
    /// port from the persisted topology document.
    pub fn for_cluster(
        dispatcher: &'a dyn Dispatcher,
        load: &'a dyn LoadSource,
        config: &Config,
        book: &AddressBook,
        database: Database,
    ) -> Result<Self> {
        let port = match database {
            Database::Redis => config.redis.port,
            Database::Mongodb => ClusterTopology::load(&config.mongodb.topology)?.router.port,
        };
        let host = book.primary.first().cloned().unwrap_or_else(|| LOOPBACK.to_string());
        Ok(Self::new(dispatcher, load, config, database, host, port))
    }

    pub fn with_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.sizes = sizes;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self.timestamps = self.work_dir.join(format!("{}-timestamps.log", self.database));
        self
    }

    pub fn timestamps(&self) -> &Path {
        &self.timestamps
    }

    pub async fn run(&self) -> Report {
        let mut report = Report::new(self.database, Action::Benchmark);
        for op in Operation::ALL {
            for &size in &self.sizes {
                if let Err(e) = self.run_one(op, size, &mut report).await {
                    error!("bench {} {} failed: {}", op, size, e);
                }
            }
        }
        let failed = report.failed();
        if failed > 0 {
            warn!("{} benchmark workloads reported errors", failed);
        }
        report
    }

    async fn run_one(&self, op: Operation, size: usize, report: &mut Report) -> Result<()> {
        let dir = self.work_dir.join(self.database.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let ops = self.load.operations_for(self.database, op, size);
        let (file, line) = match self.database {
            Database::Redis => {
                let file = dir.join(format!("{}_{}_operations.txt", op, size));
                tokio::fs::write(&file, ops.join("\n") + "\n").await?;
                let cluster = if self.redis_cluster { " -c" } else { "" };
                let line = format!(
                    "redis-cli -h {} -p {}{} < {} > /dev/null",
                    self.host,
                    self.port,
                    cluster,
                    quote(&file.display().to_string())
                );
                (file, line)
            }
            Database::Mongodb => {
                let file = dir.join(format!("{}_{}_operations.js", op, size));
                tokio::fs::write(&file, mongo_script(op, &ops)).await?;
                let line = format!(
                    "{} --host {} --port {} --quiet {} > /dev/null",
                    self.mongo_shell,
                    self.host,
                    self.port,
                    quote(&file.display().to_string())
                );
                (file, line)
            }
        };

        info!("bench {}: {} replaying {}", op, size, file.display());
        let target = CommandTarget::shell(&self.user, LOOPBACK, line)?;
        let start = Local::now();
        let results = self.dispatcher.execute(vec![target]).await?;
        let end = Local::now();

        if results.iter().any(|r| r.is_error()) {
            warn!("bench {}: {} finished with errors", op, size);
        }

        let stamp = format!(
            "bench {}: {} started {}, ended {}\n",
            op,
            size,
            start.format("%a %b %e %H:%M:%S %Y"),
            end.format("%a %b %e %H:%M:%S %Y")
        );
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.timestamps)
            .await?;
        log.write_all(stamp.as_bytes()).await?;
        log.flush().await?;

        report.push(format!("{}-{}", op, size), results);
        Ok(())
    }
}

/// mongosh script replaying `ops` against the benchmark collection.
fn mongo_script(op: Operation, ops: &[String]) -> String {
    let mut script = String::new();
    if op == Operation::Write {
        script.push_str(&format!("sh.enableSharding(\"{}\");\n", BENCH_DB));
        script.push_str(&format!(
            "sh.shardCollection(\"{}.{}\", {{ \"{}\": \"hashed\" }});\n",
            BENCH_DB, BENCH_COLLECTION, BENCH_KEY
        ));
    }
    for cmd in ops {
        script.push_str(&format!("db.getSiblingDB(\"{}\").runCommand({});\n", BENCH_DB, cmd));
    }
    if op == Operation::Read {
        script.push_str(&format!(
            "db.getSiblingDB(\"{}\").getCollection(\"{}\").drop();\n",
            BENCH_DB, BENCH_COLLECTION
        ));
    }
    script
}
