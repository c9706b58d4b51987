//! deploy-cluster entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};

use deploy_cluster::bench::BenchmarkDriver;
use deploy_cluster::config::{Config, RedisMode};
use deploy_cluster::executor::ParallelExecutor;
use deploy_cluster::lifecycle::{ClusterLifecycle, Deployment, MongoLifecycle, RedisLifecycle};
use deploy_cluster::load::RandomLoad;
use deploy_cluster::report::{self, Action, Report};
use deploy_cluster::resolver::SystemResolver;
use deploy_cluster::sweep::{ParameterSweep, SweepRunner};
use deploy_cluster::types::{AddressBook, Database};

#[derive(Parser, Debug)]
#[command(name = "deploy-cluster")]
#[command(about = "Start, benchmark and stop Redis or MongoDB clusters over ssh", long_about = None)]
struct Args {
    /// Database kind to operate on
    #[arg(short, long, value_enum)]
    database: Database,

    /// Address book with the main/data/misc host groups
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Remote login user
    #[arg(short, long)]
    user: Option<String>,

    /// Write the text report of every phase, benchmark included, here instead of the log
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Also write every report as a JSON array
    #[arg(long)]
    json: Option<PathBuf>,

    /// Stop the cluster instead of starting it
    #[arg(short, long)]
    shutdown: bool,

    /// Run the benchmark workloads after a successful start
    #[arg(short, long)]
    bench: bool,

    /// Run a parameter sweep from this file instead of a single start
    #[arg(long, conflicts_with_all = ["shutdown", "bench"])]
    sweep: Option<PathBuf>,

    /// Redis topology
    #[arg(short, long, value_enum)]
    mode: Option<RedisMode>,

    /// Extra configuration file (toml or json)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut cfg = Config::load(args.config.as_deref())?;
    if let Some(user) = args.user {
        cfg.user = user;
    }
    if let Some(file) = args.file {
        cfg.address_book = file;
    }
    if let Some(mode) = args.mode {
        cfg.redis.mode = mode;
    }
    info!("Starting deploy-cluster for {} with config: {:?}", args.database, cfg);

    let book = AddressBook::from_json(&cfg.address_book)?;
    if book.is_empty() {
        info!("address book {} lists no hosts, nothing to do", cfg.address_book.display());
        return Ok(());
    }

    let resolver = Arc::new(SystemResolver::from_system_conf());
    let executor = ParallelExecutor::new(resolver, cfg.command_timeout(), cfg.ssh.clone());
    let bench_executor = executor.with_timeout(cfg.bench_timeout());
    let deploy = Deployment::new(&executor, &book, &cfg);

    let out = args.out.as_deref();
    let json = args.json.as_deref();
    let mut reports = Vec::new();

    if let Some(path) = args.sweep {
        let sweep = ParameterSweep::from_json(&path)?;
        let runner = SweepRunner::new(deploy, &bench_executor, &RandomLoad);
        let outcome = runner.run_into(&sweep, args.database, &mut reports).await;
        report::emit(&reports, out, json)?;
        outcome?;
        info!("sweep finished with {} reports", reports.len());
        return Ok(());
    }

    let lifecycle: Box<dyn ClusterLifecycle + '_> = match args.database {
        Database::Redis => Box::new(RedisLifecycle::new(deploy)),
        Database::Mongodb => Box::new(MongoLifecycle::new(deploy)),
    };

    let action = if args.shutdown { Action::Shutdown } else { Action::Start };
    let mut run = Report::new(args.database, action);
    let mut outcome = if args.shutdown {
        lifecycle.shutdown_into(&mut run).await
    } else {
        lifecycle.start_into(&mut run).await
    };
    reports.push(run);

    if outcome.is_ok() && args.bench && !args.shutdown {
        match BenchmarkDriver::for_cluster(&bench_executor, &RandomLoad, &cfg, &book, args.database) {
            Ok(driver) => {
                reports.push(driver.run().await);
                info!("benchmark timestamps in {}", driver.timestamps().display());
            }
            Err(e) => outcome = Err(e),
        }
    }

    // an aborted run is reported too
    report::emit(&reports, out, json)?;
    outcome?;

    for handle in reports.iter().flat_map(|r| &r.local) {
        match handle.pid() {
            Some(pid) => info!("{} running locally as pid {}", handle.label, pid),
            None => warn!("{} exited before it could be reported", handle.label),
        }
    }

    Ok(())
}
