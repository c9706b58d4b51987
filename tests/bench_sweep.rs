//! Benchmark driver and parameter sweep integration tests

#[allow(dead_code)]
mod common;

use common::{err_output, small_book, test_config, RecordingDispatcher};
use deploy_cluster::bench::BenchmarkDriver;
use deploy_cluster::error::DeployError;
use deploy_cluster::lifecycle::{Deployment, PHASE_CLONE};
use deploy_cluster::load::RandomLoad;
use deploy_cluster::sweep::{ParameterSweep, SweepRunner, PHASE_PUSH_CONFS};
use deploy_cluster::types::{Command, Database, Output};

#[tokio::test]
async fn test_bench_replays_every_workload_from_loopback() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let dispatcher = RecordingDispatcher::new();

    let driver = BenchmarkDriver::new(&dispatcher, &RandomLoad, &config, Database::Redis, "10.0.0.1", 6379)
        .with_sizes(vec![3])
        .with_work_dir(dir.path().join("out"));
    let report = driver.run().await;

    assert_eq!(dispatcher.batch_sizes(), vec![1, 1, 1]);
    let batches = dispatcher.batches();
    assert!(batches.iter().all(|b| b[0].host == "127.0.0.1"));

    let write_file = dir.path().join("out/redis/write_3_operations.txt");
    assert_eq!(
        batches[0][0].command.to_string(),
        format!("redis-cli -h 10.0.0.1 -p 6379 < {} > /dev/null", write_file.display())
    );
    let ops = std::fs::read_to_string(&write_file).unwrap();
    assert_eq!(ops.lines().count(), 3);
    assert!(ops.starts_with("SET key:0 "));

    let stamps = std::fs::read_to_string(driver.timestamps()).unwrap();
    let lines: Vec<_> = stamps.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("bench write: 3 started "));
    assert!(lines[1].starts_with("bench read: 3 started "));
    assert!(lines[2].contains(", ended "));

    let names: Vec<_> = report.phases.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["write-3", "read-3", "meta-3"]);
}

#[tokio::test]
async fn test_bench_failures_are_counted_not_raised() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let dispatcher = RecordingDispatcher::new().with_responder(|_| err_output("Could not connect"));

    let driver = BenchmarkDriver::new(&dispatcher, &RandomLoad, &config, Database::Mongodb, "10.0.0.1", 27017)
        .with_sizes(vec![1, 2]);
    let report = driver.run().await;

    assert_eq!(report.failed(), 6);
    let stamps = std::fs::read_to_string(driver.timestamps()).unwrap();
    assert_eq!(stamps.lines().count(), 6);

    let script = dir
        .path()
        .join("load_generation/load-output/mongodb/write_2_operations.js");
    let script = std::fs::read_to_string(script).unwrap();
    assert!(script.starts_with("sh.enableSharding(\"test-db\");"));
}

fn redis_confs(root: &std::path::Path) -> std::path::PathBuf {
    let confs = root.join("deployment/redis/confs");
    std::fs::create_dir_all(&confs).unwrap();
    for name in ["master.conf", "slave.conf", "sentinel.conf"] {
        std::fs::write(confs.join(name), "bind 0.0.0.0\nmaxmemory 1gb\n").unwrap();
    }
    confs
}

#[tokio::test]
async fn test_sweep_patches_pushes_and_cycles_the_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let confs = redis_confs(dir.path());

    let sweep: ParameterSweep =
        serde_json::from_str(r#"{"redis": {"maxmemory": ["2gb"]}, "mongodb": {}}"#).unwrap();
    let book = small_book();
    let dispatcher = RecordingDispatcher::new();

    let reports = SweepRunner::new(Deployment::new(&dispatcher, &book, &config), &dispatcher, &RandomLoad)
        .with_bench_sizes(vec![2])
        .run(&sweep, Database::Redis)
        .await
        .unwrap();

    // clone, push, start (clone, primary, secondaries), three bench replays, two shutdown batches
    assert_eq!(dispatcher.batch_sizes(), vec![4, 12, 4, 1, 3, 1, 1, 1, 3, 1]);
    assert_eq!(reports.len(), 5);
    assert_eq!(reports[0].phase(PHASE_CLONE).unwrap().results.len(), 4);
    assert_eq!(reports[1].phase(PHASE_PUSH_CONFS).unwrap().results.len(), 12);

    let batches = dispatcher.batches();
    assert!(batches[0]
        .iter()
        .all(|t| t.command.to_string().starts_with("git clone --quiet")));
    assert!(matches!(
        &batches[1][0].command,
        Command::Push { dest, .. } if dest == "storage-deployments/deployment/redis/confs/master-mod.conf"
    ));
    assert!(batches[3][0].command.to_string().contains("confs/master-mod.conf"));
    assert!(batches[4][1].command.to_string().contains("confs/slave-mod.conf"));

    let patched = std::fs::read_to_string(confs.join("master-mod.conf")).unwrap();
    assert!(patched.contains("maxmemory 2gb"));
}

#[tokio::test]
async fn test_sweep_stops_when_no_conf_reaches_any_host() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    redis_confs(dir.path());

    let sweep: ParameterSweep =
        serde_json::from_str(r#"{"redis": {"maxmemory": ["2gb", "4gb"]}}"#).unwrap();
    let book = small_book();
    let dispatcher = RecordingDispatcher::new().with_responder(|t| match &t.command {
        Command::Push { .. } => err_output("scp: storage-deployments/deployment: No such file or directory"),
        _ => Output::default(),
    });

    let mut reports = Vec::new();
    let err = SweepRunner::new(Deployment::new(&dispatcher, &book, &config), &dispatcher, &RandomLoad)
        .with_bench_sizes(vec![2])
        .run_into(&sweep, Database::Redis, &mut reports)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeployError::PhaseFailed { ref phase, failed: 12, total: 12 } if phase == PHASE_PUSH_CONFS
    ));
    // nothing started, second case never ran
    assert_eq!(dispatcher.batch_sizes(), vec![4, 12]);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].failed(), 12);
}
