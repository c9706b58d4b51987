//! Redis lifecycle integration tests
//!
//! Drive the orchestrator against a recording dispatcher and check the
//! batches it sends, phase by phase.

#[allow(dead_code)]
mod common;

use common::{err_output, small_book, test_config, RecordingDispatcher};
use deploy_cluster::config::RedisMode;
use deploy_cluster::error::DeployError;
use deploy_cluster::lifecycle::redis::{PHASE_PRIMARY_START, PHASE_SECONDARY_START};
use deploy_cluster::lifecycle::{ClusterLifecycle, Deployment, RedisLifecycle, PHASE_CLONE, PHASE_PULL};
use deploy_cluster::report::{Action, Report};
use deploy_cluster::types::{AddressBook, Command, Database, Output, Role};

#[tokio::test]
async fn test_start_batches_follow_phase_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let book = small_book();
    let dispatcher = RecordingDispatcher::new();

    let report = RedisLifecycle::new(Deployment::new(&dispatcher, &book, &config))
        .start()
        .await
        .unwrap();

    assert_eq!(dispatcher.batch_sizes(), vec![4, 1, 3]);
    let batches = dispatcher.batches();
    assert!(batches[0]
        .iter()
        .all(|t| t.command.to_string().starts_with("git clone --quiet")));
    assert!(batches[1][0].command.to_string().contains("master.conf"));

    // sentinel first, then replicas in address book order
    let secondaries: Vec<_> = batches[2].iter().map(|t| t.host.as_str()).collect();
    assert_eq!(secondaries, vec!["10.0.0.4", "10.0.0.2", "10.0.0.3"]);
    assert!(batches[2][0].command.to_string().contains("--sentinel monitor mymaster 10.0.0.1 6379 1"));
    assert!(batches[2][1].command.to_string().contains("--replicaof 10.0.0.1 6379"));

    assert!(report.phase(PHASE_PULL).is_none());
    assert_eq!(report.phase(PHASE_CLONE).unwrap().results.len(), 4);
    assert_eq!(report.phase(PHASE_SECONDARY_START).unwrap().results.len(), 3);
    assert_eq!(report.failed(), 0);
}

#[tokio::test]
async fn test_failed_clone_is_repaired_with_pull() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let book = small_book();
    let dispatcher = RecordingDispatcher::new().with_responder(|t| {
        let line = t.command.to_string();
        if t.host == "10.0.0.3" && line.starts_with("git clone") {
            err_output("fatal: destination path 'storage-deployments' already exists")
        } else {
            Output::default()
        }
    });

    let report = RedisLifecycle::new(Deployment::new(&dispatcher, &book, &config))
        .start()
        .await
        .unwrap();

    assert_eq!(dispatcher.batch_sizes(), vec![4, 1, 1, 3]);
    let pull = &dispatcher.batches()[1][0];
    assert_eq!(pull.host, "10.0.0.3");
    assert_eq!(
        pull.command,
        Command::Shell {
            line: "cd storage-deployments && git pull --quiet".into()
        }
    );
    assert_eq!(report.phase(PHASE_PULL).unwrap().results.len(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_dependents_before_primaries() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let book = small_book();
    let dispatcher = RecordingDispatcher::new();

    let report = RedisLifecycle::new(Deployment::new(&dispatcher, &book, &config))
        .shutdown()
        .await
        .unwrap();

    assert_eq!(dispatcher.batch_sizes(), vec![3, 1]);
    assert_eq!(
        dispatcher.lines(),
        vec![
            "redis-cli -h 10.0.0.2 -p 6379 shutdown nosave",
            "redis-cli -h 10.0.0.3 -p 6379 shutdown nosave",
            "redis-cli -h 10.0.0.4 -p 26379 shutdown nosave",
            "redis-cli -h 10.0.0.1 -p 6379 shutdown nosave",
        ]
    );
    assert_eq!(report.phases.len(), 2);
}

#[tokio::test]
async fn test_local_primary_is_launched_not_dispatched() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let book = small_book();
    let dispatcher = RecordingDispatcher::new().with_local(["10.0.0.1"]);

    let report = RedisLifecycle::new(Deployment::new(&dispatcher, &book, &config))
        .start()
        .await
        .unwrap();

    // clone skips this machine, the primary never reaches the executor
    assert_eq!(dispatcher.batch_sizes(), vec![3, 3]);
    let launched = dispatcher.launched();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].program, "redis-server");
    assert!(launched[0].args[0].starts_with(&dir.path().display().to_string()));

    assert_eq!(report.local.len(), 1);
    assert!(report.phase(PHASE_PRIMARY_START).unwrap().results.is_empty());
}

#[tokio::test]
async fn test_all_primaries_failing_aborts_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let book = small_book();
    let dispatcher = RecordingDispatcher::new().with_responder(|t| {
        if t.command.to_string().contains("master.conf") {
            err_output("redis-server: command not found")
        } else {
            Output::default()
        }
    });

    let err = RedisLifecycle::new(Deployment::new(&dispatcher, &book, &config))
        .start()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeployError::PhaseFailed { ref phase, failed: 1, total: 1 } if phase == PHASE_PRIMARY_START
    ));
    // nothing after the failed phase was dispatched
    assert_eq!(dispatcher.batch_sizes(), vec![4, 1]);
}

#[tokio::test]
async fn test_partial_secondary_failure_keeps_going() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let book = small_book();
    let dispatcher = RecordingDispatcher::new().with_responder(|t| {
        if t.host == "10.0.0.2" && t.command.to_string().contains("slave.conf") {
            err_output("bind: address in use")
        } else {
            Output::default()
        }
    });

    let report = RedisLifecycle::new(Deployment::new(&dispatcher, &book, &config))
        .start()
        .await
        .unwrap();
    assert_eq!(report.failed(), 1);
}

#[tokio::test]
async fn test_cluster_mode_creates_cluster_from_first_primary() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.redis.mode = RedisMode::Cluster;
    let book = small_book();
    let dispatcher = RecordingDispatcher::new();

    RedisLifecycle::new(Deployment::new(&dispatcher, &book, &config))
        .start()
        .await
        .unwrap();

    assert_eq!(dispatcher.batch_sizes(), vec![4, 1, 3, 1]);
    let create = &dispatcher.batches()[3][0];
    assert_eq!(create.host, "10.0.0.1");
    assert_eq!(
        create.command.to_string(),
        "redis-cli --cluster create 10.0.0.1:6379 10.0.0.2:6379 10.0.0.3:6379 10.0.0.4:6379 \
         --cluster-replicas 0 --cluster-yes"
    );
}

#[tokio::test]
async fn test_empty_address_book_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let book = AddressBook::default();
    let dispatcher = RecordingDispatcher::new();

    let report = RedisLifecycle::new(Deployment::new(&dispatcher, &book, &config))
        .start()
        .await
        .unwrap();
    assert!(report.phases.is_empty());
    assert!(dispatcher.batches().is_empty());
}

#[tokio::test]
async fn test_aborted_start_keeps_the_failed_phase_in_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let book = small_book();
    let dispatcher = RecordingDispatcher::new().with_responder(|t| {
        if t.command.to_string().contains("master.conf") {
            err_output("redis-server: command not found")
        } else {
            Output::default()
        }
    });

    let mut report = Report::new(Database::Redis, Action::Start);
    let err = RedisLifecycle::new(Deployment::new(&dispatcher, &book, &config))
        .start_into(&mut report)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::PhaseFailed { ref phase, .. } if phase == PHASE_PRIMARY_START));
    assert_eq!(report.phase(PHASE_CLONE).unwrap().results.len(), 4);
    let primary = &report.phase(PHASE_PRIMARY_START).unwrap().results;
    assert_eq!(primary.len(), 1);
    assert_eq!(primary[0].target.host, "10.0.0.1");
    assert!(primary[0].is_error());
    assert_eq!(report.failed(), 1);
}

#[tokio::test]
async fn test_partial_address_book_is_rejected_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.redis.mode = RedisMode::Cluster;
    let mut book = small_book();
    book.primary.clear();
    let dispatcher = RecordingDispatcher::new();
    let redis = RedisLifecycle::new(Deployment::new(&dispatcher, &book, &config));

    let err = redis.start().await.unwrap_err();
    assert!(matches!(err, DeployError::MissingRoleGroup(Role::Primary)));
    let err = redis.shutdown().await.unwrap_err();
    assert!(matches!(err, DeployError::MissingRoleGroup(Role::Primary)));
    assert!(dispatcher.batches().is_empty());
}
