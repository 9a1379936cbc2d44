//! Fleet lifecycle tests: start, partial start, stop and shutdown.


use std::sync::Arc;
use std::time::Duration;

use hashfleet::config::OrchestratorConfig;
use hashfleet::provision::InstanceId;
use hashfleet::scheduler::{Job, JobStatus};
use hashfleet::worker::Worker;
use hashfleet::FleetError;
use tokio_util::sync::CancellationToken;

use test_harness::{key_file, test_orchestrator, StubProvisioner, StubTransport};

#[tokio::test]
async fn test_start_job_provisions_full_capacity() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let job = orchestrator
        .start_job(Job::new("j1", 3))
        .await
        .expect("job should start");

    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.workers.len(), 3);
    assert!(job.is_fully_provisioned());
    assert_eq!(provisioner.create_count(), 3);

    let registered = orchestrator.registry().get("j1").await.unwrap();
    assert_eq!(registered.worker_ids(), job.worker_ids());
}

#[tokio::test]
async fn test_partial_start_attempts_every_member() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new().failing_creates(&[2, 4]));
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let partial = orchestrator
        .start_job(Job::new("j1", 5))
        .await
        .expect_err("two members fail to provision");

    assert_eq!(provisioner.create_count(), 5);
    assert_eq!(partial.errors.len(), 2);
    assert!(partial
        .errors
        .iter()
        .all(|e| matches!(e, FleetError::ProvisioningFailure(_))));
    assert_eq!(partial.job.workers.len(), 3);
    assert_eq!(partial.job.status, JobStatus::Failed);
    assert!(!partial.already_running());

    // Not registered, and the survivors are still up for the caller to handle
    assert!(!orchestrator.registry().contains("j1").await);
    assert_eq!(provisioner.live_count(), 3);
    assert!(provisioner.terminated().is_empty());

    let message = partial.to_string();
    assert!(message.contains("started 3 of 5 workers"), "{}", message);
}

#[tokio::test]
async fn test_partial_start_can_be_torn_down() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new().failing_creates(&[1]));
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let partial = orchestrator
        .start_job(Job::new("j1", 3))
        .await
        .unwrap_err();
    assert_eq!(partial.job.workers.len(), 2);

    orchestrator.stop_job(&partial.job).await.unwrap();

    assert_eq!(provisioner.live_count(), 0);
    assert_eq!(provisioner.terminated().len(), 2);
}

#[tokio::test]
async fn test_zero_capacity_job_starts_empty() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let job = orchestrator.start_job(Job::new("empty", 0)).await.unwrap();

    assert!(job.workers.is_empty());
    assert_eq!(provisioner.create_count(), 0);
    assert!(orchestrator.registry().contains("empty").await);

    orchestrator.stop_job(&job).await.unwrap();
    assert!(orchestrator.registry().is_empty().await);
}

#[tokio::test]
async fn test_stop_job_terminates_every_worker() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let job = orchestrator.start_job(Job::new("j1", 3)).await.unwrap();
    orchestrator.stop_job(&job).await.unwrap();

    assert_eq!(
        provisioner.terminated(),
        vec![
            InstanceId::from("i-1"),
            InstanceId::from("i-2"),
            InstanceId::from("i-3")
        ]
    );
    assert!(!orchestrator.registry().contains("j1").await);
}

#[tokio::test]
async fn test_stop_job_twice_is_idempotent() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let job = orchestrator.start_job(Job::new("j1", 2)).await.unwrap();
    orchestrator.stop_job(&job).await.unwrap();

    // Instances are already gone; a second stop still succeeds
    orchestrator.stop_job(&job).await.unwrap();
    assert_eq!(provisioner.terminated().len(), 2);
}

#[tokio::test]
async fn test_teardown_failure_still_unregisters() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new().failing_terminates(&["i-2"]));
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let job = orchestrator.start_job(Job::new("j1", 3)).await.unwrap();
    let err = orchestrator.stop_job(&job).await.unwrap_err();

    assert_eq!(err.failure_count(), 1);
    match err {
        FleetError::Aggregate(errors) => {
            let errors = errors.into_inner();
            assert!(matches!(
                &errors[0],
                FleetError::TeardownFailure { instance_id, .. } if instance_id.as_str() == "i-2"
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The other workers were still attempted
    assert_eq!(
        provisioner.terminated(),
        vec![InstanceId::from("i-1"), InstanceId::from("i-3")]
    );
    assert!(!orchestrator.registry().contains("j1").await);
}

#[tokio::test]
async fn test_stop_job_by_id() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    orchestrator.start_job(Job::new("j1", 2)).await.unwrap();

    let stopped = orchestrator.stop_job_by_id("j1").await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);
    assert_eq!(stopped.workers.len(), 2);
    assert_eq!(provisioner.live_count(), 0);

    let err = orchestrator.stop_job_by_id("j1").await.unwrap_err();
    assert!(matches!(err, FleetError::JobNotFound(id) if id == "j1"));
}

#[tokio::test]
async fn test_duplicate_start_is_rejected() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    orchestrator.start_job(Job::new("j1", 2)).await.unwrap();
    let partial = orchestrator.start_job(Job::new("j1", 2)).await.unwrap_err();

    assert!(partial.already_running());
    assert!(partial.job.workers.is_empty());
    // No new instances for the rejected start
    assert_eq!(provisioner.create_count(), 2);
}

#[tokio::test]
async fn test_concurrent_starts_of_same_job_provision_once() {
    let (_dir, key) = key_file();
    let provisioner =
        Arc::new(StubProvisioner::new().with_create_delay(Duration::from_millis(20)));
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let (a, b) = tokio::join!(
        orchestrator.start_job(Job::new("j1", 2)),
        orchestrator.start_job(Job::new("j1", 2)),
    );

    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    assert_eq!(provisioner.create_count(), 2);
}

#[tokio::test]
async fn test_startup_commands_run_on_each_worker() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let transport = StubTransport::new();
    let config = OrchestratorConfig::default()
        .with_startup_command("fetch {job_id}")
        .with_startup_command("hashcat -m {hash_type} {hash} --session {worker_id}");
    let orchestrator = test_orchestrator(provisioner.clone(), transport.clone(), key, config);

    let job = Job::new("j1", 2).with_payload("deadbeef", "0");
    orchestrator.start_job(job).await.unwrap();

    let mut lines = transport.command_lines();
    lines.sort();
    assert_eq!(
        lines,
        vec![
            "fetch j1".to_string(),
            "fetch j1".to_string(),
            "hashcat -m 0 deadbeef --session i-1".to_string(),
            "hashcat -m 0 deadbeef --session i-2".to_string(),
        ]
    );

    // Commands ran against each worker's own address
    let mut hosts: Vec<String> = transport.commands().into_iter().map(|(h, _)| h).collect();
    hosts.sort();
    hosts.dedup();
    assert_eq!(hosts, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
}

#[tokio::test]
async fn test_startup_failure_keeps_worker() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let transport = StubTransport::new().failing_commands("install");
    let config = OrchestratorConfig::default()
        .with_startup_command("install {job_id}")
        .with_startup_command("run {job_id}");
    let orchestrator = test_orchestrator(provisioner.clone(), transport.clone(), key, config);

    let partial = orchestrator.start_job(Job::new("j1", 2)).await.unwrap_err();

    assert_eq!(partial.errors.len(), 2);
    assert!(partial
        .errors
        .iter()
        .all(|e| matches!(e, FleetError::CommandFailure { exit_code: Some(127), .. })));
    // Workers whose instance came up are kept so they can be torn down
    assert_eq!(partial.job.workers.len(), 2);
    // Fail-fast: the second command never ran
    assert!(transport.command_lines().iter().all(|c| c == "install j1"));

    orchestrator.stop_job(&partial.job).await.unwrap();
    assert_eq!(provisioner.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unready_instances_are_terminated() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new().never_ready());
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let partial = orchestrator.start_job(Job::new("j1", 2)).await.unwrap_err();

    assert_eq!(partial.errors.len(), 2);
    assert!(partial
        .errors
        .iter()
        .all(|e| matches!(e, FleetError::ProvisioningTimeout { waited_secs: 10, .. })));
    assert!(partial.job.workers.is_empty());
    assert_eq!(provisioner.terminated().len(), 2);
    assert_eq!(provisioner.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unready_instances_can_be_kept() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new().never_ready());
    let config = OrchestratorConfig {
        terminate_failed_launches: false,
        ..OrchestratorConfig::default()
    };
    let orchestrator =
        test_orchestrator(provisioner.clone(), StubTransport::new(), key, config);

    let partial = orchestrator.start_job(Job::new("j1", 1)).await.unwrap_err();

    assert_eq!(partial.errors.len(), 1);
    assert!(provisioner.terminated().is_empty());
    assert_eq!(provisioner.live_count(), 1);
}

#[tokio::test]
async fn test_cancelled_orchestrator_provisions_nothing() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let cancel = CancellationToken::new();
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    )
    .with_cancellation(cancel.clone());

    cancel.cancel();
    let partial = orchestrator.start_job(Job::new("j1", 3)).await.unwrap_err();

    assert_eq!(partial.errors.len(), 3);
    assert!(partial.errors.iter().all(|e| matches!(e, FleetError::Cancelled)));
    assert_eq!(provisioner.create_count(), 0);
}

#[tokio::test]
async fn test_cancellation_interrupts_readiness_wait() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new().never_ready());
    let cancel = CancellationToken::new();
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    )
    .with_cancellation(cancel.clone());

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let started = tokio::time::Instant::now();
    let partial = orchestrator.start_job(Job::new("j1", 2)).await.unwrap_err();
    canceller.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(partial.errors.iter().all(|e| matches!(e, FleetError::Cancelled)));
    // Teardown of the unready instances is not cancelled
    assert_eq!(provisioner.live_count(), 0);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let (_dir, key) = key_file();
    let provisioner =
        Arc::new(StubProvisioner::new().with_create_delay(Duration::from_millis(20)));
    let config = OrchestratorConfig {
        max_concurrency: 2,
        ..OrchestratorConfig::default()
    };
    let orchestrator =
        test_orchestrator(provisioner.clone(), StubTransport::new(), key, config);

    let job = orchestrator.start_job(Job::new("j1", 6)).await.unwrap();

    assert_eq!(job.workers.len(), 6);
    assert!(provisioner.max_in_flight() <= 2);
}

#[tokio::test]
async fn test_shutdown_stops_all_jobs() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    orchestrator.start_job(Job::new("j1", 2)).await.unwrap();
    orchestrator.start_job(Job::new("j2", 3)).await.unwrap();
    assert_eq!(orchestrator.registry().len().await, 2);

    orchestrator.shutdown().await.unwrap();

    assert!(orchestrator.registry().is_empty().await);
    assert_eq!(provisioner.terminated().len(), 5);
    assert_eq!(provisioner.live_count(), 0);
}

#[tokio::test]
async fn test_stale_partial_stop_keeps_later_start_registered() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new().failing_creates(&[2]));
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let partial = orchestrator.start_job(Job::new("j1", 2)).await.unwrap_err();
    let running = orchestrator.start_job(Job::new("j1", 2)).await.unwrap();
    assert_ne!(partial.job.generation, running.generation);

    orchestrator.stop_job(&partial.job).await.unwrap();

    // Only the partial fleet went away; the running start is still tracked
    let registered = orchestrator.registry().get("j1").await.unwrap();
    assert_eq!(registered.generation, running.generation);
    assert!(running.worker_ids().iter().all(|id| provisioner.is_live(id)));

    orchestrator.shutdown().await.unwrap();
    assert_eq!(provisioner.live_count(), 0);
}

#[tokio::test]
async fn test_rollback_tears_down_partial_fleet() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new().failing_creates(&[1]));
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let partial = orchestrator.start_job(Job::new("j1", 3)).await.unwrap_err();
    orchestrator.rollback(partial.job).await.unwrap();

    assert_eq!(provisioner.live_count(), 0);
    assert_eq!(provisioner.terminated().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_start_still_reclaims_unready_instances() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new().never_ready());
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let abandoned =
        tokio::time::timeout(Duration::from_secs(3), orchestrator.start_job(Job::new("j1", 3)))
            .await;
    assert!(abandoned.is_err());
    assert_eq!(provisioner.create_count(), 3);

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(provisioner.live_count(), 0);
    assert_eq!(provisioner.terminated().len(), 3);
    assert!(!orchestrator.registry().contains("j1").await);
}

#[tokio::test]
async fn test_dropped_start_tears_down_partial_fleet() {
    let (_dir, key) = key_file();
    let provisioner =
        Arc::new(StubProvisioner::new().with_create_delay(Duration::from_millis(50)));
    let transport = StubTransport::new().failing_commands("install");
    let config = OrchestratorConfig::default().with_startup_command("install {job_id}");
    let orchestrator = test_orchestrator(provisioner.clone(), transport, key, config);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        orchestrator.start_job(Job::new("j1", 2)),
    )
    .await;
    assert!(abandoned.is_err());

    // Workers came up, failed startup, and were torn down with nobody waiting
    let lock = orchestrator.registry().lock_job("j1").await;
    drop(lock);
    assert_eq!(provisioner.create_count(), 2);
    assert_eq!(provisioner.terminated().len(), 2);
    assert_eq!(provisioner.live_count(), 0);
}

#[tokio::test]
async fn test_dropped_start_that_succeeds_stays_registered() {
    let (_dir, key) = key_file();
    let provisioner =
        Arc::new(StubProvisioner::new().with_create_delay(Duration::from_millis(50)));
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        orchestrator.start_job(Job::new("j1", 2)),
    )
    .await;
    assert!(abandoned.is_err());

    let lock = orchestrator.registry().lock_job("j1").await;
    drop(lock);
    let job = orchestrator.registry().get("j1").await.unwrap();
    assert_eq!(job.workers.len(), 2);

    orchestrator.shutdown().await.unwrap();
    assert_eq!(provisioner.live_count(), 0);
}

#[tokio::test]
async fn test_start_rejects_job_with_workers() {
    let (_dir, key) = key_file();
    let provisioner = Arc::new(StubProvisioner::new());
    let orchestrator = test_orchestrator(
        provisioner.clone(),
        StubTransport::new(),
        key,
        OrchestratorConfig::default(),
    );

    let mut job = Job::new("j1", 1);
    job.add_worker(Worker::new(InstanceId::from("i-old"))).unwrap();

    let partial = orchestrator.start_job(job).await.unwrap_err();

    assert_eq!(partial.errors.len(), 1);
    assert!(matches!(
        partial.errors.iter().next(),
        Some(FleetError::JobNotEmpty(id)) if id == "j1"
    ));
    assert_eq!(provisioner.create_count(), 0);
    assert!(!orchestrator.registry().contains("j1").await);
}
