//! DistributorService behavior against an in-process state server and a
//! scripted cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, queued_fixture};

use jobmon_core::constants::{TaskInstanceStatus, TaskStatus};
use jobmon_distributor::{DistributorService, FakeCluster};
use jobmon_server::storage::StateStore;

async fn attached_service(
    fixture: &common::Fixture,
    cluster: Arc<FakeCluster>,
) -> DistributorService {
    let mut service = DistributorService::new(cluster, fixture.requester.clone(), fast_config());
    service.set_workflow_run(fixture.workflow_run_id).await.unwrap();
    service
}

fn shutdown_channel() -> tokio::sync::watch::Receiver<bool> {
    tokio::sync::watch::channel(false).1
}

#[tokio::test]
async fn array_capable_cluster_launches_one_submission() {
    let fixture = queued_fixture(3).await;
    let cluster = Arc::new(FakeCluster::new(true));
    let mut service = attached_service(&fixture, cluster.clone()).await;
    let mut shutdown = shutdown_channel();

    service.tick(&mut shutdown).await.unwrap();

    // One array submission covering all three instances.
    let submissions = cluster.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].array_length, Some(3));
    assert!(submissions[0].command.contains("--array-id"));

    // Server side: every instance LAUNCHED with a distributor id, tasks
    // LAUNCHED too.
    let rows = fixture.store.task_status_rows(fixture.task_ids.clone()).await.unwrap();
    for row in &rows {
        assert_eq!(row.status, TaskStatus::Launched);
        assert_eq!(row.task_instance_status, Some(TaskInstanceStatus::Launched));
    }
    assert_eq!(service.tracked(TaskInstanceStatus::Launched).len(), 3);
}

#[tokio::test]
async fn missing_array_support_falls_back_to_per_instance() {
    let fixture = queued_fixture(3).await;
    let cluster = Arc::new(FakeCluster::new(false));
    let mut service = attached_service(&fixture, cluster.clone()).await;
    let mut shutdown = shutdown_channel();

    service.tick(&mut shutdown).await.unwrap();

    let submissions = cluster.submissions();
    assert_eq!(submissions.len(), 3);
    assert!(submissions.iter().all(|s| s.array_length.is_none()));
    assert!(submissions[0].command.contains("--task-instance-id"));

    let rows = fixture.store.task_status_rows(fixture.task_ids.clone()).await.unwrap();
    for row in &rows {
        assert_eq!(row.status, TaskStatus::Launched);
        assert_eq!(row.task_instance_status, Some(TaskInstanceStatus::Launched));
    }
}

#[tokio::test]
async fn submission_failure_consumes_an_attempt() {
    let fixture = queued_fixture(2).await;
    let cluster = Arc::new(FakeCluster::new(true));
    cluster.fail_submissions("sbatch: error: queue is closed");
    let mut service = attached_service(&fixture, cluster.clone()).await;
    let mut shutdown = shutdown_channel();

    service.tick(&mut shutdown).await.unwrap();

    // Every instance is NO_DISTRIBUTOR_ID with the submission error in its
    // trail; the tasks still have attempts, so they re-enter the scheduler.
    let rows = fixture.store.task_status_rows(fixture.task_ids.clone()).await.unwrap();
    for row in &rows {
        assert_eq!(row.status, TaskStatus::AdjustingResources);
        assert_eq!(
            row.task_instance_status,
            Some(TaskInstanceStatus::NoDistributorId)
        );
        assert_eq!(
            row.error_description.as_deref(),
            Some("sbatch: error: queue is closed")
        );
    }
    // The distributor dropped them; nothing is tracked as launched.
    assert!(service.tracked(TaskInstanceStatus::Launched).is_empty());
}

#[tokio::test]
async fn triage_applies_the_remote_exit_classification() {
    let fixture = queued_fixture(1).await;
    let cluster = Arc::new(FakeCluster::new(true));
    let mut service = attached_service(&fixture, cluster.clone()).await;
    let mut shutdown = shutdown_channel();

    service.tick(&mut shutdown).await.unwrap();
    let launched = service.tracked(TaskInstanceStatus::Launched);
    assert_eq!(launched.len(), 1);
    let task_instance_id = launched[0];

    // The job dies on the cluster; its deadline lapses and the sweep flags
    // it for triage.
    cluster.mark_dead("fake-1_0", TaskInstanceStatus::ResourceError, "oom-killed");
    tokio::time::sleep(Duration::from_millis(80)).await;
    let moved = fixture
        .store
        .set_status_for_triaging(fixture.workflow_run_id)
        .await
        .unwrap();
    assert_eq!(moved, 1);

    service.tick(&mut shutdown).await.unwrap();

    let rows = fixture.store.task_status_rows(vec![fixture.task_ids[0]]).await.unwrap();
    assert_eq!(
        rows[0].task_instance_status,
        Some(TaskInstanceStatus::ResourceError)
    );
    assert_eq!(rows[0].error_description.as_deref(), Some("oom-killed"));
    assert_eq!(rows[0].status, TaskStatus::AdjustingResources);

    let log = fixture.store.task_instance_error_log(task_instance_id).await.unwrap();
    assert_eq!(log.len(), 1);
}

#[tokio::test]
async fn kill_self_terminates_on_the_cluster_and_fails_fatally() {
    let fixture = queued_fixture(1).await;
    let cluster = Arc::new(FakeCluster::new(true));
    let mut service = attached_service(&fixture, cluster.clone()).await;
    let mut shutdown = shutdown_channel();

    service.tick(&mut shutdown).await.unwrap();

    // A resume flags the in-flight instance.
    fixture
        .store
        .terminate_task_instances(fixture.workflow_run_id)
        .await
        .unwrap();

    service.tick(&mut shutdown).await.unwrap();

    assert_eq!(cluster.terminated(), vec!["fake-1_0".to_string()]);
    let rows = fixture.store.task_status_rows(vec![fixture.task_ids[0]]).await.unwrap();
    assert_eq!(
        rows[0].task_instance_status,
        Some(TaskInstanceStatus::ErrorFatal)
    );
    assert_eq!(rows[0].status, TaskStatus::ErrorFatal);
}

#[tokio::test]
async fn heartbeats_cover_only_jobs_the_cluster_vouches_for() {
    let fixture = queued_fixture(2).await;
    let cluster = Arc::new(FakeCluster::new(true));
    let mut service = attached_service(&fixture, cluster.clone()).await;
    let mut shutdown = shutdown_channel();

    service.tick(&mut shutdown).await.unwrap();

    // One job vanishes from the cluster; only the survivor gets its
    // report-by extended on the next tick.
    cluster.mark_dead("fake-1_0", TaskInstanceStatus::UnknownError, "vanished");
    tokio::time::sleep(Duration::from_millis(80)).await;
    service.tick(&mut shutdown).await.unwrap();

    // The vanished job's deadline was never extended, so the sweep only
    // catches it.
    let moved = fixture
        .store
        .set_status_for_triaging(fixture.workflow_run_id)
        .await
        .unwrap();
    assert_eq!(moved, 1);
}
