//! Worker runtime against an in-process state server, running real shell
//! commands.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use jobmon_client::Requester;
use jobmon_core::config::{HeartbeatConfig, WorkerConfig};
use jobmon_core::constants::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus};
use jobmon_core::contracts::{AddArrayRequest, BindTaskRequest, BindWorkflowRequest};
use jobmon_server::storage::{MemoryStateStore, StateStore};
use jobmon_worker::{LocalWorkerNode, WorkerNodeTaskInstance};

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        heartbeat: HeartbeatConfig {
            workflow_run_interval: Duration::from_millis(50),
            task_instance_interval: Duration::from_millis(50),
            report_by_buffer: 1.5,
        },
        command_interrupt_timeout: Duration::from_millis(500),
    }
}

struct WorkerFixture {
    store: Arc<MemoryStateStore>,
    requester: Requester,
    workflow_run_id: i64,
    task_id: i64,
    task_instance_id: i64,
    #[allow(dead_code)]
    log_dir: TempDir,
}

/// Seed one task with the given command and walk its instance to LAUNCHED,
/// the state a cluster-invoked worker starts from.
async fn launched_fixture(command: &str) -> WorkerFixture {
    let store = Arc::new(MemoryStateStore::new());
    let app = jobmon_server::build_app(store.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let requester = Requester::new(&format!("http://{addr}"));

    let log_dir = TempDir::new().unwrap();
    let log_path = log_dir.path().to_string_lossy().into_owned();

    let (dag_id, _) = store.add_dag("worker-dag").await.unwrap();
    let (workflow_id, _, _) = store
        .bind_workflow(BindWorkflowRequest {
            tool_version_id: 1,
            dag_id,
            workflow_args_hash: "w-args".to_string(),
            task_hash: "w-tasks".to_string(),
            name: "worker-workflow".to_string(),
            description: String::new(),
            max_concurrently_running: 100,
        })
        .await
        .unwrap();
    let array_id = store
        .add_array(AddArrayRequest {
            workflow_id,
            task_template_version_id: 1,
            name: "worker-array".to_string(),
            max_concurrently_running: 100,
            stdout_dir: log_path.clone(),
            stderr_dir: log_path,
        })
        .await
        .unwrap();
    let task_resources_id = store
        .bind_task_resources(
            "all.q",
            "local_process",
            BTreeMap::from([("cores".to_string(), json!(1))]),
        )
        .await
        .unwrap();
    let bound = store
        .bind_tasks(
            workflow_id,
            vec![BindTaskRequest {
                node_id: 1,
                array_id,
                task_args_hash: "args-1".to_string(),
                task_resources_id,
                name: "w1".to_string(),
                command: command.to_string(),
                max_attempts: 3,
                resource_scales: BTreeMap::new(),
                fallback_queues: vec![],
            }],
        )
        .await
        .unwrap();
    let task_id = bound[0].task_id;

    let (workflow_run_id, _) = store
        .register_workflow_run(workflow_id, "testuser", "0.2.0", 45.0)
        .await
        .unwrap();
    store
        .update_workflow_run_status(workflow_run_id, WorkflowRunStatus::Bound)
        .await
        .unwrap();
    store
        .queue_task_batch(array_id, vec![task_id], task_resources_id, workflow_run_id)
        .await
        .unwrap();
    let sync = store
        .sync_status(workflow_run_id, TaskInstanceStatus::Queued, vec![])
        .await
        .unwrap();
    let task_instance_id = sync[&TaskInstanceStatus::Queued][0];
    store
        .instantiate_task_instances(vec![task_instance_id])
        .await
        .unwrap();
    store
        .transition_batch_to_launched(array_id, 1, 135.0)
        .await
        .unwrap();

    WorkerFixture {
        store,
        requester,
        workflow_run_id,
        task_id,
        task_instance_id,
        log_dir,
    }
}

fn worker(fixture: &WorkerFixture) -> WorkerNodeTaskInstance {
    WorkerNodeTaskInstance::new(
        fixture.requester.clone(),
        Arc::new(LocalWorkerNode),
        fixture.task_instance_id,
        fast_worker_config(),
    )
}

#[tokio::test]
async fn successful_command_reports_done_with_captured_output() {
    let fixture = launched_fixture("echo hello from jobmon").await;
    let mut worker = worker(&fixture);

    let status = worker.run().await.unwrap();
    assert_eq!(status, TaskInstanceStatus::Done);
    assert_eq!(worker.command_returncode(), Some(0));

    // Stream capture wrote through to the declared file.
    let stdout = tokio::fs::read_to_string(worker.stdout_path().unwrap())
        .await
        .unwrap();
    assert_eq!(stdout, "hello from jobmon\n");

    // Server side: instance DONE with the tail recorded, task DONE.
    let rows = fixture.store.task_status_rows(vec![fixture.task_id]).await.unwrap();
    assert_eq!(rows[0].status, TaskStatus::Done);
    assert_eq!(rows[0].task_instance_status, Some(TaskInstanceStatus::Done));
}

#[tokio::test]
async fn failing_command_reports_the_exit_classification() {
    let fixture = launched_fixture("echo boom >&2; exit 3").await;
    let mut worker = worker(&fixture);

    let status = worker.run().await.unwrap();
    assert_eq!(status, TaskInstanceStatus::Error);
    assert_eq!(worker.command_returncode(), Some(3));

    let log = fixture
        .store
        .task_instance_error_log(fixture.task_instance_id)
        .await
        .unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].description.contains("exited with code 3"));
    assert!(log[0].description.contains("boom"));

    // One attempt consumed, more remain.
    let rows = fixture.store.task_status_rows(vec![fixture.task_id]).await.unwrap();
    assert_eq!(rows[0].status, TaskStatus::AdjustingResources);
}

#[tokio::test]
async fn long_commands_heartbeat_while_running() {
    let fixture = launched_fixture("sleep 0.3; echo finally").await;
    let mut worker = worker(&fixture);

    // The 50ms heartbeat interval forces several report-by posts during
    // the 300ms sleep; if any were missed the deadline (75ms) would lapse
    // and the sweep below would catch it.
    let status = worker.run().await.unwrap();
    assert_eq!(status, TaskInstanceStatus::Done);

    let moved = fixture
        .store
        .set_status_for_triaging(fixture.workflow_run_id)
        .await
        .unwrap();
    assert_eq!(moved, 0);
}

#[tokio::test]
async fn kill_self_tears_down_the_subprocess() {
    let fixture = launched_fixture("sleep 30").await;
    let mut worker = worker(&fixture);

    // Flag the instance shortly after it starts running.
    let store = fixture.store.clone();
    let workflow_run_id = fixture.workflow_run_id;
    let killer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.terminate_task_instances(workflow_run_id).await.unwrap()
    });

    let started = std::time::Instant::now();
    let status = worker.run().await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(killer.await.unwrap(), 1);

    // The worker noticed at a heartbeat, killed the sleep and reported the
    // fatal status well before the command would have finished.
    assert_eq!(status, TaskInstanceStatus::ErrorFatal);
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");

    let rows = fixture.store.task_status_rows(vec![fixture.task_id]).await.unwrap();
    assert_eq!(rows[0].status, TaskStatus::ErrorFatal);
    let log = fixture
        .store
        .task_instance_error_log(fixture.task_instance_id)
        .await
        .unwrap();
    assert!(log[0].description.contains("KILL_SELF"));
}

#[tokio::test]
async fn log_running_refuses_a_non_running_handshake() {
    let fixture = launched_fixture("echo never").await;

    // The instance is flagged before the worker comes up: the server
    // resolves the handshake to ERROR_FATAL and the worker surfaces it.
    fixture
        .store
        .terminate_task_instances(fixture.workflow_run_id)
        .await
        .unwrap();

    let mut worker = worker(&fixture);
    let result = worker.run().await;
    match result {
        Err(jobmon_worker::WorkerNodeError::Transition { actual, .. }) => {
            assert_eq!(actual, TaskInstanceStatus::ErrorFatal);
        }
        other => panic!("expected a transition error, got {other:?}"),
    }
}
