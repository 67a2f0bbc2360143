//! Fixtures for distributor tests: an in-process state server plus a seeded
//! workflow with queued task instances.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use jobmon_client::Requester;
use jobmon_core::config::{DistributorConfig, HeartbeatConfig};
use jobmon_core::constants::WorkflowRunStatus;
use jobmon_core::contracts::{AddArrayRequest, BindTaskRequest, BindWorkflowRequest};
use jobmon_server::storage::{MemoryStateStore, StateStore};

pub fn fast_config() -> DistributorConfig {
    DistributorConfig {
        heartbeat: HeartbeatConfig {
            workflow_run_interval: Duration::from_millis(50),
            task_instance_interval: Duration::from_millis(50),
            report_by_buffer: 1.2,
        },
        poll_interval: Duration::from_millis(10),
        raise_on_error: true,
    }
}

pub struct Fixture {
    pub store: Arc<MemoryStateStore>,
    pub requester: Requester,
    pub workflow_id: i64,
    pub array_id: i64,
    pub task_resources_id: i64,
    pub workflow_run_id: i64,
    pub task_ids: Vec<i64>,
}

/// Seed `n` independent tasks, register a bound run and queue everything.
pub async fn queued_fixture(n: usize) -> Fixture {
    let store = Arc::new(MemoryStateStore::new());
    let app = jobmon_server::build_app(store.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let requester = Requester::new(&format!("http://{addr}"));

    let (dag_id, _) = store.add_dag("dist-dag").await.unwrap();
    let (workflow_id, _, _) = store
        .bind_workflow(BindWorkflowRequest {
            tool_version_id: 1,
            dag_id,
            workflow_args_hash: "dist-args".to_string(),
            task_hash: "dist-tasks".to_string(),
            name: "dist-workflow".to_string(),
            description: String::new(),
            max_concurrently_running: 10_000,
        })
        .await
        .unwrap();
    let array_id = store
        .add_array(AddArrayRequest {
            workflow_id,
            task_template_version_id: 1,
            name: "dist-array".to_string(),
            max_concurrently_running: 10_000,
            stdout_dir: "/tmp".to_string(),
            stderr_dir: "/tmp".to_string(),
        })
        .await
        .unwrap();
    let task_resources_id = store
        .bind_task_resources(
            "all.q",
            "fake",
            BTreeMap::from([("cores".to_string(), json!(1))]),
        )
        .await
        .unwrap();

    let tasks: Vec<BindTaskRequest> = (1..=n as i64)
        .map(|node_id| BindTaskRequest {
            node_id,
            array_id,
            task_args_hash: format!("args-{node_id}"),
            task_resources_id,
            name: format!("t{node_id}"),
            command: "echo hi".to_string(),
            max_attempts: 3,
            resource_scales: BTreeMap::new(),
            fallback_queues: vec![],
        })
        .collect();
    let bound = store.bind_tasks(workflow_id, tasks).await.unwrap();
    let task_ids: Vec<i64> = bound.iter().map(|t| t.task_id).collect();

    let (workflow_run_id, _) = store
        .register_workflow_run(workflow_id, "testuser", "0.2.0", 45.0)
        .await
        .unwrap();
    store
        .update_workflow_run_status(workflow_run_id, WorkflowRunStatus::Bound)
        .await
        .unwrap();
    store
        .queue_task_batch(array_id, task_ids.clone(), task_resources_id, workflow_run_id)
        .await
        .unwrap();

    Fixture {
        store,
        requester,
        workflow_id,
        array_id,
        task_resources_id,
        workflow_run_id,
        task_ids,
    }
}
