//! Shared fixtures for server tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use jobmon_core::constants::WorkflowRunStatus;
use jobmon_core::contracts::{AddArrayRequest, BindTaskRequest, BindWorkflowRequest, EdgeWire};
use jobmon_server::storage::{MemoryStateStore, StateStore};

pub const TEST_USER: &str = "testuser";

/// A fully seeded linear workflow: t1 -> t2 -> ... -> tN.
pub struct SeededWorkflow {
    pub store: Arc<MemoryStateStore>,
    pub workflow_id: i64,
    pub dag_id: i64,
    pub array_id: i64,
    pub task_resources_id: i64,
    pub workflow_run_id: i64,
    pub task_ids: Vec<i64>,
}

/// Seed a linear chain of `n` tasks with a bound workflow run.
pub async fn seed_linear_workflow(n: usize) -> SeededWorkflow {
    let store = Arc::new(MemoryStateStore::new());
    seed_on_store(store, n).await
}

pub async fn seed_on_store(store: Arc<MemoryStateStore>, n: usize) -> SeededWorkflow {
    let (dag_id, _) = store.add_dag("dag-hash-1").await.unwrap();

    // Linear edges over node ids 1..=n.
    let edges: Vec<EdgeWire> = (1..=n as i64)
        .map(|node_id| EdgeWire {
            node_id,
            upstream_node_ids: if node_id > 1 { vec![node_id - 1] } else { vec![] },
            downstream_node_ids: if node_id < n as i64 {
                vec![node_id + 1]
            } else {
                vec![]
            },
        })
        .collect();
    store.add_edges(dag_id, edges).await.unwrap();

    let (workflow_id, _, _) = store
        .bind_workflow(BindWorkflowRequest {
            tool_version_id: 1,
            dag_id,
            workflow_args_hash: "args-hash".to_string(),
            task_hash: "task-hash".to_string(),
            name: "test-workflow".to_string(),
            description: String::new(),
            max_concurrently_running: 10_000,
        })
        .await
        .unwrap();

    let array_id = store
        .add_array(AddArrayRequest {
            workflow_id,
            task_template_version_id: 1,
            name: "test-array".to_string(),
            max_concurrently_running: 10_000,
            stdout_dir: "/tmp".to_string(),
            stderr_dir: "/tmp".to_string(),
        })
        .await
        .unwrap();

    let task_resources_id = store
        .bind_task_resources(
            "all.q",
            "sequential",
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
    let task_ids = bound.iter().map(|t| t.task_id).collect();

    let (workflow_run_id, _) = store
        .register_workflow_run(workflow_id, TEST_USER, "0.2.0", 45.0)
        .await
        .unwrap();
    store
        .update_workflow_run_status(workflow_run_id, WorkflowRunStatus::Linking)
        .await
        .unwrap();
    store
        .update_workflow_run_status(workflow_run_id, WorkflowRunStatus::Bound)
        .await
        .unwrap();

    SeededWorkflow {
        store,
        workflow_id,
        dag_id,
        array_id,
        task_resources_id,
        workflow_run_id,
        task_ids,
    }
}
