//! Fixtures for swarm end-to-end tests.
//!
//! Tests run against a real in-process state server and emulate the
//! distributor + worker side of the system through the same public HTTP
//! endpoints those components use.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use std::sync::Mutex;

use serde_json::{json, Value};

use jobmon_client::Requester;
use jobmon_core::config::{HeartbeatConfig, SwarmConfig};
use jobmon_core::constants::WorkflowRunStatus;
use jobmon_core::contracts::*;
use jobmon_server::storage::MemoryStateStore;
use jobmon_swarm::{ArrayDescription, TaskDescription, WorkflowDescription};

/// Fast cadences so scenarios settle in well under a second of wall clock.
pub fn fast_swarm_config() -> SwarmConfig {
    SwarmConfig {
        heartbeat: fast_heartbeat(),
        poll_interval: Duration::from_millis(10),
        wedged_workflow_sync_interval: 600.0,
        fail_fast: false,
    }
}

pub fn fast_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        workflow_run_interval: Duration::from_millis(40),
        task_instance_interval: Duration::from_millis(40),
        report_by_buffer: 1.5,
    }
}

/// Serve the app over an ephemeral port; returns its base url.
pub async fn spawn_server(store: Arc<MemoryStateStore>) -> String {
    let app = jobmon_server::build_app(store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// One task to seed: (name, max_attempts, upstream node ids).
pub struct TaskSpec {
    pub node_id: i64,
    pub name: &'static str,
    pub max_attempts: i64,
    pub upstreams: Vec<i64>,
}

pub struct SeededRun {
    pub requester: Requester,
    pub store: Arc<MemoryStateStore>,
    pub workflow_id: i64,
    pub dag_id: i64,
    pub array_id: i64,
    pub workflow_run_id: i64,
    /// node_id -> task_id
    pub tasks_by_node: HashMap<i64, i64>,
    pub description: WorkflowDescription,
}

impl SeededRun {
    pub fn task_id(&self, node_id: i64) -> i64 {
        self.tasks_by_node[&node_id]
    }
}

/// Seed a workflow through the public API and register its first run.
pub async fn seed_workflow(
    tasks: Vec<TaskSpec>,
    max_concurrently_running: i64,
    array_max_concurrently_running: i64,
) -> SeededRun {
    let store = Arc::new(MemoryStateStore::new());
    let url = spawn_server(store.clone()).await;
    let requester = Requester::new(&url);

    let dag: AddDagResponse = requester
        .post("/dag", &AddDagRequest { hash: "it-dag".to_string() })
        .await
        .unwrap();

    // Downstream lists derived from the declared upstreams.
    let mut downstreams: HashMap<i64, Vec<i64>> = HashMap::new();
    for task in &tasks {
        for upstream in &task.upstreams {
            downstreams.entry(*upstream).or_default().push(task.node_id);
        }
    }
    let edges: Vec<EdgeWire> = tasks
        .iter()
        .map(|task| EdgeWire {
            node_id: task.node_id,
            upstream_node_ids: task.upstreams.clone(),
            downstream_node_ids: downstreams.get(&task.node_id).cloned().unwrap_or_default(),
        })
        .collect();
    let _: Value = requester
        .post(&format!("/dag/{}/edges", dag.dag_id), &AddEdgesRequest { edges })
        .await
        .unwrap();

    let workflow: BindWorkflowResponse = requester
        .post(
            "/workflow",
            &BindWorkflowRequest {
                tool_version_id: 1,
                dag_id: dag.dag_id,
                workflow_args_hash: "wf-args".to_string(),
                task_hash: "wf-tasks".to_string(),
                name: "integration-workflow".to_string(),
                description: String::new(),
                max_concurrently_running,
            },
        )
        .await
        .unwrap();

    let array: AddArrayResponse = requester
        .post(
            "/array",
            &AddArrayRequest {
                workflow_id: workflow.workflow_id,
                task_template_version_id: 1,
                name: "it-array".to_string(),
                max_concurrently_running: array_max_concurrently_running,
                stdout_dir: "/tmp".to_string(),
                stderr_dir: "/tmp".to_string(),
            },
        )
        .await
        .unwrap();

    let resources: BindTaskResourcesResponse = requester
        .post(
            "/task/bind_resources",
            &BindTaskResourcesRequest {
                queue_name: "all.q".to_string(),
                cluster_name: "sequential".to_string(),
                requested_resources: BTreeMap::from([("cores".to_string(), json!(1))]),
            },
        )
        .await
        .unwrap();

    let bind_requests: Vec<BindTaskRequest> = tasks
        .iter()
        .map(|task| BindTaskRequest {
            node_id: task.node_id,
            array_id: array.array_id,
            task_args_hash: format!("args-{}", task.node_id),
            task_resources_id: resources.task_resources_id,
            name: task.name.to_string(),
            command: "echo hi".to_string(),
            max_attempts: task.max_attempts,
            resource_scales: BTreeMap::new(),
            fallback_queues: vec![],
        })
        .collect();
    let bound: BindTasksResponse = requester
        .put(
            "/task/bind_tasks",
            &BindTasksRequest {
                workflow_id: workflow.workflow_id,
                tasks: bind_requests,
            },
        )
        .await
        .unwrap();
    let tasks_by_node: HashMap<i64, i64> =
        bound.tasks.iter().map(|t| (t.node_id, t.task_id)).collect();

    let run: RegisterWorkflowRunResponse = requester
        .post(
            "/workflow_run",
            &RegisterWorkflowRunRequest {
                workflow_id: workflow.workflow_id,
                user: "testuser".to_string(),
                jobmon_version: "0.2.0".to_string(),
                next_report_increment: 45.0,
            },
        )
        .await
        .unwrap();

    let description = WorkflowDescription {
        workflow_id: workflow.workflow_id,
        dag_id: dag.dag_id,
        max_concurrently_running,
        arrays: vec![ArrayDescription {
            array_id: array.array_id,
            name: "it-array".to_string(),
            max_concurrently_running: array_max_concurrently_running,
        }],
        tasks: tasks
            .iter()
            .map(|task| TaskDescription {
                task_id: tasks_by_node[&task.node_id],
                array_id: array.array_id,
                status: jobmon_core::TaskStatus::Registering,
                max_attempts: task.max_attempts,
                upstream_task_ids: task.upstreams.iter().map(|n| tasks_by_node[n]).collect(),
                downstream_task_ids: downstreams
                    .get(&task.node_id)
                    .map(|nodes| nodes.iter().map(|n| tasks_by_node[n]).collect())
                    .unwrap_or_default(),
                cluster_name: "sequential".to_string(),
                queue_name: "all.q".to_string(),
                requested_resources: BTreeMap::from([("cores".to_string(), json!(1))]),
                resource_scales: BTreeMap::new(),
                fallback_queues: vec![],
                compute_resources_callable: None,
            })
            .collect(),
    };

    SeededRun {
        requester,
        store,
        workflow_id: workflow.workflow_id,
        dag_id: dag.dag_id,
        array_id: array.array_id,
        workflow_run_id: run.workflow_run_id,
        tasks_by_node,
        description,
    }
}

/// What the fake executor does with an attempt of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Fail,
    /// Report running and never finish.
    Hang,
}

/// Emulates the distributor and worker nodes over the public endpoints:
/// claims QUEUED instances, launches them, reports them running and applies
/// the scripted per-task outcome (successive attempts consume successive
/// outcomes; the default is success).
pub struct FakeExecutor {
    requester: Requester,
    workflow_run_id: i64,
    outcomes: Mutex<HashMap<i64, VecDeque<Outcome>>>,
    delay: Duration,
}

impl FakeExecutor {
    pub fn new(run: &SeededRun) -> Arc<Self> {
        Arc::new(Self {
            requester: run.requester.clone(),
            workflow_run_id: run.workflow_run_id,
            outcomes: Mutex::new(HashMap::new()),
            delay: Duration::from_millis(5),
        })
    }

    pub fn script(self: Arc<Self>, task_id: i64, outcomes: Vec<Outcome>) -> Arc<Self> {
        self.outcomes
            .lock()
            .unwrap()
            .insert(task_id, outcomes.into());
        self
    }

    fn next_outcome(&self, task_id: i64) -> Outcome {
        self.outcomes
            .lock()
            .unwrap()
            .get_mut(&task_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Outcome::Success)
    }

    /// March the run through the distributor attach states, waiting out
    /// the swarm builder's BOUND transition if it has not landed yet.
    pub async fn attach(&self) {
        for status in [WorkflowRunStatus::Instantiated, WorkflowRunStatus::Launched] {
            for _ in 0..500 {
                let result: Result<WorkflowRunStatusResponse, _> = self
                    .requester
                    .put(
                        &format!("/workflow_run/{}/update_status", self.workflow_run_id),
                        &UpdateWorkflowRunStatusRequest { status },
                    )
                    .await;
                if result.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    /// One sweep: instantiate, launch, run, settle.
    pub async fn step(&self) {
        let sync: SyncStatusResponse = self
            .requester
            .post(
                &format!("/workflow_run/{}/sync_status", self.workflow_run_id),
                &SyncStatusRequest {
                    status: jobmon_core::TaskInstanceStatus::Queued,
                    task_instance_ids: vec![],
                },
            )
            .await
            .unwrap();
        let queued = sync
            .status_updates
            .get(&jobmon_core::TaskInstanceStatus::Queued)
            .cloned()
            .unwrap_or_default();
        if queued.is_empty() {
            return;
        }

        let instantiated: InstantiateTaskInstancesResponse = self
            .requester
            .post(
                "/task_instance/instantiate_task_instances",
                &InstantiateTaskInstancesRequest {
                    task_instance_ids: queued,
                },
            )
            .await
            .unwrap();

        for batch in instantiated.task_instance_batches {
            let _: Value = self
                .requester
                .post(
                    &format!("/array/{}/transition_to_launched", batch.array_id),
                    &TransitionBatchToLaunchedRequest {
                        batch_number: batch.array_batch_num,
                        next_report_increment: 135.0,
                    },
                )
                .await
                .unwrap();

            for task_instance_id in batch.task_instance_ids {
                let running: LogRunningResponse = self
                    .requester
                    .post(
                        &format!("/task_instance/{task_instance_id}/log_running"),
                        &LogRunningRequest {
                            nodename: "fake-node".to_string(),
                            process_group_id: 1,
                            next_report_increment: 135.0,
                            distributor_id: Some(format!("fake-{task_instance_id}")),
                        },
                    )
                    .await
                    .unwrap();
                if running.task_instance.status != jobmon_core::TaskInstanceStatus::Running {
                    continue;
                }

                tokio::time::sleep(self.delay).await;
                match self.next_outcome(running.task_instance.task_id) {
                    Outcome::Success => {
                        let _: TaskInstanceStatusResponse = self
                            .requester
                            .post(
                                &format!("/task_instance/{task_instance_id}/log_done"),
                                &LogDoneRequest {
                                    nodename: Some("fake-node".to_string()),
                                    stdout_log: Some("hi".to_string()),
                                    ..Default::default()
                                },
                            )
                            .await
                            .unwrap();
                    }
                    Outcome::Fail => {
                        let _: TaskInstanceStatusResponse = self
                            .requester
                            .post(
                                &format!("/task_instance/{task_instance_id}/log_error_worker_node"),
                                &LogErrorWorkerNodeRequest {
                                    error_state: jobmon_core::TaskInstanceStatus::Error,
                                    error_description: "exit code 1".to_string(),
                                    distributor_id: None,
                                    nodename: Some("fake-node".to_string()),
                                    stdout: None,
                                    stderr: None,
                                    stdout_log: None,
                                    stderr_log: Some("boom".to_string()),
                                },
                            )
                            .await
                            .unwrap();
                    }
                    Outcome::Hang => {}
                }
            }
        }
    }

    /// Sweep continuously until the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.attach().await;
            loop {
                self.step().await;
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
        })
    }
}
