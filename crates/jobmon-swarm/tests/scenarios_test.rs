//! End-to-end scheduling scenarios against an in-process state server.
//!
//! The swarm under test is the real thing; the distributor and worker sides
//! are emulated through the same public endpoints those agents use.

mod common;

use std::time::Duration;

use common::{fast_heartbeat, fast_swarm_config, seed_workflow, FakeExecutor, Outcome, TaskSpec};

use jobmon_core::constants::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus};
use jobmon_server::storage::StateStore;
use jobmon_swarm::{SwarmBuilder, WorkflowRunOrchestrator};

fn linear(names: &[&'static str], max_attempts: i64) -> Vec<TaskSpec> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| TaskSpec {
            node_id: i as i64 + 1,
            name,
            max_attempts,
            upstreams: if i == 0 { vec![] } else { vec![i as i64] },
        })
        .collect()
}

#[tokio::test]
async fn linear_three_task_workflow_runs_to_done() {
    let run = seed_workflow(linear(&["t1", "t2", "t3"], 3), 10_000, 10_000).await;
    let executor = FakeExecutor::new(&run);
    let executor_handle = executor.spawn();

    let mut builder = SwarmBuilder::new(run.requester.clone(), run.workflow_run_id, fast_heartbeat());
    let state = builder.build_from_workflow(run.description.clone()).await.unwrap();
    let gateway = builder.gateway(&state);
    let mut orchestrator = WorkflowRunOrchestrator::new(state, gateway, fast_swarm_config());

    let status = orchestrator.run(Some(30.0)).await.unwrap();
    executor_handle.abort();

    assert_eq!(status, WorkflowRunStatus::Done);
    let tasks = run.store.workflow_tasks(run.workflow_id, None, 100).await.unwrap();
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.num_attempts, 1);
    }
    // Exactly one attempt per task.
    assert_eq!(run.store.task_instance_count(), 3);
}

#[tokio::test]
async fn middle_task_failure_strands_the_downstream() {
    let mut specs = linear(&["t1", "t2", "t3"], 3);
    specs[1].max_attempts = 1;
    let run = seed_workflow(specs, 10_000, 10_000).await;
    let t2 = run.task_id(2);

    let executor = FakeExecutor::new(&run).script(t2, vec![Outcome::Fail]);
    let executor_handle = executor.spawn();

    let mut builder = SwarmBuilder::new(run.requester.clone(), run.workflow_run_id, fast_heartbeat());
    let state = builder.build_from_workflow(run.description.clone()).await.unwrap();
    let gateway = builder.gateway(&state);
    let mut orchestrator = WorkflowRunOrchestrator::new(state, gateway, fast_swarm_config());

    let status = orchestrator.run(Some(30.0)).await.unwrap();
    executor_handle.abort();

    assert_eq!(status, WorkflowRunStatus::Error);
    let rows = run
        .store
        .task_status_rows(vec![run.task_id(1), t2, run.task_id(3)])
        .await
        .unwrap();
    assert_eq!(rows[0].status, TaskStatus::Done);
    assert_eq!(rows[1].status, TaskStatus::ErrorFatal);
    assert_eq!(rows[1].task_instance_status, Some(TaskInstanceStatus::Error));
    // The stranded downstream never left registration and has no attempts.
    assert_eq!(rows[2].status, TaskStatus::Registering);
    assert_eq!(rows[2].task_instance_id, None);
}

#[tokio::test]
async fn recoverable_error_retries_to_done() {
    let run = seed_workflow(linear(&["t1"], 2), 10_000, 10_000).await;
    let t1 = run.task_id(1);

    let executor = FakeExecutor::new(&run).script(t1, vec![Outcome::Fail, Outcome::Success]);
    let executor_handle = executor.spawn();

    let mut builder = SwarmBuilder::new(run.requester.clone(), run.workflow_run_id, fast_heartbeat());
    let state = builder.build_from_workflow(run.description.clone()).await.unwrap();
    let gateway = builder.gateway(&state);
    let mut orchestrator = WorkflowRunOrchestrator::new(state, gateway, fast_swarm_config());

    let status = orchestrator.run(Some(30.0)).await.unwrap();
    executor_handle.abort();

    assert_eq!(status, WorkflowRunStatus::Done);
    let tasks = run.store.workflow_tasks(run.workflow_id, None, 10).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Done);
    assert_eq!(tasks[0].num_attempts, 2);
    // Two attempts: the failed one and the successful one.
    assert_eq!(run.store.task_instance_count(), 2);
    let rows = run.store.task_status_rows(vec![t1]).await.unwrap();
    assert_eq!(rows[0].task_instance_status, Some(TaskInstanceStatus::Done));
}

#[tokio::test]
async fn workflow_concurrency_cap_bounds_active_tasks() {
    // Five independent tasks, workflow cap 2, array cap 5.
    let specs: Vec<TaskSpec> = (1..=5)
        .map(|node_id| TaskSpec {
            node_id,
            name: "fanout",
            max_attempts: 3,
            upstreams: vec![],
        })
        .collect();
    let run = seed_workflow(specs, 2, 5).await;

    let executor = FakeExecutor::new(&run);
    let executor_handle = executor.spawn();

    // Poll task statuses while the run progresses, recording the peak
    // number of in-flight tasks.
    let max_active = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let store = run.store.clone();
    let workflow_id = run.workflow_id;
    let observed = max_active.clone();
    let monitor = tokio::spawn(async move {
        loop {
            let tasks = store.workflow_tasks(workflow_id, None, 100).await.unwrap();
            let active = tasks.iter().filter(|t| t.status.is_active()).count();
            observed.fetch_max(active, std::sync::atomic::Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    });

    let mut builder = SwarmBuilder::new(run.requester.clone(), run.workflow_run_id, fast_heartbeat());
    let state = builder.build_from_workflow(run.description.clone()).await.unwrap();
    let gateway = builder.gateway(&state);
    let mut orchestrator = WorkflowRunOrchestrator::new(state, gateway, fast_swarm_config());

    let status = orchestrator.run(Some(30.0)).await.unwrap();
    executor_handle.abort();
    monitor.abort();

    assert_eq!(status, WorkflowRunStatus::Done);
    let tasks = run.store.workflow_tasks(run.workflow_id, None, 100).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Done));

    // At no observed point were more than two tasks in flight.
    let peak = max_active.load(std::sync::atomic::Ordering::Relaxed);
    assert!(peak <= 2, "observed {peak} concurrent tasks with a cap of 2");
    assert!(peak > 0, "the monitor never saw the workflow make progress");
}

#[tokio::test]
async fn resume_rebuilds_only_the_unfinished_frontier() {
    // Diamond: t1 -> {t2, t3} -> t4, with t3 failing permanently.
    let specs = vec![
        TaskSpec { node_id: 1, name: "t1", max_attempts: 3, upstreams: vec![] },
        TaskSpec { node_id: 2, name: "t2", max_attempts: 3, upstreams: vec![1] },
        TaskSpec { node_id: 3, name: "t3", max_attempts: 1, upstreams: vec![1] },
        TaskSpec { node_id: 4, name: "t4", max_attempts: 3, upstreams: vec![2, 3] },
    ];
    let run = seed_workflow(specs, 10_000, 10_000).await;
    let t3 = run.task_id(3);

    let executor = FakeExecutor::new(&run).script(t3, vec![Outcome::Fail]);
    let executor_handle = executor.spawn();

    let mut builder = SwarmBuilder::new(run.requester.clone(), run.workflow_run_id, fast_heartbeat());
    let state = builder.build_from_workflow(run.description.clone()).await.unwrap();
    let gateway = builder.gateway(&state);
    let mut orchestrator = WorkflowRunOrchestrator::new(state, gateway, fast_swarm_config());
    let status = orchestrator.run(Some(30.0)).await.unwrap();
    executor_handle.abort();

    assert_eq!(status, WorkflowRunStatus::Error);
    let rows = run
        .store
        .task_status_rows(vec![run.task_id(1), run.task_id(2), t3, run.task_id(4)])
        .await
        .unwrap();
    assert_eq!(rows[0].status, TaskStatus::Done);
    assert_eq!(rows[1].status, TaskStatus::Done);
    assert_eq!(rows[2].status, TaskStatus::ErrorFatal);
    assert_eq!(rows[3].status, TaskStatus::Registering);

    // Reset and rebuild from the database under a fresh run.
    run.store.set_task_resume_state(run.workflow_id, true).await.unwrap();
    let (new_run_id, _) = run
        .store
        .register_workflow_run(run.workflow_id, "testuser", "0.2.0", 45.0)
        .await
        .unwrap();

    let mut builder = SwarmBuilder::new(run.requester.clone(), new_run_id, fast_heartbeat());
    let mut state = builder.build_from_workflow_id(run.workflow_id).await.unwrap();

    // Only the unfinished frontier is materialized: no DONE tasks.
    assert_eq!(state.tasks.len(), 2);
    assert!(state.get_task(t3).is_some());
    assert!(state.get_task(run.task_id(4)).is_some());

    // Upstream counts reflect loaded tasks only: t3 has no live upstreams,
    // t4 waits for t3 alone.
    assert_eq!(state.get_task(t3).unwrap().num_upstreams, 0);
    assert_eq!(state.get_task(run.task_id(4)).unwrap().num_upstreams, 1);

    state.set_initial_fringe().unwrap();
    assert_eq!(state.ready_to_run, std::collections::VecDeque::from([t3]));
}

#[tokio::test]
async fn wedged_workflow_recovers_via_full_sync() {
    // t1 -> t2 where t1 hangs; its DONE lands directly in the database with
    // a stale status_date, invisible to incremental sync.
    let run = seed_workflow(linear(&["t1", "t2"], 3), 10_000, 10_000).await;
    let t1 = run.task_id(1);

    let executor = FakeExecutor::new(&run).script(t1, vec![Outcome::Hang]);
    let executor_handle = executor.spawn();

    let mut config = fast_swarm_config();
    config.wedged_workflow_sync_interval = -1.0;

    let mut builder = SwarmBuilder::new(run.requester.clone(), run.workflow_run_id, fast_heartbeat());
    let state = builder.build_from_workflow(run.description.clone()).await.unwrap();
    let gateway = builder.gateway(&state);
    let mut orchestrator = WorkflowRunOrchestrator::new(state, gateway, config);

    let store = run.store.clone();
    let wedger = tokio::spawn(async move {
        // Let t1 reach RUNNING, then complete it behind the swarm's back.
        tokio::time::sleep(Duration::from_millis(120)).await;
        store.backdate_task_status(t1, TaskStatus::Done, 10);
    });

    let status = orchestrator.run(Some(30.0)).await.unwrap();
    executor_handle.abort();
    wedger.await.unwrap();

    assert_eq!(status, WorkflowRunStatus::Done);
    let tasks = run.store.workflow_tasks(run.workflow_id, None, 10).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Done));
}

#[tokio::test]
async fn fail_fast_stops_scheduling_new_work() {
    // Two independent roots; the failing one trips fail-fast while the
    // other's downstream would otherwise still be scheduled.
    let specs = vec![
        TaskSpec { node_id: 1, name: "bad", max_attempts: 1, upstreams: vec![] },
        TaskSpec { node_id: 2, name: "slow", max_attempts: 3, upstreams: vec![] },
        TaskSpec { node_id: 3, name: "after-slow", max_attempts: 3, upstreams: vec![2] },
    ];
    let run = seed_workflow(specs, 10_000, 10_000).await;
    let bad = run.task_id(1);

    let executor = FakeExecutor::new(&run).script(bad, vec![Outcome::Fail]);
    let executor_handle = executor.spawn();

    let mut config = fast_swarm_config();
    config.fail_fast = true;

    let mut builder = SwarmBuilder::new(run.requester.clone(), run.workflow_run_id, fast_heartbeat());
    let state = builder.build_from_workflow(run.description.clone()).await.unwrap();
    let gateway = builder.gateway(&state);
    let mut orchestrator = WorkflowRunOrchestrator::new(state, gateway, config);

    let status = orchestrator.run(Some(30.0)).await.unwrap();
    executor_handle.abort();

    assert_eq!(status, WorkflowRunStatus::Error);
    let rows = run.store.task_status_rows(vec![bad]).await.unwrap();
    assert_eq!(rows[0].status, TaskStatus::ErrorFatal);
}

#[tokio::test]
async fn timeout_leaves_the_run_resumable() {
    // Nothing ever executes the queued work: the run must time out without
    // forcing any transition.
    let run = seed_workflow(linear(&["t1"], 3), 10_000, 10_000).await;

    let mut builder = SwarmBuilder::new(run.requester.clone(), run.workflow_run_id, fast_heartbeat());
    let state = builder.build_from_workflow(run.description.clone()).await.unwrap();
    let gateway = builder.gateway(&state);
    let mut orchestrator = WorkflowRunOrchestrator::new(state, gateway, fast_swarm_config());

    let result = orchestrator.run(Some(0.3)).await;
    assert!(matches!(
        result,
        Err(jobmon_swarm::SwarmError::Timeout { .. })
    ));

    // The run is still live server-side; a resume signal can reclaim it.
    assert!(!run.store.is_resumable(run.workflow_id).await.unwrap());
    run.store.set_resume(run.workflow_id, true, "testuser").await.unwrap();
    run.store
        .terminate_task_instances(run.workflow_run_id)
        .await
        .unwrap();
    assert!(run.store.is_resumable(run.workflow_id).await.unwrap());
}
