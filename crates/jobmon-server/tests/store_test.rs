//! StateStore semantics over the in-memory backend.
//!
//! Every behavior here is backend-independent: the PostgreSQL store
//! implements the same contract and is exercised against a live database in
//! deployment pipelines.

mod common;

use common::{seed_linear_workflow, TEST_USER};

use jobmon_core::constants::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus};
use jobmon_server::storage::{RunningReport, StateStore, StoreError, WorkerReport};

fn running_report() -> RunningReport {
    RunningReport {
        nodename: "node1.cluster".to_string(),
        process_group_id: 4242,
        next_report_increment: 135.0,
        distributor_id: Some("sbatch-1".to_string()),
    }
}

/// Queue a seeded workflow's tasks and walk the first instance to RUNNING.
/// Returns the task instance id.
async fn launch_first_instance(wf: &common::SeededWorkflow) -> i64 {
    let store = &wf.store;
    store
        .queue_task_batch(
            wf.array_id,
            wf.task_ids.clone(),
            wf.task_resources_id,
            wf.workflow_run_id,
        )
        .await
        .unwrap();
    let sync = store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::Queued, vec![])
        .await
        .unwrap();
    let queued = sync[&TaskInstanceStatus::Queued].clone();
    let batches = store.instantiate_task_instances(queued).await.unwrap();
    let batch = &batches[0];
    store
        .transition_batch_to_launched(batch.array_id, batch.array_batch_num, 135.0)
        .await
        .unwrap();
    let ti_id = batch.task_instance_ids[0];
    store.log_running(ti_id, running_report()).await.unwrap();
    ti_id
}

#[tokio::test]
async fn queue_task_batch_reports_every_input_task() {
    let wf = seed_linear_workflow(3).await;

    let by_status = wf
        .store
        .queue_task_batch(
            wf.array_id,
            wf.task_ids.clone(),
            wf.task_resources_id,
            wf.workflow_run_id,
        )
        .await
        .unwrap();
    assert_eq!(by_status[&TaskStatus::Queued].len(), 3);

    // Re-queueing already-QUEUED tasks is a no-op but must still return
    // their current status, never an empty map.
    let again = wf
        .store
        .queue_task_batch(
            wf.array_id,
            wf.task_ids.clone(),
            wf.task_resources_id,
            wf.workflow_run_id,
        )
        .await
        .unwrap();
    assert_eq!(again[&TaskStatus::Queued].len(), 3);

    // No duplicate instances were created by the no-op.
    assert_eq!(wf.store.task_instance_count(), 3);
}

#[tokio::test]
async fn queue_task_batch_numbers_batches_and_steps() {
    let wf = seed_linear_workflow(3).await;
    wf.store
        .queue_task_batch(
            wf.array_id,
            wf.task_ids.clone(),
            wf.task_resources_id,
            wf.workflow_run_id,
        )
        .await
        .unwrap();

    let sync = wf
        .store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::Queued, vec![])
        .await
        .unwrap();
    let queued = sync[&TaskInstanceStatus::Queued].clone();
    let batches = wf.store.instantiate_task_instances(queued).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].array_batch_num, 1);
    assert_eq!(batches[0].task_instance_ids.len(), 3);
    assert_eq!(batches[0].array_name, "test-array");
}

#[tokio::test]
async fn instantiate_gates_on_the_task_transition() {
    let wf = seed_linear_workflow(2).await;
    wf.store
        .queue_task_batch(
            wf.array_id,
            wf.task_ids.clone(),
            wf.task_resources_id,
            wf.workflow_run_id,
        )
        .await
        .unwrap();
    let sync = wf
        .store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::Queued, vec![])
        .await
        .unwrap();
    let queued = sync[&TaskInstanceStatus::Queued].clone();

    // Force one task out of QUEUED behind the distributor's back; its
    // instance must not instantiate.
    wf.store
        .update_task_statuses(vec![wf.task_ids[0]], TaskStatus::ErrorFatal, wf.workflow_id)
        .await
        .unwrap();

    let batches = wf.store.instantiate_task_instances(queued).await.unwrap();
    let instantiated: usize = batches.iter().map(|b| b.task_instance_ids.len()).sum();
    assert_eq!(instantiated, 1);
}

#[tokio::test]
async fn full_happy_path_lands_task_done() {
    let wf = seed_linear_workflow(1).await;
    let ti_id = launch_first_instance(&wf).await;

    let status = wf
        .store
        .log_done(ti_id, WorkerReport::default())
        .await
        .unwrap();
    assert_eq!(status, TaskInstanceStatus::Done);

    let rows = wf.store.task_status_rows(vec![wf.task_ids[0]]).await.unwrap();
    assert_eq!(rows[0].status, TaskStatus::Done);
    assert_eq!(rows[0].task_instance_status, Some(TaskInstanceStatus::Done));
}

#[tokio::test]
async fn repeated_log_done_is_idempotent() {
    let wf = seed_linear_workflow(1).await;
    let ti_id = launch_first_instance(&wf).await;

    let first = wf.store.log_done(ti_id, WorkerReport::default()).await.unwrap();
    let second = wf.store.log_done(ti_id, WorkerReport::default()).await.unwrap();
    assert_eq!(first, TaskInstanceStatus::Done);
    assert_eq!(second, TaskInstanceStatus::Done);

    // The repeat created no error-log rows.
    let log = wf.store.task_instance_error_log(ti_id).await.unwrap();
    assert!(log.is_empty());
}

#[tokio::test]
async fn recoverable_error_consults_the_attempt_budget() {
    let wf = seed_linear_workflow(1).await;
    let task_id = wf.task_ids[0];
    let ti_id = launch_first_instance(&wf).await;

    let status = wf
        .store
        .log_error_worker_node(
            ti_id,
            TaskInstanceStatus::Error,
            "exit code 1".to_string(),
            WorkerReport::default(),
        )
        .await
        .unwrap();
    assert_eq!(status, TaskInstanceStatus::Error);

    // num_attempts (1) < max_attempts (3): the task re-enters the scheduler.
    let rows = wf.store.task_status_rows(vec![task_id]).await.unwrap();
    assert_eq!(rows[0].status, TaskStatus::AdjustingResources);
    assert_eq!(rows[0].error_description.as_deref(), Some("exit code 1"));
}

#[tokio::test]
async fn exhausted_attempts_fail_the_task_fatally() {
    let wf = seed_linear_workflow(1).await;
    let task_id = wf.task_ids[0];

    for attempt in 1..=3 {
        let by_status = wf
            .store
            .queue_task_batch(
                wf.array_id,
                vec![task_id],
                wf.task_resources_id,
                wf.workflow_run_id,
            )
            .await
            .unwrap();
        assert_eq!(by_status[&TaskStatus::Queued], vec![task_id]);

        let sync = wf
            .store
            .sync_status(wf.workflow_run_id, TaskInstanceStatus::Queued, vec![])
            .await
            .unwrap();
        let queued = sync[&TaskInstanceStatus::Queued].clone();
        let batches = wf.store.instantiate_task_instances(queued).await.unwrap();
        let batch = &batches[0];
        assert_eq!(batch.array_batch_num, attempt);
        wf.store
            .transition_batch_to_launched(batch.array_id, batch.array_batch_num, 135.0)
            .await
            .unwrap();
        let ti_id = batch.task_instance_ids[0];
        wf.store.log_running(ti_id, running_report()).await.unwrap();
        wf.store
            .log_error_worker_node(
                ti_id,
                TaskInstanceStatus::Error,
                format!("attempt {attempt} failed"),
                WorkerReport::default(),
            )
            .await
            .unwrap();
    }

    let rows = wf.store.task_status_rows(vec![task_id]).await.unwrap();
    assert_eq!(rows[0].status, TaskStatus::ErrorFatal);

    let tasks = wf.store.workflow_tasks(wf.workflow_id, None, 100).await.unwrap();
    assert_eq!(tasks[0].num_attempts, 3);
    assert_eq!(tasks[0].max_attempts, 3);
}

#[tokio::test]
async fn kill_self_observed_at_log_running_goes_fatal() {
    let wf = seed_linear_workflow(1).await;
    wf.store
        .queue_task_batch(
            wf.array_id,
            wf.task_ids.clone(),
            wf.task_resources_id,
            wf.workflow_run_id,
        )
        .await
        .unwrap();
    wf.store
        .terminate_task_instances(wf.workflow_run_id)
        .await
        .unwrap();

    let sync = wf
        .store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::KillSelf, vec![])
        .await
        .unwrap();
    let ti_id = sync[&TaskInstanceStatus::KillSelf][0];

    let wire = wf.store.log_running(ti_id, running_report()).await.unwrap();
    assert_eq!(wire.status, TaskInstanceStatus::ErrorFatal);

    let rows = wf.store.task_status_rows(vec![wf.task_ids[0]]).await.unwrap();
    assert_eq!(rows[0].status, TaskStatus::ErrorFatal);
}

#[tokio::test]
async fn triage_sweep_moves_overdue_instances() {
    let wf = seed_linear_workflow(2).await;
    wf.store
        .queue_task_batch(
            wf.array_id,
            wf.task_ids.clone(),
            wf.task_resources_id,
            wf.workflow_run_id,
        )
        .await
        .unwrap();
    let sync = wf
        .store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::Queued, vec![])
        .await
        .unwrap();
    let queued = sync[&TaskInstanceStatus::Queued].clone();
    let batches = wf.store.instantiate_task_instances(queued).await.unwrap();
    let batch = &batches[0];

    // Launch with an already-elapsed deadline.
    wf.store
        .transition_batch_to_launched(batch.array_id, batch.array_batch_num, -1.0)
        .await
        .unwrap();

    // First instance got a distributor id and reported running; the second
    // never got one.
    let with_id = batch.task_instance_ids[0];
    let without_id = batch.task_instance_ids[1];
    wf.store
        .log_array_distributor_ids(
            wf.array_id,
            std::collections::HashMap::from([(with_id, "job-7".to_string())]),
        )
        .await
        .unwrap();
    let mut report = running_report();
    report.next_report_increment = -1.0;
    wf.store.log_running(with_id, report).await.unwrap();

    let moved = wf
        .store
        .set_status_for_triaging(wf.workflow_run_id)
        .await
        .unwrap();
    assert_eq!(moved, 2);

    let triaging = wf
        .store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::Triaging, vec![])
        .await
        .unwrap();
    assert_eq!(triaging[&TaskInstanceStatus::Triaging], vec![with_id]);

    let rows = wf.store.task_status_rows(vec![wf.task_ids[1]]).await.unwrap();
    assert_eq!(
        rows[0].task_instance_status,
        Some(TaskInstanceStatus::NoHeartbeat)
    );
}

#[tokio::test]
async fn late_heartbeat_wins_the_triage_race() {
    let wf = seed_linear_workflow(1).await;
    wf.store
        .queue_task_batch(
            wf.array_id,
            wf.task_ids.clone(),
            wf.task_resources_id,
            wf.workflow_run_id,
        )
        .await
        .unwrap();
    let sync = wf
        .store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::Queued, vec![])
        .await
        .unwrap();
    let queued = sync[&TaskInstanceStatus::Queued].clone();
    let batches = wf.store.instantiate_task_instances(queued).await.unwrap();
    let batch = &batches[0];
    let ti_id = batch.task_instance_ids[0];

    // Launch already overdue, with a distributor id, and sweep into triage.
    wf.store
        .transition_batch_to_launched(batch.array_id, batch.array_batch_num, -1.0)
        .await
        .unwrap();
    wf.store
        .log_array_distributor_ids(
            wf.array_id,
            std::collections::HashMap::from([(ti_id, "job-9".to_string())]),
        )
        .await
        .unwrap();
    let moved = wf
        .store
        .set_status_for_triaging(wf.workflow_run_id)
        .await
        .unwrap();
    assert_eq!(moved, 1);

    // The worker was alive all along: its heartbeat pulls the instance
    // back to RUNNING.
    let status = wf
        .store
        .log_report_by(ti_id, 135.0, WorkerReport::default())
        .await
        .unwrap();
    assert_eq!(status, TaskInstanceStatus::Running);

    // With a fresh deadline, log_unknown_error must refuse to transition.
    let status = wf
        .store
        .log_triage_error(
            ti_id,
            TaskInstanceStatus::UnknownError,
            "reconciler thought it was gone".to_string(),
            None,
            None,
            true,
        )
        .await
        .unwrap();
    assert_eq!(status, TaskInstanceStatus::Running);
}

#[tokio::test]
async fn sync_status_reports_corrections_and_newcomers() {
    let wf = seed_linear_workflow(2).await;
    wf.store
        .queue_task_batch(
            wf.array_id,
            wf.task_ids.clone(),
            wf.task_resources_id,
            wf.workflow_run_id,
        )
        .await
        .unwrap();

    // Caller knows nothing: both instances are newcomers in QUEUED.
    let updates = wf
        .store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::Queued, vec![])
        .await
        .unwrap();
    let queued = updates[&TaskInstanceStatus::Queued].clone();
    assert_eq!(queued.len(), 2);

    // Now the caller believes both are QUEUED; nothing changed, so no
    // updates at all.
    let updates = wf
        .store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::Queued, queued.clone())
        .await
        .unwrap();
    assert!(updates.is_empty());

    // One instantiates behind the caller's back: correction reported.
    let batches = wf
        .store
        .instantiate_task_instances(vec![queued[0]])
        .await
        .unwrap();
    assert_eq!(batches.len(), 1);
    let updates = wf
        .store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::Queued, queued.clone())
        .await
        .unwrap();
    assert_eq!(updates[&TaskInstanceStatus::Instantiated], vec![queued[0]]);
}

#[tokio::test]
async fn resume_flow_resets_the_unfinished_frontier() {
    let wf = seed_linear_workflow(3).await;
    let ti_id = launch_first_instance(&wf).await;
    wf.store.log_done(ti_id, WorkerReport::default()).await.unwrap();

    // A second run cannot start while the first is live.
    let refused = wf
        .store
        .register_workflow_run(wf.workflow_id, TEST_USER, "0.2.0", 45.0)
        .await;
    assert!(matches!(refused, Err(StoreError::NotResumable { .. })));

    // Resume by the wrong user is rejected.
    let refused = wf.store.set_resume(wf.workflow_id, true, "intruder").await;
    assert!(matches!(refused, Err(StoreError::Unauthorized(_))));

    // Cold resume: the run is signaled, then terminated; in-flight
    // instances get the kill flag.
    wf.store.set_resume(wf.workflow_id, true, TEST_USER).await.unwrap();
    let status = wf
        .store
        .log_workflow_run_heartbeat(wf.workflow_run_id, WorkflowRunStatus::Running, 45.0)
        .await
        .unwrap();
    assert_eq!(status, WorkflowRunStatus::ColdResume);
    assert!(!wf.store.is_resumable(wf.workflow_id).await.unwrap());

    wf.store
        .terminate_task_instances(wf.workflow_run_id)
        .await
        .unwrap();
    assert!(wf.store.is_resumable(wf.workflow_id).await.unwrap());

    // Task reset spares DONE (and REGISTERING) tasks.
    let reset = wf.store.set_task_resume_state(wf.workflow_id, true).await.unwrap();
    assert_eq!(reset, 2);
    let rows = wf.store.task_status_rows(wf.task_ids.clone()).await.unwrap();
    assert_eq!(rows[0].status, TaskStatus::Done);
    assert_eq!(rows[1].status, TaskStatus::Registering);
    assert_eq!(rows[2].status, TaskStatus::Registering);

    // And a fresh run can now register.
    let (new_run, status) = wf
        .store
        .register_workflow_run(wf.workflow_id, TEST_USER, "0.2.0", 45.0)
        .await
        .unwrap();
    assert!(new_run > wf.workflow_run_id);
    assert_eq!(status, WorkflowRunStatus::Registered);
}

#[tokio::test]
async fn get_tasks_paginates_and_excludes_done() {
    let wf = seed_linear_workflow(5).await;
    let ti_id = launch_first_instance(&wf).await;
    wf.store.log_done(ti_id, WorkerReport::default()).await.unwrap();

    // chunk_size=0 returns nothing.
    let chunk = wf.store.get_tasks(wf.workflow_id, 0, 0).await.unwrap();
    assert!(chunk.is_empty());

    // Two pages of two, then the tail; the DONE task never appears.
    let first = wf.store.get_tasks(wf.workflow_id, 0, 2).await.unwrap();
    assert_eq!(first.len(), 2);
    let cursor = *first.keys().max().unwrap();
    let second = wf.store.get_tasks(wf.workflow_id, cursor, 2).await.unwrap();
    assert_eq!(second.len(), 2);
    let cursor = *second.keys().max().unwrap();
    let tail = wf.store.get_tasks(wf.workflow_id, cursor, 2).await.unwrap();
    assert!(tail.is_empty());

    let seen: Vec<i64> = first.keys().chain(second.keys()).copied().collect();
    assert!(!seen.contains(&wf.task_ids[0]));

    // A cursor past the max id returns an empty map.
    let past = wf.store.get_tasks(wf.workflow_id, 10_000, 2).await.unwrap();
    assert!(past.is_empty());

    // Metadata carries the cluster binding.
    let metadata = &second[&wf.task_ids[3]];
    assert_eq!(metadata.cluster_name, "sequential");
    assert_eq!(metadata.queue_name, "all.q");
    assert_eq!(metadata.array_max_concurrently_running, 10_000);
}

#[tokio::test]
async fn admin_reset_flags_live_instances() {
    let wf = seed_linear_workflow(1).await;
    let ti_id = launch_first_instance(&wf).await;

    wf.store
        .update_task_statuses(vec![wf.task_ids[0]], TaskStatus::Registering, wf.workflow_id)
        .await
        .unwrap();

    let rows = wf.store.task_status_rows(vec![wf.task_ids[0]]).await.unwrap();
    assert_eq!(rows[0].status, TaskStatus::Registering);
    let sync = wf
        .store
        .sync_status(wf.workflow_run_id, TaskInstanceStatus::KillSelf, vec![])
        .await
        .unwrap();
    assert_eq!(sync[&TaskInstanceStatus::KillSelf], vec![ti_id]);
}

#[tokio::test]
async fn recursive_closures_walk_the_chain() {
    let wf = seed_linear_workflow(4).await;

    let down = wf
        .store
        .tasks_recursive(vec![wf.task_ids[1]], true)
        .await
        .unwrap();
    assert_eq!(down, vec![wf.task_ids[1], wf.task_ids[2], wf.task_ids[3]]);

    let up = wf
        .store
        .tasks_recursive(vec![wf.task_ids[2]], false)
        .await
        .unwrap();
    assert_eq!(up, vec![wf.task_ids[0], wf.task_ids[1], wf.task_ids[2]]);
}

#[tokio::test]
async fn downstream_edges_resolve_for_resume() {
    let wf = seed_linear_workflow(3).await;
    let downstream = wf
        .store
        .get_downstream_tasks(wf.task_ids.clone(), wf.dag_id)
        .await
        .unwrap();
    assert_eq!(downstream.len(), 3);
    assert_eq!(
        downstream[&wf.task_ids[0]].downstream_node_ids,
        vec![downstream[&wf.task_ids[1]].node_id]
    );
    assert!(downstream[&wf.task_ids[2]].downstream_node_ids.is_empty());

    let (up, down) = wf.store.task_dependencies(wf.task_ids[1]).await.unwrap();
    assert_eq!(up.len(), 1);
    assert_eq!(up[0].task_id, wf.task_ids[0]);
    assert_eq!(down.len(), 1);
    assert_eq!(down[0].task_id, wf.task_ids[2]);
}
