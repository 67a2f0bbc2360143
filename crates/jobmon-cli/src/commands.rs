//! Command implementations: thin typed calls over the requester.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use jobmon_client::Requester;
use jobmon_core::constants::TaskStatus;
use jobmon_core::contracts::*;

use crate::output;

fn parse_id_list(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(|id| {
            id.trim()
                .parse::<i64>()
                .with_context(|| format!("'{id}' is not a task id"))
        })
        .collect()
}

fn current_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

pub async fn workflow_status(
    requester: &Requester,
    workflow_id: i64,
    json: bool,
) -> Result<()> {
    let row: WorkflowStatusRow = requester
        .get(&format!("/cli/workflow_status/{workflow_id}"))
        .await?;
    if json {
        output::print_json(&row)?;
    } else {
        output::print_workflow_status(&row);
    }
    Ok(())
}

pub async fn workflow_tasks(
    requester: &Requester,
    workflow_id: i64,
    status: Option<String>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let mut route = format!("/cli/workflow_tasks/{workflow_id}?limit={limit}");
    if let Some(status) = status {
        // Validate codes client-side so typos fail fast.
        for code in status.split(',') {
            if TaskStatus::parse(code.trim()).is_none() {
                bail!("'{code}' is not a task status code");
            }
        }
        route.push_str(&format!("&status={status}"));
    }
    let response: WorkflowTasksResponse = requester.get(&route).await?;
    if json {
        output::print_json(&response.tasks)?;
    } else {
        output::print_workflow_tasks(&response.tasks);
    }
    Ok(())
}

pub async fn task_status(requester: &Requester, task_ids: &str, json: bool) -> Result<()> {
    let ids = parse_id_list(task_ids)?;
    let id_list = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let response: TaskStatusRowsResponse = requester
        .get(&format!("/cli/task_status?task_ids={id_list}"))
        .await?;
    if json {
        output::print_json(&response.task_instances)?;
    } else {
        output::print_task_status(&response.task_instances);
    }
    Ok(())
}

pub async fn update_task_status(
    requester: &Requester,
    task_ids: &str,
    workflow_id: i64,
    new_status: &str,
    recursive: bool,
) -> Result<()> {
    let mut task_ids = parse_id_list(task_ids)?;
    let Some(new_status) = TaskStatus::parse(new_status) else {
        bail!("'{new_status}' is not a task status code");
    };

    // Resetting a task invalidates everything built on top of it.
    if recursive && new_status == TaskStatus::Registering {
        let closure: TasksRecursiveResponse = requester
            .put(
                "/tasks_recursive/down",
                &TasksRecursiveRequest { task_ids },
            )
            .await?;
        task_ids = closure.task_ids;
    }

    let response: MessageResponse = requester
        .put(
            "/task/update_statuses",
            &UpdateTaskStatusesRequest {
                task_ids,
                new_status,
                workflow_id,
            },
        )
        .await?;
    println!("{}", response.message);
    Ok(())
}

pub async fn concurrency_limit(
    requester: &Requester,
    workflow_id: i64,
    max_tasks: i64,
) -> Result<()> {
    let response: MessageResponse = requester
        .put(
            &format!("/workflow/{workflow_id}/update_max_concurrently_running"),
            &UpdateMaxConcurrentlyRunningRequest {
                max_tasks,
                user: current_user(),
            },
        )
        .await?;
    println!("{}", response.message);
    Ok(())
}

pub async fn task_dependencies(requester: &Requester, task_id: i64) -> Result<()> {
    let response: TaskDependenciesResponse = requester
        .get(&format!("/task_dependencies/{task_id}"))
        .await?;
    output::print_task_dependencies(task_id, &response);
    Ok(())
}

pub async fn workflow_reset(requester: &Requester, workflow_id: i64) -> Result<()> {
    signal_resume_and_wait(requester, workflow_id, true).await?;
    let response: Value = requester
        .post(
            &format!("/task/{workflow_id}/set_resume_state"),
            &SetTaskResumeStateRequest {
                reset_if_running: true,
            },
        )
        .await?;
    let reset = response.get("reset").and_then(Value::as_u64).unwrap_or(0);
    println!("workflow {workflow_id} reset; {reset} tasks returned to registering");
    Ok(())
}

pub async fn workflow_resume(
    requester: &Requester,
    workflow_id: i64,
    reset_running_jobs: bool,
) -> Result<()> {
    signal_resume_and_wait(requester, workflow_id, reset_running_jobs).await?;
    println!("workflow {workflow_id} is resumable; start a new run to pick up the frontier");
    Ok(())
}

/// Signal resume, then wait for the active run to stand down.
async fn signal_resume_and_wait(
    requester: &Requester,
    workflow_id: i64,
    reset_running_jobs: bool,
) -> Result<()> {
    let _: Value = requester
        .post(
            &format!("/workflow/{workflow_id}/set_resume"),
            &SetResumeRequest {
                reset_running_jobs,
                user: current_user(),
            },
        )
        .await?;

    // The active swarm notices the signal at its next heartbeat and
    // terminates itself; give it a bounded window.
    for _ in 0..60 {
        let response: IsResumableResponse = requester
            .get(&format!("/workflow/{workflow_id}/is_resumable"))
            .await?;
        if response.workflow_is_resumable {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    bail!("workflow {workflow_id} did not become resumable; is its run still heartbeating?")
}
