//! Plain-text and JSON rendering for command results.

use anyhow::Result;
use serde::Serialize;

use jobmon_core::contracts::{
    TaskDependenciesResponse, TaskStatusRow, WorkflowStatusRow, WorkflowTaskRow,
};

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_workflow_status(row: &WorkflowStatusRow) {
    println!(
        "workflow {} '{}' [{}] created {}",
        row.workflow_id,
        row.name,
        row.status.label(),
        row.created_date.format("%Y-%m-%d %H:%M:%S"),
    );
    let mut counts: Vec<_> = row.task_counts.iter().collect();
    counts.sort_by_key(|(status, _)| **status);
    for (status, count) in counts {
        println!("  {:<20} {count}", status.label());
    }
}

pub fn print_workflow_tasks(tasks: &[WorkflowTaskRow]) {
    println!("{:<10} {:<8} {:<10} {}", "TASK_ID", "STATUS", "ATTEMPTS", "NAME");
    for task in tasks {
        println!(
            "{:<10} {:<8} {:<10} {}",
            task.task_id,
            task.status.to_string(),
            format!("{}/{}", task.num_attempts, task.max_attempts),
            task.name,
        );
    }
}

pub fn print_task_status(rows: &[TaskStatusRow]) {
    println!(
        "{:<10} {:<8} {:<14} {:<10} {}",
        "TASK_ID", "STATUS", "INSTANCE", "TI_STATUS", "ERROR"
    );
    for row in rows {
        println!(
            "{:<10} {:<8} {:<14} {:<10} {}",
            row.task_id,
            row.status.to_string(),
            row.task_instance_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            row.task_instance_status
                .map(|status| status.to_string())
                .unwrap_or_else(|| "-".to_string()),
            row.error_description.as_deref().unwrap_or(""),
        );
    }
}

pub fn print_task_dependencies(task_id: i64, response: &TaskDependenciesResponse) {
    println!("task {task_id} upstream:");
    for task in &response.up {
        println!("  {} [{}] {}", task.task_id, task.status, task.name);
    }
    println!("task {task_id} downstream:");
    for task in &response.down {
        println!("  {} [{}] {}", task.task_id, task.status, task.name);
    }
}
