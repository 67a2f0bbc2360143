//! PostgreSQL implementation of StateStore.
//!
//! Production persistence with:
//! - row-level locks on (task, task_instance) so transitions are totally
//!   ordered per row
//! - chunked bulk updates with bounded backoff retries on lock contention
//! - the database clock as the authority for every timestamp

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{error, instrument, warn};

use jobmon_core::constants::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};
use jobmon_core::contracts::{
    AddArrayRequest, BindTaskRequest, BindWorkflowRequest, BoundTask, DownstreamTask, EdgeWire,
    TaskInstanceBatchWire, TaskInstanceErrorLogWire, TaskMetadata, TaskResourcesWire,
    TaskStatusRow, TaskSummary, WorkerTaskInstance, WorkflowMetadata, WorkflowStatusRow,
    WorkflowTaskRow,
};

use super::fsm::{classify_instance_transition, task_followup, TransitionOutcome};
use super::store::*;

/// Chunk size for bulk task updates under contention.
const UPDATE_CHUNK_SIZE: usize = 1000;

/// Bounded retries for lock-wait failures, with exponential backoff capped
/// in the tens of milliseconds.
const LOCK_RETRIES: u32 = 5;
const LOCK_BACKOFF_BASE_MS: u64 = 2;
const LOCK_BACKOFF_CAP_MS: u64 = 50;

/// PostgreSQL implementation of [`StateStore`].
///
/// # Example
///
/// ```ignore
/// use jobmon_server::storage::PostgresStateStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/jobmon").await?;
/// let store = PostgresStateStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_lock_error(e: &sqlx::Error) -> bool {
    let message = e.to_string();
    message.contains("lock") || message.contains("deadlock") || message.contains("could not obtain")
}

fn parse_task_status(code: &str) -> Result<TaskStatus, StoreError> {
    TaskStatus::parse(code)
        .ok_or_else(|| StoreError::Serialization(format!("bad task status code '{code}'")))
}

fn parse_instance_status(code: &str) -> Result<TaskInstanceStatus, StoreError> {
    TaskInstanceStatus::parse(code)
        .ok_or_else(|| StoreError::Serialization(format!("bad task instance status code '{code}'")))
}

fn parse_run_status(code: &str) -> Result<WorkflowRunStatus, StoreError> {
    WorkflowRunStatus::parse(code)
        .ok_or_else(|| StoreError::Serialization(format!("bad workflow run status code '{code}'")))
}

fn parse_workflow_status(code: &str) -> Result<WorkflowStatus, StoreError> {
    WorkflowStatus::parse(code)
        .ok_or_else(|| StoreError::Serialization(format!("bad workflow status code '{code}'")))
}

fn json_map(value: Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

fn json_string_list(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn json_id_list(value: Value) -> Vec<i64> {
    match value {
        Value::Array(items) => items.into_iter().filter_map(|v| v.as_i64()).collect(),
        _ => Vec::new(),
    }
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply an instance transition plus its coupled task update inside the
    /// caller's transaction. Locks the instance row, then the task row.
    async fn transition_instance(
        tx: &mut Transaction<'_, Postgres>,
        task_instance_id: i64,
        target: TaskInstanceStatus,
    ) -> Result<TransitionOutcome, StoreError> {
        let row = sqlx::query(
            "SELECT status, task_id FROM task_instance WHERE id = $1 FOR UPDATE",
        )
        .bind(task_instance_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound {
            entity: "task_instance",
            id: task_instance_id,
        })?;

        let current = parse_instance_status(row.get("status"))?;
        let task_id: i64 = row.get("task_id");

        let outcome = classify_instance_transition(current, target);
        match outcome {
            TransitionOutcome::Repeat => {
                warn!(
                    task_instance_id,
                    status = %target,
                    "attempted transition into the current status"
                );
                return Ok(outcome);
            }
            TransitionOutcome::Illegal => {
                error!(
                    task_instance_id,
                    from = %current,
                    to = %target,
                    "illegal task instance transition"
                );
                return Ok(outcome);
            }
            TransitionOutcome::Applied => {}
        }

        sqlx::query(
            r#"
            UPDATE task_instance
            SET status = $2,
                status_date = now(),
                wallclock = CASE
                    WHEN $3 AND submitted_date IS NOT NULL
                    THEN EXTRACT(EPOCH FROM (now() - submitted_date))
                    ELSE wallclock
                END
            WHERE id = $1
            "#,
        )
        .bind(task_instance_id)
        .bind(target.to_string())
        .bind(target.is_terminal())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        let task_row = sqlx::query(
            "SELECT status, num_attempts, max_attempts FROM task WHERE id = $1 FOR UPDATE",
        )
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;

        if let Some(task_row) = task_row {
            let task_status = parse_task_status(task_row.get("status"))?;
            let num_attempts: i64 = task_row.get("num_attempts");
            let max_attempts: i64 = task_row.get("max_attempts");
            if let Some(next_status) = task_followup(target, task_status, num_attempts, max_attempts)
            {
                sqlx::query("UPDATE task SET status = $2, status_date = now() WHERE id = $1")
                    .bind(task_id)
                    .bind(next_status.to_string())
                    .execute(&mut **tx)
                    .await
                    .map_err(db_err)?;
            }
        }
        Ok(TransitionOutcome::Applied)
    }

    async fn push_error_log(
        tx: &mut Transaction<'_, Postgres>,
        task_instance_id: i64,
        description: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_instance_error_log (task_instance_id, error_time, description)
            VALUES ($1, now(), $2)
            "#,
        )
        .bind(task_instance_id)
        .bind(description)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn apply_worker_report(
        tx: &mut Transaction<'_, Postgres>,
        task_instance_id: i64,
        report: &WorkerReport,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE task_instance
            SET distributor_id = COALESCE($2, distributor_id),
                nodename = COALESCE($3, nodename),
                stdout = COALESCE($4, stdout),
                stderr = COALESCE($5, stderr),
                stdout_log = COALESCE($6, stdout_log),
                stderr_log = COALESCE($7, stderr_log)
            WHERE id = $1
            "#,
        )
        .bind(task_instance_id)
        .bind(&report.distributor_id)
        .bind(&report.nodename)
        .bind(&report.stdout)
        .bind(&report.stderr)
        .bind(&report.stdout_log)
        .bind(&report.stderr_log)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn instance_status(
        tx: &mut Transaction<'_, Postgres>,
        task_instance_id: i64,
    ) -> Result<TaskInstanceStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM task_instance WHERE id = $1")
            .bind(task_instance_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound {
                entity: "task_instance",
                id: task_instance_id,
            })?;
        parse_instance_status(row.get("status"))
    }

    /// Strict run transition; mirrors into the workflow.
    async fn transition_run(
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: i64,
        target: WorkflowRunStatus,
    ) -> Result<WorkflowRunStatus, StoreError> {
        let row = sqlx::query(
            "SELECT status, workflow_id FROM workflow_run WHERE id = $1 FOR UPDATE",
        )
        .bind(workflow_run_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound {
            entity: "workflow_run",
            id: workflow_run_id,
        })?;
        let current = parse_run_status(row.get("status"))?;
        let workflow_id: i64 = row.get("workflow_id");

        if current == target {
            return Ok(current);
        }
        if !current.can_transition_to(target) {
            return Err(StoreError::InvalidTransition {
                entity: "workflow_run",
                id: workflow_run_id,
                from: current.to_string(),
                to: target.to_string(),
            });
        }
        sqlx::query("UPDATE workflow_run SET status = $2, status_date = now() WHERE id = $1")
            .bind(workflow_run_id)
            .bind(target.to_string())
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;

        if let Some(workflow_status) = WorkflowStatus::from_run_status(target) {
            sqlx::query("UPDATE workflow SET status = $2, status_date = now() WHERE id = $1")
                .bind(workflow_id)
                .bind(workflow_status.to_string())
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
        }
        Ok(target)
    }

    async fn latest_run_user(
        tx: &mut Transaction<'_, Postgres>,
        workflow_id: i64,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT username FROM workflow_run
            WHERE workflow_id = $1
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| r.get("username")))
    }

    fn tasks_by_status_from_rows(
        rows: Vec<sqlx::postgres::PgRow>,
    ) -> Result<HashMap<TaskStatus, Vec<i64>>, StoreError> {
        let mut by_status: HashMap<TaskStatus, Vec<i64>> = HashMap::new();
        for row in rows {
            let status = parse_task_status(row.get("status"))?;
            by_status.entry(status).or_default().push(row.get("id"));
        }
        Ok(by_status)
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query("SELECT now() AS now")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get("now"))
    }

    // =========================================================================
    // Catalog seeding
    // =========================================================================

    #[instrument(skip(self))]
    async fn add_dag(&self, hash: &str) -> Result<(i64, bool), StoreError> {
        let existing = sqlx::query("SELECT id FROM dag WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if let Some(row) = existing {
            return Ok((row.get("id"), false));
        }
        let row = sqlx::query(
            "INSERT INTO dag (hash, created_date) VALUES ($1, now()) RETURNING id",
        )
        .bind(hash)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok((row.get("id"), true))
    }

    #[instrument(skip(self, edges))]
    async fn add_edges(&self, dag_id: i64, edges: Vec<EdgeWire>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let exists = sqlx::query("SELECT id FROM dag WHERE id = $1")
            .bind(dag_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::NotFound {
                entity: "dag",
                id: dag_id,
            });
        }
        for edge in edges {
            sqlx::query(
                r#"
                INSERT INTO edge (dag_id, node_id, upstream_node_ids, downstream_node_ids)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (dag_id, node_id) DO UPDATE
                SET upstream_node_ids = EXCLUDED.upstream_node_ids,
                    downstream_node_ids = EXCLUDED.downstream_node_ids
                "#,
            )
            .bind(dag_id)
            .bind(edge.node_id)
            .bind(Value::from(edge.upstream_node_ids))
            .bind(Value::from(edge.downstream_node_ids))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, request))]
    async fn add_array(&self, request: AddArrayRequest) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let existing = sqlx::query(
            r#"
            SELECT id FROM arrays
            WHERE workflow_id = $1 AND task_template_version_id = $2
            FOR UPDATE
            "#,
        )
        .bind(request.workflow_id)
        .bind(request.task_template_version_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let array_id = if let Some(row) = existing {
            let id: i64 = row.get("id");
            sqlx::query("UPDATE arrays SET max_concurrently_running = $2 WHERE id = $1")
                .bind(id)
                .bind(request.max_concurrently_running)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            id
        } else {
            let row = sqlx::query(
                r#"
                INSERT INTO arrays
                    (workflow_id, task_template_version_id, name, max_concurrently_running,
                     stdout_dir, stderr_dir, created_date)
                VALUES ($1, $2, $3, $4, $5, $6, now())
                RETURNING id
                "#,
            )
            .bind(request.workflow_id)
            .bind(request.task_template_version_id)
            .bind(&request.name)
            .bind(request.max_concurrently_running)
            .bind(&request.stdout_dir)
            .bind(&request.stderr_dir)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            row.get("id")
        };
        tx.commit().await.map_err(db_err)?;
        Ok(array_id)
    }

    #[instrument(skip(self, requested_resources))]
    async fn bind_task_resources(
        &self,
        queue_name: &str,
        cluster_name: &str,
        requested_resources: BTreeMap<String, Value>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO task_resources (queue_name, cluster_name, requested_resources)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(queue_name)
        .bind(cluster_name)
        .bind(Value::Object(requested_resources.into_iter().collect()))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get("id"))
    }

    async fn task_resources(
        &self,
        task_resources_id: i64,
    ) -> Result<TaskResourcesWire, StoreError> {
        let row = sqlx::query(
            "SELECT queue_name, cluster_name, requested_resources FROM task_resources WHERE id = $1",
        )
        .bind(task_resources_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound {
            entity: "task_resources",
            id: task_resources_id,
        })?;
        Ok(TaskResourcesWire {
            task_resources_id,
            queue_name: row.get("queue_name"),
            cluster_name: row.get("cluster_name"),
            requested_resources: json_map(row.get("requested_resources")),
        })
    }

    #[instrument(skip(self, tasks))]
    async fn bind_tasks(
        &self,
        workflow_id: i64,
        tasks: Vec<BindTaskRequest>,
    ) -> Result<Vec<BoundTask>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let exists = sqlx::query("SELECT id FROM workflow WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            });
        }

        let mut bound = Vec::with_capacity(tasks.len());
        for request in tasks {
            let row = sqlx::query(
                r#"
                INSERT INTO task
                    (workflow_id, array_id, node_id, name, command, status, num_attempts,
                     max_attempts, task_args_hash, task_resources_id, resource_scales,
                     fallback_queues, status_date)
                VALUES ($1, $2, $3, $4, $5, 'G', 0, $6, $7, $8, $9, $10, now())
                ON CONFLICT (workflow_id, node_id, task_args_hash) DO UPDATE
                SET name = EXCLUDED.name,
                    command = EXCLUDED.command,
                    max_attempts = EXCLUDED.max_attempts
                RETURNING id, node_id, status
                "#,
            )
            .bind(workflow_id)
            .bind(request.array_id)
            .bind(request.node_id)
            .bind(&request.name)
            .bind(&request.command)
            .bind(request.max_attempts)
            .bind(&request.task_args_hash)
            .bind(request.task_resources_id)
            .bind(Value::Object(request.resource_scales.into_iter().collect()))
            .bind(Value::from(request.fallback_queues))
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            bound.push(BoundTask {
                task_id: row.get("id"),
                node_id: row.get("node_id"),
                status: parse_task_status(row.get("status"))?,
            });
        }
        tx.commit().await.map_err(db_err)?;
        Ok(bound)
    }

    // =========================================================================
    // Workflow
    // =========================================================================

    #[instrument(skip(self, request))]
    async fn bind_workflow(
        &self,
        request: BindWorkflowRequest,
    ) -> Result<(i64, WorkflowStatus, bool), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let existing = sqlx::query(
            r#"
            SELECT id, status FROM workflow
            WHERE tool_version_id = $1 AND dag_id = $2
              AND workflow_args_hash = $3 AND task_hash = $4
            FOR UPDATE
            "#,
        )
        .bind(request.tool_version_id)
        .bind(request.dag_id)
        .bind(&request.workflow_args_hash)
        .bind(&request.task_hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let result = if let Some(row) = existing {
            let id: i64 = row.get("id");
            let status = parse_workflow_status(row.get("status"))?;
            sqlx::query(
                r#"
                UPDATE workflow
                SET name = $2, description = $3, max_concurrently_running = $4
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&request.name)
            .bind(&request.description)
            .bind(request.max_concurrently_running)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            (id, status, false)
        } else {
            let row = sqlx::query(
                r#"
                INSERT INTO workflow
                    (tool_version_id, dag_id, workflow_args_hash, task_hash, name, description,
                     max_concurrently_running, status, created_date, status_date)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'G', now(), now())
                RETURNING id
                "#,
            )
            .bind(request.tool_version_id)
            .bind(request.dag_id)
            .bind(&request.workflow_args_hash)
            .bind(&request.task_hash)
            .bind(&request.name)
            .bind(&request.description)
            .bind(request.max_concurrently_running)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            (row.get("id"), WorkflowStatus::Registering, true)
        };
        tx.commit().await.map_err(db_err)?;
        Ok(result)
    }

    async fn workflow_metadata(
        &self,
        workflow_id: i64,
    ) -> Result<Option<WorkflowMetadata>, StoreError> {
        let row = sqlx::query(
            "SELECT id, dag_id, max_concurrently_running, status FROM workflow WHERE id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| {
            Ok(WorkflowMetadata {
                workflow_id: r.get("id"),
                dag_id: r.get("dag_id"),
                max_concurrently_running: r.get("max_concurrently_running"),
                status: parse_workflow_status(r.get("status"))?,
            })
        })
        .transpose()
    }

    async fn is_resumable(&self, workflow_id: i64) -> Result<bool, StoreError> {
        let exists = sqlx::query("SELECT id FROM workflow WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            });
        }
        let row = sqlx::query(
            r#"
            SELECT count(*) AS live FROM workflow_run
            WHERE workflow_id = $1 AND status NOT IN ('T', 'D', 'E')
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let live: i64 = row.get("live");
        Ok(live == 0)
    }

    #[instrument(skip(self))]
    async fn set_resume(
        &self,
        workflow_id: i64,
        reset_running_jobs: bool,
        user: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let exists = sqlx::query("SELECT id FROM workflow WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            });
        }
        if let Some(owner) = Self::latest_run_user(&mut tx, workflow_id).await? {
            if owner != user {
                return Err(StoreError::Unauthorized(format!(
                    "resume requested by '{user}' but the latest run belongs to '{owner}'"
                )));
            }
        }

        let active: Vec<i64> = sqlx::query(
            r#"
            SELECT id FROM workflow_run
            WHERE workflow_id = $1 AND status IN ('G', 'L', 'B', 'I', 'O', 'R')
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(|r| r.get("id"))
        .collect();

        let target = if reset_running_jobs {
            WorkflowRunStatus::ColdResume
        } else {
            WorkflowRunStatus::HotResume
        };
        for run_id in active {
            Self::transition_run(&mut tx, run_id, target).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn max_concurrently_running(&self, workflow_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT max_concurrently_running FROM workflow WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            })?;
        Ok(row.get("max_concurrently_running"))
    }

    #[instrument(skip(self))]
    async fn update_max_concurrently_running(
        &self,
        workflow_id: i64,
        max_tasks: i64,
        user: &str,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if let Some(owner) = Self::latest_run_user(&mut tx, workflow_id).await? {
            if owner != user {
                return Err(StoreError::Unauthorized(format!(
                    "limit change requested by '{user}' but the latest run belongs to '{owner}'"
                )));
            }
        }
        let result =
            sqlx::query("UPDATE workflow SET max_concurrently_running = $2 WHERE id = $1")
                .bind(workflow_id)
                .bind(max_tasks)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn update_array_max_concurrently_running(
        &self,
        workflow_id: i64,
        array_id: i64,
        max_tasks: i64,
        _user: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE arrays SET max_concurrently_running = $3
            WHERE id = $2 AND workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(array_id)
        .bind(max_tasks)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn array_max_concurrently_running(&self, array_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT max_concurrently_running FROM arrays WHERE id = $1")
            .bind(array_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound {
                entity: "array",
                id: array_id,
            })?;
        Ok(row.get("max_concurrently_running"))
    }

    #[instrument(skip(self))]
    async fn get_tasks(
        &self,
        workflow_id: i64,
        max_task_id: i64,
        chunk_size: usize,
    ) -> Result<BTreeMap<i64, TaskMetadata>, StoreError> {
        let mut result = BTreeMap::new();
        if chunk_size == 0 {
            return Ok(result);
        }
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.array_id, t.status, t.max_attempts, t.resource_scales,
                   t.fallback_queues, tr.requested_resources, tr.cluster_name, tr.queue_name,
                   a.max_concurrently_running AS array_max
            FROM task t
            JOIN arrays a ON t.array_id = a.id
            JOIN task_resources tr ON t.task_resources_id = tr.id
            WHERE t.workflow_id = $1 AND t.status <> 'D' AND t.id > $2
            ORDER BY t.id
            LIMIT $3
            "#,
        )
        .bind(workflow_id)
        .bind(max_task_id)
        .bind(chunk_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        for row in rows {
            let task_id: i64 = row.get("id");
            result.insert(
                task_id,
                TaskMetadata {
                    array_id: row.get("array_id"),
                    status: parse_task_status(row.get("status"))?,
                    max_attempts: row.get("max_attempts"),
                    resource_scales: json_map(row.get("resource_scales")),
                    fallback_queues: json_string_list(row.get("fallback_queues")),
                    requested_resources: json_map(row.get("requested_resources")),
                    cluster_name: row.get("cluster_name"),
                    queue_name: row.get("queue_name"),
                    array_max_concurrently_running: row.get("array_max"),
                },
            );
        }
        Ok(result)
    }

    async fn task_status_updates(
        &self,
        workflow_id: i64,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<(HashMap<TaskStatus, Vec<i64>>, DateTime<Utc>), StoreError> {
        let now = self.now().await?;
        let rows = match last_sync {
            Some(since) => sqlx::query(
                "SELECT id, status FROM task WHERE workflow_id = $1 AND status_date >= $2",
            )
            .bind(workflow_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?,
            None => sqlx::query("SELECT id, status FROM task WHERE workflow_id = $1")
                .bind(workflow_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?,
        };
        Ok((Self::tasks_by_status_from_rows(rows)?, now))
    }

    // =========================================================================
    // Workflow run
    // =========================================================================

    #[instrument(skip(self))]
    async fn register_workflow_run(
        &self,
        workflow_id: i64,
        user: &str,
        jobmon_version: &str,
        next_report_increment: f64,
    ) -> Result<(i64, WorkflowRunStatus), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let exists = sqlx::query("SELECT id FROM workflow WHERE id = $1 FOR UPDATE")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            });
        }
        let blocker = sqlx::query(
            r#"
            SELECT id, status FROM workflow_run
            WHERE workflow_id = $1 AND status NOT IN ('T', 'D', 'E')
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if let Some(row) = blocker {
            let id: i64 = row.get("id");
            let status: String = row.get("status");
            return Err(StoreError::NotResumable {
                workflow_id,
                reason: format!("workflow run {id} is still live ({status})"),
            });
        }

        let row = sqlx::query(
            r#"
            INSERT INTO workflow_run
                (workflow_id, username, jobmon_version, status, created_date, status_date,
                 heartbeat_date)
            VALUES ($1, $2, $3, 'G', now(), now(),
                    now() + make_interval(secs => $4))
            RETURNING id
            "#,
        )
        .bind(workflow_id)
        .bind(user)
        .bind(jobmon_version)
        .bind(next_report_increment)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok((row.get("id"), WorkflowRunStatus::Registered))
    }

    async fn update_workflow_run_status(
        &self,
        workflow_run_id: i64,
        status: WorkflowRunStatus,
    ) -> Result<WorkflowRunStatus, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let status = Self::transition_run(&mut tx, workflow_run_id, status).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(status)
    }

    async fn log_workflow_run_heartbeat(
        &self,
        workflow_run_id: i64,
        status: WorkflowRunStatus,
        next_report_increment: f64,
    ) -> Result<WorkflowRunStatus, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            r#"
            UPDATE workflow_run
            SET heartbeat_date = now() + make_interval(secs => $2)
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(workflow_run_id)
        .bind(next_report_increment)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound {
            entity: "workflow_run",
            id: workflow_run_id,
        })?;
        let current = parse_run_status(row.get("status"))?;

        let result = if current.is_resume() || current == status {
            current
        } else if current.can_transition_to(status) {
            Self::transition_run(&mut tx, workflow_run_id, status).await?
        } else {
            current
        };
        tx.commit().await.map_err(db_err)?;
        Ok(result)
    }

    async fn sync_status(
        &self,
        workflow_run_id: i64,
        status: TaskInstanceStatus,
        task_instance_ids: Vec<i64>,
    ) -> Result<HashMap<TaskInstanceStatus, Vec<i64>>, StoreError> {
        let known: HashSet<i64> = task_instance_ids.iter().copied().collect();
        let mut status_updates: HashMap<TaskInstanceStatus, Vec<i64>> = HashMap::new();

        if !task_instance_ids.is_empty() {
            let rows = sqlx::query(
                "SELECT id, status FROM task_instance WHERE id = ANY($1)",
            )
            .bind(&task_instance_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            for row in rows {
                let current = parse_instance_status(row.get("status"))?;
                if current != status {
                    status_updates.entry(current).or_default().push(row.get("id"));
                }
            }
        }

        let rows = sqlx::query(
            "SELECT id FROM task_instance WHERE workflow_run_id = $1 AND status = $2",
        )
        .bind(workflow_run_id)
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        for row in rows {
            let id: i64 = row.get("id");
            if !known.contains(&id) {
                status_updates.entry(status).or_default().push(id);
            }
        }
        for ids in status_updates.values_mut() {
            ids.sort_unstable();
        }
        Ok(status_updates)
    }

    #[instrument(skip(self))]
    async fn set_status_for_triaging(&self, workflow_run_id: i64) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let overdue: Vec<(i64, String, bool)> = sqlx::query(
            r#"
            SELECT id, status, distributor_id IS NULL AS no_distributor
            FROM task_instance
            WHERE workflow_run_id = $1
              AND status IN ('O', 'R')
              AND report_by_date IS NOT NULL
              AND report_by_date <= now()
            FOR UPDATE
            "#,
        )
        .bind(workflow_run_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(|r| (r.get("id"), r.get("status"), r.get("no_distributor")))
        .collect();

        let mut moved = 0;
        for (id, status, no_distributor) in overdue {
            let status = parse_instance_status(&status)?;
            let target = if status == TaskInstanceStatus::Launched && no_distributor {
                TaskInstanceStatus::NoHeartbeat
            } else {
                TaskInstanceStatus::Triaging
            };
            if Self::transition_instance(&mut tx, id, target).await? == TransitionOutcome::Applied
            {
                if target == TaskInstanceStatus::NoHeartbeat {
                    Self::push_error_log(
                        &mut tx,
                        id,
                        "task instance never logged a heartbeat and has no distributor id",
                    )
                    .await?;
                }
                moved += 1;
            }
        }
        tx.commit().await.map_err(db_err)?;
        Ok(moved)
    }

    #[instrument(skip(self))]
    async fn terminate_task_instances(&self, workflow_run_id: i64) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let run = sqlx::query("SELECT status FROM workflow_run WHERE id = $1 FOR UPDATE")
            .bind(workflow_run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound {
                entity: "workflow_run",
                id: workflow_run_id,
            })?;
        let run_status = parse_run_status(run.get("status"))?;

        let in_flight: Vec<i64> = sqlx::query(
            r#"
            SELECT id FROM task_instance
            WHERE workflow_run_id = $1 AND status IN ('Q', 'I', 'O', 'R')
            FOR UPDATE
            "#,
        )
        .bind(workflow_run_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(|r| r.get("id"))
        .collect();

        let mut flagged = 0;
        for id in in_flight {
            if Self::transition_instance(&mut tx, id, TaskInstanceStatus::KillSelf).await?
                == TransitionOutcome::Applied
            {
                flagged += 1;
            }
        }
        if run_status.is_resume() {
            Self::transition_run(&mut tx, workflow_run_id, WorkflowRunStatus::Terminated).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(flagged)
    }

    // =========================================================================
    // Array batches
    // =========================================================================

    #[instrument(skip(self, task_ids))]
    async fn queue_task_batch(
        &self,
        array_id: i64,
        task_ids: Vec<i64>,
        task_resources_id: i64,
        workflow_run_id: i64,
    ) -> Result<HashMap<TaskStatus, Vec<i64>>, StoreError> {
        // Step 1: the queueable subset, without locks.
        let queueable: Vec<i64> = sqlx::query(
            "SELECT id FROM task WHERE id = ANY($1) AND status IN ('G', 'A') ORDER BY id",
        )
        .bind(&task_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(|r| r.get("id"))
        .collect();

        if !queueable.is_empty() {
            // One batch number for the whole request.
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let row = sqlx::query(
                r#"
                SELECT COALESCE(MAX(array_batch_num), 0) + 1 AS batch_num
                FROM task_instance WHERE array_id = $1
                "#,
            )
            .bind(array_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            let batch_num: i64 = row.get("batch_num");
            tx.commit().await.map_err(db_err)?;

            // Step 2/3: per chunk, transition tasks then insert instances,
            // retrying lock-wait failures with bounded backoff. The insert
            // derives array_step_id from the chunk-relative row number, so
            // chunk offsets keep step ids 0-based across the whole batch.
            let mut step_offset: i64 = 0;
            for chunk in queueable.chunks(UPDATE_CHUNK_SIZE) {
                let chunk: Vec<i64> = chunk.to_vec();
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    let outcome: Result<(), sqlx::Error> = async {
                        let mut tx = self.pool.begin().await?;
                        sqlx::query(
                            r#"
                            UPDATE task
                            SET status = 'Q', status_date = now(),
                                num_attempts = num_attempts + 1
                            WHERE id = ANY($1) AND status IN ('G', 'A')
                            "#,
                        )
                        .bind(&chunk)
                        .execute(&mut *tx)
                        .await?;

                        sqlx::query(
                            r#"
                            INSERT INTO task_instance
                                (task_id, workflow_run_id, array_id, task_resources_id,
                                 array_batch_num, array_step_id, status, status_date)
                            SELECT t.id, $2, $3, $4, $5,
                                   $6 + row_number() OVER (ORDER BY t.id) - 1,
                                   'Q', now()
                            FROM task t
                            WHERE t.id = ANY($1) AND t.status = 'Q'
                            "#,
                        )
                        .bind(&chunk)
                        .bind(workflow_run_id)
                        .bind(array_id)
                        .bind(task_resources_id)
                        .bind(batch_num)
                        .bind(step_offset)
                        .execute(&mut *tx)
                        .await?;
                        tx.commit().await
                    }
                    .await;

                    match outcome {
                        Ok(()) => break,
                        Err(e) if is_lock_error(&e) && attempt < LOCK_RETRIES => {
                            let backoff = (LOCK_BACKOFF_BASE_MS << attempt).min(LOCK_BACKOFF_CAP_MS);
                            warn!(
                                attempt,
                                backoff_ms = backoff,
                                "lock wait updating task batch, retrying"
                            );
                            tokio::time::sleep(Duration::from_millis(backoff)).await;
                        }
                        Err(e) => return Err(db_err(e)),
                    }
                }
                step_offset += chunk.len() as i64;
            }
        }

        // Step 4: always return the current status of every input task.
        let rows = sqlx::query("SELECT id, status FROM task WHERE id = ANY($1) ORDER BY id")
            .bind(&task_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Self::tasks_by_status_from_rows(rows)
    }

    #[instrument(skip(self, task_instance_ids))]
    async fn instantiate_task_instances(
        &self,
        task_instance_ids: Vec<i64>,
    ) -> Result<Vec<TaskInstanceBatchWire>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Tasks first, where the FSM allows it.
        sqlx::query(
            r#"
            UPDATE task
            SET status = 'I', status_date = now()
            WHERE status = 'Q' AND id IN (
                SELECT task_id FROM task_instance WHERE id = ANY($1)
            )
            "#,
        )
        .bind(&task_instance_ids)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Then propagate into instances whose task actually transitioned.
        sqlx::query(
            r#"
            UPDATE task_instance ti
            SET status = 'I', status_date = now()
            FROM task t
            WHERE ti.task_id = t.id
              AND ti.id = ANY($1)
              AND ti.status = 'Q'
              AND t.status = 'I'
            "#,
        )
        .bind(&task_instance_ids)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let rows = sqlx::query(
            r#"
            SELECT ti.array_id, a.name AS array_name, ti.array_batch_num,
                   ti.task_resources_id, ti.id
            FROM task_instance ti
            JOIN arrays a ON ti.array_id = a.id
            WHERE ti.id = ANY($1) AND ti.status = 'I'
            ORDER BY ti.array_id, ti.array_batch_num, ti.id
            "#,
        )
        .bind(&task_instance_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        let mut grouped: BTreeMap<(i64, i64, i64), (String, Vec<i64>)> = BTreeMap::new();
        for row in rows {
            let key = (
                row.get("array_id"),
                row.get("array_batch_num"),
                row.get("task_resources_id"),
            );
            let entry = grouped
                .entry(key)
                .or_insert_with(|| (row.get("array_name"), Vec::new()));
            entry.1.push(row.get("id"));
        }
        Ok(grouped
            .into_iter()
            .map(
                |((array_id, array_batch_num, task_resources_id), (array_name, ids))| {
                    TaskInstanceBatchWire {
                        array_id,
                        array_name,
                        array_batch_num,
                        task_resources_id,
                        task_instance_ids: ids,
                    }
                },
            )
            .collect())
    }

    #[instrument(skip(self))]
    async fn transition_batch_to_launched(
        &self,
        array_id: i64,
        batch_number: i64,
        next_report_increment: f64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Lock and advance the parent tasks.
        sqlx::query(
            r#"
            SELECT id FROM task
            WHERE array_id = $1 AND status = 'I' AND id IN (
                SELECT task_id FROM task_instance
                WHERE array_id = $1 AND array_batch_num = $2
            )
            FOR UPDATE
            "#,
        )
        .bind(array_id)
        .bind(batch_number)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            r#"
            UPDATE task
            SET status = 'O', status_date = now()
            WHERE array_id = $1 AND status = 'I' AND id IN (
                SELECT task_id FROM task_instance
                WHERE array_id = $1 AND array_batch_num = $2
            )
            "#,
        )
        .bind(array_id)
        .bind(batch_number)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE task_instance
            SET status = 'O', status_date = now(), submitted_date = now(),
                report_by_date = now() + make_interval(secs => $3)
            WHERE array_id = $1 AND array_batch_num = $2 AND status = 'I'
            "#,
        )
        .bind(array_id)
        .bind(batch_number)
        .bind(next_report_increment)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn transition_batch_to_killed(
        &self,
        array_id: i64,
        batch_number: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE task
            SET status = 'F', status_date = now()
            WHERE array_id = $1 AND status IN ('O', 'R') AND id IN (
                SELECT task_id FROM task_instance
                WHERE array_id = $1 AND array_batch_num = $2 AND status = 'K'
            )
            "#,
        )
        .bind(array_id)
        .bind(batch_number)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE task_instance
            SET status = 'F', status_date = now()
            WHERE array_id = $1 AND array_batch_num = $2 AND status = 'K'
            "#,
        )
        .bind(array_id)
        .bind(batch_number)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn log_array_distributor_ids(
        &self,
        array_id: i64,
        distributor_ids: HashMap<i64, String>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for (task_instance_id, distributor_id) in distributor_ids {
            sqlx::query(
                "UPDATE task_instance SET distributor_id = $3 WHERE id = $1 AND array_id = $2",
            )
            .bind(task_instance_id)
            .bind(array_id)
            .bind(&distributor_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    // =========================================================================
    // Task instance lifecycle
    // =========================================================================

    #[instrument(skip(self, report))]
    async fn log_running(
        &self,
        task_instance_id: i64,
        report: RunningReport,
    ) -> Result<WorkerTaskInstance, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE task_instance
            SET distributor_id = COALESCE($2, distributor_id),
                nodename = $3,
                process_group_id = $4
            WHERE id = $1
            "#,
        )
        .bind(task_instance_id)
        .bind(&report.distributor_id)
        .bind(&report.nodename)
        .bind(report.process_group_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let current = Self::instance_status(&mut tx, task_instance_id).await?;
        match classify_instance_transition(current, TaskInstanceStatus::Running) {
            TransitionOutcome::Applied => {
                Self::transition_instance(&mut tx, task_instance_id, TaskInstanceStatus::Running)
                    .await?;
                sqlx::query(
                    r#"
                    UPDATE task_instance
                    SET report_by_date = now() + make_interval(secs => $2)
                    WHERE id = $1
                    "#,
                )
                .bind(task_instance_id)
                .bind(report.next_report_increment)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            TransitionOutcome::Repeat => {
                warn!(task_instance_id, "log_running on an already-running instance");
            }
            TransitionOutcome::Illegal => match current {
                TaskInstanceStatus::KillSelf => {
                    Self::transition_instance(
                        &mut tx,
                        task_instance_id,
                        TaskInstanceStatus::ErrorFatal,
                    )
                    .await?;
                }
                TaskInstanceStatus::NoHeartbeat => {
                    Self::transition_instance(
                        &mut tx,
                        task_instance_id,
                        TaskInstanceStatus::Error,
                    )
                    .await?;
                }
                _ => {
                    error!(
                        task_instance_id,
                        from = %current,
                        "illegal log_running transition"
                    );
                }
            },
        }

        let row = sqlx::query(
            r#"
            SELECT ti.status, ti.workflow_run_id, t.workflow_id, t.id AS task_id,
                   t.array_id, t.name, t.command, a.stdout_dir, a.stderr_dir
            FROM task_instance ti
            JOIN task t ON ti.task_id = t.id
            JOIN arrays a ON t.array_id = a.id
            WHERE ti.id = $1
            "#,
        )
        .bind(task_instance_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(WorkerTaskInstance {
            task_instance_id,
            status: parse_instance_status(row.get("status"))?,
            workflow_id: row.get("workflow_id"),
            workflow_run_id: row.get("workflow_run_id"),
            task_id: row.get("task_id"),
            array_id: row.get("array_id"),
            name: row.get("name"),
            command: row.get("command"),
            stdout_dir: row.get("stdout_dir"),
            stderr_dir: row.get("stderr_dir"),
        })
    }

    async fn log_done(
        &self,
        task_instance_id: i64,
        report: WorkerReport,
    ) -> Result<TaskInstanceStatus, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::apply_worker_report(&mut tx, task_instance_id, &report).await?;
        Self::transition_instance(&mut tx, task_instance_id, TaskInstanceStatus::Done).await?;
        let status = Self::instance_status(&mut tx, task_instance_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(status)
    }

    async fn log_error_worker_node(
        &self,
        task_instance_id: i64,
        error_state: TaskInstanceStatus,
        error_description: String,
        report: WorkerReport,
    ) -> Result<TaskInstanceStatus, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::apply_worker_report(&mut tx, task_instance_id, &report).await?;
        let outcome = Self::transition_instance(&mut tx, task_instance_id, error_state).await?;
        if outcome == TransitionOutcome::Applied {
            Self::push_error_log(&mut tx, task_instance_id, &error_description).await?;
        }
        let status = Self::instance_status(&mut tx, task_instance_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(status)
    }

    async fn log_report_by(
        &self,
        task_instance_id: i64,
        next_report_increment: f64,
        report: WorkerReport,
    ) -> Result<TaskInstanceStatus, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::apply_worker_report(&mut tx, task_instance_id, &report).await?;
        let updated = sqlx::query(
            r#"
            UPDATE task_instance
            SET report_by_date = now() + make_interval(secs => $2)
            WHERE id = $1
            "#,
        )
        .bind(task_instance_id)
        .bind(next_report_increment)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "task_instance",
                id: task_instance_id,
            });
        }
        if Self::instance_status(&mut tx, task_instance_id).await? == TaskInstanceStatus::Triaging
        {
            Self::transition_instance(&mut tx, task_instance_id, TaskInstanceStatus::Running)
                .await?;
        }
        let status = Self::instance_status(&mut tx, task_instance_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(status)
    }

    async fn log_report_by_batch(
        &self,
        task_instance_ids: Vec<i64>,
        next_report_increment: f64,
    ) -> Result<(), StoreError> {
        if task_instance_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE task_instance
            SET report_by_date = now() + make_interval(secs => $2)
            WHERE id = ANY($1) AND status IN ('O', 'R')
            "#,
        )
        .bind(&task_instance_ids)
        .bind(next_report_increment)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn log_distributor_id(
        &self,
        task_instance_id: i64,
        distributor_id: &str,
        next_report_increment: f64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Per-instance launch path (array fallback): move the parent task
        // along as the batch route would have.
        sqlx::query(
            r#"
            UPDATE task
            SET status = 'O', status_date = now()
            WHERE status = 'I' AND id = (
                SELECT task_id FROM task_instance WHERE id = $1
            )
            "#,
        )
        .bind(task_instance_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        Self::transition_instance(&mut tx, task_instance_id, TaskInstanceStatus::Launched).await?;
        sqlx::query(
            r#"
            UPDATE task_instance
            SET distributor_id = $2, submitted_date = now(),
                report_by_date = now() + make_interval(secs => $3)
            WHERE id = $1
            "#,
        )
        .bind(task_instance_id)
        .bind(distributor_id)
        .bind(next_report_increment)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn log_no_distributor_id(
        &self,
        task_instance_id: i64,
        no_id_err_msg: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let outcome = Self::transition_instance(
            &mut tx,
            task_instance_id,
            TaskInstanceStatus::NoDistributorId,
        )
        .await?;
        if outcome == TransitionOutcome::Applied {
            Self::push_error_log(&mut tx, task_instance_id, no_id_err_msg).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn log_triage_error(
        &self,
        task_instance_id: i64,
        error_state: TaskInstanceStatus,
        error_message: String,
        distributor_id: Option<String>,
        nodename: Option<String>,
        require_overdue: bool,
    ) -> Result<TaskInstanceStatus, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "SELECT status, report_by_date FROM task_instance WHERE id = $1 FOR UPDATE",
        )
        .bind(task_instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound {
            entity: "task_instance",
            id: task_instance_id,
        })?;

        if require_overdue {
            let report_by: Option<DateTime<Utc>> = row.get("report_by_date");
            let now = self.now().await?;
            if report_by.is_some_and(|d| d > now) {
                // A heartbeat arrived since the reconciler looked; leave it.
                return parse_instance_status(row.get("status"));
            }
        }

        sqlx::query(
            r#"
            UPDATE task_instance
            SET distributor_id = COALESCE($2, distributor_id),
                nodename = COALESCE($3, nodename)
            WHERE id = $1
            "#,
        )
        .bind(task_instance_id)
        .bind(&distributor_id)
        .bind(&nodename)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let outcome = Self::transition_instance(&mut tx, task_instance_id, error_state).await?;
        if outcome == TransitionOutcome::Applied {
            Self::push_error_log(&mut tx, task_instance_id, &error_message).await?;
        }
        let status = Self::instance_status(&mut tx, task_instance_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(status)
    }

    async fn task_instance_error_log(
        &self,
        task_instance_id: i64,
    ) -> Result<Vec<TaskInstanceErrorLogWire>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT task_instance_id, error_time, description
            FROM task_instance_error_log
            WHERE task_instance_id = $1
            ORDER BY id
            "#,
        )
        .bind(task_instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| TaskInstanceErrorLogWire {
                task_instance_id: r.get("task_instance_id"),
                error_time: r.get("error_time"),
                description: r.get("description"),
            })
            .collect())
    }

    // =========================================================================
    // Task queries and admin
    // =========================================================================

    async fn get_downstream_tasks(
        &self,
        task_ids: Vec<i64>,
        dag_id: i64,
    ) -> Result<HashMap<i64, DownstreamTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.node_id, e.downstream_node_ids
            FROM task t
            LEFT JOIN edge e ON e.dag_id = $2 AND e.node_id = t.node_id
            WHERE t.id = ANY($1)
            "#,
        )
        .bind(&task_ids)
        .bind(dag_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut result = HashMap::new();
        for row in rows {
            let downstream: Option<Value> = row.get("downstream_node_ids");
            result.insert(
                row.get("id"),
                DownstreamTask {
                    node_id: row.get("node_id"),
                    downstream_node_ids: downstream.map(json_id_list).unwrap_or_default(),
                },
            );
        }
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn set_task_resume_state(
        &self,
        workflow_id: i64,
        reset_if_running: bool,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let live = sqlx::query(
            r#"
            SELECT count(*) AS live FROM workflow_run
            WHERE workflow_id = $1 AND status NOT IN ('T', 'D', 'E')
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let live: i64 = live.get("live");
        if live > 0 {
            return Err(StoreError::NotResumable {
                workflow_id,
                reason: "an active workflow run still holds this workflow".to_string(),
            });
        }

        let excluded: &[&str] = if reset_if_running {
            &["D", "G"]
        } else {
            &["D", "G", "R"]
        };
        let excluded: Vec<String> = excluded.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE task
            SET status = 'G', num_attempts = 0, status_date = now()
            WHERE workflow_id = $1 AND status <> ALL($2)
            "#,
        )
        .bind(workflow_id)
        .bind(&excluded)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, task_ids))]
    async fn update_task_statuses(
        &self,
        task_ids: Vec<i64>,
        new_status: TaskStatus,
        workflow_id: i64,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            r#"
            UPDATE task
            SET status = $3, status_date = now(),
                num_attempts = CASE WHEN $4 THEN 0 ELSE num_attempts END
            WHERE id = ANY($1) AND workflow_id = $2
            "#,
        )
        .bind(&task_ids)
        .bind(workflow_id)
        .bind(new_status.to_string())
        .bind(new_status == TaskStatus::Registering)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if new_status == TaskStatus::Registering {
            let live: Vec<i64> = sqlx::query(
                r#"
                SELECT id FROM task_instance
                WHERE task_id = ANY($1) AND status IN ('Q', 'I', 'O', 'R', 'T')
                FOR UPDATE
                "#,
            )
            .bind(&task_ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(|r| r.get("id"))
            .collect();
            for id in live {
                Self::transition_instance(&mut tx, id, TaskInstanceStatus::KillSelf).await?;
            }
        }
        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn most_recent_ti_error(
        &self,
        task_id: i64,
    ) -> Result<Option<(String, i64)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT el.description, el.task_instance_id
            FROM task_instance_error_log el
            JOIN task_instance ti ON el.task_instance_id = ti.id
            WHERE ti.task_id = $1
            ORDER BY ti.id DESC, el.id DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| (r.get("description"), r.get("task_instance_id"))))
    }

    async fn tasks_recursive(
        &self,
        task_ids: Vec<i64>,
        downstream: bool,
    ) -> Result<Vec<i64>, StoreError> {
        // Level-by-level expansion; DAG depth bounds the iteration count.
        let mut closure: HashSet<i64> = HashSet::new();
        let mut frontier: Vec<i64> = task_ids;

        while !frontier.is_empty() {
            frontier.retain(|task_id| !closure.contains(task_id));
            if frontier.is_empty() {
                break;
            }
            closure.extend(frontier.iter().copied());

            let column = if downstream {
                "e.downstream_node_ids"
            } else {
                "e.upstream_node_ids"
            };
            let rows = sqlx::query(&format!(
                r#"
                SELECT t.workflow_id, {column} AS neighbor_node_ids
                FROM task t
                JOIN workflow w ON t.workflow_id = w.id
                JOIN edge e ON e.dag_id = w.dag_id AND e.node_id = t.node_id
                WHERE t.id = ANY($1)
                "#
            ))
            .bind(&frontier)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            let mut next_frontier: Vec<i64> = Vec::new();
            for row in rows {
                let workflow_id: i64 = row.get("workflow_id");
                let neighbor_nodes = json_id_list(row.get("neighbor_node_ids"));
                if neighbor_nodes.is_empty() {
                    continue;
                }
                let neighbors = sqlx::query(
                    "SELECT id FROM task WHERE workflow_id = $1 AND node_id = ANY($2)",
                )
                .bind(workflow_id)
                .bind(&neighbor_nodes)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
                next_frontier.extend(neighbors.into_iter().map(|r| r.get::<i64, _>("id")));
            }
            frontier = next_frontier;
        }

        let mut closure: Vec<i64> = closure.into_iter().collect();
        closure.sort_unstable();
        Ok(closure)
    }

    async fn task_dependencies(
        &self,
        task_id: i64,
    ) -> Result<(Vec<TaskSummary>, Vec<TaskSummary>), StoreError> {
        let row = sqlx::query(
            r#"
            SELECT t.workflow_id, t.node_id, w.dag_id
            FROM task t JOIN workflow w ON t.workflow_id = w.id
            WHERE t.id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound {
            entity: "task",
            id: task_id,
        })?;
        let workflow_id: i64 = row.get("workflow_id");
        let node_id: i64 = row.get("node_id");
        let dag_id: i64 = row.get("dag_id");

        let edge = sqlx::query(
            "SELECT upstream_node_ids, downstream_node_ids FROM edge WHERE dag_id = $1 AND node_id = $2",
        )
        .bind(dag_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let (up_nodes, down_nodes) = match edge {
            Some(row) => (
                json_id_list(row.get("upstream_node_ids")),
                json_id_list(row.get("downstream_node_ids")),
            ),
            None => (Vec::new(), Vec::new()),
        };

        let fetch = |nodes: Vec<i64>| async move {
            if nodes.is_empty() {
                return Ok::<Vec<TaskSummary>, StoreError>(Vec::new());
            }
            let rows = sqlx::query(
                r#"
                SELECT id, name, status FROM task
                WHERE workflow_id = $1 AND node_id = ANY($2)
                ORDER BY id
                "#,
            )
            .bind(workflow_id)
            .bind(&nodes)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.into_iter()
                .map(|r| {
                    Ok(TaskSummary {
                        task_id: r.get("id"),
                        name: r.get("name"),
                        status: parse_task_status(r.get("status"))?,
                    })
                })
                .collect()
        };
        Ok((fetch(up_nodes).await?, fetch(down_nodes).await?))
    }

    // =========================================================================
    // CLI status queries
    // =========================================================================

    async fn workflow_status_row(&self, workflow_id: i64) -> Result<WorkflowStatusRow, StoreError> {
        let row = sqlx::query("SELECT name, status, created_date FROM workflow WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            })?;

        let counts = sqlx::query(
            "SELECT status, count(*) AS n FROM task WHERE workflow_id = $1 GROUP BY status",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let mut task_counts = HashMap::new();
        for count in counts {
            task_counts.insert(parse_task_status(count.get("status"))?, count.get("n"));
        }

        Ok(WorkflowStatusRow {
            workflow_id,
            name: row.get("name"),
            status: parse_workflow_status(row.get("status"))?,
            created_date: row.get("created_date"),
            task_counts,
        })
    }

    async fn workflow_tasks(
        &self,
        workflow_id: i64,
        statuses: Option<Vec<TaskStatus>>,
        limit: usize,
    ) -> Result<Vec<WorkflowTaskRow>, StoreError> {
        let status_codes: Option<Vec<String>> =
            statuses.map(|s| s.iter().map(|status| status.to_string()).collect());
        let rows = sqlx::query(
            r#"
            SELECT id, name, status, num_attempts, max_attempts
            FROM task
            WHERE workflow_id = $1 AND ($2::text[] IS NULL OR status = ANY($2))
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(workflow_id)
        .bind(&status_codes)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|r| {
                Ok(WorkflowTaskRow {
                    task_id: r.get("id"),
                    name: r.get("name"),
                    status: parse_task_status(r.get("status"))?,
                    num_attempts: r.get("num_attempts"),
                    max_attempts: r.get("max_attempts"),
                })
            })
            .collect()
    }

    async fn task_status_rows(
        &self,
        task_ids: Vec<i64>,
    ) -> Result<Vec<TaskStatusRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT t.id AS task_id, t.name, t.status AS task_status,
                   ti.id AS task_instance_id, ti.status AS instance_status,
                   (SELECT description FROM task_instance_error_log el
                    WHERE el.task_instance_id = ti.id ORDER BY el.id DESC LIMIT 1)
                   AS error_description
            FROM task t
            LEFT JOIN LATERAL (
                SELECT id, status FROM task_instance
                WHERE task_id = t.id ORDER BY id DESC LIMIT 1
            ) ti ON true
            WHERE t.id = ANY($1)
            ORDER BY t.id
            "#,
        )
        .bind(&task_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|r| {
                let instance_status: Option<String> = r.get("instance_status");
                Ok(TaskStatusRow {
                    task_id: r.get("task_id"),
                    name: r.get("name"),
                    status: parse_task_status(r.get("task_status"))?,
                    task_instance_id: r.get("task_instance_id"),
                    task_instance_status: instance_status
                        .as_deref()
                        .map(parse_instance_status)
                        .transpose()?,
                    error_description: r.get("error_description"),
                })
            })
            .collect()
    }
}
