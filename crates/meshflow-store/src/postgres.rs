//! PostgreSQL-backed [`Store`].
//!
//! Assumes the following schema exists (applied out of band — this
//! crate carries no migration runner):
//!
//! ```sql
//! CREATE TABLE meshflow_workflows (
//!     id UUID PRIMARY KEY,
//!     blueprint JSONB NOT NULL,
//!     dockerinfo JSONB NOT NULL,
//!     initial_inputs JSONB NOT NULL DEFAULT '[]',
//!     status TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     terminal_at TIMESTAMPTZ
//! );
//!
//! CREATE TABLE meshflow_tasks (
//!     id UUID PRIMARY KEY,
//!     workflow_id UUID NOT NULL REFERENCES meshflow_workflows(id),
//!     node_key JSONB NOT NULL,
//!     upstream JSONB NOT NULL DEFAULT '[]',
//!     status TEXT NOT NULL,
//!     attempt INT NOT NULL DEFAULT 1,
//!     last_error JSONB,
//!     resolved_inputs JSONB NOT NULL DEFAULT '[]',
//!     inputs JSONB NOT NULL DEFAULT '[]',
//!     output JSONB,
//!     claimed_by TEXT,
//!     claim_expires_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE meshflow_ready_queue (
//!     seq BIGSERIAL PRIMARY KEY,
//!     task_id UUID NOT NULL REFERENCES meshflow_tasks(id)
//! );
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use meshflow_model::{
    Claim, DataReference, NodeKey, PredecessorOutput, Task, TaskError, TaskStatus, Workflow,
    WorkflowStatus,
};

use crate::store::{ClaimOutcome, PromotionOutcome, Result, Store, StoreError};

fn workflow_status_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Pending => "pending",
        WorkflowStatus::Running => "running",
        WorkflowStatus::Complete => "complete",
        WorkflowStatus::Failed => "failed",
        WorkflowStatus::Cancelled => "cancelled",
    }
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Ready => "ready",
        TaskStatus::RunningRemote => "running_remote",
        TaskStatus::Complete => "complete",
        TaskStatus::Failed => "failed",
    }
}

fn parse_workflow_status(s: &str) -> WorkflowStatus {
    match s {
        "running" => WorkflowStatus::Running,
        "complete" => WorkflowStatus::Complete,
        "failed" => WorkflowStatus::Failed,
        "cancelled" => WorkflowStatus::Cancelled,
        _ => WorkflowStatus::Pending,
    }
}

fn parse_task_status(s: &str) -> TaskStatus {
    match s {
        "ready" => TaskStatus::Ready,
        "running_remote" => TaskStatus::RunningRemote,
        "complete" => TaskStatus::Complete,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Pending,
    }
}

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn json(e: serde_json::Error) -> StoreError {
    StoreError::Backend(format!("serialization error: {e}"))
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task> {
    let node_key_json: serde_json::Value = row.get("node_key");
    let upstream_json: serde_json::Value = row.get("upstream");
    let resolved_inputs_json: serde_json::Value = row.get("resolved_inputs");
    let inputs_json: serde_json::Value = row.get("inputs");
    let output_json: Option<serde_json::Value> = row.get("output");
    let last_error_json: Option<serde_json::Value> = row.get("last_error");
    let status_str: String = row.get("status");
    let claimed_by: Option<String> = row.get("claimed_by");
    let claim_expires_at: Option<chrono::DateTime<Utc>> = row.get("claim_expires_at");

    Ok(Task {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        node_key: serde_json::from_value(node_key_json).map_err(json)?,
        upstream: serde_json::from_value(upstream_json).map_err(json)?,
        status: parse_task_status(&status_str),
        attempt: row.get::<i32, _>("attempt") as u32,
        last_error: last_error_json
            .map(serde_json::from_value::<TaskError>)
            .transpose()
            .map_err(json)?,
        resolved_inputs: serde_json::from_value(resolved_inputs_json).map_err(json)?,
        inputs: serde_json::from_value(inputs_json).map_err(json)?,
        output: output_json
            .map(serde_json::from_value::<DataReference>)
            .transpose()
            .map_err(json)?,
        claim: match (claimed_by, claim_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Claim { owner, expires_at }),
            _ => None,
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// PostgreSQL implementation of [`Store`], suitable for multiple
/// worker processes competing for the same ready queue.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, workflow))]
    async fn create_workflow(&self, workflow: Workflow) -> Result<()> {
        let blueprint = serde_json::to_value(&workflow.blueprint).map_err(json)?;
        let dockerinfo = serde_json::to_value(&workflow.dockerinfo).map_err(json)?;
        let initial_inputs = serde_json::to_value(&workflow.initial_inputs).map_err(json)?;

        sqlx::query(
            r#"
            INSERT INTO meshflow_workflows (id, blueprint, dockerinfo, initial_inputs, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(workflow.id)
        .bind(&blueprint)
        .bind(&dockerinfo)
        .bind(&initial_inputs)
        .bind(workflow_status_str(workflow.status))
        .bind(workflow.created_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        debug!(workflow_id = %workflow.id, "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow> {
        let row = sqlx::query(
            r#"
            SELECT id, blueprint, dockerinfo, initial_inputs, status, created_at, terminal_at
            FROM meshflow_workflows WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?
        .ok_or(StoreError::WorkflowNotFound(id))?;

        let blueprint: serde_json::Value = row.get("blueprint");
        let dockerinfo: serde_json::Value = row.get("dockerinfo");
        let initial_inputs: serde_json::Value = row.get("initial_inputs");
        let status_str: String = row.get("status");
        let task_ids = sqlx::query(r#"SELECT id FROM meshflow_tasks WHERE workflow_id = $1"#)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?
            .into_iter()
            .map(|r| r.get::<Uuid, _>("id"))
            .collect();

        Ok(Workflow {
            id: row.get("id"),
            blueprint: serde_json::from_value(blueprint).map_err(json)?,
            dockerinfo: serde_json::from_value(dockerinfo).map_err(json)?,
            initial_inputs: serde_json::from_value(initial_inputs).map_err(json)?,
            status: parse_workflow_status(&status_str),
            task_ids,
            created_at: row.get("created_at"),
            terminal_at: row.get("terminal_at"),
        })
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query(r#"SELECT id FROM meshflow_workflows"#)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.get_workflow(row.get("id")).await?);
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn set_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> Result<()> {
        let terminal = matches!(
            status,
            WorkflowStatus::Complete | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        );
        sqlx::query(
            r#"
            UPDATE meshflow_workflows
            SET status = $2, terminal_at = CASE WHEN $3 THEN NOW() ELSE terminal_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(workflow_status_str(status))
        .bind(terminal)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self, task))]
    async fn create_task(&self, task: Task) -> Result<()> {
        let node_key = serde_json::to_value(&task.node_key).map_err(json)?;
        let upstream = serde_json::to_value(&task.upstream).map_err(json)?;
        let inputs = serde_json::to_value(&task.inputs).map_err(json)?;

        sqlx::query(
            r#"
            INSERT INTO meshflow_tasks
                (id, workflow_id, node_key, upstream, status, attempt, inputs, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(task.id)
        .bind(task.workflow_id)
        .bind(&node_key)
        .bind(&upstream)
        .bind(task_status_str(task.status))
        .bind(task.attempt as i32)
        .bind(&inputs)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_task(&self, id: Uuid) -> Result<Task> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, node_key, upstream, status, attempt, last_error,
                   resolved_inputs, inputs, output, claimed_by, claim_expires_at, created_at, updated_at
            FROM meshflow_tasks WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?
        .ok_or(StoreError::TaskNotFound(id))?;
        row_to_task(&row)
    }

    async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, node_key, upstream, status, attempt, last_error,
                   resolved_inputs, inputs, output, claimed_by, claim_expires_at, created_at, updated_at
            FROM meshflow_tasks WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn enqueue_ready(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(r#"INSERT INTO meshflow_ready_queue (task_id) VALUES ($1)"#)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    /// Claims the oldest ready task via a `SELECT ... FOR UPDATE SKIP
    /// LOCKED` CTE so that concurrent workers never double-claim the
    /// same queue entry.
    #[instrument(skip(self))]
    async fn claim_one(&self, worker_id: &str, lease: Duration) -> Result<Option<Task>> {
        let lease_secs = lease.as_secs_f64();
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT q.seq, q.task_id
                FROM meshflow_ready_queue q
                JOIN meshflow_tasks t ON t.id = q.task_id
                WHERE t.status = 'ready'
                ORDER BY q.seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            ),
            popped AS (
                DELETE FROM meshflow_ready_queue
                WHERE seq = (SELECT seq FROM claimable)
                RETURNING task_id
            )
            UPDATE meshflow_tasks t
            SET status = 'running_remote',
                claimed_by = $1,
                claim_expires_at = NOW() + make_interval(secs => $2)
            FROM popped
            WHERE t.id = popped.task_id
            RETURNING t.id, t.workflow_id, t.node_key, t.upstream, t.status, t.attempt,
                      t.last_error, t.inputs, t.output, t.claimed_by, t.claim_expires_at,
                      t.created_at, t.updated_at
            "#,
        )
        .bind(worker_id)
        .bind(lease_secs)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(%worker_id, error = %e, "claim_one failed");
            db(e)
        })?;

        row.as_ref().map(row_to_task).transpose()
    }

    #[instrument(skip(self))]
    async fn extend_claim(&self, task_id: Uuid, worker_id: &str, lease: Duration) -> Result<ClaimOutcome> {
        let lease_secs = lease.as_secs_f64();
        let row = sqlx::query(
            r#"
            UPDATE meshflow_tasks
            SET claim_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND claimed_by = $2 AND status = 'running_remote'
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(lease_secs)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        Ok(if row.is_some() {
            ClaimOutcome::Accepted
        } else {
            ClaimOutcome::Lost
        })
    }

    async fn release_claim(&self, task_id: Uuid, worker_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE meshflow_tasks
            SET claimed_by = NULL, claim_expires_at = NULL
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self, output))]
    async fn complete_task(&self, task_id: Uuid, output: DataReference) -> Result<()> {
        let output_json = serde_json::to_value(&output).map_err(json)?;
        sqlx::query(
            r#"
            UPDATE meshflow_tasks
            SET status = 'complete', output = $2, claimed_by = NULL, claim_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(&output_json)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_task(&self, task_id: Uuid, error: TaskError) -> Result<()> {
        let error_json = serde_json::to_value(&error).map_err(json)?;
        sqlx::query(
            r#"
            UPDATE meshflow_tasks
            SET status = 'failed', last_error = $2, claimed_by = NULL, claim_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(&error_json)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn retry_task(&self, task_id: Uuid, error: TaskError) -> Result<()> {
        let error_json = serde_json::to_value(&error).map_err(json)?;
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            r#"
            UPDATE meshflow_tasks
            SET status = 'ready', attempt = attempt + 1, last_error = $2,
                claimed_by = NULL, claim_expires_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(&error_json)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        sqlx::query(r#"INSERT INTO meshflow_ready_queue (task_id) VALUES ($1)"#)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(())
    }

    /// Appends `(predecessor, output)` to `resolved_inputs` under a
    /// row lock, then — once every predecessor has reported — sorts the
    /// accumulated pairs by node key and materializes that order into
    /// `inputs`. The sort happens in Rust rather than SQL because the
    /// ordering key (`NodeKey`) is a compound JSON object, not a scalar
    /// column.
    #[instrument(skip(self, output))]
    async fn record_predecessor_output(
        &self,
        task_id: Uuid,
        predecessor: NodeKey,
        output: DataReference,
        expected_inputs: usize,
    ) -> Result<PromotionOutcome> {
        let pair_json = serde_json::to_value((&predecessor, &output)).map_err(json)?;
        let mut tx = self.pool.begin().await.map_err(db)?;

        let row = sqlx::query(
            r#"
            UPDATE meshflow_tasks
            SET resolved_inputs = resolved_inputs || jsonb_build_array($2::jsonb), updated_at = NOW()
            WHERE id = $1
            RETURNING resolved_inputs, status
            "#,
        )
        .bind(task_id)
        .bind(&pair_json)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        let resolved_json: serde_json::Value = row.get("resolved_inputs");
        let mut resolved: Vec<PredecessorOutput> =
            serde_json::from_value(resolved_json).map_err(json)?;
        let status: String = row.get("status");

        let outcome = if resolved.len() >= expected_inputs && status == "pending" {
            resolved.sort_by(|a, b| a.0.cmp(&b.0));
            let inputs: Vec<&DataReference> = resolved.iter().map(|(_, o)| o).collect();
            let inputs_json = serde_json::to_value(&inputs).map_err(json)?;

            sqlx::query(
                r#"UPDATE meshflow_tasks SET status = 'ready', inputs = $2 WHERE id = $1"#,
            )
            .bind(task_id)
            .bind(&inputs_json)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
            sqlx::query(r#"INSERT INTO meshflow_ready_queue (task_id) VALUES ($1)"#)
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            PromotionOutcome::Promoted
        } else {
            PromotionOutcome::Pending
        };

        tx.commit().await.map_err(db)?;
        Ok(outcome)
    }

    /// Resets any `running_remote` task whose claim lease has elapsed
    /// back to `ready` and re-enqueues it, mirroring the in-memory
    /// implementation's stale-claim sweep. A lease-recovered task is
    /// re-executed from scratch by whichever worker claims it next, so
    /// this bumps `attempt` the same way a transport retry does.
    #[instrument(skip(self))]
    async fn recover_expired(&self) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let rows = sqlx::query(
            r#"
            UPDATE meshflow_tasks
            SET status = 'ready', attempt = attempt + 1, claimed_by = NULL,
                claim_expires_at = NULL, updated_at = NOW()
            WHERE status = 'running_remote' AND claim_expires_at < NOW()
            RETURNING id
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;

        let ids: Vec<Uuid> = rows.into_iter().map(|r| r.get("id")).collect();
        for id in &ids {
            sqlx::query(r#"INSERT INTO meshflow_ready_queue (task_id) VALUES ($1)"#)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;
        if !ids.is_empty() {
            debug!(count = ids.len(), "reclaimed stale tasks");
        }
        Ok(ids)
    }
}
