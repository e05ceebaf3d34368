//! The `Store` trait: the sole medium of cross-process coordination
//! between workers and the API process.
//!
//! Implementations must offer an atomic claim primitive (mutual
//! exclusion over ready tasks, invariant I3) and an atomic
//! predecessor-output recording primitive (no double-promotion of a
//! successor, invariant I4). Two implementations are provided:
//! [`crate::memory::InMemoryStore`] for tests and single-process use,
//! and [`crate::postgres::PostgresStore`] for multi-worker production
//! deployments.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use meshflow_model::{DataReference, NodeKey, Task, TaskError, Workflow, WorkflowStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("task {0} already exists")]
    TaskAlreadyExists(Uuid),

    #[error("claim on task {0} is held by another worker")]
    ClaimConflict(Uuid),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a heartbeat against a held claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Accepted,
    Lost,
}

/// Outcome of recording one predecessor's output against a successor
/// task. `Promoted` means this call was the one that satisfied the
/// last missing input and the task has been transitioned to `ready`
/// and enqueued by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    Pending,
    Promoted,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_workflow(&self, workflow: Workflow) -> Result<()>;
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow>;
    async fn list_workflows(&self) -> Result<Vec<Workflow>>;
    async fn set_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> Result<()>;

    async fn create_task(&self, task: Task) -> Result<()>;
    async fn get_task(&self, id: Uuid) -> Result<Task>;
    async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<Task>>;

    /// Append `task_id` to the FIFO ready queue. Called for source
    /// tasks at submit time and for successors as they are promoted.
    async fn enqueue_ready(&self, task_id: Uuid) -> Result<()>;

    /// Atomically pop the head of the ready queue and record a claim
    /// owned by `worker_id` with the given lease. Returns `None` if the
    /// queue is empty.
    async fn claim_one(&self, worker_id: &str, lease: Duration) -> Result<Option<Task>>;

    /// Heartbeat an outstanding claim. Returns `Lost` if `worker_id` no
    /// longer owns the claim (it expired and was reclaimed).
    async fn extend_claim(&self, task_id: Uuid, worker_id: &str, lease: Duration) -> Result<ClaimOutcome>;

    async fn release_claim(&self, task_id: Uuid, worker_id: &str) -> Result<()>;

    async fn complete_task(&self, task_id: Uuid, output: DataReference) -> Result<()>;

    async fn fail_task(&self, task_id: Uuid, error: TaskError) -> Result<()>;

    /// Re-enqueue a task after a retriable failure, bumping its attempt
    /// counter and returning it to `ready`.
    async fn retry_task(&self, task_id: Uuid, error: TaskError) -> Result<()>;

    /// Record `predecessor`'s `output` against `task_id`. If this call
    /// brings the resolved-predecessor count up to `expected_inputs`,
    /// the store assembles the final `inputs` list in lexicographic
    /// order of producing node key (not arrival order), transitions the
    /// task `pending -> ready`, and enqueues it as a single atomic step,
    /// returning `Promoted`. This is the compare-and-set primitive that
    /// prevents a successor with two predecessors completing
    /// concurrently from being enqueued twice.
    async fn record_predecessor_output(
        &self,
        task_id: Uuid,
        predecessor: NodeKey,
        output: DataReference,
        expected_inputs: usize,
    ) -> Result<PromotionOutcome>;

    /// Scan for tasks whose claim lease has expired, reset them from
    /// `running_remote` to `ready`, re-enqueue them, and return their
    /// ids.
    async fn recover_expired(&self) -> Result<Vec<Uuid>>;
}
