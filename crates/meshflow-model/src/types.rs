//! Workflow, task and data-reference types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blueprint::{Blueprint, DockerInfo, NodeKey};

/// One predecessor's output, tagged with the node key that produced it
/// so the final `inputs` list can be assembled in lexicographic
/// predecessor order regardless of completion order (see
/// [`Task::resolved_inputs`]).
pub type PredecessorOutput = (NodeKey, DataReference);

/// An opaque pointer to artifact data. The engine never inspects the
/// body behind a reference — it only carries it from an upstream
/// output slot to a downstream input slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataReference {
    pub protocol: DataProtocol,
    pub uri: String,
    #[serde(default)]
    pub format: String,
}

impl DataReference {
    pub fn inline(bytes: &[u8], format: impl Into<String>) -> Self {
        use base64::Engine;
        DataReference {
            protocol: DataProtocol::Inline,
            uri: base64::engine::general_purpose::STANDARD.encode(bytes),
            format: format.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataProtocol {
    Inline,
    Http,
    Https,
    S3,
    Nfs,
    File,
    Grpc,
}

/// Lifecycle status of a workflow. See the invariants in the data model:
/// a workflow is terminal iff every owned task is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub blueprint: Blueprint,
    pub dockerinfo: DockerInfo,
    #[serde(default)]
    pub initial_inputs: Vec<DataReference>,
    pub status: WorkflowStatus,
    pub task_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(
        id: Uuid,
        blueprint: Blueprint,
        dockerinfo: DockerInfo,
        initial_inputs: Vec<DataReference>,
    ) -> Self {
        Workflow {
            id,
            blueprint,
            dockerinfo,
            initial_inputs,
            status: WorkflowStatus::Pending,
            task_ids: Vec::new(),
            created_at: Utc::now(),
            terminal_at: None,
        }
    }
}

/// Per-node-operation task state machine. See [`TaskStatus`] for the
/// transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    RunningRemote,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

/// An unexpired claim held by a worker on a `ready`-turned-`running_remote`
/// task. Invariant I3: at most one unexpired claim per task at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub node_key: NodeKey,
    pub upstream: Vec<NodeKey>,
    pub status: TaskStatus,
    /// Number of execution attempts made or in flight, 1-based: a task
    /// starts at `1` for its first execution, and each transport retry
    /// or lease-recovered re-claim bumps it before the next execution
    /// runs. Compared directly against `RetryPolicy::max_attempts`.
    #[serde(default)]
    pub attempt: u32,
    pub last_error: Option<TaskError>,
    /// Predecessor outputs received so far, tagged by the node key that
    /// produced them. Unordered with respect to arrival; finalized into
    /// `inputs` (sorted by node key) the moment the task is promoted.
    #[serde(default)]
    pub resolved_inputs: Vec<PredecessorOutput>,
    /// The task's final input list, resolved exactly once (I2) in
    /// lexicographic order of the producing predecessor's node key —
    /// not completion order.
    #[serde(default)]
    pub inputs: Vec<DataReference>,
    pub output: Option<DataReference>,
    pub claim: Option<Claim>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(workflow_id: Uuid, node_key: NodeKey, upstream: Vec<NodeKey>) -> Self {
        let now = Utc::now();
        Task {
            id: Uuid::now_v7(),
            workflow_id,
            node_key,
            upstream,
            status: TaskStatus::Pending,
            attempt: 1,
            last_error: None,
            resolved_inputs: Vec::new(),
            inputs: Vec::new(),
            output: None,
            claim: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_source(&self) -> bool {
        self.upstream.is_empty()
    }
}
