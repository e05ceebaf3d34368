//! Core data model for the orchestration engine: blueprints, the DAG
//! they compile to, and the workflow/task records that track execution
//! against that DAG.

pub mod blueprint;
pub mod error;
pub mod types;

pub use blueprint::{
    build_dag, Blueprint, BlueprintNode, Connection, Dag, DockerInfo, DockerInfoEntry, NodeKey,
    OperationEntry, OperationSignature,
};
pub use error::{EngineError, Result};
pub use types::{
    Claim, DataProtocol, DataReference, PredecessorOutput, Task, TaskError, TaskStatus, Workflow,
    WorkflowStatus,
};
