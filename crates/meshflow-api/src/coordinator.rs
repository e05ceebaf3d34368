//! Workflow coordinator: the only actor that writes a submit-time
//! workflow record and the sole read path the submission API uses to
//! observe progress.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use meshflow_model::{
    build_dag, Blueprint, DataReference, DockerInfo, EngineError, Result, Task, Workflow,
    WorkflowStatus,
};
use meshflow_store::Store;
use meshflow_worker::Scheduler;

pub struct Coordinator {
    store: Arc<dyn Store>,
    scheduler: Scheduler,
}

#[derive(Debug, Serialize)]
pub struct WorkflowView {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub terminal_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub node_key: meshflow_model::NodeKey,
    pub status: meshflow_model::TaskStatus,
    pub error: Option<meshflow_model::TaskError>,
    pub output: Option<DataReference>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Coordinator {
            scheduler: Scheduler::new(store.clone()),
            store,
        }
    }

    pub async fn submit(
        &self,
        blueprint: Blueprint,
        dockerinfo: DockerInfo,
        inputs: Vec<DataReference>,
    ) -> Result<Uuid> {
        // Validate before persisting anything — a rejected blueprint
        // must not leave partial state behind.
        build_dag(&blueprint, &dockerinfo)?;

        let workflow_id = Uuid::now_v7();
        let workflow = Workflow::new(workflow_id, blueprint, dockerinfo, inputs);
        self.store
            .create_workflow(workflow.clone())
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;

        self.scheduler
            .seed(&workflow)
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;

        Ok(workflow_id)
    }

    pub async fn observe(&self, workflow_id: Uuid) -> Result<WorkflowView> {
        let workflow = self.get_or_not_found(workflow_id).await?;
        Ok(WorkflowView {
            workflow_id: workflow.id,
            status: workflow.status,
            created_at: workflow.created_at,
            terminal_at: workflow.terminal_at,
        })
    }

    pub async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<TaskView>> {
        self.get_or_not_found(workflow_id).await?;
        let tasks: Vec<Task> = self
            .store
            .list_tasks(workflow_id)
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;
        Ok(tasks
            .into_iter()
            .map(|t| TaskView {
                task_id: t.id,
                node_key: t.node_key,
                status: t.status,
                error: t.last_error,
                output: t.output,
            })
            .collect())
    }

    async fn get_or_not_found(&self, workflow_id: Uuid) -> Result<Workflow> {
        self.store.get_workflow(workflow_id).await.map_err(|e| match e {
            meshflow_store::StoreError::WorkflowNotFound(id) => {
                EngineError::not_found(format!("workflow {id}"))
            }
            other => EngineError::Internal(other.into()),
        })
    }
}
