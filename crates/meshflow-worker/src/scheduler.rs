//! Scheduling: turning a validated DAG into an initial task set, and
//! promoting successors as their predecessors complete.

use std::sync::Arc;
use uuid::Uuid;

use meshflow_model::{build_dag, DataReference, Task, Workflow};
use meshflow_store::{PromotionOutcome, Store, StoreError};

pub struct Scheduler {
    store: Arc<dyn Store>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Scheduler { store }
    }

    /// Build one task per DAG node, seed source tasks with the
    /// workflow's initial inputs, mark them `ready` and enqueue them.
    /// Non-source tasks are created `pending` and wait for
    /// [`Scheduler::promote_successors`] to fill their inputs.
    pub async fn seed(&self, workflow: &Workflow) -> Result<Vec<Uuid>, StoreError> {
        let dag = build_dag(&workflow.blueprint, &workflow.dockerinfo)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut task_ids = Vec::new();
        for node_key in dag.node_order() {
            let upstream = dag.predecessors(&node_key);
            let mut task = Task::new(workflow.id, node_key.clone(), upstream.clone());
            if upstream.is_empty() {
                task.inputs = workflow.initial_inputs.clone();
                task.status = meshflow_model::TaskStatus::Ready;
            }
            let task_id = task.id;
            self.store.create_task(task).await?;
            task_ids.push(task_id);
            if upstream.is_empty() {
                self.store.enqueue_ready(task_id).await?;
            }
        }
        Ok(task_ids)
    }

    /// Called by the worker loop when `task_id` completes. Looks up its
    /// DAG successors and atomically records this task's output
    /// against each, letting the store promote any successor whose
    /// last input just arrived.
    pub async fn promote_successors(
        &self,
        workflow: &Workflow,
        completed_node: &meshflow_model::NodeKey,
        output: DataReference,
    ) -> Result<(), StoreError> {
        let dag = build_dag(&workflow.blueprint, &workflow.dockerinfo)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let successors = dag.successors(completed_node);

        let all_tasks = self.store.list_tasks(workflow.id).await?;
        for succ_key in successors {
            let Some(succ_task) = all_tasks.iter().find(|t| t.node_key == succ_key) else {
                continue;
            };
            let expected = dag.predecessors(&succ_key).len();
            let outcome = self
                .store
                .record_predecessor_output(succ_task.id, completed_node.clone(), output.clone(), expected)
                .await?;
            if outcome == PromotionOutcome::Promoted {
                tracing::debug!(task_id = %succ_task.id, node = %succ_key, "promoted successor to ready");
            }
        }
        Ok(())
    }
}
