//! In-memory [`Store`] implementation backed by `parking_lot` locks.
//! Used for unit tests and single-process deployments (`STORE_URL=memory`).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use meshflow_model::{
    Claim, DataReference, NodeKey, Task, TaskError, TaskStatus, Workflow, WorkflowStatus,
};

use crate::store::{ClaimOutcome, PromotionOutcome, Result, Store, StoreError};

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, Workflow>,
    tasks: HashMap<Uuid, Task>,
    ready_queue: VecDeque<Uuid>,
}

/// An in-memory store. Cheap to clone — the lock and maps live behind
/// an `Arc` internally via `RwLock` over the whole struct, so clone a
/// single instance and share it across workers and the API instead of
/// constructing a new one per task.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_workflow(&self, workflow: Workflow) -> Result<()> {
        let mut inner = self.inner.write();
        inner.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow> {
        self.inner
            .read()
            .workflows
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        Ok(self.inner.read().workflows.values().cloned().collect())
    }

    async fn set_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> Result<()> {
        let mut inner = self.inner.write();
        let wf = inner
            .workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        wf.status = status;
        if matches!(
            status,
            WorkflowStatus::Complete | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        ) {
            wf.terminal_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn create_task(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::TaskAlreadyExists(task.id));
        }
        if let Some(wf) = inner.workflows.get_mut(&task.workflow_id) {
            wf.task_ids.push(task.id);
        }
        inner.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.inner
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<Task>> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn enqueue_ready(&self, task_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        inner.ready_queue.push_back(task_id);
        Ok(())
    }

    async fn claim_one(&self, worker_id: &str, lease: Duration) -> Result<Option<Task>> {
        let mut inner = self.inner.write();
        let Some(task_id) = inner.ready_queue.pop_front() else {
            return Ok(None);
        };
        let expires_at = Utc::now() + lease;
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::RunningRemote;
        task.claim = Some(Claim {
            owner: worker_id.to_string(),
            expires_at,
        });
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn extend_claim(&self, task_id: Uuid, worker_id: &str, lease: Duration) -> Result<ClaimOutcome> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        match &task.claim {
            Some(c) if c.owner == worker_id => {
                task.claim = Some(Claim {
                    owner: worker_id.to_string(),
                    expires_at: Utc::now() + lease,
                });
                Ok(ClaimOutcome::Accepted)
            }
            _ => Ok(ClaimOutcome::Lost),
        }
    }

    async fn release_claim(&self, task_id: Uuid, worker_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            if matches!(&task.claim, Some(c) if c.owner == worker_id) {
                task.claim = None;
            }
        }
        Ok(())
    }

    async fn complete_task(&self, task_id: Uuid, output: DataReference) -> Result<()> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Complete;
        task.output = Some(output);
        task.claim = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_task(&self, task_id: Uuid, error: TaskError) -> Result<()> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Failed;
        task.last_error = Some(error);
        task.claim = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn retry_task(&self, task_id: Uuid, error: TaskError) -> Result<()> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Ready;
        task.attempt += 1;
        task.last_error = Some(error);
        task.claim = None;
        task.updated_at = Utc::now();
        inner.ready_queue.push_back(task_id);
        Ok(())
    }

    async fn record_predecessor_output(
        &self,
        task_id: Uuid,
        predecessor: NodeKey,
        output: DataReference,
        expected_inputs: usize,
    ) -> Result<PromotionOutcome> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.resolved_inputs.push((predecessor, output));
        task.updated_at = Utc::now();
        if task.resolved_inputs.len() >= expected_inputs && task.status == TaskStatus::Pending {
            task.resolved_inputs.sort_by(|a, b| a.0.cmp(&b.0));
            task.inputs = task.resolved_inputs.iter().map(|(_, o)| o.clone()).collect();
            task.status = TaskStatus::Ready;
            inner.ready_queue.push_back(task_id);
            Ok(PromotionOutcome::Promoted)
        } else {
            Ok(PromotionOutcome::Pending)
        }
    }

    async fn recover_expired(&self) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let expired: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::RunningRemote
                    && matches!(&t.claim, Some(c) if c.expires_at < now)
            })
            .map(|t| t.id)
            .collect();
        for id in &expired {
            if let Some(task) = inner.tasks.get_mut(id) {
                task.status = TaskStatus::Ready;
                task.attempt += 1;
                task.claim = None;
                task.updated_at = now;
            }
            inner.ready_queue.push_back(*id);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshflow_model::{Blueprint, DockerInfo, NodeKey};

    fn blank_workflow() -> Workflow {
        Workflow::new(
            Uuid::now_v7(),
            Blueprint {
                name: "t".into(),
                pipeline_id: "t".into(),
                version: "1".into(),
                nodes: vec![],
            },
            DockerInfo {
                docker_info_list: vec![],
            },
            vec![],
        )
    }

    fn blank_task(workflow_id: Uuid) -> Task {
        Task::new(
            workflow_id,
            NodeKey {
                container_name: "a".into(),
                operation_name: "run".into(),
            },
            vec![],
        )
    }

    #[tokio::test]
    async fn claim_one_is_exclusive() {
        let store = InMemoryStore::new();
        let wf = blank_workflow();
        let task = blank_task(wf.id);
        let task_id = task.id;
        store.create_workflow(wf).await.unwrap();
        store.create_task(task).await.unwrap();
        store.enqueue_ready(task_id).await.unwrap();

        let claimed = store.claim_one("worker-1", Duration::from_secs(30)).await.unwrap();
        assert!(claimed.is_some());
        let nothing = store.claim_one("worker-2", Duration::from_secs(30)).await.unwrap();
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn extend_claim_fails_for_wrong_owner() {
        let store = InMemoryStore::new();
        let wf = blank_workflow();
        let task = blank_task(wf.id);
        let task_id = task.id;
        store.create_workflow(wf).await.unwrap();
        store.create_task(task).await.unwrap();
        store.enqueue_ready(task_id).await.unwrap();
        store.claim_one("worker-1", Duration::from_secs(30)).await.unwrap();

        let outcome = store
            .extend_claim(task_id, "worker-2", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Lost);
    }

    #[tokio::test]
    async fn recover_expired_requeues_stale_claims() {
        let store = InMemoryStore::new();
        let wf = blank_workflow();
        let task = blank_task(wf.id);
        let task_id = task.id;
        store.create_workflow(wf).await.unwrap();
        store.create_task(task).await.unwrap();
        store.enqueue_ready(task_id).await.unwrap();
        store.claim_one("worker-1", Duration::from_millis(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = store.recover_expired().await.unwrap();
        assert_eq!(expired, vec![task_id]);
        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempt, 2, "reclaimed task starts a new attempt");
    }

    #[tokio::test]
    async fn record_predecessor_output_promotes_once() {
        let store = InMemoryStore::new();
        let wf = blank_workflow();
        let mut task = blank_task(wf.id);
        task.status = TaskStatus::Pending;
        let task_id = task.id;
        store.create_workflow(wf).await.unwrap();
        store.create_task(task).await.unwrap();

        let key_b = NodeKey {
            container_name: "b".into(),
            operation_name: "run".into(),
        };
        let key_c = NodeKey {
            container_name: "c".into(),
            operation_name: "run".into(),
        };

        let out1 = store
            .record_predecessor_output(task_id, key_b.clone(), DataReference::inline(b"x", "json"), 2)
            .await
            .unwrap();
        assert_eq!(out1, PromotionOutcome::Pending);

        let out2 = store
            .record_predecessor_output(task_id, key_c.clone(), DataReference::inline(b"y", "json"), 2)
            .await
            .unwrap();
        assert_eq!(out2, PromotionOutcome::Promoted);

        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.inputs.len(), 2);
    }

    #[tokio::test]
    async fn record_predecessor_output_orders_inputs_by_node_key_not_arrival() {
        let store = InMemoryStore::new();
        let wf = blank_workflow();
        let mut task = blank_task(wf.id);
        task.status = TaskStatus::Pending;
        let task_id = task.id;
        store.create_workflow(wf).await.unwrap();
        store.create_task(task).await.unwrap();

        let key_b = NodeKey {
            container_name: "b".into(),
            operation_name: "run".into(),
        };
        let key_c = NodeKey {
            container_name: "c".into(),
            operation_name: "run".into(),
        };
        let c_output = DataReference::inline(b"from-c", "json");
        let b_output = DataReference::inline(b"from-b", "json");

        // C completes first, B second — inputs must still come out B-then-C.
        store
            .record_predecessor_output(task_id, key_c, c_output.clone(), 2)
            .await
            .unwrap();
        store
            .record_predecessor_output(task_id, key_b, b_output.clone(), 2)
            .await
            .unwrap();

        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.inputs, vec![b_output, c_output]);
    }
}
