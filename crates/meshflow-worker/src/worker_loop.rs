//! The worker loop: compete for claims on the ready queue, drive a
//! claimed task through its state machine, and hand completions back
//! to the [`Scheduler`] for successor promotion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use meshflow_client::{ExecuteRequest, ExecuteResponse, ServiceClient, StatusResponse};
use meshflow_model::{EngineError, Task, TaskError, TaskStatus, Workflow, WorkflowStatus};
use meshflow_store::Store;

use crate::config::WorkerConfig;
use crate::scheduler::Scheduler;

/// Polling cadence while a task is `running_remote` and the service
/// reported `status: running`.
const REMOTE_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct WorkerLoop {
    config: WorkerConfig,
    store: Arc<dyn Store>,
    client: ServiceClient,
    scheduler: Scheduler,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerLoop {
    pub fn new(config: WorkerConfig, store: Arc<dyn Store>, client: ServiceClient) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        WorkerLoop {
            scheduler: Scheduler::new(store.clone()),
            config,
            store,
            client,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// A clonable handle other tasks (signal handlers, tests) can use
    /// to request shutdown without holding a reference to the loop.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown is signalled. Also spawns a background sweep
    /// that calls `recover_expired` on `reclaim_interval`, so a worker
    /// that crashes mid-task doesn't strand it forever.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(worker_id = %self.config.worker_id, "starting worker loop");
        let reclaim_handle = self.spawn_reclaim_loop();

        loop {
            if *self.shutdown_rx.borrow() {
                info!(worker_id = %self.config.worker_id, "shutdown signal received");
                break;
            }

            match self.store.claim_one(&self.config.worker_id, self.config.claim_lease).await {
                Ok(Some(task)) => {
                    if let Err(e) = self.drive_task(task).await {
                        error!(worker_id = %self.config.worker_id, error = %e, "task driving failed");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = self.shutdown_rx_changed() => {
                            info!(worker_id = %self.config.worker_id, "shutdown during poll wait");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "claim_one failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }

        reclaim_handle.abort();
        info!(worker_id = %self.config.worker_id, "worker loop stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn shutdown_rx_changed(&self) {
        let mut rx = self.shutdown_rx.clone();
        let _ = rx.changed().await;
    }

    fn spawn_reclaim_loop(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.config.reclaim_interval;
        let worker_id = self.config.worker_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.recover_expired().await {
                    Ok(ids) if !ids.is_empty() => {
                        debug!(worker_id = %worker_id, count = ids.len(), "reclaimed expired claims");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(worker_id = %worker_id, error = %e, "recover_expired failed"),
                }
            }
        })
    }

    /// Drives one claimed task from `running_remote` to a terminal or
    /// re-enqueued state, per the state machine in the spec's worker
    /// loop component.
    #[instrument(skip(self, task), fields(task_id = %task.id, node = %task.node_key))]
    async fn drive_task(&self, task: Task) -> anyhow::Result<()> {
        let workflow = self.store.get_workflow(task.workflow_id).await?;
        if workflow.status == WorkflowStatus::Pending {
            self.store
                .set_workflow_status(workflow.id, WorkflowStatus::Running)
                .await?;
        }

        let Some(endpoint) = workflow.dockerinfo.endpoint(&task.node_key.container_name) else {
            self.abandon(&task, "no dockerinfo endpoint for container").await;
            return Ok(());
        };

        let request = ExecuteRequest {
            method: task.node_key.operation_name.clone(),
            workflow_id: task.workflow_id,
            task_id: task.id,
            inputs: task.inputs.clone(),
            parameters: serde_json::Value::Null,
        };

        match self.client.execute(&endpoint, &request).await {
            Ok(ExecuteResponse::Complete { output }) => {
                self.finish_complete(&workflow, &task, output).await
            }
            Ok(ExecuteResponse::Running { task_id: remote_id }) => {
                self.poll_until_terminal(&workflow, &task, &endpoint, &remote_id).await
            }
            Ok(ExecuteResponse::Failed { .. }) => unreachable!("client maps Failed to Err"),
            Err(e) => self.handle_failure(&task, e).await,
        }
    }

    async fn poll_until_terminal(
        &self,
        workflow: &Workflow,
        task: &Task,
        endpoint: &str,
        remote_id: &str,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        let mut last_heartbeat = Instant::now();
        let heartbeat_every = self.config.claim_lease / 2;

        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(());
            }
            if let Some(timeout) = self.config.remote_timeout {
                if started.elapsed() > timeout {
                    return self
                        .handle_failure(task, EngineError::remote_timeout(timeout))
                        .await;
                }
            }

            if last_heartbeat.elapsed() >= heartbeat_every {
                match self
                    .store
                    .extend_claim(task.id, &self.config.worker_id, self.config.claim_lease)
                    .await
                {
                    Ok(meshflow_store::ClaimOutcome::Lost) => {
                        warn!(task_id = %task.id, "claim lost mid-poll, abandoning");
                        return Ok(());
                    }
                    Ok(meshflow_store::ClaimOutcome::Accepted) => {}
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "extend_claim failed");
                    }
                }
                last_heartbeat = Instant::now();
            }

            match self.client.status(endpoint, remote_id).await {
                Ok(StatusResponse::Complete) => {
                    let output = self.client.output(endpoint, remote_id).await?;
                    return self.finish_complete(workflow, task, output).await;
                }
                Ok(StatusResponse::Running { .. }) => {
                    tokio::time::sleep(REMOTE_POLL_INTERVAL).await;
                }
                Ok(StatusResponse::Failed { .. }) => unreachable!("client maps Failed to Err"),
                Err(e) => return self.handle_failure(task, e).await,
            }
        }
    }

    async fn finish_complete(
        &self,
        workflow: &Workflow,
        task: &Task,
        output: meshflow_model::DataReference,
    ) -> anyhow::Result<()> {
        self.store.complete_task(task.id, output.clone()).await?;
        self.scheduler
            .promote_successors(workflow, &task.node_key, output)
            .await?;
        self.maybe_finalize_workflow(workflow.id).await
    }

    /// `task.attempt` already counts the execution that just failed
    /// (1-based — see [`Task::attempt`]), so comparing it directly
    /// against `max_attempts` caps the total number of executions, not
    /// just the number of retries.
    async fn handle_failure(&self, task: &Task, error: EngineError) -> anyhow::Result<()> {
        let task_error = TaskError {
            kind: error.kind().to_string(),
            message: error.to_string(),
        };
        if error.is_retriable() && self.config.retry_policy.has_attempts_remaining(task.attempt) {
            let delay = self.config.retry_policy.delay_for_attempt(task.attempt + 1);
            debug!(task_id = %task.id, ?delay, "retrying after transport error");
            tokio::time::sleep(delay).await;
            self.store.retry_task(task.id, task_error).await?;
            Ok(())
        } else {
            self.store.fail_task(task.id, task_error).await?;
            self.maybe_finalize_workflow(task.workflow_id).await
        }
    }

    async fn abandon(&self, task: &Task, reason: &str) {
        warn!(task_id = %task.id, reason, "abandoning task, leaving claim to expire");
        let _ = reason;
        let _ = task;
    }

    /// Workflow becomes `complete` iff every task is `complete`, and
    /// `failed` once every remaining non-terminal task is permanently
    /// blocked by a failed ancestor (invariant I5). A `pending` task
    /// downstream of a `failed` one can never be promoted — its
    /// predecessor's output will never arrive — so it is treated as
    /// resolved for finalization purposes even though its own status
    /// stays `pending` forever, matching the diamond-DAG boundary
    /// behavior in the spec: a failed source's descendants stay
    /// `pending`, but the workflow still turns `failed` once every
    /// other task has terminated.
    async fn maybe_finalize_workflow(&self, workflow_id: uuid::Uuid) -> anyhow::Result<()> {
        let tasks = self.store.list_tasks(workflow_id).await?;
        let by_key: HashMap<_, _> = tasks.iter().map(|t| (t.node_key.clone(), t.id)).collect();

        let mut blocked: HashSet<uuid::Uuid> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id)
            .collect();
        loop {
            let mut changed = false;
            for t in &tasks {
                if t.status != TaskStatus::Pending || blocked.contains(&t.id) {
                    continue;
                }
                let upstream_blocked = t
                    .upstream
                    .iter()
                    .any(|key| by_key.get(key).is_some_and(|id| blocked.contains(id)));
                if upstream_blocked {
                    blocked.insert(t.id);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let still_in_play = tasks
            .iter()
            .any(|t| !t.status.is_terminal() && !blocked.contains(&t.id));
        if still_in_play {
            return Ok(());
        }

        let status = if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Complete
        };
        self.store.set_workflow_status(workflow_id, status).await?;
        Ok(())
    }
}
