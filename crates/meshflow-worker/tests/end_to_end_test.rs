//! End-to-end scenarios driving claim -> execute -> poll -> promote
//! against an in-process stub service instead of a real container.
//!
//! Each stub binds an ephemeral port and answers the three control
//! calls from canned, per-call responses so a test can script a
//! service's exact behavior (a transient 503 then success, a
//! long-running job with several progress polls, and so on).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use uuid::Uuid;

use meshflow_model::{
    BlueprintNode, Connection, DataReference, DockerInfo, DockerInfoEntry, OperationEntry,
    OperationSignature, Task, TaskStatus, Workflow, WorkflowStatus,
};
use meshflow_store::{InMemoryStore, Store};
use meshflow_worker::{Scheduler, WorkerConfig, WorkerLoop};

/// A scripted sequence of `(status, body)` replies for one control
/// endpoint. The last entry repeats once the sequence is exhausted.
struct Script {
    replies: Vec<(StatusCode, Value)>,
    calls: AtomicUsize,
}

impl Script {
    fn new(replies: Vec<(StatusCode, Value)>) -> Self {
        Script {
            replies,
            calls: AtomicUsize::new(0),
        }
    }

    fn once(status: StatusCode, body: Value) -> Self {
        Script::new(vec![(status, body)])
    }

    fn next(&self) -> (StatusCode, Value) {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        let idx = i.min(self.replies.len() - 1);
        self.replies[idx].clone()
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct StubService {
    execute: Script,
    status: Script,
    output: Script,
}

async fn execute_handler(
    State(svc): State<Arc<StubService>>,
    Json(_req): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let (status, body) = svc.execute.next();
    (status, Json(body))
}

async fn status_handler(
    State(svc): State<Arc<StubService>>,
    Path(_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let (status, body) = svc.status.next();
    (status, Json(body))
}

async fn output_handler(
    State(svc): State<Arc<StubService>>,
    Path(_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let (status, body) = svc.output.next();
    (status, Json(body))
}

/// Spawns one stub service and returns its bound address. The caller
/// keeps its own `Arc<StubService>` clone to inspect call counts after
/// the test has finished driving tasks against it.
async fn spawn_stub(svc: Arc<StubService>) -> SocketAddr {
    let router = Router::new()
        .route("/control/execute", post(execute_handler))
        .route("/control/status/:id", get(status_handler))
        .route("/control/output/:id", get(output_handler))
        .with_state(svc);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn node(container: &str, op: &str, connects: &[(&str, &str)]) -> BlueprintNode {
    BlueprintNode {
        container_name: container.to_string(),
        operation_signature_list: vec![OperationEntry {
            operation_signature: OperationSignature {
                operation_name: op.to_string(),
                input_message_name: String::new(),
                output_message_name: String::new(),
            },
            connected_to: connects
                .iter()
                .map(|(c, o)| Connection {
                    container_name: c.to_string(),
                    operation_signature: OperationSignature {
                        operation_name: o.to_string(),
                        input_message_name: String::new(),
                        output_message_name: String::new(),
                    },
                })
                .collect(),
        }],
    }
}

fn dockerinfo(entries: &[(&str, SocketAddr)]) -> DockerInfo {
    DockerInfo {
        docker_info_list: entries
            .iter()
            .map(|(name, addr)| DockerInfoEntry {
                container_name: name.to_string(),
                ip_address: addr.ip().to_string(),
                port: addr.port(),
            })
            .collect(),
    }
}

fn complete_body(output: &DataReference) -> Value {
    json!({"status": "complete", "output": output})
}

async fn wait_for_workflow_terminal(store: &dyn Store, workflow_id: Uuid) -> Workflow {
    for _ in 0..500 {
        let wf = store.get_workflow(workflow_id).await.unwrap();
        if matches!(
            wf.status,
            WorkflowStatus::Complete | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        ) {
            return wf;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("workflow {workflow_id} did not reach a terminal status in time");
}

fn task_by_container<'a>(tasks: &'a [Task], container: &str) -> &'a Task {
    tasks
        .iter()
        .find(|t| t.node_key.container_name == container)
        .unwrap_or_else(|| panic!("no task for container {container}"))
}

async fn run_worker(store: Arc<dyn Store>, config: WorkerConfig) -> Arc<WorkerLoop> {
    let client = meshflow_client::ServiceClient::new(Duration::from_secs(5));
    let worker = Arc::new(WorkerLoop::new(config, store, client));
    let handle = worker.clone();
    tokio::spawn(async move {
        let _ = handle.run().await;
    });
    worker
}

/// Scenario 1: linear pipeline A -> B -> C, all complete.
#[tokio::test]
async fn linear_pipeline_all_complete() {
    let a_out = DataReference::inline(b"a-out", "json");
    let b_out = DataReference::inline(b"b-out", "json");
    let c_out = DataReference::inline(b"c-out", "json");

    let a_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&a_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(a_out)),
    }))
    .await;
    let b_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&b_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(b_out)),
    }))
    .await;
    let c_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&c_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(c_out)),
    }))
    .await;

    let blueprint = meshflow_model::Blueprint {
        name: "linear".into(),
        pipeline_id: "linear".into(),
        version: "1".into(),
        nodes: vec![
            node("a", "run", &[("b", "run")]),
            node("b", "run", &[("c", "run")]),
            node("c", "run", &[]),
        ],
    };
    let dockerinfo = dockerinfo(&[("a", a_addr), ("b", b_addr), ("c", c_addr)]);

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let workflow = Workflow::new(Uuid::now_v7(), blueprint, dockerinfo, vec![]);
    store.create_workflow(workflow.clone()).await.unwrap();
    Scheduler::new(store.clone()).seed(&workflow).await.unwrap();

    let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(20));
    let worker = run_worker(store.clone(), config).await;

    let terminal = wait_for_workflow_terminal(store.as_ref(), workflow.id).await;
    worker.shutdown();

    assert_eq!(terminal.status, WorkflowStatus::Complete);
    let tasks = store.list_tasks(workflow.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    let task_b = task_by_container(&tasks, "b");
    let task_c = task_by_container(&tasks, "c");
    assert_eq!(task_b.inputs, vec![a_out]);
    assert_eq!(task_c.inputs, vec![b_out]);
}

/// Scenario 2: a single transient 503 followed by success; the task
/// still completes and the service sees exactly two execute calls.
#[tokio::test]
async fn single_transport_retry_then_complete() {
    let a_out = DataReference::inline(b"a-out", "json");
    let b_out = DataReference {
        protocol: meshflow_model::DataProtocol::Inline,
        uri: "eA==".to_string(),
        format: "json".to_string(),
    };

    let a_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&a_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(a_out)),
    }))
    .await;

    let b_stub = Arc::new(StubService {
        execute: Script::new(vec![
            (StatusCode::SERVICE_UNAVAILABLE, json!({})),
            (StatusCode::OK, complete_body(&b_out)),
        ]),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(b_out)),
    });
    let b_addr = spawn_stub(b_stub.clone()).await;

    let blueprint = meshflow_model::Blueprint {
        name: "retry".into(),
        pipeline_id: "retry".into(),
        version: "1".into(),
        nodes: vec![node("a", "run", &[("b", "run")]), node("b", "run", &[])],
    };
    let dockerinfo = dockerinfo(&[("a", a_addr), ("b", b_addr)]);

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let workflow = Workflow::new(Uuid::now_v7(), blueprint, dockerinfo, vec![]);
    store.create_workflow(workflow.clone()).await.unwrap();
    Scheduler::new(store.clone()).seed(&workflow).await.unwrap();

    let config = WorkerConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_retry_policy(
            meshflow_worker::RetryPolicy::exponential()
                .with_initial_interval(Duration::from_millis(10))
                .with_max_interval(Duration::from_millis(50))
                .with_jitter(0.0),
        );
    let worker = run_worker(store.clone(), config).await;

    let terminal = wait_for_workflow_terminal(store.as_ref(), workflow.id).await;
    worker.shutdown();

    assert_eq!(terminal.status, WorkflowStatus::Complete);
    assert_eq!(b_stub.execute.call_count(), 2);
    let tasks = store.list_tasks(workflow.id).await.unwrap();
    let task_b = task_by_container(&tasks, "b");
    assert_eq!(task_b.status, TaskStatus::Complete);
    assert_eq!(task_b.attempt, 2);
}

/// Scenario 5: a worker claims B and crashes before completing it; the
/// lease expires, the reclaim sweep puts B back on the ready queue, and
/// a second worker claims and completes it. The re-execution after
/// lease recovery counts as a new attempt.
///
/// A's completion and w1's crash are driven directly against the store
/// rather than a real worker loop, so the test isn't racing a real HTTP
/// round trip against a millisecond-scale claim lease.
#[tokio::test]
async fn lease_recovery_bumps_attempt_and_completes() {
    let a_out = DataReference::inline(b"a-out", "json");
    let b_out = DataReference::inline(b"b-out", "json");

    let b_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&b_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(b_out)),
    }))
    .await;

    let blueprint = meshflow_model::Blueprint {
        name: "lease-recovery".into(),
        pipeline_id: "lease-recovery".into(),
        version: "1".into(),
        nodes: vec![node("a", "run", &[("b", "run")]), node("b", "run", &[])],
    };
    // A's endpoint is never dialed in this test; any address will do.
    let dockerinfo = dockerinfo(&[("a", b_addr), ("b", b_addr)]);

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let workflow = Workflow::new(Uuid::now_v7(), blueprint, dockerinfo, vec![]);
    store.create_workflow(workflow.clone()).await.unwrap();
    let scheduler = Scheduler::new(store.clone());
    scheduler.seed(&workflow).await.unwrap();

    let task_a = store.claim_one("seed-worker", Duration::from_secs(30)).await.unwrap().unwrap();
    store.complete_task(task_a.id, a_out.clone()).await.unwrap();
    scheduler
        .promote_successors(&workflow, &task_a.node_key, a_out)
        .await
        .unwrap();

    let task_b = store
        .claim_one("w1", Duration::from_millis(1))
        .await
        .unwrap()
        .expect("B should be ready once A has completed");
    assert_eq!(task_b.attempt, 1);

    // w1 never finishes; let its lease lapse and sweep it back to ready.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let reclaimed = store.recover_expired().await.unwrap();
    assert_eq!(reclaimed, vec![task_b.id]);

    let w2 = run_worker(
        store.clone(),
        WorkerConfig::default()
            .with_worker_id("w2")
            .with_poll_interval(Duration::from_millis(20)),
    )
    .await;

    let terminal = wait_for_workflow_terminal(store.as_ref(), workflow.id).await;
    w2.shutdown();

    assert_eq!(terminal.status, WorkflowStatus::Complete);
    let tasks = store.list_tasks(workflow.id).await.unwrap();
    let task_b = task_by_container(&tasks, "b");
    assert_eq!(task_b.status, TaskStatus::Complete);
    assert_eq!(task_b.attempt, 2);
}

/// Scenario 3: a non-retriable service failure leaves the failed
/// task's own descendants permanently `pending`, but the workflow
/// still resolves to `failed` once nothing else can make progress.
#[tokio::test]
async fn non_retriable_failure_blocks_descendants_and_fails_workflow() {
    let a_out = DataReference::inline(b"a-out", "json");

    let a_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&a_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(a_out)),
    }))
    .await;
    let b_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(
            StatusCode::OK,
            json!({"status": "failed", "error": {"kind": "ServiceError", "message": "bad input"}}),
        ),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!({})),
    }))
    .await;
    // C never receives a call since B never completes; stub is unused
    // but still needs an endpoint for the blueprint to validate.
    let c_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, json!({})),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!({})),
    }))
    .await;

    let blueprint = meshflow_model::Blueprint {
        name: "fail".into(),
        pipeline_id: "fail".into(),
        version: "1".into(),
        nodes: vec![
            node("a", "run", &[("b", "run")]),
            node("b", "run", &[("c", "run")]),
            node("c", "run", &[]),
        ],
    };
    let dockerinfo = dockerinfo(&[("a", a_addr), ("b", b_addr), ("c", c_addr)]);

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let workflow = Workflow::new(Uuid::now_v7(), blueprint, dockerinfo, vec![]);
    store.create_workflow(workflow.clone()).await.unwrap();
    Scheduler::new(store.clone()).seed(&workflow).await.unwrap();

    let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(20));
    let worker = run_worker(store.clone(), config).await;

    let terminal = wait_for_workflow_terminal(store.as_ref(), workflow.id).await;
    worker.shutdown();

    assert_eq!(terminal.status, WorkflowStatus::Failed);
    let tasks = store.list_tasks(workflow.id).await.unwrap();
    let task_a = task_by_container(&tasks, "a");
    let task_b = task_by_container(&tasks, "b");
    let task_c = task_by_container(&tasks, "c");
    assert_eq!(task_a.status, TaskStatus::Complete);
    assert_eq!(task_b.status, TaskStatus::Failed);
    assert_eq!(task_b.last_error.as_ref().unwrap().kind, "ServiceError");
    assert!(task_b.last_error.as_ref().unwrap().message.contains("bad input"));
    assert_eq!(task_c.status, TaskStatus::Pending);
}

/// Scenario 4: a long-running job that reports `running` on the
/// initial execute call, is polled three times, then completes.
#[tokio::test]
async fn long_running_task_polls_to_completion() {
    let b_out = DataReference {
        protocol: meshflow_model::DataProtocol::Http,
        uri: "http://b/data/rt-1".to_string(),
        format: "csv".to_string(),
    };

    let a_out = DataReference::inline(b"a-out", "json");
    let a_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&a_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(a_out)),
    }))
    .await;

    let b_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, json!({"status": "running", "task_id": "rt-1"})),
        status: Script::new(vec![
            (StatusCode::OK, json!({"status": "running", "progress": 33.0})),
            (StatusCode::OK, json!({"status": "running", "progress": 66.0})),
            (StatusCode::OK, json!({"status": "running", "progress": 99.0})),
            (StatusCode::OK, json!({"status": "complete"})),
        ]),
        output: Script::once(StatusCode::OK, json!(b_out)),
    }))
    .await;

    let blueprint = meshflow_model::Blueprint {
        name: "long-running".into(),
        pipeline_id: "long-running".into(),
        version: "1".into(),
        nodes: vec![node("a", "run", &[("b", "run")]), node("b", "run", &[])],
    };
    let dockerinfo = dockerinfo(&[("a", a_addr), ("b", b_addr)]);

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let workflow = Workflow::new(Uuid::now_v7(), blueprint, dockerinfo, vec![]);
    store.create_workflow(workflow.clone()).await.unwrap();
    Scheduler::new(store.clone()).seed(&workflow).await.unwrap();

    let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(20));
    let worker = run_worker(store.clone(), config).await;

    let terminal = wait_for_workflow_terminal(store.as_ref(), workflow.id).await;
    worker.shutdown();

    assert_eq!(terminal.status, WorkflowStatus::Complete);
    let tasks = store.list_tasks(workflow.id).await.unwrap();
    let task_b = task_by_container(&tasks, "b");
    assert_eq!(task_b.output, Some(b_out));
}

/// Scenario 6: diamond DAG `A -> {B, C} -> D`. D must not be claimed
/// until both B and C are complete, and its inputs must come out in
/// lexicographic node-key order (B before C) regardless of which one
/// finished first.
#[tokio::test]
async fn diamond_dag_orders_inputs_by_node_key() {
    let a_out = DataReference::inline(b"a-out", "json");
    let b_out = DataReference::inline(b"b-out", "json");
    let c_out = DataReference::inline(b"c-out", "json");
    let d_out = DataReference::inline(b"d-out", "json");

    let a_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&a_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(a_out)),
    }))
    .await;
    let b_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&b_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(b_out)),
    }))
    .await;
    let c_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&c_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(c_out)),
    }))
    .await;
    let d_addr = spawn_stub(Arc::new(StubService {
        execute: Script::once(StatusCode::OK, complete_body(&d_out)),
        status: Script::once(StatusCode::OK, json!({"status": "complete"})),
        output: Script::once(StatusCode::OK, json!(d_out)),
    }))
    .await;

    let blueprint = meshflow_model::Blueprint {
        name: "diamond".into(),
        pipeline_id: "diamond".into(),
        version: "1".into(),
        nodes: vec![
            node("a", "run", &[("b", "run"), ("c", "run")]),
            node("b", "run", &[("d", "run")]),
            node("c", "run", &[("d", "run")]),
            node("d", "run", &[]),
        ],
    };
    let dockerinfo = dockerinfo(&[("a", a_addr), ("b", b_addr), ("c", c_addr), ("d", d_addr)]);

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let workflow = Workflow::new(Uuid::now_v7(), blueprint, dockerinfo, vec![]);
    store.create_workflow(workflow.clone()).await.unwrap();
    Scheduler::new(store.clone()).seed(&workflow).await.unwrap();

    // Several competing workers, matching the reference deployment's
    // multiple replicas, to exercise cross-worker promotion.
    let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(20));
    let workers = vec![
        run_worker(store.clone(), config.clone().with_worker_id("w1")).await,
        run_worker(store.clone(), config.clone().with_worker_id("w2")).await,
        run_worker(store.clone(), config.with_worker_id("w3")).await,
    ];

    let terminal = wait_for_workflow_terminal(store.as_ref(), workflow.id).await;
    for w in &workers {
        w.shutdown();
    }

    assert_eq!(terminal.status, WorkflowStatus::Complete);
    let tasks = store.list_tasks(workflow.id).await.unwrap();
    let task_d = task_by_container(&tasks, "d");
    assert_eq!(task_d.inputs, vec![b_out, c_out]);
}
