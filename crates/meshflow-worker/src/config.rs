//! Worker configuration, read from the environment per the process
//! supervision contract (`WORKER_POLL_INTERVAL`, `WORKER_CLAIM_LEASE`,
//! `WORKER_MAX_ATTEMPTS`) with builder overrides for tests.

use std::time::Duration;
use uuid::Uuid;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// How long to sleep between `claim_one` attempts when the ready
    /// queue is empty.
    pub poll_interval: Duration,
    /// Lease duration granted by `claim_one`; heartbeated at half this
    /// interval while a task is being driven.
    pub claim_lease: Duration,
    pub retry_policy: RetryPolicy,
    /// Per-call HTTP timeout for the service client, distinct from the
    /// per-task remote timeout below.
    pub call_timeout: Duration,
    /// Optional ceiling on how long a task may sit `running_remote`
    /// before it is treated as a non-retriable `RemoteTimeout` failure.
    /// `None` means unbounded, matching the spec's default.
    pub remote_timeout: Option<Duration>,
    /// How often the background sweep calls `recover_expired`.
    pub reclaim_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            poll_interval: Duration::from_secs(1),
            claim_lease: Duration::from_secs(30),
            retry_policy: RetryPolicy::exponential(),
            call_timeout: Duration::from_secs(30),
            remote_timeout: None,
            reclaim_interval: Duration::from_secs(15),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let worker_id =
            std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", Uuid::now_v7()));

        let poll_interval = std::env::var("WORKER_POLL_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(1));

        let claim_lease = std::env::var("WORKER_CLAIM_LEASE")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(30));

        let max_attempts = std::env::var("WORKER_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let remote_timeout = std::env::var("WORKER_REMOTE_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(Duration::from_secs_f64);

        WorkerConfig {
            worker_id,
            poll_interval,
            claim_lease,
            retry_policy: RetryPolicy::exponential().with_max_attempts(max_attempts),
            remote_timeout,
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = Some(timeout);
        self
    }
}
