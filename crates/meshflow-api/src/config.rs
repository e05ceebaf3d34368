//! Process-wide configuration, read from the environment.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// `memory` selects the in-memory store; anything else is treated
    /// as a `postgres://` connection string.
    pub store_url: String,
    /// Number of in-process worker loops the supervisor starts.
    pub worker_count: usize,
    pub log_filter: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            store_url: "memory".to_string(),
            worker_count: 3,
            log_filter: "info".to_string(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);
        let store_url = std::env::var("STORE_URL").unwrap_or_else(|_| "memory".to_string());
        let worker_count = std::env::var("WORKER_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);
        let log_filter = std::env::var("RUST_LOG")
            .or_else(|_| std::env::var("LOG_LEVEL"))
            .unwrap_or_else(|_| "info".to_string());

        ApiConfig {
            host,
            port,
            store_url,
            worker_count,
            log_filter,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uses_postgres(&self) -> bool {
        self.store_url != "memory"
    }
}

/// Shutdown drain budget, separate from `ApiConfig` since it governs
/// process teardown rather than startup.
pub fn shutdown_grace_period() -> Duration {
    std::env::var("SHUTDOWN_GRACE_SECONDS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(10))
}
