pub mod config;
pub mod coordinator;
pub mod routes;
pub mod telemetry;

pub use config::ApiConfig;
pub use coordinator::Coordinator;
