// ingestor: Receives sensor telemetry over TCP and persists it to the
// shared table read by the dashboard.
//
// Exposes modules for integration testing.

pub mod acceptor;
pub mod buffer;
pub mod config;
pub mod framing;
pub mod handler;
pub mod retention;
pub mod scheduler;
pub mod service;

pub use buffer::IngestBuffer;
pub use config::ServiceConfig;
pub use service::{IngestService, ServiceError, ShutdownReport};
