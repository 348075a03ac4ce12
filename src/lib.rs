// congraph - convergent replicated JSON-LD graph engine

// Core types and primitives
pub mod core;

// Storage, journal, dataset and the clone engine
pub mod infrastructure;

// Pub/sub fabric abstraction and bindings
pub mod remotes;

// Declarative data constraints
pub mod constraints;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use config::{CloneConfig, ContextConfig, LogLevel};
pub use crate::core::{CausalOperation, Gwc, ProcessPath, Tid, TreeClock};
pub use error::{EngineError, EngineResult};
pub use infrastructure::{CloneEngine, CloneStatus, DatasetUpdate, EngineState, Patch};
pub use remotes::{MemoryTransport, PubsubRemotes, Remotes};

use tracing_subscriber::EnvFilter;

/// Initialise tracing from the configured log level, once per process.
/// Subsequent calls are no-ops.
pub fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
