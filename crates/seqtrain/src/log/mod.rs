//! Metric sinks.
//!
//! Provides:
//! - `MetricLogger` trait for composable backends
//! - `ConsoleLogger` for logging through tracing
//! - `MemoryLogger` for recording metrics in tests and tools
//! - `CompositeLogger` for multi-backend logging

mod console;
mod logger;

pub use console::ConsoleLogger;
pub use logger::{CompositeLogger, MemoryLogger, MetricLogger, NoOpLogger};
