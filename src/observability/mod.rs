/// Observability module for tracing and structured logging
pub mod tracing_setup;
