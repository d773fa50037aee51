//! Process-level helpers shared by the binary and the storage layer.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod retry;
