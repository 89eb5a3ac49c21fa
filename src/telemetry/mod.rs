//! Telemetry module for MUX-CORE.
//!
//! Structured logging setup, per-step generation spans and pool metrics.
//! The crate records metrics through the `metrics` facade only; installing
//! an exporter is left to the embedding process.

mod logging;
mod metrics;
mod spans;

pub use self::logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{record_bind, record_pool, record_tokens};
pub use self::spans::{GenerateSpan, SpanExt};
