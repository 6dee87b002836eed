//! Tracing and logging setup shared by both services.

/// Log filter and output format.
pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat, UnknownLogFormat};

/// Initialize process-wide logging.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(config: &LogConfig) {
    tracing::init(config);
}
