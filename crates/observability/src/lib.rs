//! Logging setup shared by tradepost binaries.

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use tracing::{LogFormat, init, init_with};
