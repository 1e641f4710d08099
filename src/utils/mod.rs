//! Utility modules.

pub mod logging;
pub mod retry;

pub use logging::{LogFormat, init_tracing};
pub use retry::{RetryConfig, Retryable, with_retry};
