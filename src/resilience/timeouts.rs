//! Timeout enforcement.
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities, so deadlines follow paused test time
//! - Timeout errors are distinct from other errors
//! - The timed-out future is dropped, which cancels it

use std::future::Future;
use std::time::Duration;

use crate::error::LinkError;

/// Run `fut` with a deadline, naming `operation` in the error.
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T, LinkError>
where
    F: Future<Output = Result<T, LinkError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LinkError::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}
