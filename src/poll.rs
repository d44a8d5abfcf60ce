//! Bounded polling
//!
//! Shared by the readiness verifier and the backend adapters, which both wait
//! for something remote to converge without ever waiting forever.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::Result;

/// Default interval between readiness checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Poll until `poll_fn` yields a value or `timeout` elapses.
///
/// `poll_fn` returns `Ok(Some(value))` when done, `Ok(None)` to keep waiting,
/// or `Err` to abort immediately. Transient failures are the caller's to log
/// and turn into `Ok(None)`.
///
/// Returns `Ok(None)` on timeout. The deadline also bounds each check: one
/// that is still pending when `timeout` elapses is dropped. The first check
/// is always polled, even with a zero timeout.
pub async fn poll_until<T, F, Fut>(
    description: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut poll_fn: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match tokio::time::timeout_at(deadline, poll_fn()).await {
            Ok(Ok(Some(value))) => return Ok(Some(value)),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                trace!(attempt, "{} check still pending at deadline", description);
                return Ok(None);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        trace!(attempt, "{} not ready yet", description);
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
