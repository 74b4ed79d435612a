//! Eventual consistency helpers.
//!
//! Broker round trips run on background lanes, so a subscription or an
//! unsubscription becomes visible some time after the request that caused it
//! was acknowledged. These helpers poll with backoff instead of sleeping a
//! fixed amount.

use std::future::Future;
use std::time::{Duration, Instant};

/// Default deadline for in-process convergence.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_DELAY: Duration = Duration::from_millis(2);
const MAX_DELAY: Duration = Duration::from_millis(100);

/// Wait until `condition` holds, polling with exponential backoff.
///
/// Returns an error describing the timeout if it never holds.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let mut delay = INITIAL_DELAY;

    loop {
        if condition().await {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(format!("Condition not met within {timeout:?}"));
        }

        tokio::time::sleep(delay.min(timeout.saturating_sub(elapsed))).await;
        delay = (delay * 2).min(MAX_DELAY);
    }
}

/// Like [`wait_until`] with a synchronous condition and the default timeout.
///
/// # Panics
///
/// Panics with `what` if the condition does not hold in time.
pub async fn assert_eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let result = wait_until(DEFAULT_TIMEOUT, || {
        let met = condition();
        async move { met }
    })
    .await;
    assert!(result.is_ok(), "{what}: {}", result.unwrap_err());
}
