//! Bounded polling for convergence
//!
//! The orchestrator waits on eventually-consistent state (a provider id
//! appearing on a Machine, a Node registering, control-plane pods going
//! ready) by polling at a fixed interval under an overall deadline. Probes
//! treat transient failures as "not done yet"; only a probe that returns an
//! error aborts the wait early.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::{Error, Result};

/// Poll `probe` every `interval` until it yields a value or `deadline` runs
/// out.
///
/// The probe is invoked immediately on entry. Returning `Ok(None)` means the
/// condition does not hold yet (transient errors belong here, logged by the
/// caller); `Ok(Some(v))` completes the wait; `Err` aborts it. Exhausting the
/// deadline produces [`Error::Timeout`] naming `description`.
pub async fn poll_until<T, F, Fut>(
    description: &str,
    interval: Duration,
    deadline: Duration,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();

    loop {
        if let Some(value) = probe().await? {
            return Ok(value);
        }

        if start.elapsed() >= deadline {
            return Err(Error::timeout(description));
        }

        debug!(wait = %description, interval_secs = interval.as_secs(), "Condition not met, polling again");
        tokio::time::sleep(interval).await;
    }
}
