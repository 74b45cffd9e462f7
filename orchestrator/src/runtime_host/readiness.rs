use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tracing::debug;

use crate::error::HostError;

/// Polls `check` until it succeeds or `timeout` elapses.
///
/// `still_running` is consulted between attempts; an error from it (the process
/// exited, the container stopped) ends the wait immediately as a start
/// failure instead of waiting out the deadline.
pub(crate) async fn wait_until_ready<P, PFut, A, AFut>(
    timeout: Duration,
    poll_interval: Duration,
    description: &str,
    mut check: P,
    mut still_running: A,
) -> Result<(), HostError>
where
    P: FnMut() -> PFut,
    PFut: Future<Output = anyhow::Result<()>>,
    A: FnMut() -> AFut,
    AFut: Future<Output = anyhow::Result<()>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HostError::StartTimeout(timeout));
        }
        match tokio::time::timeout(remaining, check()).await {
            Ok(Ok(())) => {
                debug!(description, attempts, "runtime ready");
                return Ok(());
            }
            Ok(Err(err)) => {
                debug!(description, attempts, error = %err, "runtime not ready yet");
            }
            Err(_) => return Err(HostError::StartTimeout(timeout)),
        }

        still_running().await.map_err(HostError::Start)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(poll_interval.min(remaining)).await;
    }
}
