//! Per-service request spacing for the slot clients.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Spaces requests evenly so a service sees at most `per_minute` of them.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    next: Mutex<Option<Instant>>,
}

impl Throttle {
    #[must_use]
    pub fn per_minute(per_minute: u32) -> Self {
        Self {
            interval: Duration::from_secs(60) / per_minute.max(1),
            next: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for this caller's turn.
    ///
    /// # Errors
    ///
    /// Returns an error if `token` is cancelled first. The turn is still
    /// consumed.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<()> {
        let turn = {
            let mut next = self.next.lock().await;
            let now = Instant::now();
            let turn = next.map_or(now, |at| at.max(now));
            *next = Some(turn + self.interval);
            turn
        };

        tokio::select! {
            biased;
            () = token.cancelled() => anyhow::bail!("cancelled while waiting for rate limit"),
            () = tokio::time::sleep_until(turn) => Ok(()),
        }
    }
}
