//! Backoff between tunnel (re)connections.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Shortest delay between two connections.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Longest delay between two connections.
pub const MAX_BACKOFF: Duration = Duration::from_secs(128);

/// Spaces out connection attempts.
///
/// Attempts arriving faster than the current backoff double it; attempts
/// after a quiet period shrink it again, and a gap longer than
/// [`MAX_BACKOFF`] resets it to [`MIN_BACKOFF`].
#[derive(Debug)]
pub struct ConnectionThrottler {
    last_attempt: Option<Instant>,
    backoff: Duration,
}

impl ConnectionThrottler {
    pub const fn new() -> Self {
        Self {
            last_attempt: None,
            backoff: MIN_BACKOFF,
        }
    }

    pub const fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Register an attempt at `now` and return how long to wait before it.
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        let last = self.last_attempt.replace(now)?;
        let elapsed = now.saturating_duration_since(last);

        if elapsed < self.backoff {
            self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
            return Some(self.backoff.saturating_sub(elapsed));
        }

        self.backoff = if elapsed > MAX_BACKOFF {
            MIN_BACKOFF
        } else {
            (self.backoff / 4).max(MIN_BACKOFF)
        };
        None
    }

    /// Wait as long as the backoff requires before connecting.
    pub async fn throttle(&mut self) {
        if let Some(delay) = self.next_delay(Instant::now()) {
            debug!(delay_ms = delay.as_millis(), "Throttling reconnection");
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for ConnectionThrottler {
    fn default() -> Self {
        Self::new()
    }
}
