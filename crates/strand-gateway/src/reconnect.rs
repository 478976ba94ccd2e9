use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Exponential reconnect backoff: 2s, 4s, 8s, ... capped at a ceiling.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    current: Duration,
    ceiling: Duration,
}

impl ReconnectBackoff {
    pub const INITIAL: Duration = Duration::from_secs(2);

    pub fn new(ceiling: Duration) -> Self {
        Self::with_initial(Self::INITIAL, ceiling)
    }

    pub fn with_initial(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial,
            current: initial,
            ceiling,
        }
    }

    /// Delay before the next attempt; grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.ceiling);
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Called once a session is confirmed.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Delay before the `attempt`-th consecutive retry (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.ceiling)
    }
}

/// Ordered queue of identify attempts shared by every shard of one client.
///
/// Only one holder runs at a time; waiters are served in arrival order and
/// each permit starts at least `spacing` after the previous one was released.
#[derive(Debug, Clone)]
pub struct ConnectQueue {
    last_release: Arc<Mutex<Option<Instant>>>,
    spacing: Duration,
}

pub struct ConnectPermit {
    guard: OwnedMutexGuard<Option<Instant>>,
}

impl ConnectQueue {
    pub fn new(spacing: Duration) -> Self {
        Self {
            last_release: Arc::new(Mutex::new(None)),
            spacing,
        }
    }

    pub async fn acquire(&self) -> ConnectPermit {
        let guard = self.last_release.clone().lock_owned().await;
        if let Some(released) = *guard {
            tokio::time::sleep_until(released + self.spacing).await;
        }
        ConnectPermit { guard }
    }
}

impl Drop for ConnectPermit {
    fn drop(&mut self) {
        *self.guard = Some(Instant::now());
    }
}
