//! Wall-clock source for token expiry and message timestamps.

use std::sync::Arc;

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Epoch time advanced by the tokio clock, so paused-time tests see token
/// expiry and timers move together.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    epoch_ms: i64,
    origin: tokio::time::Instant,
}

impl RuntimeClock {
    pub fn starting_at(epoch_ms: i64) -> Self {
        Self {
            epoch_ms,
            origin: tokio::time::Instant::now(),
        }
    }

    pub fn from_system() -> Self {
        Self::starting_at(SystemClock.now_ms())
    }
}

impl Clock for RuntimeClock {
    fn now_ms(&self) -> i64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as i64
    }
}
