//! Wall clock used by the idle subsystem.

use tokio::time::Instant;

/// Source of Unix-millisecond timestamps.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock anchored once and advanced by the tokio timer.
///
/// Timers and timestamps come from the same source, so a deadline computed
/// from `now_ms()` is reached exactly when a `tokio::time::sleep` for the
/// difference completes, including under `tokio::time::pause`.
#[derive(Debug, Clone)]
pub struct TokioClock {
    base_ms: i64,
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(vmlab_protocol::now_ms())
    }

    pub fn starting_at(base_ms: i64) -> Self {
        Self {
            base_ms,
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.base_ms.saturating_add(elapsed)
    }
}
