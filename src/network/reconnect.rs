//! Reconnect backoff policy and timer bookkeeping
//!
//! Delay ladder observed on the hardware: 5 s first, +10 s per disconnect
//! up through 55 s, then +60 s per step with a 600 s ceiling. At most one
//! reconnect timer exists at a time; a successful connect or a terminal
//! close consumes it and resets the delay.

use std::time::Duration;

use tokio::task::JoinHandle;

pub const RECONNECT_BASE_DELAY_MS: u64 = 5_000;
pub const RECONNECT_SMALL_STEP_MS: u64 = 10_000;
pub const RECONNECT_LARGE_STEP_MS: u64 = 60_000;
pub const RECONNECT_SMALL_REGION_MS: u64 = 60_000;
pub const RECONNECT_CEILING_MS: u64 = 600_000;

/// Deterministic backoff ladder
#[derive(Debug, Default)]
pub struct ReconnectPolicy {
    delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the ladder and return the delay to use for the next
    /// reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.delay_ms = match self.delay_ms {
            0 => RECONNECT_BASE_DELAY_MS,
            d if d + RECONNECT_SMALL_STEP_MS < RECONNECT_SMALL_REGION_MS => {
                d + RECONNECT_SMALL_STEP_MS
            }
            d => (d + RECONNECT_LARGE_STEP_MS).min(RECONNECT_CEILING_MS),
        };
        Duration::from_millis(self.delay_ms)
    }

    /// Reset after a successful connect or a terminal close.
    pub fn reset(&mut self) {
        self.delay_ms = 0;
    }

    pub fn current_delay_ms(&self) -> u64 {
        self.delay_ms
    }
}

/// Policy plus the single outstanding timer task.
#[derive(Default)]
pub struct ReconnectState {
    pub policy: ReconnectPolicy,
    timer: Option<JoinHandle<()>>,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a reconnect timer is currently scheduled.
    pub fn scheduled(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Store the timer task. Callers must check `scheduled()` first to
    /// keep the one-timer invariant.
    pub fn set_timer(&mut self, handle: JoinHandle<()>) {
        self.timer = Some(handle);
    }

    /// Mark the timer as consumed (called by the timer task itself when it
    /// fires).
    pub fn consume_timer(&mut self) {
        self.timer = None;
    }

    /// Abort a scheduled timer without touching the delay ladder. Used
    /// when a connect attempt starts; only success resets the delay.
    pub fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Cancel any scheduled timer and reset the delay.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.policy.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_ladder_first_ten() {
        let mut policy = ReconnectPolicy::new();
        let expected = [
            5_000, 15_000, 25_000, 35_000, 45_000, 55_000, 115_000, 175_000, 235_000, 295_000,
        ];
        for (n, want) in expected.iter().enumerate() {
            let got = policy.next_delay().as_millis() as u64;
            assert_eq!(got, *want, "Delay mismatch at attempt {}", n + 1);
        }
    }

    #[test]
    fn test_delay_soft_ceiling() {
        let mut policy = ReconnectPolicy::new();
        for _ in 0..64 {
            policy.next_delay();
        }
        assert_eq!(policy.current_delay_ms(), RECONNECT_CEILING_MS);
        assert_eq!(
            policy.next_delay(),
            Duration::from_millis(RECONNECT_CEILING_MS)
        );
    }

    #[test]
    fn test_reset_restarts_ladder() {
        let mut policy = ReconnectPolicy::new();
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.current_delay_ms(), 0);
        assert_eq!(policy.next_delay(), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_cancel_aborts_timer() {
        let mut state = ReconnectState::new();
        assert!(!state.scheduled());

        state.set_timer(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));
        assert!(state.scheduled());

        state.cancel();
        assert!(!state.scheduled());
        assert_eq!(state.policy.current_delay_ms(), 0);
    }
}
