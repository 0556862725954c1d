//! Reconnect delay schedule.

use std::time::Duration;

/// Fixed reconnect schedule. Attempt `n` waits `steps[n]`; once the schedule
/// is exhausted the last entry repeats indefinitely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn new(steps: Vec<Duration>) -> Self {
        Self { steps }
    }

    pub fn from_millis(steps: &[u64]) -> Self {
        Self::new(steps.iter().copied().map(Duration::from_millis).collect())
    }

    /// Delay before the given zero-based attempt. An empty schedule retries
    /// immediately.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.steps
            .get(attempt as usize)
            .or(self.steps.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from_millis(&[0, 2_000, 10_000, 30_000])
    }
}
