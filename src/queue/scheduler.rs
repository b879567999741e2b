use std::time::Duration;

use tokio::time::Instant;

/// Pending wake-up for the admission driver.
///
/// Holds at most one deadline; scheduling an earlier one replaces it, a later
/// one is ignored. Chains of retries therefore collapse into a single timer.
#[derive(Debug, Default)]
pub struct Scheduler {
    deadline: Option<Instant>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the deadline moved.
    pub fn schedule_at(&mut self, at: Instant) -> bool {
        match self.deadline {
            Some(current) if current <= at => false,
            _ => {
                self.deadline = Some(at);
                true
            }
        }
    }

    pub fn schedule_after(&mut self, now: Instant, delay: Duration) -> bool {
        self.schedule_at(now + delay)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Clear the deadline if it has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if at <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }
}
