use thiserror::Error;

use crate::config::QuotaConfig;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("clock moved backwards: now {now_ms} ms, window started at {window_start_ms} ms")]
    ClockRegressed { now_ms: i64, window_start_ms: i64 },
}

/// Outcome of checking the window against its ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Throttled { second_full: bool, minute_full: bool },
    Open { available: u32 },
}

/// Fixed per-second and per-minute admission counters.
#[derive(Debug, Clone)]
pub struct QuotaWindow {
    per_second: u32,
    per_minute: u32,
    second_start: i64,
    second_count: u32,
    minute_start: i64,
    minute_count: u32,
}

impl QuotaWindow {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            per_second: config.per_second.max(1),
            per_minute: config.per_minute.max(1),
            second_start: i64::MIN,
            second_count: 0,
            minute_start: i64::MIN,
            minute_count: 0,
        }
    }

    pub fn per_second(&self) -> u32 {
        self.per_second
    }

    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }

    pub fn second_count(&self) -> u32 {
        self.second_count
    }

    pub fn minute_count(&self) -> u32 {
        self.minute_count
    }

    /// Reset counters whose wall-clock window has rolled over.
    ///
    /// A clock that jumped backwards re-anchors both windows at `now_ms` but
    /// keeps the counts, then reports the regression.
    pub fn refresh(&mut self, now_ms: i64) -> Result<(), QueueError> {
        let second = now_ms.div_euclid(SECOND_MS) * SECOND_MS;
        let minute = now_ms.div_euclid(MINUTE_MS) * MINUTE_MS;

        if self.minute_start != i64::MIN && minute < self.minute_start {
            let window_start_ms = self.minute_start;
            self.second_start = second;
            self.minute_start = minute;
            return Err(QueueError::ClockRegressed {
                now_ms,
                window_start_ms,
            });
        }

        if second > self.second_start {
            self.second_start = second;
            self.second_count = 0;
        }
        if minute > self.minute_start {
            self.minute_start = minute;
            self.minute_count = 0;
        }
        Ok(())
    }

    pub fn check(&self) -> Admission {
        let second_full = self.second_count >= self.per_second;
        let minute_full = self.minute_count >= self.per_minute;

        if second_full || minute_full {
            return Admission::Throttled {
                second_full,
                minute_full,
            };
        }

        Admission::Open {
            available: self.available(),
        }
    }

    pub fn available(&self) -> u32 {
        let second = self.per_second.saturating_sub(self.second_count);
        let minute = self.per_minute.saturating_sub(self.minute_count);
        second.min(minute)
    }

    /// Reserve `n` slots in both windows.
    pub fn record(&mut self, n: u32) {
        self.second_count = self.second_count.saturating_add(n);
        self.minute_count = self.minute_count.saturating_add(n);
    }
}
