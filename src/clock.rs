// 🕰️ Clock - injectable "now"
// Expiry checks and two-digit year expansion depend on the current month,
// so both take a Clock instead of reading the system time directly.

use chrono::{Datelike, Local};

/// Year and month as seen by validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        YearMonth { year, month }
    }

    /// First year of the century this year belongs to (2026 -> 2000)
    pub fn century_base(&self) -> i32 {
        self.year - self.year.rem_euclid(100)
    }
}

pub trait Clock: Send + Sync {
    fn current(&self) -> YearMonth;
}

/// Reads the local wall clock on every call
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current(&self) -> YearMonth {
        let today = Local::now().date_naive();
        YearMonth::new(today.year(), today.month())
    }
}

/// Pinned to a single month, for tests and replays
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub YearMonth);

impl FixedClock {
    pub fn at(year: i32, month: u32) -> Self {
        FixedClock(YearMonth::new(year, month))
    }
}

impl Clock for FixedClock {
    fn current(&self) -> YearMonth {
        self.0
    }
}
