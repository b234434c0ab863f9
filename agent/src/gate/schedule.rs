use chrono::{DateTime, TimeZone, Timelike};

/// Hour-of-day window during which the agent captures and analyzes.
///
/// `start` is inclusive and `end` exclusive. A window with `start >= end`
/// wraps past midnight, so `start == end` is active around the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHours {
    start: u32,
    end: u32,
}

impl ActiveHours {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn always() -> Self {
        Self::new(0, 0)
    }

    pub fn is_active(&self, hour: u32) -> bool {
        if self.start < self.end {
            self.start <= hour && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }

    /// Whether the wall-clock time `now` falls inside the window.
    pub fn contains<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.is_active(now.hour())
    }
}
