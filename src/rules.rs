use chrono::Timelike;

use crate::engine::EngineError;
use crate::limits::{DEFAULT_SAME_DAY_LEAD_HOURS, DEFAULT_TIME_UNIT_MINUTES};
use crate::model::DateTime;

/// Time-unit and lead-time policy for proposed reservation windows.
///
/// All checks are pure: callers pass `now` in, and a `false` becomes a domain
/// error at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRules {
    unit_minute: u32,
    same_day_lead_hours: u32,
}

impl Default for TimeRules {
    fn default() -> Self {
        Self {
            unit_minute: DEFAULT_TIME_UNIT_MINUTES,
            same_day_lead_hours: DEFAULT_SAME_DAY_LEAD_HOURS,
        }
    }
}

impl TimeRules {
    pub fn new(unit_minute: u32, same_day_lead_hours: u32) -> Result<Self, EngineError> {
        if unit_minute == 0 || unit_minute >= 60 {
            return Err(EngineError::LimitExceeded(
                "time unit must be between 1 and 59 minutes",
            ));
        }
        if same_day_lead_hours >= 24 {
            return Err(EngineError::LimitExceeded(
                "same-day lead time must be under 24 hours",
            ));
        }
        Ok(Self {
            unit_minute,
            same_day_lead_hours,
        })
    }

    pub fn unit_minute(&self) -> u32 {
        self.unit_minute
    }

    pub fn same_day_lead_hours(&self) -> u32 {
        self.same_day_lead_hours
    }

    /// Both ends sit on minute 0 or on the unit minute.
    pub fn is_aligned_to_time_unit(&self, start: DateTime, end: DateTime) -> bool {
        let on_unit = |m: u32| m == 0 || m == self.unit_minute;
        on_unit(start.minute()) && on_unit(end.minute())
    }

    pub fn is_same_day(start: DateTime, now: DateTime) -> bool {
        start.date() == now.date()
    }

    /// Lead-time rule for a same-day start, bucketed on `now`'s minute.
    ///
    /// The four buckets are kept exactly as the booking policy states them,
    /// including the asymmetric boundaries; see the sweep tests below.
    pub fn is_lead_time_satisfied(&self, start: DateTime, now: DateTime) -> bool {
        let unit = self.unit_minute;
        let minute = now.minute();
        let earliest = now.hour() + self.same_day_lead_hours;
        let start_hour = start.hour();

        if minute == 0 {
            start_hour >= earliest
        } else if minute == unit {
            if start_hour == earliest {
                start.minute() == unit
            } else {
                start_hour > earliest
            }
        } else if minute > unit {
            start_hour >= earliest + 1
        } else if start_hour == earliest {
            // 0 < minute < unit
            start.minute() == unit
        } else {
            start_hour > earliest
        }
    }

    /// Full admission check for a new window.
    pub fn validate_window(
        &self,
        start: DateTime,
        end: DateTime,
        now: DateTime,
    ) -> Result<(), EngineError> {
        if start >= end {
            return Err(EngineError::InvalidWindow { start, end });
        }
        if !self.is_aligned_to_time_unit(start, end) {
            return Err(EngineError::InvalidTimeUnit { start, end });
        }
        if start <= now {
            return Err(EngineError::InvalidLeadTime { start });
        }
        if Self::is_same_day(start, now) && !self.is_lead_time_satisfied(start, now) {
            return Err(EngineError::InvalidLeadTime { start });
        }
        Ok(())
    }
}
