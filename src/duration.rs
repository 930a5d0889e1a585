//! Calendar durations for trials and subscription terms.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Calendar unit of a [`LicenseDuration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    /// Days.
    Day,
    /// Weeks.
    Week,
    /// Calendar months.
    Month,
    /// Calendar years.
    Year,
}

/// A calendar duration such as "14 days" or "1 year".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LicenseDuration {
    /// Unit.
    pub unit: DurationUnit,
    /// Number of units.
    pub length: u32,
}

impl LicenseDuration {
    /// Create a duration.
    pub const fn new(unit: DurationUnit, length: u32) -> Self {
        Self { unit, length }
    }

    /// `length` days.
    pub const fn days(length: u32) -> Self {
        Self::new(DurationUnit::Day, length)
    }

    /// The instant this duration after `start`, or `None` on calendar overflow.
    pub fn after(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let length = i64::from(self.length);
        match self.unit {
            DurationUnit::Day => start.checked_add_signed(Duration::try_days(length)?),
            DurationUnit::Week => start.checked_add_signed(Duration::try_weeks(length)?),
            DurationUnit::Month => start.checked_add_months(Months::new(self.length)),
            DurationUnit::Year => {
                start.checked_add_months(Months::new(self.length.checked_mul(12)?))
            }
        }
    }
}

impl fmt::Display for LicenseDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            DurationUnit::Day => "day",
            DurationUnit::Week => "week",
            DurationUnit::Month => "month",
            DurationUnit::Year => "year",
        };
        if self.length == 1 {
            write!(f, "1 {}", unit)
        } else {
            write!(f, "{} {}s", self.length, unit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_days_after() {
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        assert_eq!(
            LicenseDuration::days(14).after(start),
            Some(Utc.with_ymd_and_hms(2025, 1, 29, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_month_clamps_to_end_of_month() {
        let start = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        let end = LicenseDuration::new(DurationUnit::Month, 1).after(start);
        assert_eq!(end, Some(Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_year_after() {
        let start = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        let end = LicenseDuration::new(DurationUnit::Year, 1).after(start);
        assert_eq!(end, Some(Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_display() {
        assert_eq!(LicenseDuration::days(14).to_string(), "14 days");
        assert_eq!(LicenseDuration::new(DurationUnit::Year, 1).to_string(), "1 year");
    }
}
