//! Calendar period units and their truncation rules.

use std::fmt;

use chrono::{Datelike, Days, Months, NaiveDateTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

/// Calendar unit a periodic schedule repeats on.
///
/// Truncation is calendar truncation, not fixed-duration truncation: a `Day`
/// starts at local midnight and a `Month` starts on the 1st, whatever the
/// instant's distance from the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnit {
    Minute,
    Hour,
    Day,
    /// ISO week, starting Monday.
    Week,
    Month,
}

impl PeriodUnit {
    /// Shortest possible length of one period.
    ///
    /// Offsets are validated against this so that adding the offset never
    /// pushes a run into the following period.
    pub fn min_length(self) -> TimeDelta {
        match self {
            PeriodUnit::Minute => TimeDelta::minutes(1),
            PeriodUnit::Hour => TimeDelta::hours(1),
            PeriodUnit::Day => TimeDelta::days(1),
            PeriodUnit::Week => TimeDelta::weeks(1),
            PeriodUnit::Month => TimeDelta::days(28),
        }
    }

    /// Start of the period containing `local`.
    pub fn truncate(self, local: NaiveDateTime) -> Option<NaiveDateTime> {
        let date = local.date();
        match self {
            PeriodUnit::Minute => date.and_hms_opt(local.hour(), local.minute(), 0),
            PeriodUnit::Hour => date.and_hms_opt(local.hour(), 0, 0),
            PeriodUnit::Day => date.and_hms_opt(0, 0, 0),
            PeriodUnit::Week => {
                let back = u64::from(date.weekday().num_days_from_monday());
                date.checked_sub_days(Days::new(back))?.and_hms_opt(0, 0, 0)
            }
            PeriodUnit::Month => date.with_day(1)?.and_hms_opt(0, 0, 0),
        }
    }

    /// `local` moved forward by exactly one period.
    ///
    /// Only meaningful for period starts; `Month` keeps the day of month.
    pub fn advance(self, local: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            PeriodUnit::Month => local.checked_add_months(Months::new(1)),
            fixed => local.checked_add_signed(fixed.min_length()),
        }
    }
}

impl fmt::Display for PeriodUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeriodUnit::Minute => "minute",
            PeriodUnit::Hour => "hour",
            PeriodUnit::Day => "day",
            PeriodUnit::Week => "week",
            PeriodUnit::Month => "month",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rstest::rstest;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[rstest]
    #[case(PeriodUnit::Minute, local(2024, 3, 14, 15, 9, 26), local(2024, 3, 14, 15, 9, 0))]
    #[case(PeriodUnit::Hour, local(2024, 3, 14, 15, 9, 26), local(2024, 3, 14, 15, 0, 0))]
    #[case(PeriodUnit::Day, local(2024, 3, 14, 15, 9, 26), local(2024, 3, 14, 0, 0, 0))]
    // 2024-03-14 is a Thursday
    #[case(PeriodUnit::Week, local(2024, 3, 14, 15, 9, 26), local(2024, 3, 11, 0, 0, 0))]
    #[case(PeriodUnit::Week, local(2024, 3, 11, 0, 0, 0), local(2024, 3, 11, 0, 0, 0))]
    #[case(PeriodUnit::Month, local(2024, 3, 14, 15, 9, 26), local(2024, 3, 1, 0, 0, 0))]
    fn test_truncate(
        #[case] unit: PeriodUnit,
        #[case] input: NaiveDateTime,
        #[case] expected: NaiveDateTime,
    ) {
        assert_eq!(unit.truncate(input), Some(expected));
    }

    #[test]
    fn test_month_advance_is_calendar_aware() {
        let jan = local(2024, 1, 1, 0, 0, 0);
        let feb = PeriodUnit::Month.advance(jan).unwrap();
        let mar = PeriodUnit::Month.advance(feb).unwrap();
        assert_eq!(feb, local(2024, 2, 1, 0, 0, 0));
        assert_eq!(mar, local(2024, 3, 1, 0, 0, 0));
        assert_eq!(mar - feb, TimeDelta::days(29));
    }

    #[test]
    fn test_display() {
        assert_eq!(PeriodUnit::Week.to_string(), "week");
    }
}
