use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::PeriodUnit;

/// Invalid schedule configuration. Raised only while constructing a
/// schedule; a constructed schedule has no failure modes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule offset must not be negative, got {offset}")]
    NegativeOffset { offset: TimeDelta },

    #[error("schedule offset {offset} must be shorter than one {period} ({length})")]
    OffsetTooLarge {
        offset: TimeDelta,
        period: PeriodUnit,
        length: TimeDelta,
    },

    #[error("run_until {run_until} must be later than run_at_and_after {run_at_and_after}")]
    EmptyWindow {
        run_at_and_after: DateTime<Utc>,
        run_until: DateTime<Utc>,
    },

    #[error("schedule offset of {0} milliseconds is out of range")]
    OffsetOutOfRange(i64),

    #[error("utc offset of {0} seconds is not a valid zone")]
    InvalidZone(i32),
}
