use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{PeriodUnit, ScheduleError};

// =============================================================================
// Bounds
// =============================================================================

/// Window a schedule may fire in: `[run_at_and_after, run_until)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleBounds {
    run_at_and_after: DateTime<Utc>,
    run_until: Option<DateTime<Utc>>,
}

impl ScheduleBounds {
    /// Bounds with an exclusive upper limit.
    pub fn new(
        run_at_and_after: DateTime<Utc>,
        run_until: Option<DateTime<Utc>>,
    ) -> Result<Self, ScheduleError> {
        if let Some(run_until) = run_until {
            if run_until <= run_at_and_after {
                return Err(ScheduleError::EmptyWindow {
                    run_at_and_after,
                    run_until,
                });
            }
        }
        Ok(Self {
            run_at_and_after,
            run_until,
        })
    }

    /// Open-ended bounds starting at `run_at_and_after`.
    pub fn starting(run_at_and_after: DateTime<Utc>) -> Self {
        Self {
            run_at_and_after,
            run_until: None,
        }
    }

    pub fn run_at_and_after(&self) -> DateTime<Utc> {
        self.run_at_and_after
    }

    pub fn run_until(&self) -> Option<DateTime<Utc>> {
        self.run_until
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.run_at_and_after && self.run_until.map_or(true, |until| instant < until)
    }
}

// =============================================================================
// One-off
// =============================================================================

/// Fires exactly once, at `at`, provided `at` lies inside the bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneOffSchedule {
    bounds: ScheduleBounds,
    at: DateTime<Utc>,
}

impl OneOffSchedule {
    pub fn new(bounds: ScheduleBounds, at: DateTime<Utc>) -> Self {
        Self { bounds, at }
    }

    /// A one-off whose window opens at the target instant itself.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self::new(ScheduleBounds::starting(at), at)
    }

    pub fn bounds(&self) -> &ScheduleBounds {
        &self.bounds
    }

    pub fn target(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn next_run(&self, last_run: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match last_run {
            Some(_) => None,
            None => Some(self.at).filter(|at| self.bounds.contains(*at)),
        }
    }
}

// =============================================================================
// Periodic
// =============================================================================

/// Fires once per calendar period, `offset` after the period starts.
///
/// Periods are aligned in `zone` (UTC unless set with [`with_zone`]), so a
/// daily schedule in `+09:00` fires relative to Tokyo midnight.
///
/// [`with_zone`]: PeriodicSchedule::with_zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicSchedule {
    bounds: ScheduleBounds,
    period: PeriodUnit,
    offset: TimeDelta,
    zone: FixedOffset,
}

impl PeriodicSchedule {
    /// Build a periodic schedule; `offset` must lie in `[0, period)`.
    pub fn new(
        bounds: ScheduleBounds,
        period: PeriodUnit,
        offset: TimeDelta,
    ) -> Result<Self, ScheduleError> {
        if offset < TimeDelta::zero() {
            return Err(ScheduleError::NegativeOffset { offset });
        }
        let length = period.min_length();
        if offset >= length {
            return Err(ScheduleError::OffsetTooLarge {
                offset,
                period,
                length,
            });
        }
        Ok(Self {
            bounds,
            period,
            offset,
            zone: utc_zone(),
        })
    }

    /// Align periods to `zone` instead of UTC.
    #[must_use]
    pub fn with_zone(mut self, zone: FixedOffset) -> Self {
        self.zone = zone;
        self
    }

    pub fn bounds(&self) -> &ScheduleBounds {
        &self.bounds
    }

    pub fn period(&self) -> PeriodUnit {
        self.period
    }

    pub fn offset(&self) -> TimeDelta {
        self.offset
    }

    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    pub fn next_run(&self, last_run: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        // A last run from before the window (bounds moved forward) restarts
        // the computation from the window itself.
        let last_run = last_run.filter(|last| *last >= self.bounds.run_at_and_after);
        self.unbounded_next_run(last_run)
            .filter(|candidate| self.bounds.run_until.map_or(true, |until| *candidate < until))
    }

    fn unbounded_next_run(&self, last_run: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let period_start = match last_run {
            Some(last) => {
                let start = self.period.truncate(self.to_local(last))?;
                self.period.advance(start)?
            }
            None => {
                let lower = self.to_local(self.bounds.run_at_and_after);
                let aligned = self.period.truncate(lower)?;
                if aligned < lower {
                    self.period.advance(aligned)?
                } else {
                    aligned
                }
            }
        };
        let local = period_start.checked_add_signed(self.offset)?;
        self.from_local(local)
    }

    fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.zone).naive_local()
    }

    fn from_local(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.zone
            .from_local_datetime(&local)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

fn utc_zone() -> FixedOffset {
    Utc.fix()
}

// =============================================================================
// Schedule
// =============================================================================

/// Policy computing the next instant a job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleRepr", into = "ScheduleRepr")]
pub enum Schedule {
    OneOff(OneOffSchedule),
    Periodic(PeriodicSchedule),
}

impl Schedule {
    /// Next run after `last_run`, or the first run when `last_run` is `None`.
    ///
    /// `None` means the schedule is exhausted.
    pub fn next_run(&self, last_run: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::OneOff(s) => s.next_run(last_run),
            Schedule::Periodic(s) => s.next_run(last_run),
        }
    }

    pub fn bounds(&self) -> &ScheduleBounds {
        match self {
            Schedule::OneOff(s) => s.bounds(),
            Schedule::Periodic(s) => s.bounds(),
        }
    }

    /// Successive runs following `last_run`.
    pub fn runs(&self, last_run: Option<DateTime<Utc>>) -> Runs<'_> {
        Runs {
            schedule: self,
            last_run,
            exhausted: false,
        }
    }
}

impl From<OneOffSchedule> for Schedule {
    fn from(s: OneOffSchedule) -> Self {
        Schedule::OneOff(s)
    }
}

impl From<PeriodicSchedule> for Schedule {
    fn from(s: PeriodicSchedule) -> Self {
        Schedule::Periodic(s)
    }
}

/// Iterator over the run instants of a schedule.
#[derive(Debug, Clone)]
pub struct Runs<'a> {
    schedule: &'a Schedule,
    last_run: Option<DateTime<Utc>>,
    exhausted: bool,
}

impl Iterator for Runs<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match self.schedule.next_run(self.last_run) {
            Some(next) => {
                self.last_run = Some(next);
                Some(next)
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

// =============================================================================
// Wire form
// =============================================================================

/// Serialized form; deserialization goes through the validating constructors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ScheduleRepr {
    OneOff {
        run_at_and_after: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_until: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    Periodic {
        run_at_and_after: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_until: Option<DateTime<Utc>>,
        period: PeriodUnit,
        #[serde(default)]
        offset_ms: i64,
        #[serde(default)]
        utc_offset_secs: i32,
    },
}

impl TryFrom<ScheduleRepr> for Schedule {
    type Error = ScheduleError;

    fn try_from(repr: ScheduleRepr) -> Result<Self, Self::Error> {
        match repr {
            ScheduleRepr::OneOff {
                run_at_and_after,
                run_until,
                at,
            } => {
                let bounds = ScheduleBounds::new(run_at_and_after, run_until)?;
                Ok(OneOffSchedule::new(bounds, at).into())
            }
            ScheduleRepr::Periodic {
                run_at_and_after,
                run_until,
                period,
                offset_ms,
                utc_offset_secs,
            } => {
                let bounds = ScheduleBounds::new(run_at_and_after, run_until)?;
                let offset = TimeDelta::try_milliseconds(offset_ms)
                    .ok_or(ScheduleError::OffsetOutOfRange(offset_ms))?;
                let zone = FixedOffset::east_opt(utc_offset_secs)
                    .ok_or(ScheduleError::InvalidZone(utc_offset_secs))?;
                Ok(PeriodicSchedule::new(bounds, period, offset)?
                    .with_zone(zone)
                    .into())
            }
        }
    }
}

impl From<Schedule> for ScheduleRepr {
    fn from(schedule: Schedule) -> Self {
        match schedule {
            Schedule::OneOff(s) => ScheduleRepr::OneOff {
                run_at_and_after: s.bounds.run_at_and_after,
                run_until: s.bounds.run_until,
                at: s.at,
            },
            Schedule::Periodic(s) => ScheduleRepr::Periodic {
                run_at_and_after: s.bounds.run_at_and_after,
                run_until: s.bounds.run_until,
                period: s.period,
                offset_ms: s.offset.num_milliseconds(),
                utc_offset_secs: s.zone.local_minus_utc(),
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
