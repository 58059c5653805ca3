//! Run schedules for cadence jobs.
//!
//! A [`Schedule`] is a pure policy: given the instant a job last ran (or
//! nothing, if it never ran) it answers when the job should run next. It
//! never looks at the wall clock; deciding whether that instant is due is
//! the coordinator's business.
//!
//! # Variants
//!
//! | Variant    | Fires                                                      |
//! |------------|------------------------------------------------------------|
//! | `OneOff`   | once, at a fixed instant inside the bounds                 |
//! | `Periodic` | once per calendar period (minute .. month), plus an offset |
//!
//! Both variants are bounded by [`ScheduleBounds`]: an inclusive
//! `run_at_and_after` and an optional exclusive `run_until`.
//!
//! # Invariants
//!
//! - Successive results of `next_run` are strictly increasing
//! - No result precedes `run_at_and_after` or reaches `run_until`
//! - A periodic offset is always in `[0, period)`; construction fails otherwise

mod error;
mod period;
mod schedule;

pub use error::ScheduleError;
pub use period::PeriodUnit;
pub use schedule::{OneOffSchedule, PeriodicSchedule, Runs, Schedule, ScheduleBounds};
