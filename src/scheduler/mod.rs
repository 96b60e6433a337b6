//! Durable task scheduling: the interval grammar and the single-runner
//! fire loop.

pub mod engine;
pub mod parse;

pub use engine::{SchedulerEngine, SCHEDULER_LOCK};
pub use parse::{build_trigger, is_valid_interval, ScheduleQualifiers};
