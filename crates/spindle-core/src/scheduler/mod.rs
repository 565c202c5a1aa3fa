//! Recurring jobs on top of the queue.
//!
//! - `trigger`: the `unit(*%N)` expression language and its evaluation
//! - `job`: the dispatch loop with duplicate-run suppression

pub mod job;
pub mod trigger;

pub use self::job::{JobDefinition, JobScheduler, SchedulerConfig, SchedulerError, TickReport};
pub use self::trigger::{Field, Trigger, TriggerParseError, TriggerParseErrorKind, Unit};
