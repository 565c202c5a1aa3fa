//! Domain model (ids, messages, correlation, triggers, outcomes).

pub mod correlation;
pub mod ids;
pub mod message;
pub mod outcome;
pub mod trigger;

pub use correlation::{CorrelationId, CorrelationParseError, CorrelationRegistry};
pub use ids::{Id, IdMarker, LeaseToken, MessageId, SchedulerId};
pub use message::{Headers, Heartbeat, MessageRecord, MessageStatus, MessageUpdate, NewMessage, header_keys};
pub use outcome::{CommitOutcome, MessageEvent, QueueCounts, RenewOutcome, RollbackOutcome};
pub use trigger::TriggerRecord;
