//! Typed outcomes of queue operations.
//!
//! Lease conflicts and poisoning are normal results, not errors: the caller
//! gets a value describing what happened and decides nothing more is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::correlation::CorrelationId;
use super::ids::MessageId;

/// Result of `MessageStore::commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The lease token no longer matches: another owner already handled it.
    Conflict,
}

/// Result of `MessageStore::rollback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Back to `Waiting`, claimable from `visible_at`.
    Requeued {
        visible_at: DateTime<Utc>,
        error_count: u32,
    },
    /// Retry budget spent; parked in terminal `Error`.
    Poisoned { error_count: u32 },
    /// `expires_at` had passed; the message was deleted.
    Expired,
    /// The lease token no longer matches.
    Conflict,
}

/// Result of a lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed { expires_at: Option<DateTime<Utc>> },
    /// Lease lost (reclaimed, or the message is gone).
    Lost,
}

/// Counts by status for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub processing: usize,
    pub error: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.processing + self.error
    }
}

/// Lifecycle notification broadcast by the message store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    Enqueued {
        id: MessageId,
        correlation_id: CorrelationId,
    },
    Completed {
        id: MessageId,
        correlation_id: CorrelationId,
    },
    Requeued {
        id: MessageId,
        correlation_id: CorrelationId,
        error_count: u32,
    },
    Poisoned {
        id: MessageId,
        correlation_id: CorrelationId,
        error_count: u32,
    },
    Expired {
        id: MessageId,
    },
    /// Lease reclaimed by the sweep.
    Reclaimed {
        id: MessageId,
        error_count: u32,
    },
    /// Handed back unprocessed by a stopping worker.
    Released {
        id: MessageId,
    },
}

impl MessageEvent {
    pub fn message_id(&self) -> MessageId {
        match self {
            MessageEvent::Enqueued { id, .. }
            | MessageEvent::Completed { id, .. }
            | MessageEvent::Requeued { id, .. }
            | MessageEvent::Poisoned { id, .. }
            | MessageEvent::Expired { id }
            | MessageEvent::Reclaimed { id, .. }
            | MessageEvent::Released { id } => *id,
        }
    }
}
