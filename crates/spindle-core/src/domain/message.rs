//! Message record: the unit of work and its state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::correlation::CorrelationId;
use super::ids::{LeaseToken, MessageId};

/// Message status.
///
/// State transitions:
/// - Waiting -> Processing (claim)
/// - Processing -> Completed (commit; the record is deleted in the same step)
/// - Processing -> Waiting (rollback or lease reclaim, error_count + 1)
/// - Processing -> Error (rollback or reclaim once the retry budget is spent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Waiting,
    Processing,
    Completed,
    Error,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Error)
    }
}

/// Header keys the engine itself reads or writes.
pub mod header_keys {
    /// Name of the scheduled job that produced the message.
    pub const JOB_NAME: &str = "spindle.job.name";
    /// RFC 3339 time slot the job message was dispatched for.
    pub const JOB_SCHEDULED_TIME: &str = "spindle.job.scheduled_time";
    /// Routing key used by `HandlerRegistry`.
    pub const MESSAGE_TYPE: &str = "spindle.message.type";
}

/// String keys mapped to typed (JSON) values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, serde_json::Value>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> serde_json::Result<()> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Builder form of `set` for plain string values.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    /// Typed read. `None` when the key is missing or holds a different type.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Lease bookkeeping carried by a `Processing` message.
///
/// `expires_at` is `None` when heartbeats are disabled: such a lease never
/// expires and an abandoned message stays `Processing` until an operator acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub lease_token: LeaseToken,
    pub last_renewed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Heartbeat {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A message to be inserted; the adapter assigns the id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub correlation_id: CorrelationId,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Mutation applied by the adapter under a lease-token check.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageUpdate {
    /// Extend the lease.
    Renew {
        renewed_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    },
    /// Release the lease and make the message claimable again at `visible_at`.
    Requeue {
        visible_at: DateTime<Utc>,
        error_count: u32,
        last_error: Option<String>,
    },
    /// Release the lease and park the message in terminal `Error`.
    MarkError {
        error_count: u32,
        last_error: Option<String>,
    },
    /// Give the message back untouched (worker shutting down).
    Release,
}

/// Metadata + body for a message in the queue.
///
/// This is the single source of truth for message state; every transition
/// goes through one of the methods below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub correlation_id: CorrelationId,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub status: MessageStatus,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Number of rollback-driven reprocessing attempts.
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Present only while `status == Processing`.
    pub heartbeat: Option<Heartbeat>,
}

impl MessageRecord {
    pub fn from_new(id: MessageId, message: NewMessage) -> Self {
        Self {
            id,
            correlation_id: message.correlation_id,
            body: message.body,
            headers: message.headers,
            status: MessageStatus::Waiting,
            priority: message.priority,
            enqueued_at: message.enqueued_at,
            visible_at: message.visible_at,
            expires_at: message.expires_at,
            error_count: 0,
            last_error: None,
            heartbeat: None,
        }
    }

    pub fn lease_token(&self) -> Option<LeaseToken> {
        self.heartbeat.map(|hb| hb.lease_token)
    }

    pub fn holds_lease(&self, token: LeaseToken) -> bool {
        self.status == MessageStatus::Processing && self.lease_token() == Some(token)
    }

    /// Eligible for claim at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>, honor_delay: bool) -> bool {
        self.status == MessageStatus::Waiting && (!honor_delay || self.visible_at <= now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Processing with a lease whose owner stopped renewing.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Processing
            && self.heartbeat.is_some_and(|hb| hb.is_expired(now))
    }

    /// Waiting -> Processing.
    pub fn claim(&mut self, token: LeaseToken, now: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) {
        self.status = MessageStatus::Processing;
        self.heartbeat = Some(Heartbeat {
            lease_token: token,
            last_renewed_at: now,
            expires_at,
        });
    }

    pub fn apply(&mut self, update: MessageUpdate) {
        match update {
            MessageUpdate::Renew {
                renewed_at,
                expires_at,
            } => {
                if let Some(hb) = self.heartbeat.as_mut() {
                    hb.last_renewed_at = renewed_at;
                    hb.expires_at = expires_at;
                }
            }
            MessageUpdate::Requeue {
                visible_at,
                error_count,
                last_error,
            } => {
                self.status = MessageStatus::Waiting;
                self.visible_at = visible_at;
                self.error_count = error_count;
                if last_error.is_some() {
                    self.last_error = last_error;
                }
                self.heartbeat = None;
            }
            MessageUpdate::MarkError {
                error_count,
                last_error,
            } => {
                self.status = MessageStatus::Error;
                self.error_count = error_count;
                if last_error.is_some() {
                    self.last_error = last_error;
                }
                self.heartbeat = None;
            }
            MessageUpdate::Release => {
                self.status = MessageStatus::Waiting;
                self.heartbeat = None;
            }
        }
    }
}
