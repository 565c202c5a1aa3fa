//! StorageAdapter port: the contract every backing store fulfils.
//!
//! The message store facade is written once against this trait and never
//! against a concrete backend. Everything that must be atomic across processes
//! is a single method here:
//! - `claim_one`: compare-and-swap Waiting -> Processing under a fresh lease
//! - `update_if_leased` / `delete_if_leased`: optimistic check on the lease token
//! - `reclaim_if_expired`: lease-token check plus "still expired" check
//! - `insert_trigger_if_absent`: unique insert of a trigger record
//!
//! An adapter must not emulate any of these with a read followed by a write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueOptions;
use crate::domain::{
    LeaseToken, MessageId, MessageRecord, MessageStatus, MessageUpdate, NewMessage, QueueCounts,
    TriggerRecord,
};
use crate::error::StorageError;

/// Family of backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterKind {
    /// SQL Server, PostgreSQL, SQLite: multi-statement transactions.
    RelationalTransactional,
    /// Redis-like stores: single-command atomic scripts, no open transactions.
    ScriptedAtomic,
    InMemory,
}

impl AdapterKind {
    /// Can a transaction stay open across handler execution?
    pub fn supports_held_transactions(self) -> bool {
        matches!(
            self,
            AdapterKind::RelationalTransactional | AdapterKind::InMemory
        )
    }
}

/// Parameters of an atomic claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRequest {
    pub now: DateTime<Utc>,
    pub lease_token: LeaseToken,
    /// `None` when heartbeats are disabled.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub honor_delay: bool,
    pub honor_priority: bool,
}

/// Outcome of an optimistic (token-checked) write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// Token mismatch, lease not expired, or record gone.
    Conflict,
}

impl CasOutcome {
    pub fn is_applied(self) -> bool {
        self == CasOutcome::Applied
    }
}

/// A processing message whose lease has run out, as seen by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredLease {
    pub id: MessageId,
    pub lease_token: LeaseToken,
    pub error_count: u32,
}

/// Transaction kept open from claim until the handler finishes.
///
/// Only adapters whose kind supports held transactions hand these out. The
/// worker owns it and must either `commit` or `rollback`; dropping it without
/// either rolls back.
#[async_trait]
pub trait HeldTransaction: Send {
    /// Delete the message and close the transaction.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Undo the claim, then apply `update` (requeue or mark error).
    async fn rollback(self: Box<Self>, update: Option<MessageUpdate>) -> Result<(), StorageError>;
}

/// Storage adapter bound to one queue.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    fn queue_name(&self) -> &str;

    async fn queue_exists(&self) -> Result<bool, StorageError>;

    /// Create the queue. `Ok(false)` when it already exists.
    async fn create_queue(&self, options: &QueueOptions) -> Result<bool, StorageError>;

    /// Remove the queue and all its data. `Ok(false)` when it did not exist.
    async fn remove_queue(&self) -> Result<bool, StorageError>;

    /// Atomic insert returning the generated id.
    async fn insert(&self, message: NewMessage) -> Result<MessageId, StorageError>;

    /// Atomically claim the next eligible Waiting message.
    ///
    /// Ordering: priority (descending, when honored), then `visible_at`, then id.
    async fn claim_one(&self, request: &ClaimRequest) -> Result<Option<MessageRecord>, StorageError>;

    /// Claim inside a transaction that stays open until commit/rollback.
    async fn claim_held(
        &self,
        _request: &ClaimRequest,
    ) -> Result<Option<(MessageRecord, Box<dyn HeldTransaction>)>, StorageError> {
        Err(StorageError::Unsupported("claim_held"))
    }

    /// Apply `update` only if `lease_token` still owns the message.
    async fn update_if_leased(
        &self,
        id: MessageId,
        lease_token: LeaseToken,
        update: MessageUpdate,
    ) -> Result<CasOutcome, StorageError>;

    /// Delete only if `lease_token` still owns the message.
    async fn delete_if_leased(
        &self,
        id: MessageId,
        lease_token: LeaseToken,
    ) -> Result<CasOutcome, StorageError>;

    /// Apply `update` only if `lease_token` still owns the message and its
    /// lease is expired at `now`.
    async fn reclaim_if_expired(
        &self,
        id: MessageId,
        lease_token: LeaseToken,
        now: DateTime<Utc>,
        update: MessageUpdate,
    ) -> Result<CasOutcome, StorageError>;

    /// Unconditional delete. `Ok(false)` when already gone.
    async fn delete(&self, id: MessageId) -> Result<bool, StorageError>;

    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>, StorageError>;

    /// Range query: Waiting records visible at `now`, in claim order.
    async fn query_waiting(
        &self,
        now: DateTime<Utc>,
        honor_delay: bool,
        honor_priority: bool,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError>;

    async fn find_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredLease>, StorageError>;

    /// Ids of messages whose `expires_at` has passed, any status.
    async fn find_expired_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageId>, StorageError>;

    async fn list_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError>;

    async fn counts(&self) -> Result<QueueCounts, StorageError>;

    /// Read the denormalized status projection (EnableStatusTable).
    async fn status_projection(&self, _id: MessageId) -> Result<Option<MessageStatus>, StorageError> {
        Err(StorageError::Unsupported("status_projection"))
    }

    /// Insert the trigger record unless `(job_name, scheduled_time)` exists.
    ///
    /// Returns `true` when this call inserted it. Must be atomic: two
    /// concurrent calls for the same pair never both return `true`.
    async fn insert_trigger_if_absent(&self, record: TriggerRecord) -> Result<bool, StorageError>;

    /// Delete trigger records with `scheduled_time < cutoff`.
    async fn purge_triggers_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_stores_cannot_hold_transactions() {
        assert!(!AdapterKind::ScriptedAtomic.supports_held_transactions());
        assert!(AdapterKind::RelationalTransactional.supports_held_transactions());
        assert!(AdapterKind::InMemory.supports_held_transactions());
    }
}
