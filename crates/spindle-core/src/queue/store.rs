//! Message store facade: the message state machine over a `StorageAdapter`.
//!
//! Every transition a message goes through is one method here, and each of
//! them is a single atomic adapter call guarded by the lease token:
//! - `enqueue`: insert (Waiting)
//! - `try_claim`: Waiting -> Processing under a fresh lease
//! - `commit`: Processing -> Completed (deleted)
//! - `rollback`: Processing -> Waiting / Error, per the retry policy
//! - `renew`: extend the lease
//! - `reclaim_expired`: Processing with a dead lease -> Waiting / Error
//! - `delete_expired`: any status past `expires_at` -> deleted

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::config::QueueOptions;
use crate::domain::{
    CommitOutcome, LeaseToken, MessageEvent, MessageId, MessageRecord, MessageStatus,
    MessageUpdate, NewMessage, QueueCounts, RenewOutcome, RollbackOutcome, TriggerRecord,
};
use crate::error::{QueueError, QueueResult};
use crate::ports::{CasOutcome, ClaimRequest, Clock, HeldTransaction, StorageAdapter, after};
use crate::queue::retry::{RetryDecision, RetryPolicy};

const EVENT_CAPACITY: usize = 1024;

/// Lease bookkeeping handed to the claimant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseHandle {
    pub id: MessageId,
    pub token: LeaseToken,
    pub claimed_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
    /// `None` when heartbeats are disabled.
    pub expires_at: Option<DateTime<Utc>>,
}

/// A claimed message. The owner must pass it back to `commit` or `rollback`.
///
/// Dropping it without either leaves the message Processing until its lease
/// expires (or, in hold-transaction mode, rolls the transaction back).
pub struct Claim {
    pub record: MessageRecord,
    pub lease: LeaseHandle,
    held: Option<Box<dyn HeldTransaction>>,
}

impl Claim {
    pub fn id(&self) -> MessageId {
        self.record.id
    }

    /// Claimed inside a transaction that stays open until commit/rollback.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("id", &self.record.id)
            .field("lease", &self.lease)
            .field("held", &self.held.is_some())
            .finish()
    }
}

/// Why a claim is being rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failure {
    pub error: Option<String>,
    /// Delay asked for by the handler; replaces the policy's backoff.
    pub delay: Option<Duration>,
}

impl Failure {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Queue operations for one queue, written once against `StorageAdapter`.
pub struct MessageStore {
    adapter: Arc<dyn StorageAdapter>,
    options: QueueOptions,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<MessageEvent>,
    disposed: AtomicBool,
}

impl MessageStore {
    /// `options` are frozen for the life of the store.
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        options: QueueOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            adapter,
            options,
            clock,
            events,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.adapter.queue_name()
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.events.subscribe()
    }

    /// Every later operation fails with `QueueError::Disposed`. Idempotent.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.queue_name(), "message store disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_live(&self) -> QueueResult<()> {
        if self.is_disposed() {
            return Err(QueueError::Disposed);
        }
        Ok(())
    }

    fn emit(&self, event: MessageEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    #[instrument(name = "store.enqueue", skip(self, message), fields(queue = %self.queue_name()))]
    pub async fn enqueue(&self, message: NewMessage) -> QueueResult<MessageId> {
        self.ensure_live()?;
        let correlation_id = message.correlation_id;
        let id = self.adapter.insert(message).await?;
        debug!(%id, %correlation_id, "message enqueued");
        self.emit(MessageEvent::Enqueued { id, correlation_id });
        Ok(id)
    }

    /// Claim the next eligible message under a fresh lease.
    ///
    /// With message expiration enabled, a claimed message already past its
    /// `expires_at` is deleted and the claim moves on to the next one.
    #[instrument(name = "store.try_claim", skip(self), fields(queue = %self.queue_name()))]
    pub async fn try_claim(&self, lease_duration: Duration) -> QueueResult<Option<Claim>> {
        self.ensure_live()?;
        loop {
            let now = self.clock.now();
            let request = ClaimRequest {
                now,
                lease_token: LeaseToken::generate(),
                lease_expires_at: self
                    .options
                    .enable_heart_beat
                    .then(|| after(now, lease_duration)),
                honor_delay: self.options.enable_delayed_processing,
                honor_priority: self.options.enable_priority,
            };

            let (record, held) = if self.options.enable_hold_transaction_until_message_committed {
                match self.adapter.claim_held(&request).await? {
                    Some((record, tx)) => (record, Some(tx)),
                    None => return Ok(None),
                }
            } else {
                match self.adapter.claim_one(&request).await? {
                    Some(record) => (record, None),
                    None => return Ok(None),
                }
            };

            let lease = LeaseHandle {
                id: record.id,
                token: request.lease_token,
                claimed_at: now,
                last_renewed_at: now,
                expires_at: request.lease_expires_at,
            };
            let claim = Claim {
                record,
                lease,
                held,
            };

            if self.options.enable_message_expiration && claim.record.is_expired(now) {
                let id = claim.id();
                if self.delete_claimed(claim).await? {
                    info!(%id, "expired message deleted at claim");
                    self.emit(MessageEvent::Expired { id });
                }
                continue;
            }

            debug!(id = %claim.id(), lease = %claim.lease.token, "message claimed");
            return Ok(Some(claim));
        }
    }

    /// Delete a message we hold the lease on. `false` on lease conflict.
    async fn delete_claimed(&self, claim: Claim) -> QueueResult<bool> {
        match claim.held {
            Some(tx) => {
                tx.commit().await?;
                Ok(true)
            }
            None => Ok(self
                .adapter
                .delete_if_leased(claim.lease.id, claim.lease.token)
                .await?
                .is_applied()),
        }
    }

    #[instrument(name = "store.commit", skip(self, claim), fields(queue = %self.queue_name(), id = %claim.id()))]
    pub async fn commit(&self, claim: Claim) -> QueueResult<CommitOutcome> {
        self.ensure_live()?;
        let correlation_id = claim.record.correlation_id;
        let id = claim.id();
        if !self.delete_claimed(claim).await? {
            warn!("commit rejected: lease no longer held");
            return Ok(CommitOutcome::Conflict);
        }
        debug!("message committed");
        self.emit(MessageEvent::Completed { id, correlation_id });
        Ok(CommitOutcome::Committed)
    }

    /// Hand a failed message to the retry policy.
    ///
    /// Expiration wins over retry: a message past `expires_at` is deleted
    /// whatever its error count.
    #[instrument(
        name = "store.rollback",
        skip(self, claim, failure, policy),
        fields(queue = %self.queue_name(), id = %claim.id(), last_heartbeat = %claim.lease.last_renewed_at)
    )]
    pub async fn rollback(
        &self,
        claim: Claim,
        failure: Failure,
        policy: &RetryPolicy,
    ) -> QueueResult<RollbackOutcome> {
        self.ensure_live()?;
        let now = self.clock.now();
        let id = claim.id();
        let correlation_id = claim.record.correlation_id;

        if self.options.enable_message_expiration && claim.record.is_expired(now) {
            if !self.delete_claimed(claim).await? {
                return Ok(RollbackOutcome::Conflict);
            }
            info!("expired message deleted at rollback");
            self.emit(MessageEvent::Expired { id });
            return Ok(RollbackOutcome::Expired);
        }

        let decision = policy.decide(claim.record.error_count, failure.delay);
        let update = update_for(decision, now, failure.error);

        let applied = match claim.held {
            Some(tx) => {
                tx.rollback(Some(update)).await?;
                true
            }
            None => self
                .adapter
                .update_if_leased(id, claim.lease.token, update)
                .await?
                .is_applied(),
        };
        if !applied {
            warn!("rollback rejected: lease no longer held");
            return Ok(RollbackOutcome::Conflict);
        }

        Ok(match decision {
            RetryDecision::Requeue { delay, error_count } => {
                debug!(error_count, ?delay, "message requeued");
                self.emit(MessageEvent::Requeued {
                    id,
                    correlation_id,
                    error_count,
                });
                RollbackOutcome::Requeued {
                    visible_at: after(now, delay),
                    error_count,
                }
            }
            RetryDecision::Poison { error_count } => {
                warn!(error_count, "retry budget spent, message moved to error");
                self.emit(MessageEvent::Poisoned {
                    id,
                    correlation_id,
                    error_count,
                });
                RollbackOutcome::Poisoned { error_count }
            }
        })
    }

    /// Give an unprocessed message back without counting an error.
    ///
    /// `false` when the lease was already lost.
    #[instrument(name = "store.release", skip(self, claim), fields(queue = %self.queue_name(), id = %claim.id()))]
    pub async fn release(&self, claim: Claim) -> QueueResult<bool> {
        self.ensure_live()?;
        let id = claim.id();
        let released = match claim.held {
            Some(tx) => {
                tx.rollback(None).await?;
                true
            }
            None => self
                .adapter
                .update_if_leased(id, claim.lease.token, MessageUpdate::Release)
                .await?
                .is_applied(),
        };
        if released {
            debug!("message released");
            self.emit(MessageEvent::Released { id });
        }
        Ok(released)
    }

    /// Extend the lease by `lease_duration` from now.
    pub async fn renew(
        &self,
        lease: &LeaseHandle,
        lease_duration: Duration,
    ) -> QueueResult<RenewOutcome> {
        self.ensure_live()?;
        let now = self.clock.now();
        let expires_at = Some(after(now, lease_duration));
        let update = MessageUpdate::Renew {
            renewed_at: now,
            expires_at,
        };
        Ok(
            match self
                .adapter
                .update_if_leased(lease.id, lease.token, update)
                .await?
            {
                CasOutcome::Applied => RenewOutcome::Renewed { expires_at },
                CasOutcome::Conflict => RenewOutcome::Lost,
            },
        )
    }

    /// Reset messages whose lease ran out. Safe to run from several
    /// processes at once: each reset is a CAS on the stale token.
    #[instrument(name = "store.reclaim_expired", skip(self, policy), fields(queue = %self.queue_name()))]
    pub async fn reclaim_expired(&self, policy: &RetryPolicy, batch: usize) -> QueueResult<usize> {
        self.ensure_live()?;
        let now = self.clock.now();
        let expired = self.adapter.find_expired_leases(now, batch).await?;
        let mut reclaimed = 0;
        for lease in expired {
            let decision = policy.decide(lease.error_count, None);
            let update = update_for(decision, now, Some("lease expired".to_string()));
            let outcome = self
                .adapter
                .reclaim_if_expired(lease.id, lease.lease_token, now, update)
                .await?;
            if !outcome.is_applied() {
                // renewed or reclaimed by someone else in the meantime
                continue;
            }
            reclaimed += 1;
            match decision {
                RetryDecision::Requeue { error_count, .. } => {
                    debug!(id = %lease.id, error_count, "lease reclaimed");
                    self.emit(MessageEvent::Reclaimed {
                        id: lease.id,
                        error_count,
                    });
                }
                RetryDecision::Poison { error_count } => {
                    warn!(id = %lease.id, error_count, "abandoned message moved to error");
                    let correlation_id = self
                        .adapter
                        .get(lease.id)
                        .await?
                        .map(|r| r.correlation_id)
                        .unwrap_or_default();
                    self.emit(MessageEvent::Poisoned {
                        id: lease.id,
                        correlation_id,
                        error_count,
                    });
                }
            }
        }
        Ok(reclaimed)
    }

    /// Delete messages past `expires_at`, whatever their status.
    #[instrument(name = "store.delete_expired", skip(self), fields(queue = %self.queue_name()))]
    pub async fn delete_expired(&self, batch: usize) -> QueueResult<usize> {
        self.ensure_live()?;
        if !self.options.enable_message_expiration {
            return Err(QueueError::FeatureDisabled("EnableMessageExpiration"));
        }
        let now = self.clock.now();
        let mut deleted = 0;
        for id in self.adapter.find_expired_messages(now, batch).await? {
            if self.adapter.delete(id).await? {
                deleted += 1;
                self.emit(MessageEvent::Expired { id });
            }
        }
        Ok(deleted)
    }

    /// Record that `record.job_name` was dispatched for its slot. `false`
    /// when another scheduler got there first.
    pub async fn insert_trigger(&self, record: TriggerRecord) -> QueueResult<bool> {
        self.ensure_live()?;
        Ok(self.adapter.insert_trigger_if_absent(record).await?)
    }

    pub async fn purge_triggers_before(&self, cutoff: DateTime<Utc>) -> QueueResult<usize> {
        self.ensure_live()?;
        Ok(self.adapter.purge_triggers_before(cutoff).await?)
    }

    pub async fn status_projection(&self, id: MessageId) -> QueueResult<Option<MessageStatus>> {
        self.ensure_live()?;
        Ok(self.adapter.status_projection(id).await?)
    }

    pub async fn count_waiting(&self) -> QueueResult<usize> {
        Ok(self.counts().await?.waiting)
    }

    pub async fn counts(&self) -> QueueResult<QueueCounts> {
        self.ensure_live()?;
        Ok(self.adapter.counts().await?)
    }

    pub async fn get(&self, id: MessageId) -> QueueResult<Option<MessageRecord>> {
        self.ensure_live()?;
        Ok(self.adapter.get(id).await?)
    }

    pub async fn list(&self, status: MessageStatus, limit: usize) -> QueueResult<Vec<MessageRecord>> {
        self.ensure_live()?;
        Ok(self.adapter.list_by_status(status, limit).await?)
    }

    /// Waiting messages in the order they would be claimed.
    pub async fn peek_waiting(&self, limit: usize) -> QueueResult<Vec<MessageRecord>> {
        self.ensure_live()?;
        let now = self.clock.now();
        Ok(self
            .adapter
            .query_waiting(
                now,
                self.options.enable_delayed_processing,
                self.options.enable_priority,
                limit,
            )
            .await?)
    }
}

fn update_for(decision: RetryDecision, now: DateTime<Utc>, error: Option<String>) -> MessageUpdate {
    match decision {
        RetryDecision::Requeue { delay, error_count } => MessageUpdate::Requeue {
            visible_at: after(now, delay),
            error_count,
            last_error: error,
        },
        RetryDecision::Poison { error_count } => MessageUpdate::MarkError {
            error_count,
            last_error: error,
        },
    }
}
