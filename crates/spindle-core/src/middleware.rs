//! Middleware chain around the storage adapter.
//!
//! Each adapter call is reified as a `StorageOp`, passed through an ordered
//! list of `Layer`s and finally executed against the wrapped adapter. Layers
//! are composed once at startup:
//!
//! ```ignore
//! let stack = AdapterStack::new(Arc::new(storage))
//!     .layer(ValidationLayer)
//!     .layer(TimingLayer::default())
//!     .layer(RetryLayer::default());
//! ```
//!
//! The first layer added is the outermost one. `AdapterStack` is itself a
//! `StorageAdapter`, so the rest of the engine never knows it is there.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};

use crate::config::QueueOptions;
use crate::domain::{
    LeaseToken, MessageId, MessageRecord, MessageStatus, MessageUpdate, NewMessage, QueueCounts,
    TriggerRecord,
};
use crate::error::StorageError;
use crate::ports::{
    AdapterKind, CasOutcome, ClaimRequest, ExpiredLease, HeldTransaction, StorageAdapter,
};

/// One adapter call with owned arguments.
#[derive(Debug, Clone)]
pub enum StorageOp {
    QueueExists,
    CreateQueue(QueueOptions),
    RemoveQueue,
    Insert(NewMessage),
    ClaimOne(ClaimRequest),
    ClaimHeld(ClaimRequest),
    UpdateIfLeased {
        id: MessageId,
        lease_token: LeaseToken,
        update: MessageUpdate,
    },
    DeleteIfLeased {
        id: MessageId,
        lease_token: LeaseToken,
    },
    ReclaimIfExpired {
        id: MessageId,
        lease_token: LeaseToken,
        now: DateTime<Utc>,
        update: MessageUpdate,
    },
    Delete(MessageId),
    Get(MessageId),
    QueryWaiting {
        now: DateTime<Utc>,
        honor_delay: bool,
        honor_priority: bool,
        limit: usize,
    },
    FindExpiredLeases {
        now: DateTime<Utc>,
        limit: usize,
    },
    FindExpiredMessages {
        now: DateTime<Utc>,
        limit: usize,
    },
    ListByStatus {
        status: MessageStatus,
        limit: usize,
    },
    Counts,
    StatusProjection(MessageId),
    InsertTriggerIfAbsent(TriggerRecord),
    PurgeTriggersBefore(DateTime<Utc>),
}

impl StorageOp {
    pub fn name(&self) -> &'static str {
        match self {
            StorageOp::QueueExists => "queue_exists",
            StorageOp::CreateQueue(_) => "create_queue",
            StorageOp::RemoveQueue => "remove_queue",
            StorageOp::Insert(_) => "insert",
            StorageOp::ClaimOne(_) => "claim_one",
            StorageOp::ClaimHeld(_) => "claim_held",
            StorageOp::UpdateIfLeased { .. } => "update_if_leased",
            StorageOp::DeleteIfLeased { .. } => "delete_if_leased",
            StorageOp::ReclaimIfExpired { .. } => "reclaim_if_expired",
            StorageOp::Delete(_) => "delete",
            StorageOp::Get(_) => "get",
            StorageOp::QueryWaiting { .. } => "query_waiting",
            StorageOp::FindExpiredLeases { .. } => "find_expired_leases",
            StorageOp::FindExpiredMessages { .. } => "find_expired_messages",
            StorageOp::ListByStatus { .. } => "list_by_status",
            StorageOp::Counts => "counts",
            StorageOp::StatusProjection(_) => "status_projection",
            StorageOp::InsertTriggerIfAbsent(_) => "insert_trigger_if_absent",
            StorageOp::PurgeTriggersBefore(_) => "purge_triggers_before",
        }
    }
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a `StorageOp`. The variant always matches the op.
pub enum StorageReply {
    Flag(bool),
    Id(MessageId),
    Record(Option<MessageRecord>),
    Held(Option<(MessageRecord, Box<dyn HeldTransaction>)>),
    Cas(CasOutcome),
    Records(Vec<MessageRecord>),
    ExpiredLeases(Vec<ExpiredLease>),
    Ids(Vec<MessageId>),
    Counts(QueueCounts),
    Status(Option<MessageStatus>),
    Purged(usize),
}

impl fmt::Debug for StorageReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageReply::Flag(v) => f.debug_tuple("Flag").field(v).finish(),
            StorageReply::Id(v) => f.debug_tuple("Id").field(v).finish(),
            StorageReply::Record(v) => f.debug_tuple("Record").field(v).finish(),
            StorageReply::Held(v) => f
                .debug_tuple("Held")
                .field(&v.as_ref().map(|(record, _)| record.id))
                .finish(),
            StorageReply::Cas(v) => f.debug_tuple("Cas").field(v).finish(),
            StorageReply::Records(v) => f.debug_tuple("Records").field(&v.len()).finish(),
            StorageReply::ExpiredLeases(v) => f.debug_tuple("ExpiredLeases").field(v).finish(),
            StorageReply::Ids(v) => f.debug_tuple("Ids").field(v).finish(),
            StorageReply::Counts(v) => f.debug_tuple("Counts").field(v).finish(),
            StorageReply::Status(v) => f.debug_tuple("Status").field(v).finish(),
            StorageReply::Purged(v) => f.debug_tuple("Purged").field(v).finish(),
        }
    }
}

/// Rest of the chain, handed to each layer.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    layers: &'a [Arc<dyn Layer>],
    inner: &'a dyn StorageAdapter,
}

impl<'a> Next<'a> {
    /// Run the remaining layers, then the adapter. May be called more than
    /// once (retry).
    pub async fn run(self, op: StorageOp) -> Result<StorageReply, StorageError> {
        match self.layers.split_first() {
            Some((layer, rest)) => {
                let next = Next {
                    layers: rest,
                    inner: self.inner,
                };
                layer.call(op, next).await
            }
            None => execute(self.inner, op).await,
        }
    }
}

/// One concern wrapped around every adapter call.
#[async_trait]
pub trait Layer: Send + Sync {
    async fn call(&self, op: StorageOp, next: Next<'_>) -> Result<StorageReply, StorageError>;
}

async fn execute(
    adapter: &dyn StorageAdapter,
    op: StorageOp,
) -> Result<StorageReply, StorageError> {
    Ok(match op {
        StorageOp::QueueExists => StorageReply::Flag(adapter.queue_exists().await?),
        StorageOp::CreateQueue(options) => {
            StorageReply::Flag(adapter.create_queue(&options).await?)
        }
        StorageOp::RemoveQueue => StorageReply::Flag(adapter.remove_queue().await?),
        StorageOp::Insert(message) => StorageReply::Id(adapter.insert(message).await?),
        StorageOp::ClaimOne(request) => StorageReply::Record(adapter.claim_one(&request).await?),
        StorageOp::ClaimHeld(request) => StorageReply::Held(adapter.claim_held(&request).await?),
        StorageOp::UpdateIfLeased {
            id,
            lease_token,
            update,
        } => StorageReply::Cas(adapter.update_if_leased(id, lease_token, update).await?),
        StorageOp::DeleteIfLeased { id, lease_token } => {
            StorageReply::Cas(adapter.delete_if_leased(id, lease_token).await?)
        }
        StorageOp::ReclaimIfExpired {
            id,
            lease_token,
            now,
            update,
        } => StorageReply::Cas(
            adapter
                .reclaim_if_expired(id, lease_token, now, update)
                .await?,
        ),
        StorageOp::Delete(id) => StorageReply::Flag(adapter.delete(id).await?),
        StorageOp::Get(id) => StorageReply::Record(adapter.get(id).await?),
        StorageOp::QueryWaiting {
            now,
            honor_delay,
            honor_priority,
            limit,
        } => StorageReply::Records(
            adapter
                .query_waiting(now, honor_delay, honor_priority, limit)
                .await?,
        ),
        StorageOp::FindExpiredLeases { now, limit } => {
            StorageReply::ExpiredLeases(adapter.find_expired_leases(now, limit).await?)
        }
        StorageOp::FindExpiredMessages { now, limit } => {
            StorageReply::Ids(adapter.find_expired_messages(now, limit).await?)
        }
        StorageOp::ListByStatus { status, limit } => {
            StorageReply::Records(adapter.list_by_status(status, limit).await?)
        }
        StorageOp::Counts => StorageReply::Counts(adapter.counts().await?),
        StorageOp::StatusProjection(id) => {
            StorageReply::Status(adapter.status_projection(id).await?)
        }
        StorageOp::InsertTriggerIfAbsent(record) => {
            StorageReply::Flag(adapter.insert_trigger_if_absent(record).await?)
        }
        StorageOp::PurgeTriggersBefore(cutoff) => {
            StorageReply::Purged(adapter.purge_triggers_before(cutoff).await?)
        }
    })
}

/// An adapter wrapped in an ordered list of layers.
pub struct AdapterStack {
    inner: Arc<dyn StorageAdapter>,
    layers: Vec<Arc<dyn Layer>>,
}

impl AdapterStack {
    pub fn new(inner: Arc<dyn StorageAdapter>) -> Self {
        Self {
            inner,
            layers: Vec::new(),
        }
    }

    /// Append a layer inside the ones already added.
    pub fn layer(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    async fn dispatch(&self, op: StorageOp) -> Result<StorageReply, StorageError> {
        Next {
            layers: &self.layers,
            inner: self.inner.as_ref(),
        }
        .run(op)
        .await
    }
}

fn mismatch(op: &'static str, reply: StorageReply) -> StorageError {
    StorageError::Fatal(format!("middleware returned {reply:?} for {op}"))
}

#[async_trait]
impl StorageAdapter for AdapterStack {
    fn kind(&self) -> AdapterKind {
        self.inner.kind()
    }

    fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    async fn queue_exists(&self) -> Result<bool, StorageError> {
        match self.dispatch(StorageOp::QueueExists).await? {
            StorageReply::Flag(v) => Ok(v),
            other => Err(mismatch("queue_exists", other)),
        }
    }

    async fn create_queue(&self, options: &QueueOptions) -> Result<bool, StorageError> {
        match self.dispatch(StorageOp::CreateQueue(options.clone())).await? {
            StorageReply::Flag(v) => Ok(v),
            other => Err(mismatch("create_queue", other)),
        }
    }

    async fn remove_queue(&self) -> Result<bool, StorageError> {
        match self.dispatch(StorageOp::RemoveQueue).await? {
            StorageReply::Flag(v) => Ok(v),
            other => Err(mismatch("remove_queue", other)),
        }
    }

    async fn insert(&self, message: NewMessage) -> Result<MessageId, StorageError> {
        match self.dispatch(StorageOp::Insert(message)).await? {
            StorageReply::Id(v) => Ok(v),
            other => Err(mismatch("insert", other)),
        }
    }

    async fn claim_one(
        &self,
        request: &ClaimRequest,
    ) -> Result<Option<MessageRecord>, StorageError> {
        match self.dispatch(StorageOp::ClaimOne(request.clone())).await? {
            StorageReply::Record(v) => Ok(v),
            other => Err(mismatch("claim_one", other)),
        }
    }

    async fn claim_held(
        &self,
        request: &ClaimRequest,
    ) -> Result<Option<(MessageRecord, Box<dyn HeldTransaction>)>, StorageError> {
        match self.dispatch(StorageOp::ClaimHeld(request.clone())).await? {
            StorageReply::Held(v) => Ok(v),
            other => Err(mismatch("claim_held", other)),
        }
    }

    async fn update_if_leased(
        &self,
        id: MessageId,
        lease_token: LeaseToken,
        update: MessageUpdate,
    ) -> Result<CasOutcome, StorageError> {
        let op = StorageOp::UpdateIfLeased {
            id,
            lease_token,
            update,
        };
        match self.dispatch(op).await? {
            StorageReply::Cas(v) => Ok(v),
            other => Err(mismatch("update_if_leased", other)),
        }
    }

    async fn delete_if_leased(
        &self,
        id: MessageId,
        lease_token: LeaseToken,
    ) -> Result<CasOutcome, StorageError> {
        match self
            .dispatch(StorageOp::DeleteIfLeased { id, lease_token })
            .await?
        {
            StorageReply::Cas(v) => Ok(v),
            other => Err(mismatch("delete_if_leased", other)),
        }
    }

    async fn reclaim_if_expired(
        &self,
        id: MessageId,
        lease_token: LeaseToken,
        now: DateTime<Utc>,
        update: MessageUpdate,
    ) -> Result<CasOutcome, StorageError> {
        let op = StorageOp::ReclaimIfExpired {
            id,
            lease_token,
            now,
            update,
        };
        match self.dispatch(op).await? {
            StorageReply::Cas(v) => Ok(v),
            other => Err(mismatch("reclaim_if_expired", other)),
        }
    }

    async fn delete(&self, id: MessageId) -> Result<bool, StorageError> {
        match self.dispatch(StorageOp::Delete(id)).await? {
            StorageReply::Flag(v) => Ok(v),
            other => Err(mismatch("delete", other)),
        }
    }

    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>, StorageError> {
        match self.dispatch(StorageOp::Get(id)).await? {
            StorageReply::Record(v) => Ok(v),
            other => Err(mismatch("get", other)),
        }
    }

    async fn query_waiting(
        &self,
        now: DateTime<Utc>,
        honor_delay: bool,
        honor_priority: bool,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let op = StorageOp::QueryWaiting {
            now,
            honor_delay,
            honor_priority,
            limit,
        };
        match self.dispatch(op).await? {
            StorageReply::Records(v) => Ok(v),
            other => Err(mismatch("query_waiting", other)),
        }
    }

    async fn find_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredLease>, StorageError> {
        match self
            .dispatch(StorageOp::FindExpiredLeases { now, limit })
            .await?
        {
            StorageReply::ExpiredLeases(v) => Ok(v),
            other => Err(mismatch("find_expired_leases", other)),
        }
    }

    async fn find_expired_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageId>, StorageError> {
        match self
            .dispatch(StorageOp::FindExpiredMessages { now, limit })
            .await?
        {
            StorageReply::Ids(v) => Ok(v),
            other => Err(mismatch("find_expired_messages", other)),
        }
    }

    async fn list_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        match self
            .dispatch(StorageOp::ListByStatus { status, limit })
            .await?
        {
            StorageReply::Records(v) => Ok(v),
            other => Err(mismatch("list_by_status", other)),
        }
    }

    async fn counts(&self) -> Result<QueueCounts, StorageError> {
        match self.dispatch(StorageOp::Counts).await? {
            StorageReply::Counts(v) => Ok(v),
            other => Err(mismatch("counts", other)),
        }
    }

    async fn status_projection(
        &self,
        id: MessageId,
    ) -> Result<Option<MessageStatus>, StorageError> {
        match self.dispatch(StorageOp::StatusProjection(id)).await? {
            StorageReply::Status(v) => Ok(v),
            other => Err(mismatch("status_projection", other)),
        }
    }

    async fn insert_trigger_if_absent(&self, record: TriggerRecord) -> Result<bool, StorageError> {
        match self
            .dispatch(StorageOp::InsertTriggerIfAbsent(record))
            .await?
        {
            StorageReply::Flag(v) => Ok(v),
            other => Err(mismatch("insert_trigger_if_absent", other)),
        }
    }

    async fn purge_triggers_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        match self.dispatch(StorageOp::PurgeTriggersBefore(cutoff)).await? {
            StorageReply::Purged(v) => Ok(v),
            other => Err(mismatch("purge_triggers_before", other)),
        }
    }
}

/// Retries transient storage errors with jittered exponential backoff.
///
/// Once `max_attempts` is spent the last error is surfaced as `Fatal`.
#[derive(Debug, Clone)]
pub struct RetryLayer {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryLayer {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryLayer {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_ms = exp.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl Layer for RetryLayer {
    async fn call(&self, op: StorageOp, next: Next<'_>) -> Result<StorageReply, StorageError> {
        let mut attempt = 1;
        loop {
            match next.run(op.clone()).await {
                Err(e) if e.is_transient() => {
                    if attempt >= self.max_attempts {
                        return Err(StorageError::Fatal(format!(
                            "{op} failed after {attempt} attempts: {e}"
                        )));
                    }
                    let delay = self.delay(attempt);
                    warn!(op = op.name(), attempt, ?delay, error = %e, "transient storage error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Logs each call's duration; calls slower than `slow_threshold` at `warn`.
#[derive(Debug, Clone)]
pub struct TimingLayer {
    pub slow_threshold: Duration,
}

impl Default for TimingLayer {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl Layer for TimingLayer {
    async fn call(&self, op: StorageOp, next: Next<'_>) -> Result<StorageReply, StorageError> {
        let name = op.name();
        let started = Instant::now();
        let result = next.run(op).await;
        let elapsed = started.elapsed();
        if elapsed >= self.slow_threshold {
            warn!(op = name, ?elapsed, ok = result.is_ok(), "slow storage call");
        } else {
            debug!(op = name, ?elapsed, ok = result.is_ok(), "storage call");
        }
        result
    }
}

/// Rejects malformed calls before they reach the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationLayer;

impl ValidationLayer {
    fn check(op: &StorageOp) -> Result<(), String> {
        match op {
            StorageOp::Insert(message) => {
                if message.visible_at < message.enqueued_at {
                    return Err("visible_at precedes enqueued_at".into());
                }
                if message.expires_at.is_some_and(|at| at <= message.enqueued_at) {
                    return Err("expires_at must be after enqueued_at".into());
                }
            }
            StorageOp::ClaimOne(request) | StorageOp::ClaimHeld(request) => {
                if request.lease_expires_at.is_some_and(|at| at <= request.now) {
                    return Err("lease must expire after the claim time".into());
                }
            }
            StorageOp::UpdateIfLeased {
                update:
                    MessageUpdate::Renew {
                        renewed_at,
                        expires_at: Some(expires_at),
                    },
                ..
            } if expires_at <= renewed_at => {
                return Err("renewed lease must expire after the renewal time".into());
            }
            StorageOp::UpdateIfLeased { update, .. }
            | StorageOp::ReclaimIfExpired { update, .. } => {
                if let MessageUpdate::Requeue { error_count: 0, .. }
                | MessageUpdate::MarkError { error_count: 0, .. } = update
                {
                    return Err("a failed attempt must increase the error count".into());
                }
            }
            StorageOp::QueryWaiting { limit: 0, .. }
            | StorageOp::FindExpiredLeases { limit: 0, .. }
            | StorageOp::FindExpiredMessages { limit: 0, .. }
            | StorageOp::ListByStatus { limit: 0, .. } => {
                return Err("limit must be greater than zero".into());
            }
            StorageOp::InsertTriggerIfAbsent(record) if record.job_name.is_empty() => {
                return Err("trigger job name must not be empty".into());
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Layer for ValidationLayer {
    async fn call(&self, op: StorageOp, next: Next<'_>) -> Result<StorageReply, StorageError> {
        if let Err(reason) = Self::check(&op) {
            return Err(StorageError::InvalidRequest(format!("{op}: {reason}")));
        }
        next.run(op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CorrelationId, Headers};
    use crate::impls::InMemoryStorage;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls with a transient error.
    struct Flaky {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Layer for Flaky {
        async fn call(&self, op: StorageOp, next: Next<'_>) -> Result<StorageReply, StorageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(StorageError::Transient("connection reset".into()));
            }
            next.run(op).await
        }
    }

    async fn storage() -> Arc<dyn StorageAdapter> {
        let storage = InMemoryStorage::new("mw");
        storage.create_queue(&QueueOptions::standard()).await.unwrap();
        Arc::new(storage)
    }

    fn quick_retry(max_attempts: u32) -> RetryLayer {
        RetryLayer {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn message() -> NewMessage {
        let now = Utc::now();
        NewMessage {
            correlation_id: CorrelationId::none(),
            body: vec![],
            headers: Headers::new(),
            priority: 0,
            enqueued_at: now,
            visible_at: now,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let stack = AdapterStack::new(storage().await)
            .layer(quick_retry(3))
            .layer(Flaky {
                failures: 2,
                calls: Arc::clone(&calls),
            });

        assert_eq!(stack.counts().await.unwrap().total(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_as_fatal() {
        let calls = Arc::new(AtomicU32::new(0));
        let stack = AdapterStack::new(storage().await)
            .layer(quick_retry(2))
            .layer(Flaky {
                failures: 10,
                calls: Arc::clone(&calls),
            });

        let err = stack.counts().await.unwrap_err();
        assert!(matches!(err, StorageError::Fatal(msg) if msg.contains("counts")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn validation_rejects_before_backend() {
        let stack = AdapterStack::new(storage().await).layer(ValidationLayer);
        let mut bad = message();
        bad.expires_at = Some(bad.enqueued_at);

        let err = stack.insert(bad).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidRequest(_)));
        assert_eq!(stack.counts().await.unwrap().total(), 0);

        let err = stack.list_by_status(MessageStatus::Error, 0).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidRequest(msg) if msg.starts_with("list_by_status")));
    }

    #[tokio::test]
    async fn full_stack_is_transparent() {
        let stack = AdapterStack::new(storage().await)
            .layer(ValidationLayer)
            .layer(TimingLayer::default())
            .layer(RetryLayer::default());
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.kind(), AdapterKind::InMemory);

        let id = stack.insert(message()).await.unwrap();
        let got = stack.get(id).await.unwrap().unwrap();
        assert_eq!(got.status, MessageStatus::Waiting);
    }
}
