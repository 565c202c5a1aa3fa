//! In-memory storage adapter.
//!
//! One `InMemoryBackend` holds any number of queues keyed by name; an
//! `InMemoryStorage` is the adapter bound to one of them. Clones of the backend
//! share state, so several "processes" (stores, worker pools, schedulers) can
//! race against the same queue in tests.
//!
//! Every adapter method runs under one `parking_lot` mutex and never awaits
//! while holding it, which is what makes claim, CAS updates and trigger
//! inserts atomic here.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::QueueOptions;
use crate::domain::{
    LeaseToken, MessageId, MessageRecord, MessageStatus, MessageUpdate, NewMessage, QueueCounts,
    TriggerRecord,
};
use crate::error::StorageError;
use crate::ports::{
    AdapterKind, CasOutcome, ClaimRequest, ExpiredLease, HeldTransaction, StorageAdapter,
};

/// One queue's tables.
#[derive(Debug)]
struct QueueTables {
    messages: BTreeMap<MessageId, MessageRecord>,
    /// Denormalized `id -> status`, present with EnableStatusTable.
    status_table: Option<HashMap<MessageId, MessageStatus>>,
    triggers: HashMap<(String, DateTime<Utc>), TriggerRecord>,
    next_id: u64,
}

impl QueueTables {
    fn new(options: &QueueOptions) -> Self {
        let status_table = options.enable_status_table.then(HashMap::new);
        Self {
            messages: BTreeMap::new(),
            status_table,
            triggers: HashMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Keep the projection in step with the primary table.
    fn project(&mut self, id: MessageId, status: Option<MessageStatus>) {
        if let Some(table) = self.status_table.as_mut() {
            match status {
                Some(status) => {
                    table.insert(id, status);
                }
                None => {
                    table.remove(&id);
                }
            }
        }
    }

    fn update(&mut self, id: MessageId, update: MessageUpdate) {
        let status = self.messages.get_mut(&id).map(|record| {
            record.apply(update);
            record.status
        });
        if let Some(status) = status {
            self.project(id, Some(status));
        }
    }

    fn remove(&mut self, id: MessageId) -> Option<MessageRecord> {
        let removed = self.messages.remove(&id);
        if removed.is_some() {
            self.project(id, None);
        }
        removed
    }

    /// Waiting records eligible at `now`, in claim order.
    fn waiting(
        &self,
        now: DateTime<Utc>,
        honor_delay: bool,
        honor_priority: bool,
    ) -> Vec<&MessageRecord> {
        let mut eligible: Vec<&MessageRecord> = self
            .messages
            .values()
            .filter(|r| r.is_claimable(now, honor_delay))
            .collect();
        if honor_priority {
            eligible.sort_by_key(|r| (Reverse(r.priority), r.visible_at, r.id));
        } else {
            eligible.sort_by_key(|r| (r.visible_at, r.id));
        }
        eligible
    }

    fn claim(&mut self, request: &ClaimRequest) -> Option<MessageRecord> {
        let id = self
            .waiting(request.now, request.honor_delay, request.honor_priority)
            .first()
            .map(|r| r.id)?;
        let record = self.messages.get_mut(&id)?;
        record.claim(request.lease_token, request.now, request.lease_expires_at);
        let claimed = record.clone();
        self.project(id, Some(MessageStatus::Processing));
        Some(claimed)
    }
}

#[derive(Debug, Default)]
struct BackendState {
    queues: HashMap<String, QueueTables>,
}

/// Shared in-memory store for any number of queues.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter bound to queue `name`.
    pub fn adapter(&self, name: impl Into<String>) -> InMemoryStorage {
        InMemoryStorage {
            name: name.into(),
            kind: AdapterKind::InMemory,
            state: Arc::clone(&self.state),
        }
    }
}

/// `StorageAdapter` over an `InMemoryBackend`.
#[derive(Debug, Clone)]
pub struct InMemoryStorage {
    name: String,
    kind: AdapterKind,
    state: Arc<Mutex<BackendState>>,
}

impl InMemoryStorage {
    /// Adapter over a fresh, private backend.
    pub fn new(name: impl Into<String>) -> Self {
        InMemoryBackend::new().adapter(name)
    }

    /// Report a different adapter family. Only used to exercise kind-specific
    /// validation; a non-transactional kind also disables `claim_held`.
    pub fn with_kind(mut self, kind: AdapterKind) -> Self {
        self.kind = kind;
        self
    }

    fn with_tables<T>(
        &self,
        f: impl FnOnce(&mut QueueTables) -> T,
    ) -> Result<T, StorageError> {
        let mut state = self.state.lock();
        let tables = state
            .queues
            .get_mut(&self.name)
            .ok_or_else(|| StorageError::QueueNotFound(self.name.clone()))?;
        Ok(f(tables))
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn queue_exists(&self) -> Result<bool, StorageError> {
        Ok(self.state.lock().queues.contains_key(&self.name))
    }

    async fn create_queue(&self, options: &QueueOptions) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        if state.queues.contains_key(&self.name) {
            return Ok(false);
        }
        state
            .queues
            .insert(self.name.clone(), QueueTables::new(options));
        Ok(true)
    }

    async fn remove_queue(&self) -> Result<bool, StorageError> {
        Ok(self.state.lock().queues.remove(&self.name).is_some())
    }

    async fn insert(&self, message: NewMessage) -> Result<MessageId, StorageError> {
        self.with_tables(|tables| {
            let id = tables.allocate_id();
            tables
                .messages
                .insert(id, MessageRecord::from_new(id, message));
            tables.project(id, Some(MessageStatus::Waiting));
            id
        })
    }

    async fn claim_one(
        &self,
        request: &ClaimRequest,
    ) -> Result<Option<MessageRecord>, StorageError> {
        self.with_tables(|tables| tables.claim(request))
    }

    async fn claim_held(
        &self,
        request: &ClaimRequest,
    ) -> Result<Option<(MessageRecord, Box<dyn HeldTransaction>)>, StorageError> {
        if !self.kind.supports_held_transactions() {
            return Err(StorageError::Unsupported("claim_held"));
        }
        self.with_tables(|tables| {
            let id = tables
                .waiting(request.now, request.honor_delay, request.honor_priority)
                .first()
                .map(|r| r.id)?;
            let snapshot = tables.messages.get(&id)?.clone();
            let claimed = tables.claim(request)?;
            let tx: Box<dyn HeldTransaction> = Box::new(InMemoryHeldTransaction {
                queue: self.name.clone(),
                state: Arc::clone(&self.state),
                snapshot: Some(snapshot),
            });
            Some((claimed, tx))
        })
    }

    async fn update_if_leased(
        &self,
        id: MessageId,
        lease_token: LeaseToken,
        update: MessageUpdate,
    ) -> Result<CasOutcome, StorageError> {
        self.with_tables(|tables| {
            let owned = tables
                .messages
                .get(&id)
                .is_some_and(|r| r.holds_lease(lease_token));
            if !owned {
                return CasOutcome::Conflict;
            }
            tables.update(id, update);
            CasOutcome::Applied
        })
    }

    async fn delete_if_leased(
        &self,
        id: MessageId,
        lease_token: LeaseToken,
    ) -> Result<CasOutcome, StorageError> {
        self.with_tables(|tables| {
            let owned = tables
                .messages
                .get(&id)
                .is_some_and(|r| r.holds_lease(lease_token));
            if !owned {
                return CasOutcome::Conflict;
            }
            tables.remove(id);
            CasOutcome::Applied
        })
    }

    async fn reclaim_if_expired(
        &self,
        id: MessageId,
        lease_token: LeaseToken,
        now: DateTime<Utc>,
        update: MessageUpdate,
    ) -> Result<CasOutcome, StorageError> {
        self.with_tables(|tables| {
            let reclaimable = tables
                .messages
                .get(&id)
                .is_some_and(|r| r.holds_lease(lease_token) && r.lease_expired(now));
            if !reclaimable {
                return CasOutcome::Conflict;
            }
            tables.update(id, update);
            CasOutcome::Applied
        })
    }

    async fn delete(&self, id: MessageId) -> Result<bool, StorageError> {
        self.with_tables(|tables| tables.remove(id).is_some())
    }

    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>, StorageError> {
        self.with_tables(|tables| tables.messages.get(&id).cloned())
    }

    async fn query_waiting(
        &self,
        now: DateTime<Utc>,
        honor_delay: bool,
        honor_priority: bool,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        self.with_tables(|tables| {
            tables
                .waiting(now, honor_delay, honor_priority)
                .into_iter()
                .take(limit)
                .cloned()
                .collect()
        })
    }

    async fn find_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredLease>, StorageError> {
        self.with_tables(|tables| {
            tables
                .messages
                .values()
                .filter(|r| r.lease_expired(now))
                .filter_map(|r| {
                    r.lease_token().map(|lease_token| ExpiredLease {
                        id: r.id,
                        lease_token,
                        error_count: r.error_count,
                    })
                })
                .take(limit)
                .collect()
        })
    }

    async fn find_expired_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageId>, StorageError> {
        self.with_tables(|tables| {
            tables
                .messages
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.id)
                .take(limit)
                .collect()
        })
    }

    async fn list_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        self.with_tables(|tables| {
            tables
                .messages
                .values()
                .filter(|r| r.status == status)
                .take(limit)
                .cloned()
                .collect()
        })
    }

    async fn counts(&self) -> Result<QueueCounts, StorageError> {
        self.with_tables(|tables| {
            let mut counts = QueueCounts::default();
            for record in tables.messages.values() {
                match record.status {
                    MessageStatus::Waiting => counts.waiting += 1,
                    MessageStatus::Processing => counts.processing += 1,
                    MessageStatus::Error => counts.error += 1,
                    MessageStatus::Completed => {}
                }
            }
            counts
        })
    }

    async fn status_projection(
        &self,
        id: MessageId,
    ) -> Result<Option<MessageStatus>, StorageError> {
        self.with_tables(|tables| {
            tables
                .status_table
                .as_ref()
                .map(|table| table.get(&id).copied())
        })?
        .ok_or(StorageError::Unsupported("status_projection"))
    }

    async fn insert_trigger_if_absent(&self, record: TriggerRecord) -> Result<bool, StorageError> {
        self.with_tables(|tables| {
            let key = (record.job_name.clone(), record.scheduled_time);
            if tables.triggers.contains_key(&key) {
                return false;
            }
            tables.triggers.insert(key, record);
            true
        })
    }

    async fn purge_triggers_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        self.with_tables(|tables| {
            let before = tables.triggers.len();
            tables.triggers.retain(|(_, at), _| *at >= cutoff);
            before - tables.triggers.len()
        })
    }
}

/// Claim kept open across handler execution.
///
/// The claimed record is Processing while the transaction lives. Commit
/// deletes it; rollback (explicit or on drop) restores the pre-claim snapshot
/// and applies the optional update on top of it.
struct InMemoryHeldTransaction {
    queue: String,
    state: Arc<Mutex<BackendState>>,
    /// `None` once committed or rolled back.
    snapshot: Option<MessageRecord>,
}

impl InMemoryHeldTransaction {
    fn finish(&mut self, commit: bool, update: Option<MessageUpdate>) -> Result<(), StorageError> {
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };
        let mut state = self.state.lock();
        let tables = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| StorageError::QueueNotFound(self.queue.clone()))?;
        let id = snapshot.id;
        if commit {
            tables.remove(id);
            return Ok(());
        }
        let mut restored = snapshot;
        if let Some(update) = update {
            restored.apply(update);
        }
        let status = restored.status;
        tables.messages.insert(id, restored);
        tables.project(id, Some(status));
        Ok(())
    }
}

#[async_trait]
impl HeldTransaction for InMemoryHeldTransaction {
    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish(true, None)
    }

    async fn rollback(mut self: Box<Self>, update: Option<MessageUpdate>) -> Result<(), StorageError> {
        self.finish(false, update)
    }
}

impl Drop for InMemoryHeldTransaction {
    fn drop(&mut self) {
        if self.snapshot.is_some() {
            if let Err(e) = self.finish(false, None) {
                tracing::warn!(queue = %self.queue, error = %e, "held transaction rollback on drop failed");
            }
        }
    }
}
