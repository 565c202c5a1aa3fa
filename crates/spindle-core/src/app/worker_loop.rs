//! Consumer worker pool.
//!
//! Each worker loops: claim -> (nothing: idle backoff) -> run handler under a
//! heartbeat -> commit / rollback. On shutdown a `watch` flag stops new
//! claims and in-flight handlers get a grace period. After that a
//! `CancellationToken` cancels whatever is left and the unfinished messages
//! are released.

use std::any::Any;
use std::ops::AddAssign;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::app::gc_loop::ExpirationSweeper;
use crate::app::heartbeat::{HeartbeatMonitor, HeartbeatStatus, deadline_after};
use crate::app::reaper_loop::LeaseSweeper;
use crate::config::ConsumerConfig;
use crate::domain::{
    CommitOutcome, CorrelationId, Headers, MessageId, MessageRecord, RollbackOutcome,
};
use crate::error::{QueueError, QueueResult};
use crate::handler::{HandlerError, MessageHandler};
use crate::queue::{Claim, Failure, MessageStore};

/// What a handler can observe about its own execution.
///
/// handler 側からキャンセルや lease の状態を確認するためのハンドル。
#[derive(Clone)]
pub struct WorkerNotification {
    heartbeat: watch::Receiver<HeartbeatStatus>,
    cancel: CancellationToken,
    stopping: watch::Receiver<bool>,
}

impl WorkerNotification {
    fn new(
        heartbeat: watch::Receiver<HeartbeatStatus>,
        cancel: CancellationToken,
        stopping: watch::Receiver<bool>,
    ) -> Self {
        Self {
            heartbeat,
            cancel,
            stopping,
        }
    }

    /// Not attached to any pool: never cancelled, heartbeat disabled.
    pub fn detached() -> Self {
        let (_, heartbeat) = watch::channel(HeartbeatStatus::Disabled);
        let (_, stopping) = watch::channel(false);
        Self::new(heartbeat, CancellationToken::new(), stopping)
    }

    pub fn heartbeat(&self) -> HeartbeatStatus {
        self.heartbeat.borrow().clone()
    }

    /// The handler should stop: lease lost or shutdown grace elapsed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The pool stopped taking new work; this handler may still finish.
    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }
}

/// Read-only view of a claimed message for the duration of one handler call.
pub struct MessageContext<'a> {
    record: &'a MessageRecord,
    notification: WorkerNotification,
}

impl<'a> MessageContext<'a> {
    pub fn new(record: &'a MessageRecord, notification: WorkerNotification) -> Self {
        Self {
            record,
            notification,
        }
    }

    pub fn id(&self) -> MessageId {
        self.record.id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.record.correlation_id
    }

    pub fn body(&self) -> &[u8] {
        &self.record.body
    }

    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.record.body).map_err(HandlerError::failed)
    }

    pub fn headers(&self) -> &Headers {
        &self.record.headers
    }

    /// Previous failed attempts.
    pub fn error_count(&self) -> u32 {
        self.record.error_count
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.record.enqueued_at
    }

    pub fn notification(&self) -> &WorkerNotification {
        &self.notification
    }
}

/// Per-worker tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub committed: usize,
    pub requeued: usize,
    pub poisoned: usize,
    pub expired: usize,
    pub released: usize,
    pub conflicts: usize,
    /// Abandoned after a lost or failed heartbeat.
    pub abandoned: usize,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.committed += other.committed;
        self.requeued += other.requeued;
        self.poisoned += other.poisoned;
        self.expired += other.expired;
        self.released += other.released;
        self.conflicts += other.conflicts;
        self.abandoned += other.abandoned;
    }
}

/// Summary returned by `WorkerPool::shutdown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub stats: WorkerStats,
    /// Handlers were still running when the grace period ran out.
    pub forced: bool,
}

/// Fixed-size set of workers on one queue, plus the sweeps the queue's
/// options call for.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    hard_cancel: CancellationToken,
    workers: Vec<JoinHandle<WorkerStats>>,
    sweepers: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl WorkerPool {
    /// Validate `config` and spawn `config.workers` workers.
    ///
    /// With EnableHeartBeat a lease sweeper runs alongside; with
    /// EnableMessageExpiration an expiration sweeper does.
    pub fn start(
        store: Arc<MessageStore>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> QueueResult<Self> {
        config.validate()?;
        store.ensure_live()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hard_cancel = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(
            Arc::clone(&store),
            config.heartbeat_interval,
            config.lease_duration,
        );
        let config = Arc::new(config);

        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let worker = Worker {
                id: worker_id,
                store: Arc::clone(&store),
                handler: Arc::clone(&handler),
                monitor: monitor.clone(),
                config: Arc::clone(&config),
                shutdown: shutdown_rx.clone(),
                hard_cancel: hard_cancel.clone(),
            };
            let span = info_span!("worker", queue = %store.queue_name(), worker_id);
            workers.push(tokio::spawn(worker.run().instrument(span)));
        }

        let mut sweepers = Vec::new();
        if store.options().enable_heart_beat {
            let sweeper = LeaseSweeper::new(
                Arc::clone(&store),
                config.retry.clone(),
                config.sweep_interval,
            );
            sweepers.push(sweeper.spawn(shutdown_rx.clone()));
        }
        if store.options().enable_message_expiration {
            let sweeper =
                ExpirationSweeper::new(Arc::clone(&store), config.expiration_sweep_interval);
            sweepers.push(sweeper.spawn(shutdown_rx.clone()));
        }

        info!(queue = %store.queue_name(), workers = config.workers, "worker pool started");
        Ok(Self {
            shutdown_tx,
            hard_cancel,
            workers,
            sweepers,
            grace: config.shutdown_grace,
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop claiming new messages. In-flight handlers keep running.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop, give in-flight handlers the grace period, then cancel and
    /// release whatever is left. Resolves once every worker has exited.
    pub async fn shutdown(mut self) -> PoolReport {
        self.request_shutdown();
        let deadline = deadline_after(self.grace);
        let mut report = PoolReport::default();
        let mut unfinished = Vec::new();

        for mut join in self.workers.drain(..) {
            if report.forced {
                unfinished.push(join);
                continue;
            }
            match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(joined) => report.stats += collect(joined),
                Err(_) => {
                    report.forced = true;
                    unfinished.push(join);
                }
            }
        }
        if report.forced {
            warn!(grace = ?self.grace, "shutdown grace elapsed, cancelling handlers");
            self.hard_cancel.cancel();
            for join in unfinished {
                report.stats += collect(join.await);
            }
        }
        for join in self.sweepers.drain(..) {
            let _ = join.await;
        }
        info!(?report, "worker pool stopped");
        report
    }
}

fn collect(joined: Result<WorkerStats, tokio::task::JoinError>) -> WorkerStats {
    joined.unwrap_or_else(|e| {
        error!(error = %e, "worker task failed");
        WorkerStats::default()
    })
}

/// panic payload から表示用の文字列を取り出す
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

struct Worker {
    id: usize,
    store: Arc<MessageStore>,
    handler: Arc<dyn MessageHandler>,
    monitor: HeartbeatMonitor,
    config: Arc<ConsumerConfig>,
    shutdown: watch::Receiver<bool>,
    hard_cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) -> WorkerStats {
        let mut stats = WorkerStats::default();
        let mut idle = self.config.idle_backoff_min;
        debug!(worker_id = self.id, "worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.store.try_claim(self.config.lease_duration).await {
                Ok(Some(claim)) => {
                    idle = self.config.idle_backoff_min;
                    self.process(claim, &mut stats).await;
                }
                Ok(None) => {
                    self.idle_wait(idle).await;
                    idle = (idle * 2).min(self.config.idle_backoff_max);
                }
                Err(QueueError::Disposed) => break,
                Err(e) => {
                    warn!(error = %e, "claim failed");
                    self.idle_wait(idle).await;
                    idle = (idle * 2).min(self.config.idle_backoff_max);
                }
            }
        }
        debug!(worker_id = self.id, ?stats, "worker stopped");
        stats
    }

    async fn idle_wait(&mut self, wait: Duration) {
        tokio::select! {
            _ = self.shutdown.changed() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    async fn process(&self, mut claim: Claim, stats: &mut WorkerStats) {
        let cancel = self.hard_cancel.child_token();
        let heartbeat = self.monitor.start(claim.lease, cancel.clone());
        let notification =
            WorkerNotification::new(heartbeat.subscribe(), cancel.clone(), self.shutdown.clone());

        let result = {
            let ctx = MessageContext::new(&claim.record, notification);
            let handled = AssertUnwindSafe(self.handler.handle(&ctx)).catch_unwind();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = handled => Some(result.unwrap_or_else(|panic| {
                    let reason = panic_message(panic.as_ref());
                    error!(id = %claim.id(), %reason, "handler panicked");
                    Err(HandlerError::failed(format!("handler panicked: {reason}")))
                })),
            }
        };
        let status = heartbeat.stop().await;
        if let Some(at) = status.last_renewed_at() {
            claim.lease.last_renewed_at = at;
        }

        let id = claim.id();
        match (result, status) {
            (_, HeartbeatStatus::Lost) => {
                warn!(%id, "lease lost during processing, leaving message to its new owner");
                stats.abandoned += 1;
            }
            (_, HeartbeatStatus::Failed(reason)) => {
                // never commit without a live lease
                warn!(%id, %reason, "heartbeat failed, rolling back instead of committing");
                stats.abandoned += 1;
                let failure = Failure::error(format!("heartbeat failed: {reason}"));
                self.rollback(claim, failure, stats).await;
            }
            (None, _) => {
                debug!(%id, "handler cancelled by shutdown, releasing message");
                match self.store.release(claim).await {
                    Ok(true) => stats.released += 1,
                    Ok(false) => stats.conflicts += 1,
                    Err(e) => error!(%id, error = %e, "release failed"),
                }
            }
            (Some(Ok(())), _) => match self.store.commit(claim).await {
                Ok(CommitOutcome::Committed) => stats.committed += 1,
                Ok(CommitOutcome::Conflict) => stats.conflicts += 1,
                Err(e) => error!(%id, error = %e, "commit failed"),
            },
            (Some(Err(err)), _) => {
                let failure = match err {
                    HandlerError::Failed(reason) => Failure::error(reason),
                    HandlerError::Rollback { delay } => Failure {
                        error: None,
                        delay,
                    },
                };
                self.rollback(claim, failure, stats).await;
            }
        }
    }

    async fn rollback(&self, claim: Claim, failure: Failure, stats: &mut WorkerStats) {
        let id = claim.id();
        match self.store.rollback(claim, failure, &self.config.retry).await {
            Ok(RollbackOutcome::Requeued { .. }) => stats.requeued += 1,
            Ok(RollbackOutcome::Poisoned { .. }) => stats.poisoned += 1,
            Ok(RollbackOutcome::Expired) => stats.expired += 1,
            Ok(RollbackOutcome::Conflict) => stats.conflicts += 1,
            Err(e) => error!(%id, error = %e, "rollback failed"),
        }
    }
}
