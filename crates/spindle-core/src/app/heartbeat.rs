//! Heartbeat monitor: keeps a claimed message's lease alive while its handler
//! runs.
//!
//! The renewal task is scoped to one message. It is stopped when processing
//! ends and aborted if the guard is dropped during an unwind.
//!
//! 更新に失敗したら handler をキャンセルし、commit はさせない。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::RenewOutcome;
use crate::queue::{LeaseHandle, MessageStore};

/// Roughly thirty years; stands in for "never" when a deadline would overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + wait`, saturating to a far-off instant instead of panicking.
pub(crate) fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Lease state as seen by the worker and the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// Heartbeats are off for this queue.
    Disabled,
    Healthy { last_renewed_at: DateTime<Utc> },
    /// Someone else owns the message now.
    Lost,
    /// Renewal failed; the lease may be lost at any moment.
    Failed(String),
}

impl HeartbeatStatus {
    /// Commit is only allowed while this holds.
    pub fn can_commit(&self) -> bool {
        matches!(
            self,
            HeartbeatStatus::Disabled | HeartbeatStatus::Healthy { .. }
        )
    }

    pub fn last_renewed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            HeartbeatStatus::Healthy { last_renewed_at } => Some(*last_renewed_at),
            _ => None,
        }
    }
}

/// Starts renewal tasks.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    store: Arc<MessageStore>,
    interval: Duration,
    lease_duration: Duration,
}

impl HeartbeatMonitor {
    pub fn new(store: Arc<MessageStore>, interval: Duration, lease_duration: Duration) -> Self {
        Self {
            store,
            interval,
            lease_duration,
        }
    }

    /// Renew `lease` every `interval` until the guard is stopped or dropped.
    ///
    /// On a lost lease or a failed renewal, `cancel` is triggered so the
    /// handler can stop early.
    pub fn start(&self, lease: LeaseHandle, cancel: CancellationToken) -> HeartbeatGuard {
        if !self.store.options().enable_heart_beat {
            return HeartbeatGuard::disabled();
        }
        let (tx, rx) = watch::channel(HeartbeatStatus::Healthy {
            last_renewed_at: lease.last_renewed_at,
        });
        let store = Arc::clone(&self.store);
        let interval = self.interval;
        let lease_duration = self.lease_duration;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(deadline_after(interval), interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.renew(&lease, lease_duration).await {
                    Ok(RenewOutcome::Renewed { .. }) => {
                        let now = store.now();
                        debug!(id = %lease.id, "lease renewed");
                        let _ = tx.send(HeartbeatStatus::Healthy {
                            last_renewed_at: now,
                        });
                    }
                    Ok(RenewOutcome::Lost) => {
                        warn!(id = %lease.id, "lease lost, cancelling handler");
                        let _ = tx.send(HeartbeatStatus::Lost);
                        cancel.cancel();
                        break;
                    }
                    Err(e) => {
                        warn!(id = %lease.id, error = %e, "lease renewal failed, cancelling handler");
                        let _ = tx.send(HeartbeatStatus::Failed(e.to_string()));
                        cancel.cancel();
                        break;
                    }
                }
            }
        });

        HeartbeatGuard {
            status: rx,
            task: Some(task),
        }
    }
}

/// Owns one renewal task. Dropping it aborts the task.
pub struct HeartbeatGuard {
    status: watch::Receiver<HeartbeatStatus>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatGuard {
    pub fn disabled() -> Self {
        let (_, rx) = watch::channel(HeartbeatStatus::Disabled);
        Self {
            status: rx,
            task: None,
        }
    }

    pub fn status(&self) -> HeartbeatStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HeartbeatStatus> {
        self.status.clone()
    }

    /// Stop renewing and return the final status.
    pub async fn stop(mut self) -> HeartbeatStatus {
        if let Some(task) = self.task.take() {
            task.abort();
            // a renewal in flight may still publish its result
            let _ = task.await;
        }
        self.status()
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use crate::domain::{CorrelationId, Headers, NewMessage};
    use crate::impls::InMemoryStorage;
    use crate::ports::{StorageAdapter, SystemClock};
    use crate::queue::RetryPolicy;

    async fn store(options: QueueOptions) -> Arc<MessageStore> {
        let storage = InMemoryStorage::new("hb");
        storage.create_queue(&options).await.unwrap();
        Arc::new(MessageStore::new(Arc::new(storage), options, Arc::new(SystemClock)))
    }

    async fn enqueue(store: &MessageStore) {
        let now = store.now();
        store
            .enqueue(NewMessage {
                correlation_id: CorrelationId::none(),
                body: vec![],
                headers: Headers::new(),
                priority: 0,
                enqueued_at: now,
                visible_at: now,
                expires_at: None,
            })
            .await
            .unwrap();
    }

    #[test]
    fn deadline_saturates_instead_of_overflowing() {
        let now = Instant::now();
        assert!(deadline_after(Duration::MAX) > now);
        let near = deadline_after(Duration::from_secs(1));
        assert!(near > now && near <= Instant::now() + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn renews_while_running() {
        let store = store(QueueOptions::standard()).await;
        enqueue(&store).await;
        let lease_duration = Duration::from_millis(300);
        let claim = store.try_claim(lease_duration).await.unwrap().unwrap();

        let monitor = HeartbeatMonitor::new(Arc::clone(&store), Duration::from_millis(50), lease_duration);
        let guard = monitor.start(claim.lease, CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(500)).await;

        // still ours well past the original lease window
        let status = guard.stop().await;
        assert!(status.last_renewed_at().unwrap() > claim.lease.claimed_at);
        assert_eq!(
            store.reclaim_expired(&RetryPolicy::default(), 10).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn lost_lease_cancels_handler() {
        let store = store(QueueOptions::standard()).await;
        enqueue(&store).await;
        let lease_duration = Duration::from_millis(300);
        let claim = store.try_claim(lease_duration).await.unwrap().unwrap();
        let lease = claim.lease;
        // someone else resolves the message
        store.commit(claim).await.unwrap();

        let cancel = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(Arc::clone(&store), Duration::from_millis(20), lease_duration);
        let guard = monitor.start(lease, cancel.clone());
        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .unwrap();
        assert_eq!(guard.stop().await, HeartbeatStatus::Lost);
    }

    #[tokio::test]
    async fn disabled_without_heartbeat_option() {
        let store = store(QueueOptions::standard().with_heart_beat(false)).await;
        enqueue(&store).await;
        let claim = store.try_claim(Duration::from_secs(1)).await.unwrap().unwrap();
        let monitor = HeartbeatMonitor::new(Arc::clone(&store), Duration::from_millis(10), Duration::from_secs(1));
        let guard = monitor.start(claim.lease, CancellationToken::new());
        assert_eq!(guard.status(), HeartbeatStatus::Disabled);
        assert!(guard.status().can_commit());
    }
}
