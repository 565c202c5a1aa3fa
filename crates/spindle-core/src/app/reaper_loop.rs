//! Lease sweeper: puts messages whose owner stopped renewing back in play.
//!
//! Any process may run one; concurrent sweeps are safe because each reset is
//! a compare-and-swap on the stale lease token.
//!
//! 回収時に error_count を 1 つ進める（放棄も失敗の一種として数える）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::queue::{MessageStore, RetryPolicy};

const SWEEP_BATCH: usize = 256;

pub struct LeaseSweeper {
    store: Arc<MessageStore>,
    policy: RetryPolicy,
    interval: Duration,
}

impl LeaseSweeper {
    pub fn new(store: Arc<MessageStore>, policy: RetryPolicy, interval: Duration) -> Self {
        Self {
            store,
            policy,
            interval,
        }
    }

    /// One full sweep. Returns the number of leases reclaimed.
    pub async fn run_once(&self) -> QueueResult<usize> {
        let mut total = 0;
        loop {
            let n = self.store.reclaim_expired(&self.policy, SWEEP_BATCH).await?;
            total += n;
            if n < SWEEP_BATCH {
                break;
            }
        }
        if total > 0 {
            info!(queue = %self.store.queue_name(), reclaimed = total, "expired leases reclaimed");
        } else {
            debug!(queue = %self.store.queue_name(), "no expired leases");
        }
        Ok(total)
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        // sender gone: the owner is gone too
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                match self.run_once().await {
                    Ok(_) => {}
                    Err(QueueError::Disposed) => break,
                    Err(e) => warn!(queue = %self.store.queue_name(), error = %e, "lease sweep failed"),
                }
            }
        })
    }
}
