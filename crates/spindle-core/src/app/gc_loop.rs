//! Expiration sweeper: deletes messages past `expires_at`, whatever their
//! status.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::queue::MessageStore;

const SWEEP_BATCH: usize = 256;

pub struct ExpirationSweeper {
    store: Arc<MessageStore>,
    interval: Duration,
}

impl ExpirationSweeper {
    pub fn new(store: Arc<MessageStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn run_once(&self) -> QueueResult<usize> {
        let mut total = 0;
        loop {
            let n = self.store.delete_expired(SWEEP_BATCH).await?;
            total += n;
            if n < SWEEP_BATCH {
                break;
            }
        }
        if total > 0 {
            info!(queue = %self.store.queue_name(), deleted = total, "expired messages deleted");
        } else {
            debug!(queue = %self.store.queue_name(), "no expired messages");
        }
        Ok(total)
    }

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
                    Err(e) => warn!(queue = %self.store.queue_name(), error = %e, "expiration sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use crate::impls::InMemoryStorage;
    use crate::ports::{ManualClock, StorageAdapter};
    use crate::queue::{Producer, SendOptions};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn deletes_only_expired_messages() {
        let options = QueueOptions::standard();
        let storage = InMemoryStorage::new("gc");
        storage.create_queue(&options).await.unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = Arc::new(MessageStore::new(
            Arc::new(storage),
            options,
            Arc::new(clock.clone()),
        ));
        let producer = Producer::new(Arc::clone(&store));
        producer
            .send("short", SendOptions::new().expire_after(Duration::from_secs(10)))
            .await
            .unwrap();
        producer
            .send("long", SendOptions::new().expire_after(Duration::from_secs(100)))
            .await
            .unwrap();

        let sweeper = ExpirationSweeper::new(Arc::clone(&store), Duration::from_secs(1));
        assert_eq!(sweeper.run_once().await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(sweeper.run_once().await.unwrap(), 1);
        assert_eq!(store.count_waiting().await.unwrap(), 1);
    }
}
