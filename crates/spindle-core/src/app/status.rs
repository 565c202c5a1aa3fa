//! Inspection queries for monitoring and operators.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, MessageRecord, MessageStatus, QueueCounts};
use crate::error::{QueueError, QueueResult};
use crate::queue::MessageStore;

/// A poisoned message as shown on an error dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErroredMessage {
    pub id: MessageId,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl From<&MessageRecord> for ErroredMessage {
    fn from(record: &MessageRecord) -> Self {
        Self {
            id: record.id,
            error_count: record.error_count,
            last_error: record.last_error.clone(),
        }
    }
}

/// Read-only view over one queue.
///
/// Counts are always available. Per-message status needs EnableStatus; the
/// denormalized projection needs EnableStatusTable.
#[derive(Clone)]
pub struct QueueInspector {
    store: Arc<MessageStore>,
}

impl QueueInspector {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }

    pub async fn counts(&self) -> QueueResult<QueueCounts> {
        self.store.counts().await
    }

    fn require_status(&self) -> QueueResult<()> {
        if !self.store.options().enable_status {
            return Err(QueueError::FeatureDisabled("EnableStatus"));
        }
        Ok(())
    }

    /// `None` once the message is gone (committed or expired).
    pub async fn status(&self, id: MessageId) -> QueueResult<Option<MessageStatus>> {
        self.require_status()?;
        Ok(self.store.get(id).await?.map(|record| record.status))
    }

    /// Reads the status table instead of the message rows.
    pub async fn status_projection(&self, id: MessageId) -> QueueResult<Option<MessageStatus>> {
        if !self.store.options().enable_status_table {
            return Err(QueueError::FeatureDisabled("EnableStatusTable"));
        }
        self.store.status_projection(id).await
    }

    /// Poisoned messages, oldest id first.
    pub async fn errored(&self, limit: usize) -> QueueResult<Vec<ErroredMessage>> {
        self.require_status()?;
        let records = self.store.list(MessageStatus::Error, limit).await?;
        Ok(records.iter().map(ErroredMessage::from).collect())
    }

    pub async fn list(&self, status: MessageStatus, limit: usize) -> QueueResult<Vec<MessageRecord>> {
        self.require_status()?;
        self.store.list(status, limit).await
    }

    /// Next messages a worker would claim, in claim order.
    pub async fn peek_waiting(&self, limit: usize) -> QueueResult<Vec<MessageRecord>> {
        self.store.peek_waiting(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use crate::impls::InMemoryStorage;
    use crate::ports::{ManualClock, StorageAdapter};
    use crate::queue::{Failure, Producer, RetryPolicy, SendOptions};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    async fn setup(options: QueueOptions) -> (Arc<MessageStore>, QueueInspector) {
        let storage = InMemoryStorage::new("inspect");
        storage.create_queue(&options).await.unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let store = Arc::new(MessageStore::new(Arc::new(storage), options, Arc::new(clock)));
        let inspector = QueueInspector::new(Arc::clone(&store));
        (store, inspector)
    }

    #[tokio::test]
    async fn errored_lists_poisoned_messages() {
        let (store, inspector) = setup(QueueOptions::standard()).await;
        let producer = Producer::new(Arc::clone(&store));
        let sent = producer.send("bad", SendOptions::new()).await.unwrap();
        producer.send("good", SendOptions::new()).await.unwrap();

        let claim = store.try_claim(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(claim.id(), sent.id);
        store
            .rollback(claim, Failure::error("boom"), &RetryPolicy::immediate(1))
            .await
            .unwrap();

        let errored = inspector.errored(10).await.unwrap();
        assert_eq!(
            errored,
            vec![ErroredMessage {
                id: sent.id,
                error_count: 1,
                last_error: Some("boom".into()),
            }]
        );
        assert_eq!(inspector.status(sent.id).await.unwrap(), Some(MessageStatus::Error));
        let counts = inspector.counts().await.unwrap();
        assert_eq!((counts.waiting, counts.error), (1, 1));
    }

    #[tokio::test]
    async fn status_queries_need_their_flags() {
        let (store, inspector) = setup(QueueOptions::default()).await;
        let sent = Producer::new(Arc::clone(&store))
            .send("x", SendOptions::new())
            .await
            .unwrap();

        assert!(matches!(
            inspector.status(sent.id).await,
            Err(QueueError::FeatureDisabled("EnableStatus"))
        ));
        assert!(matches!(
            inspector.status_projection(sent.id).await,
            Err(QueueError::FeatureDisabled("EnableStatusTable"))
        ));
        // counts and peeking stay available
        assert_eq!(inspector.counts().await.unwrap().waiting, 1);
        assert_eq!(inspector.peek_waiting(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn projection_follows_the_message() {
        let options = QueueOptions::standard().with_status_table(true);
        let (store, inspector) = setup(options).await;
        let sent = Producer::new(Arc::clone(&store))
            .send("x", SendOptions::new())
            .await
            .unwrap();
        assert_eq!(
            inspector.status_projection(sent.id).await.unwrap(),
            Some(MessageStatus::Waiting)
        );

        let claim = store.try_claim(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(
            inspector.status_projection(sent.id).await.unwrap(),
            Some(MessageStatus::Processing)
        );
        store.commit(claim).await.unwrap();
        assert_eq!(inspector.status_projection(sent.id).await.unwrap(), None);
    }
}
