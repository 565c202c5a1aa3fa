//! Producer: validates and submits messages.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::{
    CorrelationId, CorrelationRegistry, Headers, MessageEvent, MessageId, NewMessage, header_keys,
};
use crate::error::{QueueError, QueueResult};
use crate::ports::after;
use crate::queue::store::MessageStore;

/// Per-message send settings.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub delay: Option<Duration>,
    /// Time to live, measured from enqueue.
    pub expiration: Option<Duration>,
    pub priority: Option<u8>,
    pub correlation_id: Option<CorrelationId>,
    pub headers: Headers,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers = self.headers.with(key, value);
        self
    }

    /// Routing key for `HandlerRegistry`.
    pub fn message_type(self, message_type: impl Into<String>) -> Self {
        self.header(header_keys::MESSAGE_TYPE, message_type)
    }
}

/// Receipt of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub id: MessageId,
    pub correlation_id: CorrelationId,
}

/// Sends messages into one queue.
#[derive(Clone)]
pub struct Producer {
    store: Arc<MessageStore>,
    correlation: CorrelationRegistry,
}

impl Producer {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self {
            store,
            correlation: CorrelationRegistry::new(),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.store.queue_name()
    }

    /// Lifecycle notifications (completion, requeue, poison, ...) for this queue.
    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.store.subscribe()
    }

    fn prepare(&self, body: Vec<u8>, options: SendOptions) -> QueueResult<NewMessage> {
        let flags = self.store.options();
        if options.delay.is_some() && !flags.enable_delayed_processing {
            return Err(QueueError::FeatureDisabled("EnableDelayedProcessing"));
        }
        if options.expiration.is_some() && !flags.enable_message_expiration {
            return Err(QueueError::FeatureDisabled("EnableMessageExpiration"));
        }
        if options.priority.is_some() && !flags.enable_priority {
            return Err(QueueError::FeatureDisabled("EnablePriority"));
        }
        if options.expiration.is_some_and(|ttl| ttl.is_zero()) {
            return Err(QueueError::InvalidArgument(
                "expiration must be greater than zero".into(),
            ));
        }

        let now = self.store.now();
        Ok(NewMessage {
            correlation_id: self.correlation.resolve(options.correlation_id),
            body,
            headers: options.headers,
            priority: options.priority.unwrap_or(0),
            enqueued_at: now,
            visible_at: options.delay.map_or(now, |delay| after(now, delay)),
            expires_at: options.expiration.map(|ttl| after(now, ttl)),
        })
    }

    pub async fn send(&self, body: impl Into<Vec<u8>>, options: SendOptions) -> QueueResult<SentMessage> {
        self.store.ensure_live()?;
        let message = self.prepare(body.into(), options)?;
        let correlation_id = message.correlation_id;
        let id = self.store.enqueue(message).await?;
        Ok(SentMessage { id, correlation_id })
    }

    /// Serialize `value` as JSON and send it.
    pub async fn send_json<T: Serialize>(
        &self,
        value: &T,
        options: SendOptions,
    ) -> QueueResult<SentMessage> {
        let body = serde_json::to_vec(value)
            .map_err(|e| QueueError::InvalidArgument(format!("message body: {e}")))?;
        self.send(body, options).await
    }

    /// Send several messages. One result per message, in input order; a
    /// failed message does not stop the rest.
    pub async fn send_batch<B>(&self, messages: Vec<(B, SendOptions)>) -> Vec<QueueResult<SentMessage>>
    where
        B: Into<Vec<u8>>,
    {
        let mut results = Vec::with_capacity(messages.len());
        for (body, options) in messages {
            results.push(self.send(body, options).await);
        }
        let failed = results.iter().filter(|r| r.is_err()).count();
        debug!(queue = %self.queue_name(), sent = results.len() - failed, failed, "batch sent");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use crate::impls::InMemoryStorage;
    use crate::ports::{ManualClock, StorageAdapter};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    async fn producer(options: QueueOptions) -> Producer {
        let storage = InMemoryStorage::new("producer");
        storage.create_queue(&options).await.unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        Producer::new(Arc::new(MessageStore::new(
            Arc::new(storage),
            options,
            Arc::new(clock),
        )))
    }

    #[tokio::test]
    async fn send_assigns_correlation_and_applies_delay() {
        let producer = producer(QueueOptions::standard()).await;
        let sent = producer
            .send(
                "hi",
                SendOptions::new()
                    .delay(Duration::from_secs(5))
                    .expire_after(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        assert!(sent.correlation_id.has_value());

        let record = producer.store.get(sent.id).await.unwrap().unwrap();
        assert_eq!(record.visible_at - record.enqueued_at, chrono::Duration::seconds(5));
        assert_eq!(
            record.expires_at,
            Some(record.enqueued_at + chrono::Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn explicit_correlation_is_kept() {
        let producer = producer(QueueOptions::standard()).await;
        let id = CorrelationRegistry::new().generate();
        let sent = producer
            .send("x", SendOptions::new().correlation_id(id))
            .await
            .unwrap();
        assert_eq!(sent.correlation_id, id);
    }

    #[rstest]
    #[case::delay(SendOptions::new().delay(Duration::from_secs(1)), "EnableDelayedProcessing")]
    #[case::expiration(SendOptions::new().expire_after(Duration::from_secs(1)), "EnableMessageExpiration")]
    #[case::priority(SendOptions::new().priority(3), "EnablePriority")]
    #[tokio::test]
    async fn disabled_features_are_rejected(#[case] options: SendOptions, #[case] flag: &str) {
        let producer = producer(QueueOptions::default()).await;
        let err = producer.send("x", options).await.unwrap_err();
        assert!(matches!(err, QueueError::FeatureDisabled(f) if f == flag));
    }

    #[tokio::test]
    async fn batch_reports_per_message() {
        let producer = producer(QueueOptions::default()).await;
        let results = producer
            .send_batch(vec![
                ("a", SendOptions::new()),
                ("b", SendOptions::new().priority(1)),
                ("c", SendOptions::new()),
            ])
            .await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(QueueError::FeatureDisabled(_))));
        assert!(results[2].is_ok());
        assert_eq!(producer.store.count_waiting().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn send_json_sets_body() {
        let producer = producer(QueueOptions::default()).await;
        let sent = producer
            .send_json(&serde_json::json!({"n": 1}), SendOptions::new().message_type("count"))
            .await
            .unwrap();
        let record = producer.store.get(sent.id).await.unwrap().unwrap();
        assert_eq!(record.body, br#"{"n":1}"#.to_vec());
        assert_eq!(record.headers.get_str(header_keys::MESSAGE_TYPE), Some("count"));
    }
}
