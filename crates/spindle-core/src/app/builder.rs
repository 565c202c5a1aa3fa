//! QueueBuilder: explicit wiring of one queue.
//!
//! Every collaborator (adapter, clock, middleware) is passed in; `build()`
//! validates everything up front and fails fast with a `ConfigError` instead
//! of letting a bad combination surface at the first claim.

use std::sync::Arc;

use tracing::info;

use crate::app::status::QueueInspector;
use crate::app::worker_loop::WorkerPool;
use crate::config::{ConsumerConfig, QueueOptions, validate_queue_name};
use crate::error::{QueueError, QueueResult, StorageError};
use crate::handler::MessageHandler;
use crate::middleware::{AdapterStack, Layer, RetryLayer, TimingLayer, ValidationLayer};
use crate::ports::{Clock, StorageAdapter, SystemClock};
use crate::queue::{MessageStore, Producer, QueueCreation, QueueCreationStatus};
use crate::scheduler::{JobScheduler, SchedulerConfig};

/// Builds a `Queue`.
///
/// # Example
/// ```ignore
/// let queue = QueueBuilder::new(Arc::new(backend.adapter("orders")))
///     .options(QueueOptions::standard())
///     .standard_layers()
///     .build()
///     .await?;
/// ```
pub struct QueueBuilder {
    stack: AdapterStack,
    adapter: Arc<dyn StorageAdapter>,
    options: QueueOptions,
    clock: Arc<dyn Clock>,
    create_if_missing: bool,
}

impl QueueBuilder {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            stack: AdapterStack::new(Arc::clone(&adapter)),
            adapter,
            options: QueueOptions::default(),
            clock: Arc::new(SystemClock),
            create_if_missing: true,
        }
    }

    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a middleware layer. The first layer added is the outermost.
    pub fn layer(mut self, layer: impl Layer + 'static) -> Self {
        self.stack = self.stack.layer(layer);
        self
    }

    /// Timing, then retry on transient errors, then request validation.
    pub fn standard_layers(self) -> Self {
        self.layer(TimingLayer::default())
            .layer(RetryLayer::default())
            .layer(ValidationLayer)
    }

    /// When false, `build` fails if the queue does not exist yet.
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub async fn build(self) -> QueueResult<Queue> {
        let name = self.adapter.queue_name().to_string();
        validate_queue_name(&name)?;
        self.options.validate(self.adapter.kind())?;

        let adapter: Arc<dyn StorageAdapter> = Arc::new(self.stack);
        let creation = QueueCreation::new(Arc::clone(&adapter), self.options.clone());
        if self.create_if_missing {
            match creation.create_queue().await? {
                QueueCreationStatus::Success | QueueCreationStatus::AlreadyExists => {}
                QueueCreationStatus::ConfigurationError(reason) => {
                    return Err(QueueError::InvalidArgument(reason));
                }
            }
        } else if !creation.queue_exists().await? {
            return Err(StorageError::QueueNotFound(name).into());
        }

        let store = Arc::new(MessageStore::new(adapter, self.options, self.clock));
        info!(queue = %name, "queue ready");
        Ok(Queue {
            store,
            creation: Arc::new(creation),
        })
    }
}

/// A ready queue: hands out producers, worker pools, schedulers and
/// inspectors that all share one `MessageStore`.
#[derive(Clone)]
pub struct Queue {
    store: Arc<MessageStore>,
    creation: Arc<QueueCreation>,
}

impl Queue {
    pub fn name(&self) -> &str {
        self.store.queue_name()
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn producer(&self) -> Producer {
        Producer::new(Arc::clone(&self.store))
    }

    pub fn start_workers(
        &self,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> QueueResult<WorkerPool> {
        WorkerPool::start(Arc::clone(&self.store), handler, config)
    }

    pub fn inspector(&self) -> QueueInspector {
        QueueInspector::new(Arc::clone(&self.store))
    }

    pub fn scheduler(&self, config: SchedulerConfig) -> JobScheduler {
        JobScheduler::new(Arc::clone(&self.store), config)
    }

    pub fn creation(&self) -> &QueueCreation {
        &self.creation
    }

    /// Disposes the store and the creation object. Idempotent.
    pub fn dispose(&self) {
        self.store.dispose();
        self.creation.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.store.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::impls::{InMemoryBackend, InMemoryStorage};
    use crate::ports::AdapterKind;
    use crate::queue::SendOptions;

    #[tokio::test]
    async fn build_creates_the_queue_once() {
        let backend = InMemoryBackend::new();
        let first = QueueBuilder::new(Arc::new(backend.adapter("orders")))
            .options(QueueOptions::standard())
            .standard_layers()
            .build()
            .await
            .unwrap();
        first.producer().send("a", SendOptions::new()).await.unwrap();

        // second handle onto the same storage sees the same message
        let second = QueueBuilder::new(Arc::new(backend.adapter("orders")))
            .options(QueueOptions::standard())
            .create_if_missing(false)
            .build()
            .await
            .unwrap();
        assert_eq!(second.inspector().counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn missing_queue_without_create_fails() {
        let result = QueueBuilder::new(Arc::new(InMemoryStorage::new("nowhere")))
            .create_if_missing(false)
            .build()
            .await;
        assert!(matches!(
            result,
            Err(QueueError::Storage(StorageError::QueueNotFound(name))) if name == "nowhere"
        ));
    }

    #[tokio::test]
    async fn invalid_options_fail_fast() {
        let storage = InMemoryStorage::new("jobs").with_kind(AdapterKind::ScriptedAtomic);
        let result = QueueBuilder::new(Arc::new(storage))
            .options(QueueOptions::default().with_hold_transaction(true))
            .build()
            .await;
        assert!(matches!(
            result,
            Err(QueueError::Config(ConfigError::HoldTransactionUnsupported(
                AdapterKind::ScriptedAtomic
            )))
        ));
    }

    #[tokio::test]
    async fn dispose_reaches_every_handle() {
        let queue = QueueBuilder::new(Arc::new(InMemoryStorage::new("orders")))
            .build()
            .await
            .unwrap();
        let producer = queue.producer();
        queue.dispose();
        queue.dispose();
        assert!(queue.is_disposed());
        assert!(matches!(
            producer.send("late", SendOptions::new()).await,
            Err(QueueError::Disposed)
        ));
        assert!(matches!(
            queue.creation().queue_exists().await,
            Err(QueueError::Disposed)
        ));
    }
}
