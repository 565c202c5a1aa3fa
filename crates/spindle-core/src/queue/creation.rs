//! Queue creation and removal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::config::{QueueOptions, validate_queue_name};
use crate::error::{QueueError, QueueResult};
use crate::ports::StorageAdapter;

/// Result of `QueueCreation::create_queue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCreationStatus {
    Success,
    AlreadyExists,
    /// The options were rejected; nothing was created.
    ConfigurationError(String),
}

/// Result of `QueueCreation::remove_queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRemoveStatus {
    Success,
    DoesNotExist,
}

/// Schema-level operations for one queue.
pub struct QueueCreation {
    adapter: Arc<dyn StorageAdapter>,
    options: QueueOptions,
    disposed: AtomicBool,
}

impl QueueCreation {
    pub fn new(adapter: Arc<dyn StorageAdapter>, options: QueueOptions) -> Self {
        Self {
            adapter,
            options,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    fn ensure_live(&self) -> QueueResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(QueueError::Disposed);
        }
        Ok(())
    }

    /// Validate the options, then create the queue.
    ///
    /// Configuration problems come back as `ConfigurationError`, not `Err`;
    /// `Err` is reserved for storage failures and disposal.
    pub async fn create_queue(&self) -> QueueResult<QueueCreationStatus> {
        self.ensure_live()?;
        let name = self.adapter.queue_name();
        let valid = validate_queue_name(name).and_then(|()| self.options.validate(self.adapter.kind()));
        if let Err(e) = valid {
            warn!(queue = %name, error = %e, "queue configuration rejected");
            return Ok(QueueCreationStatus::ConfigurationError(e.to_string()));
        }
        if self.adapter.create_queue(&self.options).await? {
            info!(queue = %name, "queue created");
            Ok(QueueCreationStatus::Success)
        } else {
            Ok(QueueCreationStatus::AlreadyExists)
        }
    }

    pub async fn remove_queue(&self) -> QueueResult<QueueRemoveStatus> {
        self.ensure_live()?;
        if self.adapter.remove_queue().await? {
            info!(queue = %self.adapter.queue_name(), "queue removed");
            Ok(QueueRemoveStatus::Success)
        } else {
            Ok(QueueRemoveStatus::DoesNotExist)
        }
    }

    pub async fn queue_exists(&self) -> QueueResult<bool> {
        self.ensure_live()?;
        Ok(self.adapter.queue_exists().await?)
    }

    /// Idempotent.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStorage;
    use crate::ports::AdapterKind;

    fn creation(name: &str, options: QueueOptions) -> QueueCreation {
        QueueCreation::new(Arc::new(InMemoryStorage::new(name)), options)
    }

    #[tokio::test]
    async fn create_then_already_exists() {
        let creation = creation("orders", QueueOptions::standard());
        assert!(!creation.queue_exists().await.unwrap());
        assert_eq!(creation.create_queue().await.unwrap(), QueueCreationStatus::Success);
        assert_eq!(
            creation.create_queue().await.unwrap(),
            QueueCreationStatus::AlreadyExists
        );
        assert!(creation.queue_exists().await.unwrap());
    }

    #[tokio::test]
    async fn remove_reports_missing_queue() {
        let creation = creation("orders", QueueOptions::standard());
        assert_eq!(
            creation.remove_queue().await.unwrap(),
            QueueRemoveStatus::DoesNotExist
        );
        creation.create_queue().await.unwrap();
        assert_eq!(creation.remove_queue().await.unwrap(), QueueRemoveStatus::Success);
    }

    #[tokio::test]
    async fn bad_configuration_is_a_structured_result() {
        let creation = creation("orders", QueueOptions::default().with_status_table(true));
        assert!(matches!(
            creation.create_queue().await.unwrap(),
            QueueCreationStatus::ConfigurationError(msg) if msg.contains("EnableStatus")
        ));
        assert!(!creation.queue_exists().await.unwrap());

        let bad_name = self::creation("no spaces", QueueOptions::default());
        assert!(matches!(
            bad_name.create_queue().await.unwrap(),
            QueueCreationStatus::ConfigurationError(_)
        ));
    }

    #[tokio::test]
    async fn hold_transaction_needs_a_transactional_adapter() {
        let storage = InMemoryStorage::new("jobs").with_kind(AdapterKind::ScriptedAtomic);
        let creation = QueueCreation::new(
            Arc::new(storage),
            QueueOptions::default().with_hold_transaction(true),
        );
        assert!(matches!(
            creation.create_queue().await.unwrap(),
            QueueCreationStatus::ConfigurationError(_)
        ));
    }

    #[tokio::test]
    async fn disposed_creation_fails_fast() {
        let creation = creation("orders", QueueOptions::standard());
        creation.dispose();
        creation.dispose();
        assert!(matches!(creation.create_queue().await, Err(QueueError::Disposed)));
        assert!(matches!(creation.queue_exists().await, Err(QueueError::Disposed)));
    }
}
