//! spindle-core
//!
//! Embedded message-queue lifecycle engine: producers enqueue work, a worker
//! pool claims it under a lease and commits or rolls it back, and a scheduler
//! turns recurring triggers into ordinary messages.
//!
//! # Modules
//! - **domain**: ids, message record and state machine, correlation ids, outcomes
//! - **ports**: storage adapter contract and clock
//! - **impls**: in-memory storage adapter
//! - **middleware**: layers wrapped around the storage adapter (retry, timing, validation)
//! - **queue**: message store facade, producer, retry policy, queue creation
//! - **app**: worker pool, heartbeat, sweeps, inspection, builder
//! - **scheduler**: trigger expressions and the job dispatch loop
//! - **handler**: user handler contract and routing registry

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod handler;
pub mod impls;
pub mod middleware;
pub mod ports;
pub mod queue;
pub mod scheduler;

pub use app::{MessageContext, Queue, QueueBuilder, QueueInspector, WorkerPool};
pub use config::{ConsumerConfig, QueueOptions};
pub use domain::{CorrelationId, MessageId, MessageStatus};
pub use error::{ConfigError, QueueError, QueueResult, StorageError};
pub use handler::{HandlerError, HandlerRegistry, MessageHandler};
pub use queue::{MessageStore, Producer, RetryPolicy, SendOptions};
pub use scheduler::{JobScheduler, SchedulerConfig, Trigger};
