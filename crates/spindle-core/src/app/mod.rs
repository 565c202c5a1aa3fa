//! Runtime components built on the message store.
//!
//! - **builder**: `QueueBuilder` / `Queue` wiring
//! - **worker_loop**: consumer worker pool (claim, handle, commit or roll back)
//! - **heartbeat**: lease renewal while a handler runs
//! - **reaper_loop**: reclaims messages whose lease expired
//! - **gc_loop**: deletes expired messages
//! - **status**: inspection queries

pub mod builder;
pub mod gc_loop;
pub mod heartbeat;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

pub use self::builder::{Queue, QueueBuilder};
pub use self::gc_loop::ExpirationSweeper;
pub use self::heartbeat::{HeartbeatGuard, HeartbeatMonitor, HeartbeatStatus};
pub use self::reaper_loop::LeaseSweeper;
pub use self::status::{ErroredMessage, QueueInspector};
pub use self::worker_loop::{MessageContext, PoolReport, WorkerNotification, WorkerPool, WorkerStats};
