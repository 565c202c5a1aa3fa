//! Ports: the seams between the engine and the outside world.
//!
//! - `storage`: the storage adapter contract (SQL, Redis, in-memory, ...)
//! - `clock`: the source of "now"

pub mod clock;
pub mod storage;

pub use self::clock::{Clock, ManualClock, SystemClock, after};
pub use self::storage::{
    AdapterKind, CasOutcome, ClaimRequest, ExpiredLease, HeldTransaction, StorageAdapter,
};
