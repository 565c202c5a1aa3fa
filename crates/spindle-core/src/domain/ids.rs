//! Domain identifiers (strongly-typed IDs).
//!
//! 型で ID の取り違えを防ぐ。
//!
//! Two families of identifiers live here:
//! - `MessageId`: assigned by the storage adapter on insert. Monotonic where the
//!   adapter supports it, so it doubles as the insertion-order tie breaker.
//! - `Id<T>`: ULID based, generated by the engine itself. Used for lease tokens
//!   and scheduler instance ids. The phantom marker keeps a `LeaseToken` from
//!   being passed where a `SchedulerId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Storage-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Marker trait for ULID based ids.
///
/// Provides the prefix used by `Display` ("lease-", "sched-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID id.
///
/// `T` only exists at compile time; `Id<T>` has the same size as `Ulid`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Generate a fresh id from the current time and a random suffix.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for lease tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lease {}

impl IdMarker for Lease {
    fn prefix() -> &'static str {
        "lease-"
    }
}

/// Marker for scheduler instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheduler {}

impl IdMarker for Scheduler {
    fn prefix() -> &'static str {
        "sched-"
    }
}

/// Token proving ownership of a claimed message.
pub type LeaseToken = Id<Lease>;

/// Identity of one scheduler instance (recorded on the trigger rows it wins).
pub type SchedulerId = Id<Scheduler>;
