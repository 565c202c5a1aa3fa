//! Queue module: message store facade, producer, retry policy and queue
//! creation.

pub mod creation;
pub mod producer;
pub mod retry;
pub mod store;

pub use creation::{QueueCreation, QueueCreationStatus, QueueRemoveStatus};
pub use producer::{Producer, SendOptions, SentMessage};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use store::{Claim, Failure, LeaseHandle, MessageStore};
