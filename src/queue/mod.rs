//! Durable queue of writes made while offline.
//!
//! Items are replayed oldest-first by the sync controller. An item that runs
//! out of retries stays in the queue as failed until someone purges it.

mod store;
mod types;

pub use store::MutationQueue;
pub use types::{NewQueueItem, Operation, QueueItem, DEFAULT_MAX_RETRIES};
