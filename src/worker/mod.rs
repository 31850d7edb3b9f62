//! Background workers and the request/response protocol that reaches them.
//!
//! Each worker is an actor: it owns its state, runs in an isolated thread and
//! handles one message at a time. Handles are created once by the owner (see
//! [`crate::app::App`]) and passed to whoever needs them.

mod cache;
mod compute;
mod protocol;

pub use cache::{BatchItem, CacheClient, CacheRequest, CacheResponse, CacheWorker, CACHE_TIMEOUT};
pub use compute::{
  ComputeClient, ComputeOutput, ComputeTask, ComputeWorker, Condition, SortOrder, COMPUTE_TIMEOUT,
};
pub use protocol::{
  CorrelationId, Envelope, PendingTable, Reply, TaskError, Worker, WorkerError, WorkerHandle,
};
