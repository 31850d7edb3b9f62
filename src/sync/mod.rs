//! Replays the mutation queue when connectivity returns.

mod backoff;
mod controller;

pub use backoff::{backoff_delay, jittered_backoff, JITTER_RATIO};
pub use controller::{
  build_request, SyncConfig, SyncController, SyncEvent, SyncReport, SyncResult, SyncState,
};
