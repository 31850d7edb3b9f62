//! Cache worker: owns the cache storage and serves the store contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::protocol::{TaskError, Worker, WorkerError, WorkerHandle};
use crate::cache::{CacheEntry, CacheStats, CacheStorage, EntryMetadata};

/// Default deadline for cache round trips.
pub const CACHE_TIMEOUT: Duration = Duration::from_secs(5);

/// One item of a batch write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
  pub key: String,
  pub value: Value,
  pub ttl_seconds: Option<u64>,
}

#[derive(Debug)]
pub enum CacheRequest {
  Set {
    key: String,
    value: Value,
    ttl_seconds: Option<u64>,
  },
  SetBatch(Vec<BatchItem>),
  Get(String),
  GetBatch(Vec<String>),
  /// Like `Get` but returns the whole entry
  Entry(String),
  Delete(String),
  DeletePrefix(String),
  Exists(String),
  Metadata(String),
  Keys,
  Clear,
  Stats,
  Sweep,
}

#[derive(Debug)]
pub enum CacheResponse {
  Ack,
  Value(Option<Value>),
  Values(Vec<Option<Value>>),
  Entry(Option<CacheEntry>),
  Exists(bool),
  Metadata(Option<EntryMetadata>),
  Keys(Vec<String>),
  Stats(CacheStats),
  Removed(usize),
}

/// The worker-side state machine. Runs on the cache worker thread.
pub struct CacheWorker {
  storage: Box<dyn CacheStorage>,
  clock: Box<dyn FnMut() -> DateTime<Utc> + Send>,
}

impl CacheWorker {
  pub fn new(storage: Box<dyn CacheStorage>) -> Self {
    Self {
      storage,
      clock: Box::new(Utc::now),
    }
  }

  #[cfg(test)]
  fn with_clock(mut self, clock: impl FnMut() -> DateTime<Utc> + Send + 'static) -> Self {
    self.clock = Box::new(clock);
    self
  }

  fn now(&mut self) -> DateTime<Utc> {
    (self.clock)()
  }

  /// Count expired entries, then sweep, and cross-check the two.
  fn stats(&mut self) -> color_eyre::Result<CacheStats> {
    let now = self.now();
    let expired_count = self.storage.count_expired(now)?;

    // A failed or diverging sweep only costs accuracy, never the stats call
    let sweep_at = self.now();
    match self.storage.sweep(sweep_at) {
      Ok(swept) if swept != expired_count => {
        tracing::warn!(
          expired_count,
          swept,
          "Cache consistency check failed: expired count differs from sweep"
        );
      }
      Ok(_) => {}
      Err(e) => tracing::warn!(error = %e, "Cache sweep failed during stats"),
    }

    let keys = self.storage.keys()?;
    Ok(CacheStats {
      count: keys.len(),
      keys,
      expired_count,
    })
  }

  fn dispatch(&mut self, request: CacheRequest) -> color_eyre::Result<CacheResponse> {
    let response = match request {
      CacheRequest::Set {
        key,
        value,
        ttl_seconds,
      } => {
        let now = self.now();
        self.storage.put(&key, &value, ttl_seconds, now)?;
        CacheResponse::Ack
      }
      CacheRequest::SetBatch(items) => {
        let now = self.now();
        for item in &items {
          self.storage.put(&item.key, &item.value, item.ttl_seconds, now)?;
        }
        tracing::debug!(count = items.len(), "Stored cache batch");
        CacheResponse::Ack
      }
      CacheRequest::Get(key) => {
        let now = self.now();
        CacheResponse::Value(self.storage.get(&key, now)?.map(|e| e.payload))
      }
      CacheRequest::GetBatch(keys) => {
        let now = self.now();
        let values = keys
          .iter()
          .map(|key| Ok(self.storage.get(key, now)?.map(|e| e.payload)))
          .collect::<color_eyre::Result<Vec<_>>>()?;
        CacheResponse::Values(values)
      }
      CacheRequest::Entry(key) => {
        let now = self.now();
        CacheResponse::Entry(self.storage.get(&key, now)?)
      }
      CacheRequest::Delete(key) => {
        self.storage.delete(&key)?;
        CacheResponse::Ack
      }
      CacheRequest::DeletePrefix(prefix) => {
        CacheResponse::Removed(self.storage.delete_prefix(&prefix)?)
      }
      CacheRequest::Exists(key) => {
        let now = self.now();
        CacheResponse::Exists(self.storage.exists(&key, now)?)
      }
      CacheRequest::Metadata(key) => {
        let now = self.now();
        CacheResponse::Metadata(self.storage.metadata(&key, now)?)
      }
      CacheRequest::Keys => CacheResponse::Keys(self.storage.keys()?),
      CacheRequest::Clear => {
        self.storage.clear()?;
        CacheResponse::Ack
      }
      CacheRequest::Stats => CacheResponse::Stats(self.stats()?),
      CacheRequest::Sweep => {
        let now = self.now();
        CacheResponse::Removed(self.storage.sweep(now)?)
      }
    };
    Ok(response)
  }
}

impl Worker for CacheWorker {
  type Request = CacheRequest;
  type Response = CacheResponse;
  const NAME: &'static str = "cache";

  fn handle(&mut self, request: CacheRequest) -> Result<CacheResponse, TaskError> {
    self
      .dispatch(request)
      .map_err(|e| TaskError::Failed(format!("{:#}", e)))
  }
}

/// Caller-side API of the durable cache store.
#[derive(Clone)]
pub struct CacheClient {
  handle: WorkerHandle<CacheWorker>,
}

fn unexpected(response: CacheResponse) -> WorkerError {
  WorkerError::Task(format!("unexpected cache response: {:?}", response))
}

impl CacheClient {
  /// Start a cache worker that owns `storage`.
  pub fn spawn(storage: Box<dyn CacheStorage>, timeout: Duration) -> color_eyre::Result<Self> {
    let handle = WorkerHandle::spawn(CacheWorker::new(storage), timeout)?;
    Ok(Self { handle })
  }

  pub async fn set(
    &self,
    key: &str,
    value: Value,
    ttl_seconds: Option<u64>,
  ) -> Result<(), WorkerError> {
    let request = CacheRequest::Set {
      key: key.to_string(),
      value,
      ttl_seconds,
    };
    match self.handle.call(request).await? {
      CacheResponse::Ack => Ok(()),
      other => Err(unexpected(other)),
    }
  }

  pub async fn set_batch(&self, items: Vec<BatchItem>) -> Result<(), WorkerError> {
    match self.handle.call(CacheRequest::SetBatch(items)).await? {
      CacheResponse::Ack => Ok(()),
      other => Err(unexpected(other)),
    }
  }

  pub async fn get(&self, key: &str) -> Result<Option<Value>, WorkerError> {
    match self.handle.call(CacheRequest::Get(key.to_string())).await? {
      CacheResponse::Value(value) => Ok(value),
      other => Err(unexpected(other)),
    }
  }

  pub async fn get_batch(&self, keys: Vec<String>) -> Result<Vec<Option<Value>>, WorkerError> {
    match self.handle.call(CacheRequest::GetBatch(keys)).await? {
      CacheResponse::Values(values) => Ok(values),
      other => Err(unexpected(other)),
    }
  }

  pub async fn entry(&self, key: &str) -> Result<Option<CacheEntry>, WorkerError> {
    match self.handle.call(CacheRequest::Entry(key.to_string())).await? {
      CacheResponse::Entry(entry) => Ok(entry),
      other => Err(unexpected(other)),
    }
  }

  pub async fn delete(&self, key: &str) -> Result<(), WorkerError> {
    match self.handle.call(CacheRequest::Delete(key.to_string())).await? {
      CacheResponse::Ack => Ok(()),
      other => Err(unexpected(other)),
    }
  }

  pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, WorkerError> {
    match self
      .handle
      .call(CacheRequest::DeletePrefix(prefix.to_string()))
      .await?
    {
      CacheResponse::Removed(n) => Ok(n),
      other => Err(unexpected(other)),
    }
  }

  pub async fn exists(&self, key: &str) -> Result<bool, WorkerError> {
    match self.handle.call(CacheRequest::Exists(key.to_string())).await? {
      CacheResponse::Exists(exists) => Ok(exists),
      other => Err(unexpected(other)),
    }
  }

  pub async fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, WorkerError> {
    match self
      .handle
      .call(CacheRequest::Metadata(key.to_string()))
      .await?
    {
      CacheResponse::Metadata(meta) => Ok(meta),
      other => Err(unexpected(other)),
    }
  }

  pub async fn keys(&self) -> Result<Vec<String>, WorkerError> {
    match self.handle.call(CacheRequest::Keys).await? {
      CacheResponse::Keys(keys) => Ok(keys),
      other => Err(unexpected(other)),
    }
  }

  pub async fn clear(&self) -> Result<(), WorkerError> {
    match self.handle.call(CacheRequest::Clear).await? {
      CacheResponse::Ack => Ok(()),
      other => Err(unexpected(other)),
    }
  }

  pub async fn stats(&self) -> Result<CacheStats, WorkerError> {
    match self.handle.call(CacheRequest::Stats).await? {
      CacheResponse::Stats(stats) => Ok(stats),
      other => Err(unexpected(other)),
    }
  }

  pub async fn sweep(&self) -> Result<usize, WorkerError> {
    match self.handle.call(CacheRequest::Sweep).await? {
      CacheResponse::Removed(n) => Ok(n),
      other => Err(unexpected(other)),
    }
  }

  /// Periodically evict expired entries in the background.
  pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
    let client = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match client.sweep().await {
          Ok(0) => {}
          Ok(removed) => tracing::debug!(removed, "Swept expired cache entries"),
          Err(WorkerError::Terminated(_)) => break,
          Err(e) => tracing::warn!(error = %e, "Cache sweep failed"),
        }
      }
    })
  }

  pub fn terminate(&self) {
    self.handle.terminate();
  }

  pub fn is_alive(&self) -> bool {
    self.handle.is_alive()
  }
}
