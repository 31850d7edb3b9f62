//! Drains the mutation queue against the server.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use url::Url;

use super::backoff::jittered_backoff;
use crate::config::SyncSettings;
use crate::http::{Fetcher, HttpRequest};
use crate::network::{NetworkEvent, NetworkHandle};
use crate::queue::{MutationQueue, QueueItem};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SyncConfig {
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Retry budget given to newly enqueued items
  pub max_retries: u32,
  pub batch_size: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self::from_settings(&SyncSettings::default())
  }
}

impl SyncConfig {
  pub fn from_settings(settings: &SyncSettings) -> Self {
    Self {
      base_delay: Duration::from_millis(settings.base_delay_ms),
      max_delay: Duration::from_millis(settings.max_delay_ms),
      max_retries: settings.max_retries,
      batch_size: settings.batch_size.max(1),
    }
  }
}

/// Outcome of one attempt at one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
  pub item_id: String,
  pub success: bool,
  pub error: Option<String>,
}

impl SyncResult {
  fn succeeded(item_id: &str) -> Self {
    Self {
      item_id: item_id.to_string(),
      success: true,
      error: None,
    }
  }

  fn failed(item_id: &str, error: String) -> Self {
    Self {
      item_id: item_id.to_string(),
      success: false,
      error: Some(error),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
  pub results: Vec<SyncResult>,
}

impl SyncReport {
  pub fn succeeded(&self) -> usize {
    self.results.iter().filter(|r| r.success).count()
  }

  pub fn failed(&self) -> usize {
    self.results.len() - self.succeeded()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  Started,
  ItemSynced { item_id: String, success: bool },
  /// Sent at the end of every drain, even one that hit an error
  Completed(SyncReport),
  Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncState {
  pub is_processing: bool,
  /// Pending items seen by the last drain
  pub pending_count: usize,
  /// Failures in the last drain
  pub failed_count: usize,
  pub last_sync_time: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

struct RetryTimer {
  generation: u64,
  task: JoinHandle<()>,
}

struct Inner {
  queue: Arc<MutationQueue>,
  fetcher: Arc<dyn Fetcher>,
  network: NetworkHandle,
  config: SyncConfig,
  processing: AtomicBool,
  state: Mutex<SyncState>,
  retries: Mutex<HashMap<String, RetryTimer>>,
  /// Items with a request on the wire
  in_flight: Mutex<HashSet<String>>,
  generation: AtomicU64,
  events: broadcast::Sender<SyncEvent>,
}

/// Replays queued writes when the network is available.
///
/// A drain walks the pending items oldest-first in fixed-size batches and
/// stops between batches once the network is lost. A failed item gets its
/// retry count bumped and, while it has budget left, a retry timer of its own.
#[derive(Clone)]
pub struct SyncController {
  inner: Arc<Inner>,
}

/// Clears the processing flag when a drain ends, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Releases an item's in-flight claim when its attempt ends.
struct InFlight<'a> {
  ids: &'a Mutex<HashSet<String>>,
  id: String,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    lock(self.ids).remove(&self.id);
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SyncController {
  pub fn new(
    queue: Arc<MutationQueue>,
    fetcher: Arc<dyn Fetcher>,
    network: NetworkHandle,
    config: SyncConfig,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let inner = Inner {
      queue,
      fetcher,
      network,
      config,
      processing: AtomicBool::new(false),
      state: Mutex::new(SyncState::default()),
      retries: Mutex::new(HashMap::new()),
      in_flight: Mutex::new(HashSet::new()),
      generation: AtomicU64::new(0),
      events,
    };
    Self {
      inner: Arc::new(inner),
    }
  }

  pub fn config(&self) -> &SyncConfig {
    &self.inner.config
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  pub fn state(&self) -> SyncState {
    let mut state = lock(&self.inner.state).clone();
    state.is_processing = self.is_syncing();
    state
  }

  pub fn is_syncing(&self) -> bool {
    self.inner.processing.load(Ordering::SeqCst)
  }

  /// Items still stored in the queue, failed ones included.
  pub fn pending_count(&self) -> Result<usize> {
    self.inner.queue.len()
  }

  /// Ids of items with a retry timer pending, sorted.
  pub fn scheduled_retries(&self) -> Vec<String> {
    let mut ids: Vec<String> = lock(&self.inner.retries).keys().cloned().collect();
    ids.sort();
    ids
  }

  /// Run a drain now.
  pub async fn trigger_sync(&self) -> Option<SyncReport> {
    self.process_queue().await
  }

  /// Drain the pending items. Returns `None` when offline or when a drain is
  /// already running.
  pub async fn process_queue(&self) -> Option<SyncReport> {
    if !self.inner.network.is_online() {
      tracing::debug!("Offline, skipping sync");
      return None;
    }
    if self.inner.processing.swap(true, Ordering::SeqCst) {
      tracing::debug!("Sync already in progress, skipping");
      return None;
    }
    let _guard = ProcessingGuard(&self.inner.processing);

    self.emit(SyncEvent::Started);
    let mut report = SyncReport::default();
    let outcome = self.drain(&mut report).await;

    {
      let mut state = lock(&self.inner.state);
      match outcome {
        Ok(()) => {
          state.last_sync_time = Some(Utc::now());
          state.failed_count = report.failed();
          state.last_error = None;
          tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Sync finished"
          );
        }
        Err(e) => {
          let message = format!("{:#}", e);
          tracing::error!(error = %message, "Sync failed");
          state.last_error = Some(message.clone());
          self.emit(SyncEvent::Failed(message));
        }
      }
    }

    self.emit(SyncEvent::Completed(report.clone()));
    Some(report)
  }

  async fn drain(&self, report: &mut SyncReport) -> Result<()> {
    let pending = self.inner.queue.get_pending_items()?;
    lock(&self.inner.state).pending_count = pending.len();
    if pending.is_empty() {
      tracing::debug!("Mutation queue is empty");
      return Ok(());
    }

    tracing::info!(count = pending.len(), "Syncing queued mutations");
    for batch in pending.chunks(self.inner.config.batch_size.max(1)) {
      for item in batch {
        // This attempt replaces the item's timer
        self.cancel_retry(&item.id);
        let Some(result) = self.sync_item(&item.id).await else {
          continue;
        };
        self.emit(SyncEvent::ItemSynced {
          item_id: item.id.clone(),
          success: result.success,
        });
        report.results.push(result);
      }

      if !self.inner.network.is_online() {
        tracing::info!("Network lost, stopping sync");
        break;
      }
    }
    Ok(())
  }

  /// Attempt one item by id. Returns `None` when another attempt already has
  /// it on the wire or it is no longer pending.
  async fn sync_item(&self, id: &str) -> Option<SyncResult> {
    let _claim = self.claim(id)?;

    // Re-read under the claim: an earlier attempt may have synced or failed it
    let item = match self.inner.queue.get_item(id) {
      Ok(Some(item)) if !item.is_failed() => item,
      Ok(_) => {
        tracing::debug!(id, "Item no longer pending, skipping");
        return None;
      }
      Err(e) => {
        tracing::warn!(id, error = %e, "Could not load queued mutation");
        return Some(SyncResult::failed(id, format!("{:#}", e)));
      }
    };
    Some(self.process_item(&item).await)
  }

  fn claim(&self, id: &str) -> Option<InFlight<'_>> {
    if !lock(&self.inner.in_flight).insert(id.to_string()) {
      tracing::debug!(id, "Item already in flight, skipping");
      return None;
    }
    Some(InFlight {
      ids: &self.inner.in_flight,
      id: id.to_string(),
    })
  }

  /// Send one item and record the outcome in the queue.
  async fn process_item(&self, item: &QueueItem) -> SyncResult {
    let request = match build_request(item) {
      Ok(request) => request,
      Err(e) => return self.handle_failure(item, format!("{:#}", e)),
    };

    match self.inner.fetcher.fetch(request).await {
      Ok(response) if response.is_success() => {
        if let Err(e) = self.inner.queue.dequeue(&item.id) {
          tracing::error!(id = %item.id, error = %e, "Synced item could not be dequeued");
        }
        self.cancel_retry(&item.id);
        tracing::debug!(id = %item.id, "Synced queued mutation");
        SyncResult::succeeded(&item.id)
      }
      Ok(response) => self.handle_failure(item, format!("HTTP {}", response.status)),
      Err(e) => self.handle_failure(item, e.to_string()),
    }
  }

  fn handle_failure(&self, item: &QueueItem, error: String) -> SyncResult {
    let updated = match self.inner.queue.increment_retry_count(&item.id) {
      Ok(Some(updated)) => updated,
      Ok(None) => return SyncResult::failed(&item.id, "item no longer queued".to_string()),
      Err(e) => return SyncResult::failed(&item.id, format!("{}; {:#}", error, e)),
    };

    if updated.is_failed() {
      self.cancel_retry(&updated.id);
      tracing::warn!(
        id = %updated.id,
        retries = updated.retry_count,
        error = %error,
        "Queued mutation exhausted its retries"
      );
      return SyncResult::failed(&updated.id, format!("max retries reached: {}", error));
    }

    let delay = jittered_backoff(
      updated.retry_count,
      self.inner.config.base_delay,
      self.inner.config.max_delay,
    );
    tracing::info!(
      id = %updated.id,
      retry = updated.retry_count,
      max = updated.max_retries,
      ?delay,
      error = %error,
      "Queued mutation failed, retry scheduled"
    );
    self.schedule_retry(&updated.id, delay);
    SyncResult::failed(&updated.id, format!("retrying: {}", error))
  }

  /// Arm the single retry timer of an item, superseding any earlier one.
  fn schedule_retry(&self, id: &str, delay: Duration) {
    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);

    // The map stays locked until the timer is recorded so the timer cannot
    // look itself up before it exists
    let mut retries = lock(&self.inner.retries);
    let this = self.clone();
    let item_id = id.to_string();
    let task = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      this.fire_retry(&item_id, generation).await;
    });

    if let Some(previous) = retries.insert(id.to_string(), RetryTimer { generation, task }) {
      previous.task.abort();
    }
  }

  async fn fire_retry(&self, id: &str, generation: u64) {
    {
      let mut retries = lock(&self.inner.retries);
      match retries.get(id) {
        Some(timer) if timer.generation == generation => {
          retries.remove(id);
        }
        _ => return,
      }
    }

    if !self.inner.network.is_online() {
      tracing::debug!(id, "Offline when retry fired, waiting for recovery");
      return;
    }

    if let Some(result) = self.sync_item(id).await {
      self.emit(SyncEvent::ItemSynced {
        item_id: id.to_string(),
        success: result.success,
      });
    }
  }

  fn cancel_retry(&self, id: &str) {
    if let Some(timer) = lock(&self.inner.retries).remove(id) {
      timer.task.abort();
    }
  }

  /// Cancel every pending retry timer. The items stay queued.
  pub fn cancel_all_retries(&self) -> usize {
    let timers: Vec<RetryTimer> = lock(&self.inner.retries).drain().map(|(_, t)| t).collect();
    for timer in &timers {
      timer.task.abort();
    }
    timers.len()
  }

  /// React to network transitions until the monitor goes away.
  pub async fn run(self) {
    let mut events = self.inner.network.subscribe();
    loop {
      match events.recv().await {
        Ok(NetworkEvent::Recovered) => self.spawn_drain(),
        Ok(NetworkEvent::Lost) => {
          let cancelled = self.cancel_all_retries();
          tracing::info!(cancelled, "Network lost, retry timers cancelled");
        }
        Ok(NetworkEvent::QualityChanged(_)) => {}
        Err(RecvError::Lagged(missed)) => {
          tracing::warn!(missed, "Missed network events");
          if self.inner.network.is_online() {
            self.spawn_drain();
          } else {
            self.cancel_all_retries();
          }
        }
        Err(RecvError::Closed) => break,
      }
    }
  }

  pub fn spawn(&self) -> JoinHandle<()> {
    tokio::spawn(self.clone().run())
  }

  fn spawn_drain(&self) {
    let this = self.clone();
    tokio::spawn(async move {
      this.process_queue().await;
    });
  }

  fn emit(&self, event: SyncEvent) {
    let _ = self.inner.events.send(event);
  }
}

/// The HTTP request that replays a queued mutation.
pub fn build_request(item: &QueueItem) -> Result<HttpRequest> {
  let url = Url::parse(&item.target_url)
    .map_err(|e| eyre!("Invalid target url {}: {}", item.target_url, e))?;

  let mut request =
    HttpRequest::new(item.method.clone(), url).with_header("content-type", "application/json");
  for (name, value) in &item.headers {
    request = request.with_header(name, value);
  }

  if let Some(payload) = &item.payload {
    if item.method != Method::GET && item.method != Method::DELETE {
      let body = serde_json::to_vec(payload)
        .map_err(|e| eyre!("Failed to encode payload of {}: {}", item.id, e))?;
      request = request.with_body(body);
    }
  }
  Ok(request)
}
