use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::{CacheStorage, DomainCache, MemoryStorage, SqliteStorage};
use crate::config::{Config, StorageBackend};
use crate::db;
use crate::event::EventHandler;
use crate::http::{Fetcher, ReqwestFetcher};
use crate::intercept::Interceptor;
use crate::network::{
  ChannelObserver, ConnectivityObserver, HttpProbe, NetworkHandle, NetworkMonitor,
  PollingObserver, Probe, SignalSender,
};
use crate::queue::{MutationQueue, NewQueueItem, QueueItem};
use crate::sync::{SyncConfig, SyncController};
use crate::worker::{CacheClient, ComputeClient};

/// Default deadline for requests without their own timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Every long-lived handle of the offline layer, created once and owned by
/// the host.
pub struct App {
  pub config: Config,

  /// Durable cache store, behind the cache worker
  pub cache: CacheClient,

  /// User and agent data cached for offline reads
  pub domain: DomainCache,

  /// CPU-bound data operations
  pub compute: ComputeClient,

  /// Writes waiting for the server
  pub queue: Arc<MutationQueue>,

  /// Request interception with offline fallbacks
  pub interceptor: Interceptor,

  /// Connectivity state and transitions
  pub network: NetworkHandle,

  /// Feed for host connectivity signals
  pub signals: SignalSender,

  /// Queue replay
  pub sync: SyncController,

  /// Background tasks aborted on shutdown
  tasks: Vec<JoinHandle<()>>,
}

impl App {
  /// Open the stores under the data directory and connect to the configured server.
  pub async fn new(config: Config) -> Result<Self> {
    let data_dir = db::data_dir(config.data_dir.as_deref())?;

    let storage: Box<dyn CacheStorage> = match config.cache.backend {
      StorageBackend::Sqlite => Box::new(SqliteStorage::open(&data_dir.join(db::CACHE_DB))?),
      StorageBackend::Memory => Box::new(MemoryStorage::new()),
    };
    let queue = MutationQueue::open(&data_dir.join(db::QUEUE_DB))?;
    let fetcher: Arc<dyn Fetcher> = Arc::new(ReqwestFetcher::new(REQUEST_TIMEOUT)?);

    Self::build(config, storage, queue, fetcher).await
  }

  /// Wire the layer from explicit parts.
  pub async fn build(
    config: Config,
    storage: Box<dyn CacheStorage>,
    queue: MutationQueue,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    let mut tasks = Vec::new();

    let cache = CacheClient::spawn(storage, config.cache.timeout())?;
    if config.cache.sweep_interval_secs > 0 {
      tasks.push(cache.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs)));
    }
    let domain = DomainCache::new(cache.clone());
    let compute = ComputeClient::spawn(config.compute.timeout())?;
    let queue = Arc::new(queue);

    let interceptor = Interceptor::new(
      &config.server,
      &config.cache,
      &config.messages,
      fetcher.clone(),
      cache.clone(),
    )?;

    let probe_url = interceptor
      .rules()
      .resolve(&config.server.probe_path)
      .map_err(|e| eyre!("Invalid probe path: {}", e))?;
    let probe: Arc<dyn Probe> = Arc::new(HttpProbe::new(
      fetcher.clone(),
      probe_url,
      Duration::from_millis(config.network.probe_timeout_ms),
    ));
    let initially_online = probe.check().await;
    tracing::info!(online = initially_online, "Initial connectivity");

    let (signals, observer) = ChannelObserver::new();
    let confirm = config.network.confirm_with_probe.then(|| probe.clone());
    let (monitor, network) = NetworkMonitor::new(
      Box::new(observer),
      confirm,
      Duration::from_millis(config.network.stabilization_ms),
      initially_online,
    );
    tasks.push(monitor.spawn());

    if config.network.probe_interval_ms > 0 {
      tasks.push(spawn_poller(
        PollingObserver::new(probe, Duration::from_millis(config.network.probe_interval_ms)),
        signals.clone(),
      ));
    }

    let sync = SyncController::new(
      queue.clone(),
      fetcher,
      network.clone(),
      SyncConfig::from_settings(&config.sync),
    );
    tasks.push(sync.spawn());

    Ok(Self {
      config,
      cache,
      domain,
      compute,
      queue,
      interceptor,
      network,
      signals,
      sync,
      tasks,
    })
  }

  /// Install the interception layer and replay anything left from a previous run.
  pub async fn start(&self) {
    let precached = self.interceptor.install().await;
    tracing::debug!(precached, "Interceptor ready");

    if self.network.is_online() {
      self.sync.trigger_sync().await;
    }
  }

  /// Queue a write with the configured retry budget.
  pub fn enqueue(&self, item: NewQueueItem) -> Result<QueueItem> {
    let item = item.with_max_retries(self.sync.config().max_retries);
    self.queue.enqueue(item)
  }

  pub fn events(&self, tick_rate: Option<Duration>) -> EventHandler {
    EventHandler::new(&self.network, &self.sync, tick_rate)
  }

  /// Stop background work and the workers. Queued items stay stored.
  pub fn shutdown(self) {
    let cancelled = self.sync.cancel_all_retries();
    for task in &self.tasks {
      task.abort();
    }
    self.cache.terminate();
    self.compute.terminate();
    tracing::info!(cancelled, "Offline layer shut down");
  }
}

/// Forward polled connectivity changes into the monitor's signal feed.
fn spawn_poller(mut poller: PollingObserver, signals: SignalSender) -> JoinHandle<()> {
  tokio::spawn(async move {
    while let Some(signal) = poller.next_signal().await {
      if !signals.send(signal) {
        break;
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::Event;
  use crate::http::testing::ScriptedFetcher;
  use crate::http::HttpResponse;
  use crate::intercept::Lifecycle;
  use crate::queue::Operation;
  use crate::sync::SyncEvent;
  use serde_json::json;

  fn test_config() -> Config {
    Config::from_yaml(
      r#"
server:
  origin: https://app.example
  precache: []
network:
  stabilization_ms: 20
  probe_interval_ms: 0
  confirm_with_probe: false
cache:
  backend: memory
  sweep_interval_secs: 0
"#,
    )
    .unwrap()
  }

  async fn app(fetcher: Arc<ScriptedFetcher>) -> App {
    App::build(
      test_config(),
      Box::new(MemoryStorage::new()),
      MutationQueue::open_in_memory().unwrap(),
      fetcher,
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn test_starts_offline_when_probe_fails() {
    let app = app(Arc::new(ScriptedFetcher::offline())).await;
    assert!(!app.network.is_online());

    app.start().await;
    assert_eq!(app.interceptor.lifecycle(), Lifecycle::Active);
    app.shutdown();
  }

  #[tokio::test]
  async fn test_recovery_replays_offline_writes() {
    let fetcher = Arc::new(ScriptedFetcher::offline());
    let app = app(fetcher.clone()).await;
    let mut events = app.events(None);

    for id in ["1", "2", "3"] {
      let url = format!("https://app.example/api/agents/{}", id);
      app
        .enqueue(NewQueueItem::new(
          Operation::Update,
          "agent",
          id,
          Some(json!({"id": id})),
          &url,
        ))
        .unwrap();
      fetcher.push(&format!("/api/agents/{}", id), Ok(HttpResponse::new(200, "")));
    }

    app.signals.online();
    let report = tokio::time::timeout(Duration::from_secs(5), async {
      loop {
        if let Some(Event::Sync(SyncEvent::Completed(report))) = events.next().await {
          return report;
        }
      }
    })
    .await
    .unwrap();

    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.failed(), 0);
    assert!(app.queue.is_empty().unwrap());
    app.shutdown();
  }

  #[tokio::test]
  async fn test_enqueue_uses_configured_retry_budget() {
    let mut config = test_config();
    config.sync.max_retries = 2;
    let app = App::build(
      config,
      Box::new(MemoryStorage::new()),
      MutationQueue::open_in_memory().unwrap(),
      Arc::new(ScriptedFetcher::offline()),
    )
    .await
    .unwrap();

    let item = app
      .enqueue(NewQueueItem::new(
        Operation::Delete,
        "agent",
        "9",
        None,
        "https://app.example/api/agents/9",
      ))
      .unwrap();
    assert_eq!(item.max_retries, 2);
    app.shutdown();
  }
}
