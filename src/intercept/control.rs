//! Lifecycle of the interception layer and its control channel.

use serde::Serialize;
use std::collections::BTreeMap;

use super::layer::{lock, Interceptor};
use crate::cache::CacheRegion;
use crate::http::HttpRequest;
use crate::worker::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
  /// Precaching the configured paths
  Installing,
  /// Installed; requests still pass through
  Waiting,
  /// Handling requests
  Active,
}

/// Messages the application can send to the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
  ActivateImmediately,
  PurgeAll,
  ReportStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlReply {
  Activated,
  Purged { removed: usize },
  Status(CacheStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegionStatus {
  pub count: usize,
  pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatus {
  pub lifecycle: Lifecycle,
  pub regions: BTreeMap<CacheRegion, RegionStatus>,
}

impl Interceptor {
  pub fn lifecycle(&self) -> Lifecycle {
    *lock(&self.inner.lifecycle)
  }

  /// Precache the configured paths, then wait (or activate when skip-waiting
  /// is set). Paths that fail to load are logged and skipped.
  pub async fn install(&self) -> usize {
    *lock(&self.inner.lifecycle) = Lifecycle::Installing;

    let mut cached = 0;
    for path in &self.inner.precache {
      let url = match self.inner.rules.resolve(path) {
        Ok(url) => url,
        Err(e) => {
          tracing::warn!(error = %e, path, "Skipping precache path");
          continue;
        }
      };
      let request = HttpRequest::get(url);
      let region = self.inner.rules.classify(&request).region;
      let key = super::classify::cache_key(region, &request);

      match self.inner.fetcher.fetch(request).await {
        Ok(response) if response.is_success() => {
          self.store(&key, region, &response).await;
          cached += 1;
        }
        Ok(response) => {
          tracing::warn!(path, status = response.status, "Precache request rejected");
        }
        Err(e) => tracing::warn!(error = %e, path, "Precache request failed"),
      }
    }

    tracing::info!(cached, total = self.inner.precache.len(), "Interception layer installed");
    *lock(&self.inner.lifecycle) = Lifecycle::Waiting;
    if self.inner.skip_waiting {
      self.activate();
    }
    cached
  }

  /// Start handling requests.
  pub fn activate(&self) {
    let mut lifecycle = lock(&self.inner.lifecycle);
    if *lifecycle != Lifecycle::Active {
      *lifecycle = Lifecycle::Active;
      tracing::info!("Interception layer active");
    }
  }

  pub async fn control(&self, message: ControlMessage) -> Result<ControlReply, WorkerError> {
    match message {
      ControlMessage::ActivateImmediately => {
        self.activate();
        Ok(ControlReply::Activated)
      }
      ControlMessage::PurgeAll => {
        let mut removed = 0;
        for region in CacheRegion::INTERCEPTED {
          removed += self.inner.cache.delete_prefix(&region.prefix()).await?;
        }
        tracing::info!(removed, "Purged intercepted responses");
        Ok(ControlReply::Purged { removed })
      }
      ControlMessage::ReportStatus => Ok(ControlReply::Status(self.status().await?)),
    }
  }

  /// Per-region entry counts of the responses this layer cached.
  pub async fn status(&self) -> Result<CacheStatus, WorkerError> {
    let mut regions: BTreeMap<CacheRegion, RegionStatus> = CacheRegion::INTERCEPTED
      .into_iter()
      .map(|region| (region, RegionStatus::default()))
      .collect();

    for key in self.inner.cache.keys().await? {
      if let Some(status) = regions.get_mut(&CacheRegion::of_key(&key)) {
        status.count += 1;
        status.keys.push(key);
      }
    }

    Ok(CacheStatus {
      lifecycle: self.lifecycle(),
      regions,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::config::{CacheConfig, MessagesConfig};
  use crate::http::testing::ScriptedFetcher;
  use crate::http::HttpResponse;
  use crate::intercept::layer::tests::{interceptor, server_config};
  use crate::worker::{CacheClient, CACHE_TIMEOUT};
  use serde_json::json;
  use std::sync::Arc;
  use url::Url;

  fn fresh(fetcher: Arc<ScriptedFetcher>, skip_waiting: bool) -> Interceptor {
    let cache = CacheClient::spawn(Box::new(MemoryStorage::new()), CACHE_TIMEOUT).unwrap();
    let server = crate::config::ServerConfig {
      skip_waiting,
      ..server_config()
    };
    Interceptor::new(
      &server,
      &CacheConfig::default(),
      &MessagesConfig::default(),
      fetcher,
      cache,
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_install_precaches_and_activates() {
    let fetcher = Arc::new(ScriptedFetcher::offline());
    fetcher.push("/", Ok(HttpResponse::new(200, "<html>")));
    let interceptor = fresh(fetcher, true);
    assert_eq!(interceptor.lifecycle(), Lifecycle::Installing);

    assert_eq!(interceptor.install().await, 1);
    assert_eq!(interceptor.lifecycle(), Lifecycle::Active);

    // The precached page is served when the network is gone
    let request = HttpRequest::get(Url::parse("https://app.example/").unwrap());
    let response = interceptor.fetch(request).await.unwrap();
    assert_eq!(response.text(), "<html>");
  }

  #[tokio::test]
  async fn test_install_waits_without_skip_waiting() {
    let interceptor = fresh(Arc::new(ScriptedFetcher::offline()), false);
    assert_eq!(interceptor.install().await, 0);
    assert_eq!(interceptor.lifecycle(), Lifecycle::Waiting);

    let reply = interceptor
      .control(ControlMessage::ActivateImmediately)
      .await
      .unwrap();
    assert_eq!(reply, ControlReply::Activated);
    assert_eq!(interceptor.lifecycle(), Lifecycle::Active);
  }

  #[tokio::test]
  async fn test_status_and_purge() {
    let fetcher = Arc::new(ScriptedFetcher::offline());
    fetcher.push("/app.css", Ok(HttpResponse::new(200, "body{}")));
    fetcher.push("/api/agents", Ok(HttpResponse::json(200, &json!([]))));
    let interceptor = interceptor(fetcher);
    for path in ["/app.css", "/api/agents"] {
      let url = Url::parse("https://app.example").unwrap().join(path).unwrap();
      interceptor.fetch(HttpRequest::get(url)).await.unwrap();
    }
    interceptor
      .inner
      .cache
      .set("user-42", json!({"id": 42}), None)
      .await
      .unwrap();

    let status = match interceptor.control(ControlMessage::ReportStatus).await.unwrap() {
      ControlReply::Status(status) => status,
      other => panic!("unexpected {:?}", other),
    };
    assert_eq!(status.regions[&CacheRegion::Static].count, 1);
    assert_eq!(status.regions[&CacheRegion::Api].count, 1);
    assert_eq!(status.regions[&CacheRegion::UserData].count, 0);
    assert!(!status.regions.contains_key(&CacheRegion::Data));

    let reply = interceptor.control(ControlMessage::PurgeAll).await.unwrap();
    assert_eq!(reply, ControlReply::Purged { removed: 2 });
    // Domain data is not owned by the interception layer
    assert_eq!(
      interceptor.inner.cache.keys().await.unwrap(),
      vec!["user-42".to_string()]
    );
  }
}
