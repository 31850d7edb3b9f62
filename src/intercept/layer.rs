//! Interception layer that answers requests from the network or the cache.

use color_eyre::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use super::classify::{cache_key, Route, Rules, Strategy};
use super::control::Lifecycle;
use super::response::{OfflineKind, Response, StoredResponse};
use crate::cache::CacheRegion;
use crate::config::{CacheConfig, MessagesConfig, ServerConfig};
use crate::http::{FetchError, Fetcher, HttpRequest, HttpResponse};
use crate::worker::CacheClient;

/// Lifetime of cached responses per region.
#[derive(Debug, Clone, Copy)]
pub struct RegionTtls {
  pub static_secs: u64,
  pub api_secs: u64,
  pub user_data_secs: u64,
  pub general_secs: u64,
}

impl RegionTtls {
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      static_secs: config.static_ttl_secs,
      api_secs: config.api_ttl_secs,
      user_data_secs: config.user_data_ttl_secs,
      general_secs: config.general_ttl_secs,
    }
  }

  pub fn ttl(&self, region: CacheRegion) -> Option<u64> {
    match region {
      CacheRegion::Static => Some(self.static_secs),
      CacheRegion::Api => Some(self.api_secs),
      CacheRegion::UserData => Some(self.user_data_secs),
      CacheRegion::General => Some(self.general_secs),
      CacheRegion::Data => None,
    }
  }
}

/// What the layer decided to do with a request.
#[derive(Debug)]
pub enum Intercepted {
  Respond(Response),
  /// Not handled; the host should perform the request itself
  PassThrough(HttpRequest),
}

pub(super) struct Inner {
  pub(super) rules: Rules,
  pub(super) precache: Vec<String>,
  pub(super) skip_waiting: bool,
  ttls: RegionTtls,
  messages: BTreeMap<OfflineKind, String>,
  pub(super) fetcher: Arc<dyn Fetcher>,
  pub(super) cache: CacheClient,
  pub(super) lifecycle: Mutex<Lifecycle>,
  /// Keys with a background refresh in flight
  revalidating: Mutex<HashSet<String>>,
}

/// Sits between the application and the network.
///
/// Static assets are served cache-first, user data stale-while-revalidate and
/// everything else same-origin network-first. When neither the network nor the
/// cache can answer, a structured offline response is returned instead of a
/// transport error.
#[derive(Clone)]
pub struct Interceptor {
  pub(super) inner: Arc<Inner>,
}

impl Interceptor {
  pub fn new(
    server: &ServerConfig,
    cache_config: &CacheConfig,
    messages: &MessagesConfig,
    fetcher: Arc<dyn Fetcher>,
    cache: CacheClient,
  ) -> Result<Self> {
    let inner = Inner {
      rules: Rules::from_config(server)?,
      precache: server.precache.clone(),
      skip_waiting: server.skip_waiting,
      ttls: RegionTtls::from_config(cache_config),
      messages: messages.offline.clone(),
      fetcher,
      cache,
      lifecycle: Mutex::new(Lifecycle::Installing),
      revalidating: Mutex::new(HashSet::new()),
    };
    Ok(Self {
      inner: Arc::new(inner),
    })
  }

  pub fn rules(&self) -> &Rules {
    &self.inner.rules
  }

  /// Route a request through the strategy its classification picks.
  pub async fn handle(&self, request: HttpRequest) -> Intercepted {
    if self.lifecycle() != Lifecycle::Active {
      return Intercepted::PassThrough(request);
    }

    let route = self.inner.rules.classify(&request);
    let response = match route.strategy {
      Strategy::PassThrough => return Intercepted::PassThrough(request),
      Strategy::CacheFirst => self.cache_first(request, route).await,
      Strategy::NetworkFirst => self.network_first(request, route).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, route).await,
    };
    Intercepted::Respond(response)
  }

  /// Like [`handle`](Self::handle), performing pass-through requests directly.
  pub async fn fetch(&self, request: HttpRequest) -> Result<Response, FetchError> {
    match self.handle(request).await {
      Intercepted::Respond(response) => Ok(response),
      Intercepted::PassThrough(request) => {
        let response = self.inner.fetcher.fetch(request).await?;
        Ok(Response::from_network(response))
      }
    }
  }

  /// Number of background refreshes still running.
  pub fn pending_revalidations(&self) -> usize {
    lock(&self.inner.revalidating).len()
  }

  async fn cache_first(&self, request: HttpRequest, route: Route) -> Response {
    let key = cache_key(route.region, &request);
    if let Some(cached) = self.lookup(&key, false).await {
      return cached;
    }

    match self.inner.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(&key, route.region, &response).await;
        Response::from_network(response)
      }
      Err(e) => {
        tracing::debug!(error = %e, "Static asset unavailable offline");
        self.offline(route.kind)
      }
    }
  }

  async fn network_first(&self, request: HttpRequest, route: Route) -> Response {
    let cacheable = request.method == reqwest::Method::GET;
    let key = cache_key(route.region, &request);

    match self.inner.fetcher.fetch(request).await {
      Ok(response) => {
        if cacheable {
          self.store(&key, route.region, &response).await;
        }
        Response::from_network(response)
      }
      Err(e) => {
        tracing::debug!(error = %e, region = route.region.as_str(), "Network failed, trying cache");
        if cacheable {
          if let Some(cached) = self.lookup(&key, false).await {
            return cached;
          }
        }
        self.offline(route.kind)
      }
    }
  }

  async fn stale_while_revalidate(&self, request: HttpRequest, route: Route) -> Response {
    let key = cache_key(route.region, &request);
    if let Some(cached) = self.lookup(&key, true).await {
      self.spawn_revalidation(key, request, route.region);
      return cached;
    }

    match self.inner.fetcher.fetch(request).await {
      Ok(response) => {
        self.store(&key, route.region, &response).await;
        Response::from_network(response)
      }
      Err(e) => {
        tracing::debug!(error = %e, "User data unavailable offline");
        self.offline(route.kind)
      }
    }
  }

  /// Refresh a stale entry without blocking the caller.
  fn spawn_revalidation(&self, key: String, request: HttpRequest, region: CacheRegion) {
    if !lock(&self.inner.revalidating).insert(key.clone()) {
      return;
    }

    let this = self.clone();
    tokio::spawn(async move {
      match this.inner.fetcher.fetch(request).await {
        Ok(response) => this.store(&key, region, &response).await,
        Err(e) => tracing::debug!(error = %e, key, "Background refresh failed"),
      }
      lock(&this.inner.revalidating).remove(&key);
    });
  }

  /// Read a cached response. Storage problems count as a miss.
  async fn lookup(&self, key: &str, revalidating: bool) -> Option<Response> {
    let entry = match self.inner.cache.entry(key).await {
      Ok(entry) => entry?,
      Err(e) => {
        tracing::warn!(error = %e, key, "Cache read failed, treating as miss");
        return None;
      }
    };

    let cached = StoredResponse::from_value(entry.payload)
      .and_then(|stored| Response::from_cache(stored, entry.created_at, revalidating));
    match cached {
      Ok(response) => Some(response),
      Err(e) => {
        tracing::warn!(error = %e, key, "Dropping unreadable cached response");
        None
      }
    }
  }

  /// Cache a successful response. Error statuses are never cached.
  pub(super) async fn store(&self, key: &str, region: CacheRegion, response: &HttpResponse) {
    if !response.is_success() {
      return;
    }

    let value = match StoredResponse::capture(response).to_value() {
      Ok(value) => value,
      Err(e) => {
        tracing::warn!(error = %e, key, "Failed to encode response for cache");
        return;
      }
    };
    if let Err(e) = self
      .inner
      .cache
      .set(key, value, self.inner.ttls.ttl(region))
      .await
    {
      tracing::warn!(error = %e, key, "Failed to cache response");
    }
  }

  fn offline(&self, kind: OfflineKind) -> Response {
    let message = self
      .inner
      .messages
      .get(&kind)
      .map(String::as_str)
      .unwrap_or_else(|| kind.default_message());
    Response::offline(kind, message)
  }
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
