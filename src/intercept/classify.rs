//! Request classification: which strategy and cache region apply.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use super::response::OfflineKind;
use crate::cache::CacheRegion;
use crate::config::ServerConfig;
use crate::http::HttpRequest;

/// File extensions served cache-first.
pub const STATIC_EXTENSIONS: [&str; 12] = [
  "js", "css", "png", "jpg", "jpeg", "gif", "svg", "woff", "woff2", "ttf", "ico", "webp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  /// Not handled; the host performs the request itself
  PassThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
  pub strategy: Strategy,
  pub region: CacheRegion,
  pub kind: OfflineKind,
}

impl Route {
  const fn new(strategy: Strategy, region: CacheRegion, kind: OfflineKind) -> Self {
    Self {
      strategy,
      region,
      kind,
    }
  }
}

/// Classification inputs derived from the server configuration.
#[derive(Debug, Clone)]
pub struct Rules {
  pub origin: Url,
  pub api_prefix: String,
  pub user_data_prefixes: Vec<String>,
}

impl Rules {
  pub fn from_config(server: &ServerConfig) -> Result<Self> {
    let origin = Url::parse(&server.origin)
      .map_err(|e| eyre!("Invalid server origin {}: {}", server.origin, e))?;
    Ok(Self {
      origin,
      api_prefix: server.api_prefix.clone(),
      user_data_prefixes: server.user_data_prefixes.clone(),
    })
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid request path {}: {}", path, e))
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// Pick the route for a request. First match wins.
  pub fn classify(&self, request: &HttpRequest) -> Route {
    if !self.is_same_origin(&request.url) {
      return Route::new(Strategy::PassThrough, CacheRegion::General, OfflineKind::General);
    }

    let path = request.url.path();
    let route = if is_static_asset(path) {
      Route::new(Strategy::CacheFirst, CacheRegion::Static, OfflineKind::Static)
    } else if self.user_data_prefixes.iter().any(|p| path.starts_with(p)) {
      Route::new(
        Strategy::StaleWhileRevalidate,
        CacheRegion::UserData,
        OfflineKind::UserData,
      )
    } else if path.starts_with(&self.api_prefix) {
      Route::new(Strategy::NetworkFirst, CacheRegion::Api, OfflineKind::Api)
    } else {
      Route::new(Strategy::NetworkFirst, CacheRegion::General, OfflineKind::General)
    };

    // Only GET responses are ever read from or written to the cache
    if request.method != Method::GET {
      return Route {
        strategy: Strategy::NetworkFirst,
        ..route
      };
    }
    route
  }
}

fn is_static_asset(path: &str) -> bool {
  let file = path.rsplit('/').next().unwrap_or(path);
  match file.rsplit_once('.') {
    Some((_, ext)) => STATIC_EXTENSIONS
      .iter()
      .any(|candidate| ext.eq_ignore_ascii_case(candidate)),
    None => false,
  }
}

/// Cache key for a request within a region: the hashed method and URL.
pub fn cache_key(region: CacheRegion, request: &HttpRequest) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(request.url.as_str().as_bytes());
  format!("{}{}", region.prefix(), hex::encode(hasher.finalize()))
}
