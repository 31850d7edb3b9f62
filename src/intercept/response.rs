//! Responses produced by the interception layer.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::cache::CacheSource;
use crate::http::HttpResponse;

/// Marks a response as served from cache (`cache` or `stale`).
pub const SOURCE_HEADER: &str = "x-offsync-source";
/// Epoch milliseconds at which a cache-served response was stored.
pub const CACHED_AT_HEADER: &str = "x-offsync-cached-at";
/// Present on stale responses whose refresh is in flight.
pub const REVALIDATING_HEADER: &str = "x-offsync-revalidating";
/// Present on synthesized offline responses.
pub const OFFLINE_HEADER: &str = "x-offsync-offline";

/// Request category reported in offline responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OfflineKind {
  Static,
  Api,
  UserData,
  General,
}

impl OfflineKind {
  pub fn default_message(self) -> &'static str {
    match self {
      Self::Static => "This resource is not available offline.",
      Self::Api => "You are offline. Please check your network connection.",
      Self::UserData => "You are offline. Your data will refresh when the connection returns.",
      Self::General => "You are offline. Please check your network connection.",
    }
  }
}

/// Body of a synthesized offline response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineBody {
  pub error: String,
  #[serde(rename = "type")]
  pub kind: OfflineKind,
  pub message: String,
  /// Epoch milliseconds
  pub timestamp: i64,
}

/// The form in which a response is kept in the cache store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  /// Hex-encoded body bytes
  pub body: String,
}

impl StoredResponse {
  pub fn capture(response: &HttpResponse) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      body: hex::encode(&response.body),
    }
  }

  pub fn to_value(&self) -> Result<Value> {
    serde_json::to_value(self).map_err(|e| eyre!("Failed to encode cached response: {}", e))
  }

  pub fn from_value(value: Value) -> Result<Self> {
    serde_json::from_value(value).map_err(|e| eyre!("Corrupt cached response: {}", e))
  }

  fn body_bytes(&self) -> Result<Vec<u8>> {
    hex::decode(&self.body).map_err(|e| eyre!("Corrupt cached response body: {}", e))
  }
}

/// A response handed back to the application, with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub source: CacheSource,
  pub cached_at: Option<DateTime<Utc>>,
}

impl Response {
  pub fn from_network(response: HttpResponse) -> Self {
    Self {
      status: response.status,
      headers: response.headers,
      body: response.body,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Rebuild a cached response and annotate it as cache-sourced.
  pub fn from_cache(
    stored: StoredResponse,
    cached_at: DateTime<Utc>,
    revalidating: bool,
  ) -> Result<Self> {
    let body = stored.body_bytes()?;
    let mut headers = stored.headers;
    let source = if revalidating {
      headers.insert(REVALIDATING_HEADER.to_string(), "true".to_string());
      CacheSource::Stale
    } else {
      CacheSource::Cache
    };
    headers.insert(
      SOURCE_HEADER.to_string(),
      if revalidating { "stale" } else { "cache" }.to_string(),
    );
    headers.insert(
      CACHED_AT_HEADER.to_string(),
      cached_at.timestamp_millis().to_string(),
    );

    Ok(Self {
      status: stored.status,
      headers,
      body,
      source,
      cached_at: Some(cached_at),
    })
  }

  /// The structured 503 returned when neither network nor cache can answer.
  pub fn offline(kind: OfflineKind, message: &str) -> Self {
    let body = OfflineBody {
      error: "offline".to_string(),
      kind,
      message: message.to_string(),
      timestamp: Utc::now().timestamp_millis(),
    };
    let mut headers = BTreeMap::new();
    headers.insert(
      "content-type".to_string(),
      "application/json; charset=utf-8".to_string(),
    );
    headers.insert(OFFLINE_HEADER.to_string(), "true".to_string());

    Self {
      status: 503,
      headers,
      body: json!(body).to_string().into_bytes(),
      source: CacheSource::Offline,
      cached_at: None,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_offline(&self) -> bool {
    self.source == CacheSource::Offline
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json(&self) -> Result<Value> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Response body is not JSON: {}", e))
  }

  /// Parsed offline body, when this is a synthesized offline response.
  pub fn offline_body(&self) -> Option<OfflineBody> {
    if !self.is_offline() {
      return None;
    }
    serde_json::from_slice(&self.body).ok()
  }
}
