//! Core types for the cache store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single cached value with its expiry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  /// Seconds until expiry. `None` never expires.
  pub ttl_seconds: Option<u64>,
  /// Write counter for this key, starting at 1.
  pub version: u64,
}

impl CacheEntry {
  pub fn new(key: &str, payload: Value, ttl_seconds: Option<u64>, now: DateTime<Utc>) -> Self {
    Self {
      key: key.to_string(),
      payload,
      created_at: now,
      ttl_seconds,
      version: 1,
    }
  }

  /// Instant after which the entry is logically absent.
  ///
  /// A TTL too large to represent is treated as no expiry.
  pub fn expires_at(&self) -> Option<DateTime<Utc>> {
    let ttl = i64::try_from(self.ttl_seconds?).ok()?;
    self.created_at.checked_add_signed(Duration::try_seconds(ttl)?)
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at().is_some_and(|at| now > at)
  }

  pub fn metadata(&self, now: DateTime<Utc>) -> EntryMetadata {
    EntryMetadata {
      created_at: self.created_at,
      ttl_seconds: self.ttl_seconds,
      version: self.version,
      is_expired: self.is_expired(now),
    }
  }
}

/// Expiry information about an entry, without its payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryMetadata {
  pub created_at: DateTime<Utc>,
  pub ttl_seconds: Option<u64>,
  pub version: u64,
  pub is_expired: bool,
}

/// Snapshot returned by the stats operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
  /// Entries remaining after the sweep
  pub count: usize,
  pub keys: Vec<String>,
  /// Entries found expired before the sweep ran
  pub expired_count: usize,
}

/// Logical partition of the cache, encoded as a key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheRegion {
  /// Static assets served cache-first
  Static,
  /// Generic API responses served network-first
  Api,
  /// User data served stale-while-revalidate
  UserData,
  /// Other same-origin responses
  General,
  /// Generic and domain data written through the store contract
  Data,
}

impl CacheRegion {
  /// Regions owned by the interception layer.
  pub const INTERCEPTED: [CacheRegion; 4] = [
    CacheRegion::Static,
    CacheRegion::Api,
    CacheRegion::UserData,
    CacheRegion::General,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Api => "api",
      Self::UserData => "user-data",
      Self::General => "general",
      Self::Data => "data",
    }
  }

  /// Key prefix for this region, including the separator.
  pub fn prefix(self) -> String {
    format!("{}:", self.as_str())
  }

  /// Region a key belongs to, judged by its prefix.
  pub fn of_key(key: &str) -> Self {
    Self::INTERCEPTED
      .into_iter()
      .find(|region| {
        key
          .strip_prefix(region.as_str())
          .is_some_and(|rest| rest.starts_with(':'))
      })
      .unwrap_or(Self::Data)
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache because the network was unavailable
  Cache,
  /// Data from cache while a background refresh is in flight
  Stale,
  /// Nothing available; a synthesized offline answer
  Offline,
}

/// Data together with metadata about its source.
#[derive(Debug, Clone)]
pub struct Cached<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> Cached<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_from_cache(&self) -> bool {
    matches!(self.source, CacheSource::Cache | CacheSource::Stale)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_expiry_is_strict() {
    let now = Utc::now();
    let entry = CacheEntry::new("k", json!(1), Some(10), now);
    assert!(!entry.is_expired(now + Duration::seconds(10)));
    assert!(entry.is_expired(now + Duration::seconds(10) + Duration::milliseconds(1)));
  }

  #[test]
  fn test_no_ttl_never_expires() {
    let now = Utc::now();
    let entry = CacheEntry::new("k", json!(1), None, now);
    assert!(!entry.is_expired(now + Duration::days(36500)));
    let huge = CacheEntry::new("k", json!(1), Some(u64::MAX), now);
    assert!(!huge.is_expired(now + Duration::days(36500)));
  }

  #[test]
  fn test_region_of_key() {
    assert_eq!(CacheRegion::of_key("static:abc"), CacheRegion::Static);
    assert_eq!(CacheRegion::of_key("user-data:abc"), CacheRegion::UserData);
    assert_eq!(CacheRegion::of_key("api:abc"), CacheRegion::Api);
    assert_eq!(CacheRegion::of_key("apix:abc"), CacheRegion::Data);
    assert_eq!(CacheRegion::of_key("user-42"), CacheRegion::Data);
  }
}
