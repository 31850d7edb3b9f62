//! Typed helpers for caching domain data (user profiles, agent lists).

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};

use super::traits::Cached;
use crate::worker::CacheClient;

/// Domain entries live for a day unless configured otherwise.
pub const DEFAULT_DOMAIN_TTL_SECS: u64 = 24 * 60 * 60;

/// Caches domain entities through the cache worker.
///
/// Reads never fail: a storage or worker error is logged and treated as a miss.
#[derive(Clone)]
pub struct DomainCache {
  cache: CacheClient,
  ttl_seconds: u64,
}

impl DomainCache {
  pub fn new(cache: CacheClient) -> Self {
    Self {
      cache,
      ttl_seconds: DEFAULT_DOMAIN_TTL_SECS,
    }
  }

  pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
    self.ttl_seconds = ttl_seconds;
    self
  }

  fn user_key(user_id: &str) -> String {
    format!("user-{}", user_id)
  }

  fn agent_key(user_id: &str) -> String {
    format!("agent-{}", user_id)
  }

  pub async fn cache_user<T: Serialize>(&self, user_id: &str, user: &T) -> Result<()> {
    self.store(&Self::user_key(user_id), user).await
  }

  pub async fn cached_user<T: DeserializeOwned>(&self, user_id: &str) -> Option<Cached<T>> {
    self.load(&Self::user_key(user_id)).await
  }

  pub async fn user_exists(&self, user_id: &str) -> bool {
    self.exists(&Self::user_key(user_id)).await
  }

  pub async fn delete_user(&self, user_id: &str) -> Result<()> {
    self
      .cache
      .delete(&Self::user_key(user_id))
      .await
      .map_err(|e| eyre!("Failed to delete cached user {}: {}", user_id, e))
  }

  /// Cache the agent configurations belonging to `user_id`.
  pub async fn cache_agents<T: Serialize>(&self, user_id: &str, agents: &T) -> Result<()> {
    self.store(&Self::agent_key(user_id), agents).await
  }

  pub async fn cached_agents<T: DeserializeOwned>(&self, user_id: &str) -> Option<Cached<T>> {
    self.load(&Self::agent_key(user_id)).await
  }

  pub async fn delete_agents(&self, user_id: &str) -> Result<()> {
    self
      .cache
      .delete(&Self::agent_key(user_id))
      .await
      .map_err(|e| eyre!("Failed to delete cached agents for {}: {}", user_id, e))
  }

  async fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let value =
      serde_json::to_value(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    self
      .cache
      .set(key, value, Some(self.ttl_seconds))
      .await
      .map_err(|e| eyre!("Failed to cache {}: {}", key, e))?;
    tracing::debug!(key, "Cached domain entry");
    Ok(())
  }

  async fn load<T: DeserializeOwned>(&self, key: &str) -> Option<Cached<T>> {
    let entry = match self.cache.entry(key).await {
      Ok(entry) => entry?,
      Err(e) => {
        tracing::warn!(key, error = %e, "Failed to read domain cache");
        return None;
      }
    };

    match serde_json::from_value(entry.payload) {
      Ok(data) => Some(Cached::from_cache(data, entry.created_at)),
      Err(e) => {
        tracing::warn!(key, error = %e, "Cached domain entry has an unexpected shape");
        None
      }
    }
  }

  async fn exists(&self, key: &str) -> bool {
    self.cache.exists(key).await.unwrap_or_else(|e| {
      tracing::warn!(key, error = %e, "Failed to check domain cache");
      false
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::worker::CACHE_TIMEOUT;
  use serde::Deserialize;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Profile {
    id: String,
    nickname: String,
  }

  fn domain() -> (DomainCache, CacheClient) {
    let client = CacheClient::spawn(Box::new(MemoryStorage::new()), CACHE_TIMEOUT).unwrap();
    (DomainCache::new(client.clone()), client)
  }

  #[tokio::test]
  async fn test_user_round_trip_is_marked_from_cache() {
    let (domain, client) = domain();
    let profile = Profile {
      id: "42".into(),
      nickname: "ada".into(),
    };
    domain.cache_user("42", &profile).await.unwrap();

    let cached: Cached<Profile> = domain.cached_user("42").await.unwrap();
    assert_eq!(cached.data, profile);
    assert_eq!(cached.source, CacheSource::Cache);
    assert!(cached.is_from_cache());
    assert!(domain.user_exists("42").await);

    let meta = client.metadata("user-42").await.unwrap().unwrap();
    assert_eq!(meta.ttl_seconds, Some(DEFAULT_DOMAIN_TTL_SECS));
  }

  #[tokio::test]
  async fn test_read_failures_degrade_to_miss() {
    let (domain, client) = domain();
    domain.cache_agents("7", &42).await.unwrap();

    // Wrong shape reads as a miss instead of an error
    let wrong: Option<Cached<Profile>> = domain.cached_agents("7").await;
    assert!(wrong.is_none());

    client.terminate();
    let gone: Option<Cached<Vec<String>>> = domain.cached_agents("7").await;
    assert!(gone.is_none());
    assert!(!domain.user_exists("7").await);
  }
}
