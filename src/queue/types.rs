//! Queue item types.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Retry budget given to items unless the caller chooses one.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Kind of mutation a queue item replays against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Create => "CREATE",
      Self::Update => "UPDATE",
      Self::Delete => "DELETE",
    }
  }

  /// HTTP method conventionally used for this operation.
  pub fn default_method(self) -> Method {
    match self {
      Self::Create => Method::POST,
      Self::Update => Method::PUT,
      Self::Delete => Method::DELETE,
    }
  }
}

impl FromStr for Operation {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "CREATE" => Ok(Self::Create),
      "UPDATE" => Ok(Self::Update),
      "DELETE" => Ok(Self::Delete),
      other => Err(eyre!("Unknown queue operation: {}", other)),
    }
  }
}

fn serialize_method<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_str(method.as_str())
}

/// A pending write destined for the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
  pub id: String,
  pub operation: Operation,
  pub entity_type: String,
  pub entity_id: String,
  pub payload: Option<Value>,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
  pub max_retries: u32,
  pub target_url: String,
  #[serde(serialize_with = "serialize_method")]
  pub method: Method,
  pub headers: BTreeMap<String, String>,
}

impl QueueItem {
  /// Retry budget exhausted; the item stays stored but is not retried automatically.
  pub fn is_failed(&self) -> bool {
    self.retry_count >= self.max_retries
  }
}

/// A queue item before the store assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
  pub operation: Operation,
  pub entity_type: String,
  pub entity_id: String,
  pub payload: Option<Value>,
  pub max_retries: u32,
  pub target_url: String,
  pub method: Method,
  pub headers: BTreeMap<String, String>,
}

impl NewQueueItem {
  pub fn new(
    operation: Operation,
    entity_type: &str,
    entity_id: &str,
    payload: Option<Value>,
    target_url: &str,
  ) -> Self {
    Self {
      operation,
      entity_type: entity_type.to_string(),
      entity_id: entity_id.to_string(),
      payload,
      max_retries: DEFAULT_MAX_RETRIES,
      target_url: target_url.to_string(),
      method: operation.default_method(),
      headers: BTreeMap::new(),
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_string(), value.to_string());
    self
  }

  pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
    self.headers.extend(headers);
    self
  }
}
