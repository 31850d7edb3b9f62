//! HTTP transport used by the interception layer, the sync controller and the probe.

use futures::future::BoxFuture;
use reqwest::Method;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  /// Header names are lowercase
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  pub timeout: Option<Duration>,
}

impl HttpRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: None,
      timeout: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  pub status: u16,
  /// Header names are lowercase
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    let mut response = Self::new(status, value.to_string());
    response.headers.insert(
      "content-type".to_string(),
      "application/json; charset=utf-8".to_string(),
    );
    response
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Transport-level failures. Never shown to end users as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Unreachable(String),
  #[error("request timed out")]
  Timeout,
  #[error("invalid request: {0}")]
  Invalid(String),
}

/// Performs HTTP requests. Injected so tests can script the network.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, FetchError>>;
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestFetcher {
  client: reqwest::Client,
}

impl ReqwestFetcher {
  pub fn new(default_timeout: Duration) -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(default_timeout)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

impl Fetcher for ReqwestFetcher {
  fn fetch(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, FetchError>> {
    Box::pin(async move {
      let mut builder = self.client.request(request.method, request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name, value);
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }
      if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
      }

      let response = builder.send().await.map_err(classify_error)?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response.bytes().await.map_err(classify_error)?.to_vec();

      Ok(HttpResponse {
        status,
        headers,
        body,
      })
    })
  }
}

fn classify_error(e: reqwest::Error) -> FetchError {
  if e.is_timeout() {
    FetchError::Timeout
  } else if e.is_builder() {
    FetchError::Invalid(e.to_string())
  } else {
    FetchError::Unreachable(e.to_string())
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::collections::{HashMap, VecDeque};
  use std::sync::Mutex;

  type Scripted = Result<HttpResponse, FetchError>;

  /// Fetcher that answers from per-path scripts and records every request.
  pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    fallback: Mutex<Scripted>,
    calls: Mutex<Vec<HttpRequest>>,
  }

  impl ScriptedFetcher {
    /// Every unscripted request fails as unreachable.
    pub fn offline() -> Self {
      Self {
        routes: Mutex::new(HashMap::new()),
        fallback: Mutex::new(Err(FetchError::Unreachable("offline".into()))),
        calls: Mutex::new(Vec::new()),
      }
    }

    /// Queue one answer for `path`; answers are used in order, then the fallback.
    pub fn push(&self, path: &str, answer: Scripted) {
      self
        .routes
        .lock()
        .unwrap()
        .entry(path.to_string())
        .or_default()
        .push_back(answer);
    }

    pub fn set_fallback(&self, answer: Scripted) {
      *self.fallback.lock().unwrap() = answer;
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
      self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == path)
        .count()
    }
  }

  impl Fetcher for ScriptedFetcher {
    fn fetch(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, FetchError>> {
      let path = request.url.path().to_string();
      self.calls.lock().unwrap().push(request);
      let answer = self
        .routes
        .lock()
        .unwrap()
        .get_mut(&path)
        .and_then(VecDeque::pop_front)
        .unwrap_or_else(|| self.fallback.lock().unwrap().clone());
      Box::pin(async move {
        tokio::task::yield_now().await;
        answer
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_success_range() {
    assert!(HttpResponse::new(200, "").is_success());
    assert!(HttpResponse::new(204, "").is_success());
    assert!(!HttpResponse::new(304, "").is_success());
    assert!(!HttpResponse::new(503, "").is_success());
  }

  #[test]
  fn test_request_headers_are_lowercased() {
    let url = Url::parse("https://app.example/api/me").unwrap();
    let request = HttpRequest::get(url).with_header("Content-Type", "application/json");
    assert_eq!(request.headers["content-type"], "application/json");
  }
}
