use futures::future::BoxFuture;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::http::{Fetcher, HttpRequest};

/// Actively checks whether the server is reachable.
pub trait Probe: Send + Sync {
  fn check(&self) -> BoxFuture<'_, bool>;
}

/// Sends a small uncached HEAD request; reachable means a 2xx answer.
pub struct HttpProbe {
  fetcher: Arc<dyn Fetcher>,
  url: Url,
  timeout: Duration,
}

impl HttpProbe {
  pub fn new(fetcher: Arc<dyn Fetcher>, url: Url, timeout: Duration) -> Self {
    Self {
      fetcher,
      url,
      timeout,
    }
  }
}

impl Probe for HttpProbe {
  fn check(&self) -> BoxFuture<'_, bool> {
    Box::pin(async move {
      let request = HttpRequest::new(Method::HEAD, self.url.clone())
        .with_header("cache-control", "no-store")
        .with_timeout(self.timeout);
      match tokio::time::timeout(self.timeout, self.fetcher.fetch(request)).await {
        Ok(Ok(response)) => response.is_success(),
        Ok(Err(e)) => {
          tracing::debug!(error = %e, url = %self.url, "Connectivity probe failed");
          false
        }
        Err(_) => {
          tracing::debug!(url = %self.url, "Connectivity probe timed out");
          false
        }
      }
    })
  }
}

/// Probe with a fixed answer, for hosts that trust passive signals.
pub struct StaticProbe(pub bool);

impl Probe for StaticProbe {
  fn check(&self) -> BoxFuture<'_, bool> {
    let reachable = self.0;
    Box::pin(async move { reachable })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::testing::ScriptedFetcher;
  use crate::http::HttpResponse;

  #[tokio::test]
  async fn test_http_probe() {
    let fetcher = Arc::new(ScriptedFetcher::offline());
    fetcher.push("/favicon.ico", Ok(HttpResponse::new(200, "")));
    fetcher.push("/favicon.ico", Ok(HttpResponse::new(502, "")));
    let url = Url::parse("https://app.example/favicon.ico").unwrap();
    let probe = HttpProbe::new(fetcher.clone(), url, Duration::from_secs(5));

    assert!(probe.check().await);
    assert!(!probe.check().await);
    assert!(!probe.check().await);

    let sent = &fetcher.calls()[0];
    assert_eq!(sent.method, Method::HEAD);
    assert_eq!(sent.headers["cache-control"], "no-store");
  }
}
