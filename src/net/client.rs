//! Network fetch provider.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::types::{Method, Request, Response};

/// A fetch that never produced a response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("network request failed: {0}")]
  Failed(String),

  #[error("network request timed out after {0:?}")]
  Timeout(Duration),
}

/// Performs network requests on behalf of the engine.
///
/// Any HTTP status counts as a response; only transport failures are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Run one fetch attempt bounded by `timeout`. Expiry is reported as
/// [`FetchError::Timeout`] and is handled exactly like a network failure.
pub async fn fetch_with_timeout(
  fetcher: &dyn Fetcher,
  request: &Request,
  timeout: Duration,
) -> Result<Response, FetchError> {
  match tokio::time::timeout(timeout, fetcher.fetch(request)).await {
    Ok(result) => result,
    Err(_) => {
      debug!(url = %request.url, ?timeout, "fetch timed out");
      Err(FetchError::Timeout(timeout))
    }
  }
}

/// `reqwest`-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Options => reqwest::Method::OPTIONS,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(to_reqwest_method(request.method), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::Failed(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Failed(e.to_string()))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
