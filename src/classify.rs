//! Request classification: which tier and caching strategy serve a request.

use url::Url;

use crate::cache::TierKind;
use crate::config::RoutingConfig;
use crate::net::{Method, Request};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "ico"];
const STATIC_EXTENSIONS: &[&str] = &["js", "css", "html"];

/// Read classes, each bound to one tier and one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Image,
  Api,
  Static,
  Dynamic,
}

/// How a class is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  CacheFirstWithPlaceholder,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl RequestClass {
  pub fn tier(self) -> TierKind {
    match self {
      Self::Image => TierKind::Images,
      Self::Api => TierKind::Api,
      Self::Static => TierKind::Static,
      Self::Dynamic => TierKind::Dynamic,
    }
  }

  pub fn strategy(self) -> Strategy {
    match self {
      Self::Image => Strategy::CacheFirstWithPlaceholder,
      Self::Api => Strategy::NetworkFirst,
      Self::Static => Strategy::CacheFirst,
      Self::Dynamic => Strategy::StaleWhileRevalidate,
    }
  }
}

/// Where an intercepted request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// GET served through a read strategy
  Read(RequestClass),
  /// POST/PUT/PATCH/DELETE, queued on network failure
  Mutation,
  /// Other methods go straight to the network, uncached
  PassThrough,
}

/// Route a request. Pure function of the request and the routing table.
pub fn classify(request: &Request, routing: &RoutingConfig) -> Route {
  match request.method {
    Method::Get => Route::Read(classify_get(&request.url, routing)),
    m if m.is_mutation() => Route::Mutation,
    _ => Route::PassThrough,
  }
}

/// Classify a GET. First match wins: image, api, static, dynamic.
pub fn classify_get(url: &Url, routing: &RoutingConfig) -> RequestClass {
  let path = url.path();
  let extension = file_extension(path);
  let extension = extension.as_deref();

  if extension.is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext)) {
    return RequestClass::Image;
  }

  if routing.api_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    || routing.api_endpoints.iter().any(|e| e == path)
  {
    return RequestClass::Api;
  }

  if routing
    .static_manifest
    .iter()
    .any(|asset| asset == path || asset == url.as_str())
    || extension.is_some_and(|ext| STATIC_EXTENSIONS.contains(&ext))
  {
    return RequestClass::Static;
  }

  RequestClass::Dynamic
}

/// Lowercased extension of the last path segment.
fn file_extension(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (_, ext) = segment.rsplit_once('.')?;
  if ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}
