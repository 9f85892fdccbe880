//! Request and response values that flow through the engine.
//!
//! These are deliberately plain data: the engine snapshots them into cache
//! entries and queue items, so they must be cloneable and serializable.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Options,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Non-idempotent methods that are queued when the network is unreachable.
  pub fn is_mutation(self) -> bool {
    matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Options => "OPTIONS",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }

  /// Parse a method name, case-insensitively.
  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Some(Self::Get),
      "HEAD" => Some(Self::Head),
      "OPTIONS" => Some(Self::Options),
      "POST" => Some(Self::Post),
      "PUT" => Some(Self::Put),
      "PATCH" => Some(Self::Patch),
      "DELETE" => Some(Self::Delete),
      _ => None,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Header pairs in the order they were sent
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Cache key for this request.
  pub fn cache_key(&self) -> String {
    self.url.to_string()
  }
}

/// A response, either from the network, from a cache tier, or synthesized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// First header value matching `name` (case-insensitive).
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Body decoded as UTF-8, lossily.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mutation_methods() {
    assert!(Method::Post.is_mutation());
    assert!(Method::Delete.is_mutation());
    assert!(!Method::Get.is_mutation());
    assert!(!Method::Options.is_mutation());
  }

  #[test]
  fn test_method_parse_is_case_insensitive() {
    assert_eq!(Method::parse("patch"), Some(Method::Patch));
    assert_eq!(Method::parse("TRACE"), None);
  }

  #[test]
  fn test_header_lookup_ignores_case() {
    let response = Response::new(200, "ok").with_header("Content-Type", "text/plain");
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert!(response.is_success());
  }
}
