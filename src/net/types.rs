//! Request/response contract shared by the interceptor and its callers.

use bytes::Bytes;
use reqwest::Method;
use serde::Serialize;
use url::Url;

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }
}

/// A fully buffered response.
///
/// The body is read off the wire once. Cloning hands out another reader over the
/// same buffer, so the caller and the store can each hold a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

/// Payload of the synthetic offline response.
#[derive(Serialize)]
struct OfflineBody {
  error: &'static str,
  offline: bool,
}

impl Response {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  /// 503 with `{"error":"Offline","offline":true}`.
  pub fn offline() -> Self {
    let body = serde_json::to_vec(&OfflineBody {
      error: "Offline",
      offline: true,
    })
    .unwrap_or_default();

    Self::new(
      503,
      vec![("Content-Type".to_string(), "application/json".to_string())],
      body,
    )
  }

  /// 404 with an empty body, for assets that could not be fetched.
  pub fn not_found() -> Self {
    Self::new(404, Vec::new(), Bytes::new())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_offline_payload() {
    let response = Response::offline();
    assert_eq!(response.status, 503);
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(&response.body[..], br#"{"error":"Offline","offline":true}"#);
    assert!(!response.is_success());
  }

  #[test]
  fn test_not_found_is_empty() {
    let response = Response::not_found();
    assert_eq!(response.status, 404);
    assert!(response.body.is_empty());
    assert!(response.headers.is_empty());
  }

  #[test]
  fn test_success_range() {
    assert!(Response::new(200, Vec::new(), "").is_success());
    assert!(Response::new(204, Vec::new(), "").is_success());
    assert!(!Response::new(304, Vec::new(), "").is_success());
    assert!(!Response::new(500, Vec::new(), "").is_success());
  }
}
