//! Scripted network for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::FetchError;

use super::client::Network;
use super::types::{Request, Response};

/// Serves canned responses by URL and counts every fetch.
#[derive(Default)]
pub struct StubNetwork {
  routes: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl StubNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve `body` with a 200 for the given absolute URL.
  pub fn serve(&self, url: &str, body: &str) {
    self.serve_response(url, Response::new(200, Vec::new(), body.to_string()));
  }

  pub fn serve_response(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Network for StubNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Network("connection refused".to_string()));
    }

    let routes = self.routes.lock().unwrap();
    Ok(
      routes
        .get(request.url.as_str())
        .cloned()
        .unwrap_or_else(|| Response::new(404, Vec::new(), "missing")),
    )
  }
}
