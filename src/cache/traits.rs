//! Core types for the caching system.

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::net::{Request, Response};

/// Identity of a request inside a store.
///
/// Derived from method and absolute URL only; request headers do not vary the entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn for_request(request: &Request) -> Self {
    let input = format!("{} {}", request.method, request.url);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// Where a resolved response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh response from the network
  Network,
  /// Snapshot read from the current generation's store
  Cache,
  /// Fabricated offline or missing-asset response
  Synthetic,
}

/// The single authoritative response for an intercepted request.
#[derive(Debug)]
pub struct Resolved {
  pub response: Response,
  pub source: CacheSource,
  /// Background store write or revalidation still in flight, if any.
  /// Dropping the handle detaches the task; it keeps running.
  pub background: Option<JoinHandle<()>>,
}

impl Resolved {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      background: None,
    }
  }

  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      background: None,
    }
  }

  pub fn synthetic(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Synthetic,
      background: None,
    }
  }

  pub fn with_background(mut self, handle: JoinHandle<()>) -> Self {
    self.background = Some(handle);
    self
  }

  /// Wait for any background work to land.
  pub async fn settle(&mut self) {
    if let Some(handle) = self.background.take() {
      let _ = handle.await;
    }
  }
}
