//! Cache layer that resolves intercepted requests against the store and the network.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::FetchError;
use crate::lifecycle::Generation;
use crate::net::{Network, Request, Response};
use crate::router::Strategy;

use super::storage::{CacheEntry, CacheStorage};
use super::traits::{RequestKey, Resolved};

/// Runs the four resolution strategies.
///
/// Entries are read from and written to whichever generation is current when
/// the operation runs. With no current generation every read misses and every
/// write is dropped.
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  generation: watch::Receiver<Option<Generation>>,
}

impl CacheLayer {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    generation: watch::Receiver<Option<Generation>>,
  ) -> Self {
    Self {
      storage,
      network,
      generation,
    }
  }

  /// Produce the single response for `request` under `strategy`.
  ///
  /// Only stale-while-revalidate with an empty store and a failed fetch
  /// returns `Err`; every other failure becomes a response.
  #[instrument(skip_all, fields(url = %request.url, strategy = %strategy))]
  pub async fn resolve(&self, request: &Request, strategy: Strategy) -> Result<Resolved, FetchError> {
    match strategy {
      Strategy::NetworkOnly => Ok(self.network_only(request).await),
      Strategy::NetworkFirst => Ok(self.network_first(request).await),
      Strategy::CacheFirst => Ok(self.cache_first(request).await),
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  /// Network, or the offline payload. Never touches the store.
  async fn network_only(&self, request: &Request) -> Resolved {
    match self.network.fetch(request).await {
      Ok(response) => Resolved::from_network(response),
      Err(e) => {
        debug!(error = %e, "network failed, serving offline response");
        Resolved::synthetic(Response::offline())
      }
    }
  }

  /// Network with a background store write; store, then offline payload, on failure.
  async fn network_first(&self, request: &Request) -> Resolved {
    match self.network.fetch(request).await {
      Ok(response) => {
        let write = self.store_in_background(request, &response);
        let resolved = Resolved::from_network(response);
        match write {
          Some(handle) => resolved.with_background(handle),
          None => resolved,
        }
      }
      Err(e) => match self.read(request) {
        Some(cached) => {
          debug!(error = %e, outcome = "hit", "network failed, serving cached response");
          Resolved::from_cache(cached)
        }
        None => {
          debug!(error = %e, outcome = "miss", "network failed, serving offline response");
          Resolved::synthetic(Response::offline())
        }
      },
    }
  }

  /// Store without touching the network; network on a miss, 404 if that fails.
  async fn cache_first(&self, request: &Request) -> Resolved {
    if let Some(cached) = self.read(request) {
      debug!(outcome = "hit", "serving cached response");
      return Resolved::from_cache(cached);
    }

    debug!(outcome = "miss", "fetching from network");
    match self.network.fetch(request).await {
      Ok(response) => {
        let write = self.store_in_background(request, &response);
        let resolved = Resolved::from_network(response);
        match write {
          Some(handle) => resolved.with_background(handle),
          None => resolved,
        }
      }
      Err(e) => {
        debug!(error = %e, "network failed, treating asset as missing");
        Resolved::synthetic(Response::not_found())
      }
    }
  }

  /// Cached entry right away with a revalidation behind it, or wait for the network.
  async fn stale_while_revalidate(&self, request: &Request) -> Result<Resolved, FetchError> {
    if let Some(cached) = self.read(request) {
      debug!(outcome = "hit", "serving cached response, revalidating");
      let handle = self.revalidate_in_background(request);
      return Ok(Resolved::from_cache(cached).with_background(handle));
    }

    debug!(outcome = "miss", "waiting for network");
    let response = self.network.fetch(request).await?;
    let write = self.store_in_background(request, &response);
    let resolved = Resolved::from_network(response);
    Ok(match write {
      Some(handle) => resolved.with_background(handle),
      None => resolved,
    })
  }

  /// Look the request up in the current generation. Store errors count as a miss.
  fn read(&self, request: &Request) -> Option<Response> {
    let generation = self.generation.borrow().clone()?;
    let key = RequestKey::for_request(request);

    match self.storage.get(&generation, &key) {
      Ok(found) => found,
      Err(e) => {
        warn!(error = %e, generation = %generation, "cache read failed, treating as miss");
        None
      }
    }
  }

  /// Spawn a write of a successful response. Returns `None` when there is nothing to write.
  fn store_in_background(&self, request: &Request, response: &Response) -> Option<JoinHandle<()>> {
    if !response.is_success() {
      return None;
    }

    let entry = CacheEntry::new(request, response.clone());
    let this = self.clone();
    Some(tokio::spawn(async move {
      this.write(&entry);
    }))
  }

  fn revalidate_in_background(&self, request: &Request) -> JoinHandle<()> {
    let request = request.clone();
    let this = self.clone();
    tokio::spawn(async move {
      match this.network.fetch(&request).await {
        Ok(response) if response.is_success() => {
          this.write(&CacheEntry::new(&request, response));
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "revalidation returned non-success, keeping cached entry");
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "revalidation failed, keeping cached entry");
        }
      }
    })
  }

  /// Write into whichever generation is current now, unless it has been
  /// retired in the meantime. Failures are logged only.
  fn write(&self, entry: &CacheEntry) {
    let Some(generation) = self.generation.borrow().clone() else {
      debug!(url = %entry.url, "no active generation, dropping cache write");
      return;
    };

    match self.storage.put_if_active(&generation, entry) {
      Ok(true) => {}
      Ok(false) => {
        debug!(url = %entry.url, generation = %generation, "generation no longer active, dropping cache write");
      }
      Err(e) => {
        warn!(url = %entry.url, generation = %generation, error = %e, "cache write failed");
      }
    }
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      generation: self.generation.clone(),
    }
  }
}
