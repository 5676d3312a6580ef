//! Failure taxonomy for the interception layer.

use thiserror::Error;

use crate::lifecycle::Generation;

/// A network fetch that produced no response at all.
///
/// A non-2xx status is not a `FetchError`; it is a response like any other.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),
  #[error("request timed out")]
  Timeout,
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      FetchError::Timeout
    } else {
      FetchError::Network(e.to_string())
    }
  }
}

/// Why a provisioning attempt was abandoned.
#[derive(Debug, Error)]
pub enum ProvisionError {
  #[error("generation {0} was retired and cannot be reinstated")]
  Retired(Generation),
  #[error("generation {0} already exists with a different preload set; pick a new name")]
  NameReuse(Generation),
  #[error("failed to preload {path}: {reason}")]
  Preload { path: String, reason: String },
  #[error("store error: {0}")]
  Store(color_eyre::Report),
}

impl From<color_eyre::Report> for ProvisionError {
  fn from(e: color_eyre::Report) -> Self {
    ProvisionError::Store(e)
  }
}
