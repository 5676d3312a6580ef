//! Commands the hosting application can send to the interceptor.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::lifecycle::{Generation, Lifecycle};

/// A control message, e.g. `{"type":"SKIP_WAITING"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
  /// Activate the waiting generation now instead of on the next natural activation
  SkipWaiting,
}

impl ControlCommand {
  pub fn parse(message: &str) -> Result<Self> {
    serde_json::from_str(message).map_err(|e| eyre!("Unrecognized control message {}: {}", message, e))
  }
}

pub struct ControlChannel {
  lifecycle: Arc<Lifecycle>,
}

impl ControlChannel {
  pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
    Self { lifecycle }
  }

  /// Apply a command. Returns the generation that became Active, if any.
  pub async fn handle(&self, command: ControlCommand) -> Result<Option<Generation>> {
    match command {
      ControlCommand::SkipWaiting => {
        info!("skip-waiting requested");
        self.lifecycle.activate().await
      }
    }
  }
}
