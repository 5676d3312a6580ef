//! Store generations and the transitions between them.
//!
//! A generation moves Provisioning -> Waiting -> Active -> Retiring -> Retired.
//! Exactly one generation is Active at a time; activating a new one deletes the
//! store of every other generation. Retired names can never be reused.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage};
use crate::db::Database;
use crate::error::ProvisionError;
use crate::net::{Network, Request};

/// Bumped whenever the stored entry layout changes, so that an unchanged
/// generation name with a new layout is caught as a reuse.
const ENTRY_FORMAT_VERSION: u32 = 1;

/// Name of one versioned store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(String);

impl Generation {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Generation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  Provisioning,
  /// Fully provisioned, eligible to become Active
  Waiting,
  Active,
  Retiring,
  Retired,
}

impl GenerationState {
  pub(crate) fn as_str(&self) -> &'static str {
    match self {
      GenerationState::Provisioning => "provisioning",
      GenerationState::Waiting => "waiting",
      GenerationState::Active => "active",
      GenerationState::Retiring => "retiring",
      GenerationState::Retired => "retired",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "provisioning" => Ok(GenerationState::Provisioning),
      "waiting" => Ok(GenerationState::Waiting),
      "active" => Ok(GenerationState::Active),
      "retiring" => Ok(GenerationState::Retiring),
      "retired" => Ok(GenerationState::Retired),
      other => Err(eyre!("Unknown generation state '{}'", other)),
    }
  }
}

impl fmt::Display for GenerationState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Assets that must be stored before a generation may become Active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadSet {
  paths: Vec<String>,
}

impl PreloadSet {
  pub fn new(paths: Vec<String>) -> Self {
    Self { paths }
  }

  pub fn paths(&self) -> &[String] {
    &self.paths
  }

  /// Digest of the content contract: entry format plus the sorted path list.
  pub fn fingerprint(&self) -> String {
    let mut paths = self.paths.clone();
    paths.sort();
    paths.dedup();

    let mut hasher = Sha256::new();
    hasher.update(format!("format:{}\n", ENTRY_FORMAT_VERSION).as_bytes());
    for path in &paths {
      hasher.update(path.as_bytes());
      hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
  }
}

/// A row of the generation registry.
#[derive(Debug, Clone)]
pub struct GenerationRecord {
  pub generation: Generation,
  pub state: GenerationState,
  pub fingerprint: String,
  pub created_at: DateTime<Utc>,
  pub activated_at: Option<DateTime<Utc>>,
  pub retired_at: Option<DateTime<Utc>>,
}

/// Persistent record of every generation the store has seen.
struct GenerationRegistry {
  db: Arc<Database>,
}

impl GenerationRegistry {
  fn get(&self, generation: &Generation) -> Result<Option<GenerationRecord>> {
    let conn = self.db.conn()?;

    let row = conn
      .query_row(
        "SELECT name, state, fingerprint, created_at, activated_at, retired_at
         FROM generations WHERE name = ?",
        params![generation.as_str()],
        raw_record,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read generation {}: {}", generation, e))?;

    row.map(RawRecord::parse).transpose()
  }

  fn all(&self) -> Result<Vec<GenerationRecord>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT name, state, fingerprint, created_at, activated_at, retired_at
         FROM generations ORDER BY created_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], raw_record)
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<RawRecord>>>()
      .map_err(|e| eyre!("Failed to read generation: {}", e))?;

    rows.into_iter().map(RawRecord::parse).collect()
  }

  fn in_state(&self, state: GenerationState) -> Result<Vec<Generation>> {
    Ok(
      self
        .all()?
        .into_iter()
        .filter(|r| r.state == state)
        .map(|r| r.generation)
        .collect(),
    )
  }

  /// The most recently activated Active generation.
  fn newest_active(&self) -> Result<Option<Generation>> {
    let conn = self.db.conn()?;

    let name: Option<String> = conn
      .query_row(
        "SELECT name FROM generations WHERE state = ?
         ORDER BY activated_at DESC, rowid DESC LIMIT 1",
        params![GenerationState::Active.as_str()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active generation: {}", e))?;

    Ok(name.map(Generation::new))
  }

  fn insert(&self, generation: &Generation, fingerprint: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT INTO generations (name, state, fingerprint, created_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![
          generation.as_str(),
          GenerationState::Provisioning.as_str(),
          fingerprint
        ],
      )
      .map_err(|e| eyre!("Failed to register generation {}: {}", generation, e))?;
    Ok(())
  }

  fn set_state(&self, generation: &Generation, state: GenerationState) -> Result<()> {
    let sql = match state {
      GenerationState::Active => {
        "UPDATE generations SET state = ?, activated_at = datetime('now') WHERE name = ?"
      }
      GenerationState::Retired => {
        "UPDATE generations SET state = ?, retired_at = datetime('now') WHERE name = ?"
      }
      _ => "UPDATE generations SET state = ? WHERE name = ?",
    };

    self
      .db
      .conn()?
      .execute(sql, params![state.as_str(), generation.as_str()])
      .map_err(|e| eyre!("Failed to move generation {} to {}: {}", generation, state, e))?;
    Ok(())
  }

  fn remove(&self, generation: &Generation) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "DELETE FROM generations WHERE name = ?",
        params![generation.as_str()],
      )
      .map_err(|e| eyre!("Failed to remove generation {}: {}", generation, e))?;
    Ok(())
  }
}

/// Generation row as read, before its columns are parsed.
struct RawRecord {
  name: String,
  state: String,
  fingerprint: String,
  created_at: String,
  activated_at: Option<String>,
  retired_at: Option<String>,
}

fn raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
  Ok(RawRecord {
    name: row.get(0)?,
    state: row.get(1)?,
    fingerprint: row.get(2)?,
    created_at: row.get(3)?,
    activated_at: row.get(4)?,
    retired_at: row.get(5)?,
  })
}

impl RawRecord {
  fn parse(self) -> Result<GenerationRecord> {
    Ok(GenerationRecord {
      generation: Generation::new(self.name),
      state: GenerationState::parse(&self.state)?,
      fingerprint: self.fingerprint,
      created_at: parse_datetime(&self.created_at)?,
      activated_at: self.activated_at.as_deref().map(parse_datetime).transpose()?,
      retired_at: self.retired_at.as_deref().map(parse_datetime).transpose()?,
    })
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Result of a successful provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
  pub generation: Generation,
  pub state: GenerationState,
  pub entries: usize,
}

/// Generation record plus the size of its store.
#[derive(Debug, Clone)]
pub struct GenerationStatus {
  pub record: GenerationRecord,
  pub entries: usize,
}

/// Owns generation transitions and publishes the current generation.
pub struct Lifecycle {
  registry: GenerationRegistry,
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  current: watch::Sender<Option<Generation>>,
  /// Serializes install and activate
  transition: Mutex<()>,
}

impl Lifecycle {
  /// Load the registry, finish any interrupted retirement, and publish the
  /// Active generation.
  pub fn open(
    db: Arc<Database>,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
  ) -> Result<Self> {
    let registry = GenerationRegistry { db };
    // After an interrupted cutover the most recently activated row wins
    let active = registry.newest_active()?;
    let (current, _) = watch::channel(active.clone());

    let lifecycle = Self {
      registry,
      storage,
      network,
      current,
      transition: Mutex::new(()),
    };

    for generation in lifecycle.registry.in_state(GenerationState::Retiring)? {
      lifecycle.retire(&generation)?;
    }
    for generation in lifecycle.registry.in_state(GenerationState::Active)? {
      if Some(&generation) != active.as_ref() {
        lifecycle.retire(&generation)?;
      }
    }

    // Stores of retired or unknown generations
    for name in lifecycle.storage.names()? {
      let live = lifecycle.registry.get(&name)?.is_some_and(|r| {
        !matches!(
          r.state,
          GenerationState::Retiring | GenerationState::Retired
        )
      });
      if !live {
        lifecycle.storage.delete(&name)?;
        info!(generation = %name, "deleted leftover store");
      }
    }

    if let Some(active) = active {
      debug!(generation = %active, "loaded active generation");
    }
    Ok(lifecycle)
  }

  /// Receiver that always holds the Active generation.
  pub fn subscribe(&self) -> watch::Receiver<Option<Generation>> {
    self.current.subscribe()
  }

  pub fn current(&self) -> Option<Generation> {
    self.current.borrow().clone()
  }

  /// Provision `generation` with every member of `preload`.
  ///
  /// Nothing is written unless every fetch succeeds. On failure a newly
  /// created generation is discarded and the Active one keeps serving.
  pub async fn install(
    &self,
    generation: &Generation,
    preload: &PreloadSet,
    origin: &Url,
  ) -> Result<Installed, ProvisionError> {
    let _guard = self.transition.lock().await;
    let fingerprint = preload.fingerprint();

    let previous = self.registry.get(generation)?;
    match &previous {
      Some(record)
        if matches!(
          record.state,
          GenerationState::Retiring | GenerationState::Retired
        ) =>
      {
        return Err(ProvisionError::Retired(generation.clone()));
      }
      Some(record) if record.fingerprint != fingerprint => {
        return Err(ProvisionError::NameReuse(generation.clone()));
      }
      Some(_) => {}
      None => self.registry.insert(generation, &fingerprint)?,
    }
    let was_active = previous
      .as_ref()
      .is_some_and(|r| r.state == GenerationState::Active);
    // A generation that already finished provisioning survives a failed re-run
    let keep_on_failure = previous.as_ref().is_some_and(|r| {
      matches!(
        r.state,
        GenerationState::Active | GenerationState::Waiting
      )
    });

    info!(generation = %generation, assets = preload.paths().len(), "provisioning generation");

    let entries = match self.fetch_preload(preload, origin).await {
      Ok(entries) => entries,
      Err(e) => {
        warn!(generation = %generation, error = %e, "provisioning failed");
        if !keep_on_failure {
          self.discard(generation)?;
        }
        return Err(e);
      }
    };

    if let Err(e) = self.storage.put_all(generation, &entries) {
      warn!(generation = %generation, error = %e, "provisioning failed");
      if !keep_on_failure {
        self.discard(generation)?;
      }
      return Err(ProvisionError::Store(e));
    }

    let state = if was_active {
      GenerationState::Active
    } else {
      // A newer waiting generation supersedes any older one
      for stale in self.registry.in_state(GenerationState::Waiting)? {
        if &stale != generation {
          self.retire(&stale)?;
        }
      }
      self
        .registry
        .set_state(generation, GenerationState::Waiting)?;
      GenerationState::Waiting
    };

    info!(generation = %generation, state = %state, entries = entries.len(), "generation provisioned");
    Ok(Installed {
      generation: generation.clone(),
      state,
      entries: entries.len(),
    })
  }

  async fn fetch_preload(
    &self,
    preload: &PreloadSet,
    origin: &Url,
  ) -> Result<Vec<CacheEntry>, ProvisionError> {
    let fetches = preload.paths().iter().map(|path| async move {
      let failed = |reason: String| ProvisionError::Preload {
        path: path.clone(),
        reason,
      };

      let url = origin.join(path).map_err(|e| failed(e.to_string()))?;
      let request = Request::get(url);
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| failed(e.to_string()))?;

      if !response.is_success() {
        return Err(failed(format!("status {}", response.status)));
      }
      Ok(CacheEntry::new(&request, response))
    });

    try_join_all(fetches).await
  }

  fn discard(&self, generation: &Generation) -> Result<()> {
    self.storage.delete(generation)?;
    self.registry.remove(generation)?;
    debug!(generation = %generation, "discarded generation");
    Ok(())
  }

  /// Promote the Waiting generation and retire every other one.
  ///
  /// Returns `None` without changing anything when no generation is Waiting.
  pub async fn activate(&self) -> Result<Option<Generation>> {
    let _guard = self.transition.lock().await;

    let Some(next) = self
      .registry
      .in_state(GenerationState::Waiting)?
      .into_iter()
      .next()
    else {
      debug!("no waiting generation, activation is a no-op");
      return Ok(None);
    };

    self.registry.set_state(&next, GenerationState::Active)?;
    // Executors switch over before the old stores go away
    self.current.send_replace(Some(next.clone()));
    info!(generation = %next, "generation activated");

    for record in self.registry.all()? {
      if record.generation != next && record.state != GenerationState::Retired {
        self.retire(&record.generation)?;
      }
    }

    // Anything left is orphaned or was written after its generation retired
    for name in self.storage.names()? {
      if name != next {
        self.storage.delete(&name)?;
        info!(generation = %name, "deleted leftover store");
      }
    }

    Ok(Some(next))
  }

  fn retire(&self, generation: &Generation) -> Result<()> {
    self
      .registry
      .set_state(generation, GenerationState::Retiring)?;
    self.storage.delete(generation)?;
    self
      .registry
      .set_state(generation, GenerationState::Retired)?;
    info!(generation = %generation, "generation retired");
    Ok(())
  }

  pub fn entries(&self, generation: &Generation) -> Result<Vec<String>> {
    self.storage.keys(generation)
  }

  /// Every known generation with its entry count.
  pub fn status(&self) -> Result<Vec<GenerationStatus>> {
    self
      .registry
      .all()?
      .into_iter()
      .map(|record| {
        let entries = self.storage.count(&record.generation)?;
        Ok(GenerationStatus { record, entries })
      })
      .collect()
  }
}
