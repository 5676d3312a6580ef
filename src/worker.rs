//! Event dispatch: one handler per event kind, wired up once at startup.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::cache::{CacheLayer, CacheStorage, Resolved, SqliteStorage};
use crate::config::Config;
use crate::control::{ControlChannel, ControlCommand};
use crate::db::Database;
use crate::error::FetchError;
use crate::lifecycle::{Generation, GenerationStatus, Installed, Lifecycle, PreloadSet};
use crate::net::{Network, Request};
use crate::router::{Decision, Router};

/// Events delivered by the hosting environment
#[derive(Debug)]
pub enum Event {
  /// Provision the configured generation
  Install,
  /// Natural activation point: nothing holds the old generation any more
  Activate,
  /// An outgoing request
  Fetch(Request),
  /// Raw control message from the hosting application
  Message(String),
}

#[derive(Debug)]
pub enum EventOutcome {
  Installed {
    installed: Installed,
    /// Set when skip-waiting activated the generation straight away
    activated: Option<Generation>,
  },
  Activated(Option<Generation>),
  /// `None` when the request was not intercepted
  Fetched(Option<Result<Resolved, FetchError>>),
  Messaged(Option<Generation>),
}

/// The interceptor: classifier, strategies, lifecycle and control channel.
pub struct ServiceWorker {
  config: Config,
  router: Router,
  cache: CacheLayer,
  lifecycle: Arc<Lifecycle>,
  control: ControlChannel,
}

impl ServiceWorker {
  pub fn new(config: Config, db: Arc<Database>, network: Arc<dyn Network>) -> Result<Self> {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::new(db.clone()));
    let lifecycle = Arc::new(Lifecycle::open(db, storage.clone(), network.clone())?);
    let cache = CacheLayer::new(storage, network, lifecycle.subscribe());
    let router = Router::new(config.routes.clone());
    let control = ControlChannel::new(lifecycle.clone());

    Ok(Self {
      config,
      router,
      cache,
      lifecycle,
      control,
    })
  }

  pub async fn dispatch(&self, event: Event) -> Result<EventOutcome> {
    match event {
      Event::Install => self.on_install().await,
      Event::Activate => Ok(EventOutcome::Activated(self.lifecycle.activate().await?)),
      Event::Fetch(request) => Ok(EventOutcome::Fetched(self.on_fetch(&request).await)),
      Event::Message(message) => Ok(EventOutcome::Messaged(self.on_message(&message).await?)),
    }
  }

  async fn on_install(&self) -> Result<EventOutcome> {
    let preload = PreloadSet::new(self.config.preload.clone());
    let origin = self.config.origin()?;

    let installed = self
      .lifecycle
      .install(&self.config.generation, &preload, &origin)
      .await?;

    let activated = if self.config.lifecycle.skip_waiting {
      self.control.handle(ControlCommand::SkipWaiting).await?
    } else {
      None
    };

    Ok(EventOutcome::Installed {
      installed,
      activated,
    })
  }

  #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
  async fn on_fetch(&self, request: &Request) -> Option<Result<Resolved, FetchError>> {
    let Some(decision) = self.classify(request) else {
      debug!("not intercepted");
      return None;
    };

    debug!(strategy = %decision.strategy, rule = ?decision.rule, "classified");
    Some(self.cache.resolve(request, decision.strategy).await)
  }

  async fn on_message(&self, message: &str) -> Result<Option<Generation>> {
    let command = ControlCommand::parse(message)?;
    self.control.handle(command).await
  }

  pub fn classify(&self, request: &Request) -> Option<Decision> {
    self.router.classify(request)
  }

  pub fn status(&self) -> Result<Vec<GenerationStatus>> {
    self.lifecycle.status()
  }

  pub fn current(&self) -> Option<Generation> {
    self.lifecycle.current()
  }

  /// URLs stored under one generation.
  pub fn entries(&self, generation: &Generation) -> Result<Vec<String>> {
    self.lifecycle.entries(generation)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::net::stub::StubNetwork;
  use reqwest::Method;

  const ORIGIN: &str = "https://app.test";

  fn config() -> Config {
    Config {
      origin: ORIGIN.to_string(),
      ..Config::default()
    }
  }

  fn worker(config: Config) -> (ServiceWorker, Arc<StubNetwork>) {
    let network = Arc::new(StubNetwork::new());
    network.serve("https://app.test/", "<html>");
    network.serve("https://app.test/favicon.png", "icon");
    network.serve("https://app.test/manifest.json", r#"{"name":"app"}"#);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let worker = ServiceWorker::new(config, db, network.clone()).unwrap();
    (worker, network)
  }

  async fn installed_worker() -> (ServiceWorker, Arc<StubNetwork>) {
    let (worker, network) = worker(config());
    worker.dispatch(Event::Install).await.unwrap();
    worker.dispatch(Event::Activate).await.unwrap();
    (worker, network)
  }

  fn get(path: &str) -> Request {
    Request::get(config().resolve(path).unwrap())
  }

  async fn fetch(worker: &ServiceWorker, request: Request) -> Option<Result<Resolved, FetchError>> {
    match worker.dispatch(Event::Fetch(request)).await.unwrap() {
      EventOutcome::Fetched(result) => result,
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_cache_first_asset_fetched_once_then_served_from_store() {
    let (worker, network) = worker(config());
    worker.dispatch(Event::Install).await.unwrap();
    worker.dispatch(Event::Activate).await.unwrap();
    let icon_url = "https://app.test/icons/badge.png";
    network.serve(icon_url, "badge");
    let calls = network.calls();

    let mut first = fetch(&worker, get("/icons/badge.png")).await.unwrap().unwrap();
    assert_eq!(first.source, CacheSource::Network);
    first.settle().await;

    let second = fetch(&worker, get("/icons/badge.png")).await.unwrap().unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(&second.response.body[..], b"badge");
    assert_eq!(network.calls(), calls + 1);
  }

  #[tokio::test]
  async fn test_manifest_on_empty_store() {
    // Active generation with nothing preloaded
    let (worker, network) = worker(Config {
      preload: Vec::new(),
      ..config()
    });
    worker.dispatch(Event::Install).await.unwrap();
    worker.dispatch(Event::Activate).await.unwrap();

    let mut first = fetch(&worker, get("/manifest.json")).await.unwrap().unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(&first.response.body[..], br#"{"name":"app"}"#);
    first.settle().await;
    assert_eq!(network.calls(), 1);

    let second = fetch(&worker, get("/manifest.json")).await.unwrap().unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response.body, first.response.body);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_skip_listed_api_offline_is_exact_offline_payload() {
    let (worker, network) = installed_worker().await;
    network.set_offline(true);

    let resolved = fetch(&worker, get("/api/dashboard")).await.unwrap().unwrap();
    assert_eq!(resolved.response.status, 503);
    assert_eq!(
      &resolved.response.body[..],
      br#"{"error":"Offline","offline":true}"#
    );
  }

  #[tokio::test]
  async fn test_unlisted_api_offline_without_cache_is_offline_payload() {
    let (worker, network) = installed_worker().await;
    assert_eq!(
      worker.classify(&get("/api/orders/123")).unwrap().strategy,
      crate::router::Strategy::NetworkFirst
    );
    network.set_offline(true);

    let resolved = fetch(&worker, get("/api/orders/123")).await.unwrap().unwrap();
    assert_eq!(resolved.source, CacheSource::Synthetic);
    assert_eq!(resolved.response.status, 503);
  }

  #[tokio::test]
  async fn test_preloaded_shell_served_offline() {
    let (worker, network) = installed_worker().await;
    network.set_offline(true);

    let mut resolved = fetch(&worker, get("/")).await.unwrap().unwrap();
    assert_eq!(resolved.source, CacheSource::Cache);
    assert_eq!(&resolved.response.body[..], b"<html>");
    resolved.settle().await;
  }

  #[tokio::test]
  async fn test_writes_are_not_intercepted() {
    let (worker, network) = installed_worker().await;
    let calls = network.calls();

    let request = Request::new(Method::POST, config().resolve("/api/orders").unwrap());
    assert!(fetch(&worker, request).await.is_none());
    assert_eq!(network.calls(), calls);
  }

  #[tokio::test]
  async fn test_skip_waiting_config_activates_on_install() {
    let mut config = config();
    config.lifecycle.skip_waiting = true;
    let (worker, _network) = worker(config);

    match worker.dispatch(Event::Install).await.unwrap() {
      EventOutcome::Installed {
        installed,
        activated,
      } => {
        assert_eq!(installed.entries, 3);
        assert_eq!(activated, Some(Generation::new("shell-v1")));
      }
      other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(worker.current(), Some(Generation::new("shell-v1")));
  }

  #[tokio::test]
  async fn test_skip_waiting_message_when_active_is_noop() {
    let (worker, _network) = installed_worker().await;

    let outcome = worker
      .dispatch(Event::Message(r#"{"type":"SKIP_WAITING"}"#.to_string()))
      .await
      .unwrap();

    assert!(matches!(outcome, EventOutcome::Messaged(None)));
    assert_eq!(worker.current(), Some(Generation::new("shell-v1")));
  }

  #[tokio::test]
  async fn test_bad_message_is_an_error() {
    let (worker, _network) = installed_worker().await;
    assert!(worker
      .dispatch(Event::Message("reload please".to_string()))
      .await
      .is_err());
  }
}
