//! Request classification.
//!
//! Every intercepted request lands in exactly one strategy bucket. The checks
//! run in a fixed order and the first match wins:
//!
//! 1. API path containing a skip-list fragment: network only
//! 2. API path: network first
//! 3. Cache-first fragment anywhere in the URL: cache first
//! 4. Everything else: stale while revalidate

use reqwest::Method;
use std::fmt;

use crate::config::RoutesConfig;
use crate::net::Request;

/// Resolution policy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  NetworkOnly,
  NetworkFirst,
  CacheFirst,
  StaleWhileRevalidate,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Strategy::NetworkOnly => "network-only",
      Strategy::NetworkFirst => "network-first",
      Strategy::CacheFirst => "cache-first",
      Strategy::StaleWhileRevalidate => "stale-while-revalidate",
    };
    f.write_str(name)
  }
}

/// The table entry that produced a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
  Skip(String),
  ApiPrefix,
  CacheFirst(String),
  StaleWhileRevalidate(String),
  Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
  pub strategy: Strategy,
  pub rule: Rule,
}

impl Decision {
  fn new(strategy: Strategy, rule: Rule) -> Self {
    Self { strategy, rule }
  }
}

/// Classifier over the configured pattern tables
#[derive(Debug, Clone)]
pub struct Router {
  routes: RoutesConfig,
}

impl Router {
  pub fn new(routes: RoutesConfig) -> Self {
    Self { routes }
  }

  /// Pick the strategy for a request, or `None` if it is not intercepted.
  ///
  /// Only GET is intercepted; every other method passes straight through.
  pub fn classify(&self, request: &Request) -> Option<Decision> {
    if request.method != Method::GET {
      return None;
    }

    let path = request.url.path();
    let url = request.url.as_str();

    if path.starts_with(&self.routes.api_prefix) {
      if let Some(fragment) = first_contained(&self.routes.skip, path) {
        return Some(Decision::new(Strategy::NetworkOnly, Rule::Skip(fragment)));
      }
      return Some(Decision::new(Strategy::NetworkFirst, Rule::ApiPrefix));
    }

    if let Some(fragment) = first_contained(&self.routes.cache_first, url) {
      return Some(Decision::new(
        Strategy::CacheFirst,
        Rule::CacheFirst(fragment),
      ));
    }

    if let Some(fragment) = first_contained(&self.routes.stale_while_revalidate, url) {
      return Some(Decision::new(
        Strategy::StaleWhileRevalidate,
        Rule::StaleWhileRevalidate(fragment),
      ));
    }

    Some(Decision::new(Strategy::StaleWhileRevalidate, Rule::Default))
  }
}

fn first_contained(patterns: &[String], haystack: &str) -> Option<String> {
  patterns
    .iter()
    .find(|p| !p.is_empty() && haystack.contains(p.as_str()))
    .cloned()
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn router() -> Router {
    Router::new(RoutesConfig::default())
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  fn strategy(url: &str) -> Strategy {
    router().classify(&get(url)).unwrap().strategy
  }

  #[test]
  fn test_non_get_passes_through() {
    let url = Url::parse("https://app.test/api/orders").unwrap();
    for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
      assert_eq!(router().classify(&Request::new(method, url.clone())), None);
    }
  }

  #[test]
  fn test_skip_list_forces_network_only() {
    let decision = router()
      .classify(&get("https://app.test/api/dashboard"))
      .unwrap();
    assert_eq!(decision.strategy, Strategy::NetworkOnly);
    assert_eq!(decision.rule, Rule::Skip("/api/dashboard".to_string()));

    assert_eq!(
      strategy("https://app.test/api/auth/session"),
      Strategy::NetworkOnly
    );
  }

  #[test]
  fn test_unlisted_api_path_is_network_first() {
    let decision = router()
      .classify(&get("https://app.test/api/orders/123"))
      .unwrap();
    assert_eq!(decision.strategy, Strategy::NetworkFirst);
    assert_eq!(decision.rule, Rule::ApiPrefix);
  }

  #[test]
  fn test_skip_fragment_outside_api_is_ignored() {
    // Skip-list only applies to API reads
    assert_eq!(
      strategy("https://app.test/docs/api/dashboard.png"),
      Strategy::CacheFirst
    );
  }

  #[test]
  fn test_api_prefix_beats_cache_first_patterns() {
    assert_eq!(
      strategy("https://app.test/api/avatars/1.png"),
      Strategy::NetworkFirst
    );
  }

  #[test]
  fn test_cache_first_by_host_and_extension() {
    assert_eq!(
      strategy("https://fonts.gstatic.com/s/inter/v12/font.woff2"),
      Strategy::CacheFirst
    );
    assert_eq!(
      strategy("https://fonts.googleapis.com/css2?family=Inter"),
      Strategy::CacheFirst
    );
    assert_eq!(strategy("https://app.test/logo.svg"), Strategy::CacheFirst);
    assert_eq!(
      strategy("https://app.test/manifest.json"),
      Strategy::CacheFirst
    );
  }

  #[test]
  fn test_bundles_and_everything_else_revalidate() {
    let decision = router()
      .classify(&get("https://app.test/assets/index-3f2a.js"))
      .unwrap();
    assert_eq!(decision.strategy, Strategy::StaleWhileRevalidate);
    assert_eq!(decision.rule, Rule::StaleWhileRevalidate(".js".to_string()));

    let decision = router().classify(&get("https://app.test/")).unwrap();
    assert_eq!(decision.strategy, Strategy::StaleWhileRevalidate);
    assert_eq!(decision.rule, Rule::Default);
  }

  #[test]
  fn test_custom_tables() {
    let router = Router::new(RoutesConfig {
      api_prefix: "/v2/".to_string(),
      skip: vec!["/v2/live".to_string()],
      cache_first: vec!["cdn.test".to_string()],
      stale_while_revalidate: Vec::new(),
    });

    let classify = |url: &str| router.classify(&get(url)).unwrap().strategy;
    assert_eq!(classify("https://app.test/v2/live/feed"), Strategy::NetworkOnly);
    assert_eq!(classify("https://app.test/v2/orders"), Strategy::NetworkFirst);
    assert_eq!(classify("https://cdn.test/app.js"), Strategy::CacheFirst);
    assert_eq!(
      classify("https://app.test/api/orders"),
      Strategy::StaleWhileRevalidate
    );
  }
}
