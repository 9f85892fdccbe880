//! Strategy executor that orchestrates tier lookups with network fetching.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheResult, CacheTiers, TierKind};
use crate::classify::{RequestClass, Strategy};
use crate::messenger::CacheStats;
use crate::net::{fetch_with_timeout, offline, FetchError, Fetcher, Request, Response};

#[derive(Default)]
struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
}

/// Serves read requests using the strategy bound to their class.
///
/// This sits between the intercepted request and the network, providing
/// transparent caching with offline fallbacks.
#[derive(Clone)]
pub struct StrategyExecutor {
  tiers: Arc<CacheTiers>,
  fetcher: Arc<dyn Fetcher>,
  timeout: Duration,
  counters: Arc<Counters>,
  /// Background stale-while-revalidate refreshes
  revalidations: Arc<Mutex<JoinSet<()>>>,
}

impl StrategyExecutor {
  pub fn new(tiers: Arc<CacheTiers>, fetcher: Arc<dyn Fetcher>, timeout: Duration) -> Self {
    Self {
      tiers,
      fetcher,
      timeout,
      counters: Arc::new(Counters::default()),
      revalidations: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  /// Serve a GET of the given class.
  pub async fn execute(&self, class: RequestClass, request: &Request) -> CacheResult {
    debug!(url = %request.url, ?class, "serving read");
    match class.strategy() {
      Strategy::CacheFirst => {
        self
          .cache_first(class.tier(), request, offline::offline_page)
          .await
      }
      Strategy::CacheFirstWithPlaceholder => {
        self
          .cache_first(class.tier(), request, offline::placeholder_image)
          .await
      }
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  /// One network attempt, bounded by the configured timeout.
  pub async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    fetch_with_timeout(self.fetcher.as_ref(), request, self.timeout).await
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      hits: self.counters.hits.load(Ordering::Relaxed),
      misses: self.counters.misses.load(Ordering::Relaxed),
    }
  }

  /// Wait for every in-flight background revalidation to finish.
  ///
  /// The set is taken out of the lock before awaiting, so new refreshes can
  /// still be spawned meanwhile; those are awaited on the next pass.
  pub async fn settle(&self) {
    loop {
      let mut pending = std::mem::take(&mut *self.revalidations.lock().await);
      if pending.is_empty() {
        return;
      }
      while pending.join_next().await.is_some() {}
    }
  }

  /// 1. Check the tier, return on hit
  /// 2. Fetch from network and store a successful response
  /// 3. With neither, synthesize the tier's fallback
  async fn cache_first(
    &self,
    tier: TierKind,
    request: &Request,
    fallback: fn() -> Response,
  ) -> CacheResult {
    let key = request.cache_key();
    if let Some(cached) = self.lookup(tier, &key) {
      return CacheResult::from_cache(cached);
    }

    match self.fetch(request).await {
      Ok(response) => {
        self.store(tier, key, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, %tier, "offline with no cached copy");
        CacheResult::offline(fallback())
      }
    }
  }

  /// Network first; on failure fall back to a cached API response that is
  /// still within its TTL, else the offline JSON error.
  async fn network_first(&self, request: &Request) -> CacheResult {
    let key = request.cache_key();
    match self.fetch(request).await {
      Ok(response) => {
        self.store(TierKind::Api, key, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "API fetch failed, trying cache");
        match self.tiers.get_valid_api(&key) {
          Ok(Some(cached)) => {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            CacheResult::from_cache(cached)
          }
          Ok(None) => {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            CacheResult::offline(offline::api_offline(
              "You are offline and no cached data is available",
            ))
          }
          Err(e) => {
            warn!(key = %key, error = %e, "API cache read failed");
            CacheResult::offline(offline::api_offline(
              "You are offline and no cached data is available",
            ))
          }
        }
      }
    }
  }

  /// Return the cached copy immediately and refresh it in the background;
  /// without a cached copy, wait for the network.
  async fn stale_while_revalidate(&self, request: &Request) -> CacheResult {
    let key = request.cache_key();
    if let Some(cached) = self.lookup(TierKind::Dynamic, &key) {
      self.spawn_revalidation(request.clone()).await;
      return CacheResult::from_cache(cached);
    }

    match self.fetch(request).await {
      Ok(response) => {
        self.store(TierKind::Dynamic, key, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "offline with no cached page");
        CacheResult::offline(offline::offline_page())
      }
    }
  }

  async fn spawn_revalidation(&self, request: Request) {
    let executor = self.clone();
    let mut revalidations = self.revalidations.lock().await;
    // Reap finished refreshes so the set does not grow unbounded
    while revalidations.try_join_next().is_some() {}

    revalidations.spawn(async move {
      match executor.fetch(&request).await {
        Ok(response) => executor.store(TierKind::Dynamic, request.cache_key(), &response),
        Err(e) => debug!(url = %request.url, error = %e, "background revalidation failed"),
      }
    });
  }

  /// Tier read; storage errors degrade to a miss.
  fn lookup(&self, tier: TierKind, key: &str) -> Option<Response> {
    let found = match self.tiers.get(tier, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(%tier, key, error = %e, "cache read failed");
        None
      }
    };

    let counter = if found.is_some() {
      &self.counters.hits
    } else {
      &self.counters.misses
    };
    counter.fetch_add(1, Ordering::Relaxed);
    found
  }

  /// Store a successful response; failures are logged and the response is
  /// still served.
  fn store(&self, tier: TierKind, key: String, response: &Response) {
    if !response.is_success() {
      return;
    }

    let entry = CacheEntry {
      key,
      response: response.clone(),
      tier,
    };
    if let Err(e) = self.tiers.store(&entry) {
      warn!(%tier, key = %entry.key, error = %e, "failed to cache response");
    }
  }
}
