//! The engine: one instance per process, owning every tier and queue.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
  CacheResult, CacheTiers, DurableStore, MemoryStorage, SqliteStorage, TierKind, TierStore,
  TtlStore,
};
use crate::classify::{classify, Route};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::messenger::{ClientMessenger, ControlMessage, Notification, Reply, StatusReport, SyncResult};
use crate::net::{offline, Fetcher, Request};
use crate::queue::{self, AnalyticsRecord, OfflineQueue, QueueItem};
use crate::strategy::StrategyExecutor;
use crate::sync::{AnalyticsOutcome, SyncScheduler, SyncTag};

/// External collaborators injected into the engine.
#[derive(Clone)]
pub struct Providers {
  pub tiers: Arc<dyn TierStore>,
  pub ttl: Arc<dyn TtlStore>,
  pub durable: Arc<dyn DurableStore>,
  pub fetcher: Arc<dyn Fetcher>,
  pub clock: Arc<dyn Clock>,
}

impl Providers {
  /// Everything backed by one SQLite database.
  pub fn sqlite(storage: SqliteStorage, fetcher: Arc<dyn Fetcher>) -> Self {
    let storage = Arc::new(storage);
    Self {
      tiers: storage.clone(),
      ttl: storage.clone(),
      durable: storage,
      fetcher,
      clock: Arc::new(SystemClock),
    }
  }

  /// Everything in memory; nothing survives the process.
  pub fn memory(fetcher: Arc<dyn Fetcher>) -> Self {
    let storage = Arc::new(MemoryStorage::new());
    Self {
      tiers: storage.clone(),
      ttl: storage.clone(),
      durable: storage,
      fetcher,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }
}

/// Lifecycle events the host delivers to the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
  /// First start of this version: precache the static manifest
  Install,
  /// This version takes over: drop old tiers, run maintenance
  Activate,
  /// An intercepted request
  Fetch(Request),
  /// Connectivity restored
  Online,
  /// A previously armed wake-up fired
  Sync(SyncTag),
  /// Control message from the embedding application
  Message(ControlMessage),
  /// Heartbeat
  Tick,
}

/// What handling an event produced.
#[derive(Debug)]
pub enum EventOutcome {
  Done,
  Installed(usize),
  Response(CacheResult),
  Reply(Reply),
  Synced(Option<Vec<SyncResult>>),
  Analytics(AnalyticsOutcome),
}

pub struct Engine {
  config: Config,
  tiers: Arc<CacheTiers>,
  executor: StrategyExecutor,
  mutations: Arc<OfflineQueue<QueueItem>>,
  analytics: Arc<OfflineQueue<AnalyticsRecord>>,
  scheduler: SyncScheduler,
  messenger: ClientMessenger,
  clock: Arc<dyn Clock>,
}

impl Engine {
  /// Build the engine and reload both queues from durable storage before
  /// anything is served.
  pub async fn start(config: Config, providers: Providers) -> Result<Self> {
    let tiers = Arc::new(CacheTiers::new(
      config.version.clone(),
      &config.cache,
      providers.tiers,
      providers.ttl,
      providers.clock.clone(),
    ));
    let executor = StrategyExecutor::new(
      tiers.clone(),
      providers.fetcher,
      config.network.timeout(),
    );
    let mutations = Arc::new(queue::mutation_queue(&config, providers.durable.clone()));
    let analytics = Arc::new(queue::analytics_queue(&config, providers.durable));
    let messenger = ClientMessenger::default();
    let scheduler = SyncScheduler::new(
      mutations.clone(),
      analytics.clone(),
      executor.clone(),
      messenger.clone(),
      config.resolve(&config.analytics.endpoint)?,
      config.queue.max_attempts,
      providers.clock.clone(),
    );

    let engine = Self {
      config,
      tiers,
      executor,
      mutations,
      analytics,
      scheduler,
      messenger,
      clock: providers.clock,
    };
    engine.load_queues().await;

    info!(version = %engine.config.version, "engine started");
    Ok(engine)
  }

  async fn load_queues(&self) {
    match self.mutations.load().await {
      Ok(n) if n > 0 => {
        info!(pending = n, "restored queued mutations");
        self.scheduler.arm(SyncTag::Mutations);
      }
      Ok(_) => {}
      Err(e) => warn!(error = %e, "could not load mutation queue, continuing in memory"),
    }
    match self.analytics.load().await {
      Ok(n) if n > 0 => self.scheduler.arm(SyncTag::Analytics),
      Ok(_) => {}
      Err(e) => warn!(error = %e, "could not load analytics queue, continuing in memory"),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn scheduler(&self) -> &SyncScheduler {
    &self.scheduler
  }

  /// Connect a client to sync notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.messenger.subscribe()
  }

  /// Route one lifecycle event to its handler.
  pub async fn dispatch(&self, event: EngineEvent) -> EventOutcome {
    match event {
      EngineEvent::Install => EventOutcome::Installed(self.install().await),
      EngineEvent::Activate => {
        self.activate().await;
        EventOutcome::Done
      }
      EngineEvent::Fetch(request) => EventOutcome::Response(self.handle_fetch(request).await),
      EngineEvent::Online => {
        let results = self.scheduler.run_cycle().await;
        self.scheduler.sync_analytics().await;
        EventOutcome::Synced(results)
      }
      EngineEvent::Sync(SyncTag::Mutations) => EventOutcome::Synced(self.scheduler.run_cycle().await),
      EngineEvent::Sync(SyncTag::Analytics) => {
        EventOutcome::Analytics(self.scheduler.sync_analytics().await)
      }
      EngineEvent::Message(message) => match self.handle_message(message).await {
        Some(reply) => EventOutcome::Reply(reply),
        None => EventOutcome::Done,
      },
      EngineEvent::Tick => {
        self.heartbeat().await;
        EventOutcome::Done
      }
    }
  }

  /// Precache the static manifest. Returns how many assets were stored.
  pub async fn install(&self) -> usize {
    let mut cached = 0;
    for asset in &self.config.routing.static_manifest {
      let url = match self.config.resolve(asset) {
        Ok(url) => url,
        Err(e) => {
          warn!(asset, error = %e, "skipping invalid manifest entry");
          continue;
        }
      };

      let request = Request::get(url);
      match self.executor.fetch(&request).await {
        Ok(response) if response.is_success() => {
          match self.tiers.put(TierKind::Static, &request.cache_key(), &response) {
            Ok(_) => cached += 1,
            Err(e) => warn!(asset, error = %e, "failed to precache asset"),
          }
        }
        Ok(response) => warn!(asset, status = response.status, "asset not precached"),
        Err(e) => warn!(asset, error = %e, "asset not precached"),
      }
    }

    info!(
      cached,
      total = self.config.routing.static_manifest.len(),
      "install complete"
    );
    cached
  }

  /// Delete tiers from previous versions and run maintenance.
  pub async fn activate(&self) {
    match self.tiers.delete_stale_versions() {
      Ok(deleted) if !deleted.is_empty() => info!(?deleted, "removed old cache versions"),
      Ok(_) => {}
      Err(e) => warn!(error = %e, "failed to remove old cache versions"),
    }
    self.maintain();
  }

  /// Sweep expired API responses (rate limited) and enforce tier bounds.
  pub fn maintain(&self) {
    if let Err(e) = self.tiers.sweep_expired() {
      warn!(error = %e, "expired-entry sweep failed");
    }
    match self.tiers.enforce_all() {
      Ok(0) => {}
      Ok(evicted) => debug!(evicted, "enforced cache limits"),
      Err(e) => warn!(error = %e, "failed to enforce cache limits"),
    }
  }

  async fn heartbeat(&self) {
    self.maintain();
    if !self.mutations.is_empty().await {
      self.scheduler.run_cycle().await;
    }
    if !self.analytics.is_empty().await {
      self.scheduler.sync_analytics().await;
    }
  }

  /// Serve an intercepted request.
  pub async fn handle_fetch(&self, request: Request) -> CacheResult {
    match classify(&request, &self.config.routing) {
      Route::Read(class) => self.executor.execute(class, &request).await,
      Route::Mutation => self.handle_mutation(request).await,
      Route::PassThrough => match self.executor.fetch(&request).await {
        Ok(response) => CacheResult::from_network(response),
        Err(_) => CacheResult::offline(offline::offline_page()),
      },
    }
  }

  /// Send a mutation; if it cannot reach the network, queue it and
  /// acknowledge optimistically.
  async fn handle_mutation(&self, request: Request) -> CacheResult {
    match self.executor.fetch(&request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        let item = QueueItem::from_request(&request, self.clock.now());
        info!(method = %request.method, url = %request.url, error = %e, "queueing mutation for sync");
        self.mutations.enqueue(item).await;
        self.scheduler.arm(SyncTag::Mutations);
        CacheResult::offline(offline::queued_ack(
          "Request queued and will be sent when back online",
        ))
      }
    }
  }

  /// Handle a control message; `GetStatus` produces a reply.
  pub async fn handle_message(&self, message: ControlMessage) -> Option<Reply> {
    match message {
      ControlMessage::SkipWaiting => {
        debug!("skip-waiting requested");
        None
      }
      ControlMessage::QueueAnalytics(payload) => {
        let record = AnalyticsRecord::new(payload, self.clock.now());
        self.analytics.enqueue(record).await;
        self.scheduler.arm(SyncTag::Analytics);
        None
      }
      ControlMessage::ForceSync => {
        self.scheduler.run_cycle().await;
        self.scheduler.sync_analytics().await;
        None
      }
      ControlMessage::ClearCache => {
        self.clear().await;
        None
      }
      ControlMessage::GetStatus => Some(Reply::Status(self.status().await)),
    }
  }

  /// Delete every tier, reset the TTL index and both queues.
  pub async fn clear(&self) {
    if let Err(e) = self.tiers.clear() {
      warn!(error = %e, "failed to clear cache tiers");
    }
    self.mutations.clear().await;
    self.analytics.clear().await;
    info!("cache and queues cleared");
  }

  pub async fn status(&self) -> StatusReport {
    let tier_sizes = match self.tiers.sizes() {
      Ok(sizes) => sizes
        .into_iter()
        .map(|(kind, n)| (kind.as_str().to_string(), n))
        .collect(),
      Err(e) => {
        warn!(error = %e, "failed to read tier sizes");
        Default::default()
      }
    };

    StatusReport {
      tier_sizes,
      mutation_queue_length: self.mutations.len().await,
      analytics_queue_length: self.analytics.len().await,
      version: self.config.version.clone(),
      cache_stats: self.executor.stats(),
      sync_state: self.scheduler.state().to_string(),
    }
  }

  /// Wait for background revalidations to finish.
  pub async fn settle(&self) {
    self.executor.settle().await;
  }

  /// Start [`Engine::run`] on its own task.
  ///
  /// The receiver is subscribed before the task starts, so it sees the
  /// replay of mutations restored at startup.
  pub fn spawn(
    self: &Arc<Self>,
    interval: Duration,
    shutdown: impl Future<Output = ()> + Send + 'static,
  ) -> (broadcast::Receiver<Notification>, JoinHandle<()>) {
    let notifications = self.subscribe();
    let engine = Arc::clone(self);
    let handle = tokio::spawn(async move { engine.run(interval, shutdown).await });
    (notifications, handle)
  }

  /// Host loop: fire armed syncs as they arrive and a heartbeat on
  /// `interval`, until `shutdown` resolves.
  pub async fn run(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        tags = self.scheduler.wait_armed() => {
          for tag in tags {
            self.dispatch(EngineEvent::Sync(tag)).await;
          }
        }
        _ = ticker.tick() => {
          self.dispatch(EngineEvent::Tick).await;
        }
      }
    }

    self.settle().await;
    info!("engine stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::clock::ManualClock;
  use crate::net::{FetchError, Method, Response};
  use async_trait::async_trait;
  use chrono::Utc;
  use std::sync::atomic::{AtomicBool, Ordering};
  use url::Url;

  struct Network {
    online: AtomicBool,
  }

  impl Network {
    fn set_online(&self, online: bool) {
      self.online.store(online, Ordering::SeqCst);
    }
  }

  #[async_trait]
  impl Fetcher for Network {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
      if !self.online.load(Ordering::SeqCst) {
        return Err(FetchError::Failed("offline".to_string()));
      }
      if request.url.path().starts_with("/api/flaky") {
        return Ok(Response::new(503, "unavailable"));
      }
      Ok(Response::new(200, format!("{} {}", request.method, request.url.path())))
    }
  }

  fn config() -> Config {
    Config::from_yaml(
      "origin: https://app.test/\nrouting:\n  static_manifest: [/, /app.js, /site.css]\n",
    )
    .unwrap()
  }

  async fn engine_with(
    config: Config,
    online: bool,
    durable: Option<Arc<MemoryStorage>>,
  ) -> (Engine, Arc<Network>, Arc<ManualClock>) {
    let network = Arc::new(Network {
      online: AtomicBool::new(online),
    });
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let storage = durable.unwrap_or_else(|| Arc::new(MemoryStorage::new()));
    let providers = Providers {
      tiers: storage.clone(),
      ttl: storage.clone(),
      durable: storage,
      fetcher: network.clone(),
      clock: clock.clone(),
    };
    let engine = Engine::start(config, providers).await.unwrap();
    (engine, network, clock)
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("https://app.test{}", path)).unwrap()
  }

  async fn fetch(engine: &Engine, method: Method, path: &str) -> CacheResult {
    let request = Request::new(method, url(path));
    match engine.dispatch(EngineEvent::Fetch(request)).await {
      EventOutcome::Response(result) => result,
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  async fn status(engine: &Engine) -> StatusReport {
    match engine.dispatch(EngineEvent::Message(ControlMessage::GetStatus)).await {
      EventOutcome::Reply(Reply::Status(report)) => report,
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_offline_mutation_is_queued_and_acknowledged() {
    let (engine, _network, _clock) = engine_with(config(), false, None).await;

    let result = fetch(&engine, Method::Post, "/tasks").await;
    assert_eq!(result.response.status, 202);
    let body: serde_json::Value = serde_json::from_slice(&result.response.body).unwrap();
    assert_eq!(body["queued"], true);

    assert_eq!(status(&engine).await.mutation_queue_length, 1);
    assert_eq!(engine.scheduler().take_armed(), vec![SyncTag::Mutations]);
  }

  #[tokio::test]
  async fn test_force_sync_replays_queue_and_notifies() {
    let (engine, network, _clock) = engine_with(config(), false, None).await;
    let mut client = engine.subscribe();
    fetch(&engine, Method::Post, "/tasks").await;

    network.set_online(true);
    engine
      .dispatch(EngineEvent::Message(ControlMessage::ForceSync))
      .await;

    assert_eq!(status(&engine).await.mutation_queue_length, 0);
    match client.recv().await.unwrap() {
      Notification::SyncCompleted(results) => {
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].item.url, "https://app.test/tasks");
      }
      other => panic!("unexpected notification: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_second_item_failing_stays_queued() {
    let (engine, network, _clock) = engine_with(config(), false, None).await;
    fetch(&engine, Method::Post, "/tasks").await;
    fetch(&engine, Method::Put, "/api/flaky/7").await;

    network.set_online(true);
    let outcome = engine.dispatch(EngineEvent::Online).await;
    let EventOutcome::Synced(Some(results)) = outcome else {
      panic!("expected sync results");
    };
    assert!(results[0].success);
    assert!(!results[1].success);

    let report = status(&engine).await;
    assert_eq!(report.mutation_queue_length, 1);
    assert_eq!(report.sync_state, "idle-with-pending");
  }

  #[tokio::test]
  async fn test_online_mutation_goes_straight_through() {
    let (engine, _network, _clock) = engine_with(config(), true, None).await;
    let result = fetch(&engine, Method::Delete, "/tasks/3").await;
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.response.text(), "DELETE /tasks/3");
    assert_eq!(status(&engine).await.mutation_queue_length, 0);
  }

  #[tokio::test]
  async fn test_status_reports_tier_sizes_and_queue_lengths() {
    let (engine, network, _clock) = engine_with(config(), true, None).await;
    for path in ["/app.js", "/site.css", "/index.html"] {
      fetch(&engine, Method::Get, path).await;
    }
    fetch(&engine, Method::Get, "/api/tasks").await;
    for path in ["/a.png", "/b.jpg"] {
      fetch(&engine, Method::Get, path).await;
    }

    network.set_online(false);
    for n in 0..4 {
      fetch(&engine, Method::Post, &format!("/tasks/{}", n)).await;
    }

    let report = status(&engine).await;
    assert_eq!(report.tier_sizes["static"], 3);
    assert_eq!(report.tier_sizes["api"], 1);
    assert_eq!(report.tier_sizes["dynamic"], 0);
    assert_eq!(report.tier_sizes["images"], 2);
    assert_eq!(report.mutation_queue_length, 4);
    assert_eq!(report.analytics_queue_length, 0);
    assert_eq!(report.version, "offsync-v1");
  }

  #[tokio::test]
  async fn test_stale_api_response_is_not_served_after_ttl() {
    let (engine, network, clock) = engine_with(config(), true, None).await;
    fetch(&engine, Method::Get, "/api/tasks").await;

    network.set_online(false);
    clock.advance(chrono::Duration::hours(25));
    let result = fetch(&engine, Method::Get, "/api/tasks").await;
    assert_eq!(result.response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&result.response.body).unwrap();
    assert_eq!(body["error"], "Offline");
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let (engine, network, _clock) = engine_with(config(), true, None).await;
    let EventOutcome::Installed(n) = engine.dispatch(EngineEvent::Install).await else {
      panic!("expected install outcome");
    };
    assert_eq!(n, 3);

    network.set_online(false);
    let result = fetch(&engine, Method::Get, "/app.js").await;
    assert_eq!(result.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_activate_drops_old_versions() {
    let storage = Arc::new(MemoryStorage::new());
    storage
      .put("offsync-v0-static", "https://app.test/app.js", &Response::new(200, "old"))
      .unwrap();

    let (engine, _network, _clock) = engine_with(config(), true, Some(storage.clone())).await;
    engine.dispatch(EngineEvent::Activate).await;
    assert!(storage.tier_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_clear_cache_resets_everything() {
    let (engine, network, _clock) = engine_with(config(), true, None).await;
    fetch(&engine, Method::Get, "/api/tasks").await;
    network.set_online(false);
    fetch(&engine, Method::Post, "/tasks").await;
    engine
      .dispatch(EngineEvent::Message(ControlMessage::QueueAnalytics(
        serde_json::json!({"event": "click"}),
      )))
      .await;

    engine
      .dispatch(EngineEvent::Message(ControlMessage::ClearCache))
      .await;

    let report = status(&engine).await;
    assert!(report.tier_sizes.values().all(|n| *n == 0));
    assert_eq!(report.mutation_queue_length, 0);
    assert_eq!(report.analytics_queue_length, 0);
  }

  #[tokio::test]
  async fn test_queue_survives_restart() {
    let storage = Arc::new(MemoryStorage::new());
    {
      let (engine, _network, _clock) = engine_with(config(), false, Some(storage.clone())).await;
      fetch(&engine, Method::Patch, "/tasks/1").await;
    }

    let (engine, _network, _clock) = engine_with(config(), true, Some(storage)).await;
    assert_eq!(status(&engine).await.mutation_queue_length, 1);
    // Restored items arm a sync straight away
    assert_eq!(engine.scheduler().take_armed(), vec![SyncTag::Mutations]);
  }

  #[tokio::test]
  async fn test_analytics_message_is_queued_and_synced() {
    let (engine, _network, _clock) = engine_with(config(), true, None).await;
    engine
      .dispatch(EngineEvent::Message(ControlMessage::QueueAnalytics(
        serde_json::json!({"event": "open"}),
      )))
      .await;
    assert_eq!(status(&engine).await.analytics_queue_length, 1);

    let outcome = engine.dispatch(EngineEvent::Sync(SyncTag::Analytics)).await;
    assert!(matches!(outcome, EventOutcome::Analytics(AnalyticsOutcome::Sent(1))));
    assert_eq!(status(&engine).await.analytics_queue_length, 0);
  }

  #[tokio::test]
  async fn test_run_loop_fires_armed_sync_and_stops() {
    let (engine, network, _clock) = engine_with(config(), false, None).await;
    fetch(&engine, Method::Post, "/tasks").await;
    network.set_online(true);

    let engine = Arc::new(engine);
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let (mut client, runner) = engine.spawn(Duration::from_secs(3600), async move {
      let _ = rx.await;
    });

    let notification = client.recv().await.unwrap();
    assert!(matches!(notification, Notification::SyncCompleted(_)));

    tx.send(()).unwrap();
    runner.await.unwrap();
    assert_eq!(status(&engine).await.mutation_queue_length, 0);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_spawned_loop_reports_replay_of_restored_queue() {
    let storage = Arc::new(MemoryStorage::new());
    {
      let (engine, _network, _clock) = engine_with(config(), false, Some(storage.clone())).await;
      fetch(&engine, Method::Post, "/tasks").await;
    }

    let (engine, _network, _clock) = engine_with(config(), true, Some(storage)).await;
    let engine = Arc::new(engine);
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let (mut client, runner) = engine.spawn(Duration::from_secs(3600), async move {
      let _ = rx.await;
    });

    match client.recv().await.unwrap() {
      Notification::SyncCompleted(results) => {
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].item.url, "https://app.test/tasks");
      }
      other => panic!("unexpected notification: {:?}", other),
    }

    tx.send(()).unwrap();
    runner.await.unwrap();
  }
}
