//! Replay of queued mutations and analytics batches.

use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::Clock;
use crate::messenger::{ClientMessenger, Notification, SyncResult};
use crate::net::{Method, Request};
use crate::queue::{AnalyticsRecord, OfflineQueue, QueueItem, QueueRecord};
use crate::strategy::StrategyExecutor;

/// Scheduler state between and during cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Syncing,
  /// The last cycle left failed items in the queue
  IdleWithPending,
}

impl fmt::Display for SyncState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Idle => "idle",
      Self::Syncing => "syncing",
      Self::IdleWithPending => "idle-with-pending",
    })
  }
}

/// Wake-up registrations the host can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncTag {
  Mutations,
  Analytics,
}

impl SyncTag {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Mutations => "sync-queue",
      Self::Analytics => "sync-analytics",
    }
  }
}

/// Result of one analytics cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsOutcome {
  /// Nothing queued
  Empty,
  /// Batch accepted and removed from the queue
  Sent(usize),
  /// Batch rejected or unreachable; kept for the next cycle
  Retained(usize),
  /// Another analytics cycle is in flight
  Busy,
}

/// Drives replay cycles for the mutation queue and the analytics queue.
pub struct SyncScheduler {
  mutations: Arc<OfflineQueue<QueueItem>>,
  analytics: Arc<OfflineQueue<AnalyticsRecord>>,
  executor: StrategyExecutor,
  messenger: ClientMessenger,
  analytics_url: Url,
  max_attempts: u32,
  clock: Arc<dyn Clock>,
  state: Mutex<SyncState>,
  cycle: tokio::sync::Mutex<()>,
  /// Set when a cycle was requested while another was running
  rerun: AtomicBool,
  analytics_cycle: tokio::sync::Mutex<()>,
  armed: Mutex<BTreeSet<SyncTag>>,
  wake: Notify,
}

impl SyncScheduler {
  pub fn new(
    mutations: Arc<OfflineQueue<QueueItem>>,
    analytics: Arc<OfflineQueue<AnalyticsRecord>>,
    executor: StrategyExecutor,
    messenger: ClientMessenger,
    analytics_url: Url,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      mutations,
      analytics,
      executor,
      messenger,
      analytics_url,
      max_attempts: max_attempts.max(1),
      clock,
      state: Mutex::new(SyncState::Idle),
      cycle: tokio::sync::Mutex::new(()),
      rerun: AtomicBool::new(false),
      analytics_cycle: tokio::sync::Mutex::new(()),
      armed: Mutex::new(BTreeSet::new()),
      wake: Notify::new(),
    }
  }

  pub fn state(&self) -> SyncState {
    self.state.lock().map(|s| *s).unwrap_or(SyncState::Idle)
  }

  fn set_state(&self, state: SyncState) {
    if let Ok(mut current) = self.state.lock() {
      *current = state;
    }
  }

  /// Ask the host to run `tag` as soon as possible.
  pub fn arm(&self, tag: SyncTag) {
    if let Ok(mut armed) = self.armed.lock() {
      armed.insert(tag);
    }
    debug!(tag = tag.as_str(), "sync armed");
    self.wake.notify_one();
  }

  /// Take every pending registration.
  pub fn take_armed(&self) -> Vec<SyncTag> {
    self
      .armed
      .lock()
      .map(|mut armed| std::mem::take(&mut *armed).into_iter().collect())
      .unwrap_or_default()
  }

  /// Wait until something is armed, then take the registrations.
  pub async fn wait_armed(&self) -> Vec<SyncTag> {
    loop {
      let armed = self.take_armed();
      if !armed.is_empty() {
        return armed;
      }
      self.wake.notified().await;
    }
  }

  /// Replay the mutation queue once, in FIFO order.
  ///
  /// Every item gets one attempt; successes are removed, failures stay in
  /// their original relative order. Items that leave the queue mid-cycle
  /// (cleared or truncated) are not sent.
  ///
  /// Returns `None` when a cycle is already running. That cycle re-arms
  /// [`SyncTag::Mutations`] when it finishes, so the request is not lost.
  pub async fn run_cycle(&self) -> Option<Vec<SyncResult>> {
    let guard = match self.cycle.try_lock() {
      Ok(guard) => guard,
      Err(_) => {
        self.rerun.store(true, Ordering::SeqCst);
        // The running cycle may have released the lock before seeing the flag
        match self.cycle.try_lock() {
          Ok(guard) => guard,
          Err(_) => {
            debug!("sync cycle already running, will rerun when it finishes");
            return None;
          }
        }
      }
    };
    // Anything requested before this snapshot is covered by it
    self.rerun.store(false, Ordering::SeqCst);

    let results = self.replay_queue().await;

    drop(guard);
    if self.rerun.swap(false, Ordering::SeqCst) {
      self.arm(SyncTag::Mutations);
    }
    Some(results)
  }

  async fn replay_queue(&self) -> Vec<SyncResult> {
    self.set_state(SyncState::Syncing);
    let snapshot = self.mutations.drain().await;
    if !snapshot.is_empty() {
      info!(items = snapshot.len(), "replaying queued mutations");
    }

    let mut results = Vec::with_capacity(snapshot.len());
    for item in snapshot {
      if !self.mutations.contains(&item.id).await {
        debug!(id = %item.id, url = %item.url, "item left the queue, not replaying");
        continue;
      }
      results.push(self.replay(item).await);
    }

    let removed: HashSet<String> = results
      .iter()
      .filter(|r| r.success || r.discarded)
      .map(|r| r.item.id.clone())
      .collect();
    let attempts: HashMap<String, u32> = results
      .iter()
      .filter(|r| !r.success && !r.discarded)
      .map(|r| (r.item.id.clone(), r.item.attempts))
      .collect();

    // Items enqueued during the cycle are untouched
    let remaining = self
      .mutations
      .update(|items| {
        items.retain(|i| !removed.contains(i.record_id()));
        for item in items.iter_mut() {
          if let Some(n) = attempts.get(&item.id) {
            item.attempts = *n;
          }
        }
        items.len()
      })
      .await;

    self.set_state(if remaining == 0 {
      SyncState::Idle
    } else {
      SyncState::IdleWithPending
    });

    if !results.is_empty() {
      let ok = results.iter().filter(|r| r.success).count();
      info!(
        ok,
        failed = results.len() - ok,
        remaining,
        "sync cycle completed"
      );
      self
        .messenger
        .broadcast(Notification::SyncCompleted(results.clone()));
    }

    results
  }

  async fn replay(&self, mut item: QueueItem) -> SyncResult {
    let outcome = match item.to_request() {
      Ok(request) => match self.executor.fetch(&request).await {
        Ok(response) if response.is_success() => Ok(()),
        Ok(response) => Err(format!("server responded with status {}", response.status)),
        Err(e) => Err(e.to_string()),
      },
      Err(e) => Err(e.to_string()),
    };

    match outcome {
      Ok(()) => {
        debug!(id = %item.id, url = %item.url, "replayed queued mutation");
        SyncResult {
          item,
          success: true,
          error: None,
          discarded: false,
        }
      }
      Err(error) => {
        item.attempts += 1;
        let discarded = item.attempts >= self.max_attempts;
        if discarded {
          warn!(
            id = %item.id,
            url = %item.url,
            attempts = item.attempts,
            error = %error,
            "discarding mutation after repeated replay failures"
          );
        } else {
          debug!(id = %item.id, url = %item.url, error = %error, "replay failed, retained");
        }
        SyncResult {
          item,
          success: false,
          error: Some(error),
          discarded,
        }
      }
    }
  }

  /// Send the whole analytics queue as one batch.
  ///
  /// All-or-nothing: the batch leaves the queue only if the endpoint accepts it.
  pub async fn sync_analytics(&self) -> AnalyticsOutcome {
    let Ok(_guard) = self.analytics_cycle.try_lock() else {
      return AnalyticsOutcome::Busy;
    };

    let batch = self.analytics.drain().await;
    if batch.is_empty() {
      return AnalyticsOutcome::Empty;
    }

    let body = json!({
      "events": batch,
      "sentAt": self.clock.now(),
    });
    let request = Request::new(Method::Post, self.analytics_url.clone())
      .with_header("Content-Type", "application/json")
      .with_body(body.to_string());

    let accepted = match self.executor.fetch(&request).await {
      Ok(response) if response.is_success() => true,
      Ok(response) => {
        warn!(status = response.status, "analytics batch rejected");
        false
      }
      Err(e) => {
        debug!(error = %e, "analytics batch not sent");
        false
      }
    };

    if !accepted {
      return AnalyticsOutcome::Retained(batch.len());
    }

    let ids: HashSet<String> = batch.iter().map(|r| r.id.clone()).collect();
    let sent = self.analytics.remove_ids(&ids).await;
    info!(sent, "analytics batch synced");
    self
      .messenger
      .broadcast(Notification::AnalyticsSynced { count: sent });
    AnalyticsOutcome::Sent(sent)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheTiers, MemoryStorage};
  use crate::clock::ManualClock;
  use crate::config::Config;
  use crate::net::{FetchError, Fetcher, Response};
  use crate::queue::{analytics_queue, mutation_queue};
  use async_trait::async_trait;
  use chrono::{DateTime, TimeZone, Utc};
  use std::time::Duration;
  use tokio::sync::Semaphore;

  /// Fetcher that fails any URL containing one of the listed fragments.
  ///
  /// Every fetch waits for a permit from `gate`, so a test can hold a cycle
  /// mid-replay.
  struct Scripted {
    offline: bool,
    failing: Vec<&'static str>,
    seen: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Vec<u8>>>,
    started: Notify,
    gate: Semaphore,
  }

  #[async_trait]
  impl Fetcher for Scripted {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
      self.seen.lock().unwrap().push(request.url.to_string());
      self
        .bodies
        .lock()
        .unwrap()
        .push(request.body.clone().unwrap_or_default());
      self.started.notify_one();
      let _permit = self.gate.acquire().await;

      if self.offline {
        return Err(FetchError::Failed("offline".to_string()));
      }
      if self.failing.iter().any(|f| request.url.as_str().contains(f)) {
        return Ok(Response::new(500, "boom"));
      }
      Ok(Response::new(200, "{}"))
    }
  }

  struct Harness {
    scheduler: SyncScheduler,
    mutations: Arc<OfflineQueue<QueueItem>>,
    analytics: Arc<OfflineQueue<AnalyticsRecord>>,
    messenger: ClientMessenger,
    fetcher: Arc<Scripted>,
  }

  fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap()
  }

  fn harness(offline: bool, failing: Vec<&'static str>, max_attempts: u32) -> Harness {
    build(offline, failing, max_attempts, Semaphore::MAX_PERMITS)
  }

  /// Harness whose fetches block until the test adds permits to the gate.
  fn gated_harness() -> Harness {
    build(false, vec![], 5, 0)
  }

  fn build(
    offline: bool,
    failing: Vec<&'static str>,
    max_attempts: u32,
    permits: usize,
  ) -> Harness {
    let config = Config::default();
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let fetcher = Arc::new(Scripted {
      offline,
      failing,
      seen: Mutex::new(Vec::new()),
      bodies: Mutex::new(Vec::new()),
      started: Notify::new(),
      gate: Semaphore::new(permits),
    });
    let tiers = Arc::new(CacheTiers::new(
      "offsync-v1",
      &config.cache,
      storage.clone(),
      storage.clone(),
      clock.clone(),
    ));
    let executor = StrategyExecutor::new(tiers, fetcher.clone(), Duration::from_secs(5));
    let mutations = Arc::new(mutation_queue(&config, storage.clone()));
    let analytics = Arc::new(analytics_queue(&config, storage));
    let messenger = ClientMessenger::default();
    let scheduler = SyncScheduler::new(
      mutations.clone(),
      analytics.clone(),
      executor,
      messenger.clone(),
      Url::parse("https://app.test/api/analytics/batch").unwrap(),
      max_attempts,
      clock,
    );
    Harness {
      scheduler,
      mutations,
      analytics,
      messenger,
      fetcher,
    }
  }

  fn post(path: &str) -> QueueItem {
    let url = Url::parse(&format!("https://app.test{}", path)).unwrap();
    QueueItem::from_request(&Request::new(Method::Post, url).with_body("{}"), Utc::now())
  }

  #[tokio::test]
  async fn test_successful_cycle_empties_queue_and_notifies() {
    let h = harness(false, vec![], 5);
    let mut client = h.messenger.subscribe();
    h.mutations.enqueue(post("/tasks")).await;

    let results = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert!(h.mutations.is_empty().await);
    assert_eq!(h.scheduler.state(), SyncState::Idle);

    match client.recv().await.unwrap() {
      Notification::SyncCompleted(results) => {
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
      }
      other => panic!("unexpected notification: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_partial_failure_retains_failed_items_in_order() {
    let h = harness(false, vec!["/bad"], 5);
    let a = post("/good/1");
    let b = post("/bad/1");
    let c = post("/good/2");
    let d = post("/bad/2");
    for item in [&a, &b, &c, &d] {
      h.mutations.enqueue(item.clone()).await;
    }

    let results = h.scheduler.run_cycle().await.unwrap();
    let success: Vec<bool> = results.iter().map(|r| r.success).collect();
    assert_eq!(success, vec![true, false, true, false]);

    let remaining: Vec<String> = h.mutations.drain().await.into_iter().map(|i| i.id).collect();
    assert_eq!(remaining, vec![b.id, d.id]);
    assert_eq!(h.scheduler.state(), SyncState::IdleWithPending);
  }

  #[tokio::test]
  async fn test_replay_follows_enqueue_order_without_aborting() {
    let h = harness(true, vec![], 5);
    for path in ["/a", "/b", "/c"] {
      h.mutations.enqueue(post(path)).await;
    }

    let results = h.scheduler.run_cycle().await.unwrap();
    assert!(results.iter().all(|r| !r.success && r.error.is_some()));
    assert_eq!(
      *h.fetcher.seen.lock().unwrap(),
      vec!["https://app.test/a", "https://app.test/b", "https://app.test/c"]
    );
    assert!(h.mutations.drain().await.iter().all(|i| i.attempts == 1));
  }

  #[tokio::test]
  async fn test_items_are_discarded_after_max_attempts() {
    let h = harness(true, vec![], 2);
    h.mutations.enqueue(post("/tasks")).await;

    let first = h.scheduler.run_cycle().await.unwrap();
    assert!(!first[0].discarded);
    assert_eq!(h.mutations.len().await, 1);

    let second = h.scheduler.run_cycle().await.unwrap();
    assert!(second[0].discarded);
    assert!(h.mutations.is_empty().await);
  }

  #[tokio::test]
  async fn test_empty_queue_cycle_is_quiet() {
    let h = harness(false, vec![], 5);
    let results = h.scheduler.run_cycle().await.unwrap();
    assert!(results.is_empty());
    assert_eq!(h.scheduler.state(), SyncState::Idle);
  }

  #[tokio::test]
  async fn test_analytics_batch_success_clears_queue() {
    let h = harness(false, vec![], 5);
    for n in 0..3 {
      h.analytics
        .enqueue(AnalyticsRecord::new(json!({ "n": n }), Utc::now()))
        .await;
    }

    assert_eq!(h.scheduler.sync_analytics().await, AnalyticsOutcome::Sent(3));
    assert!(h.analytics.is_empty().await);
    // One request for the whole batch
    assert_eq!(h.fetcher.seen.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_analytics_batch_is_stamped_with_injected_clock() {
    let h = harness(false, vec![], 5);
    h.analytics
      .enqueue(AnalyticsRecord::new(json!({ "event": "open" }), start_time()))
      .await;
    h.scheduler.sync_analytics().await;

    let bodies = h.fetcher.bodies.lock().unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    let sent_at: DateTime<Utc> = body["sentAt"].as_str().unwrap().parse().unwrap();
    assert_eq!(sent_at, start_time());
    assert_eq!(body["events"].as_array().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_analytics_batch_failure_retains_everything() {
    let h = harness(false, vec!["/analytics"], 5);
    for n in 0..3 {
      h.analytics
        .enqueue(AnalyticsRecord::new(json!({ "n": n }), Utc::now()))
        .await;
    }

    assert_eq!(
      h.scheduler.sync_analytics().await,
      AnalyticsOutcome::Retained(3)
    );
    assert_eq!(h.analytics.len().await, 3);
  }

  #[tokio::test]
  async fn test_analytics_empty_queue() {
    let h = harness(false, vec![], 5);
    assert_eq!(h.scheduler.sync_analytics().await, AnalyticsOutcome::Empty);
  }

  #[tokio::test]
  async fn test_arm_wakes_waiter_once_per_tag() {
    let h = harness(false, vec![], 5);
    h.scheduler.arm(SyncTag::Mutations);
    h.scheduler.arm(SyncTag::Mutations);
    h.scheduler.arm(SyncTag::Analytics);

    let tags = h.scheduler.wait_armed().await;
    assert_eq!(tags, vec![SyncTag::Mutations, SyncTag::Analytics]);
    assert!(h.scheduler.take_armed().is_empty());
  }

  #[tokio::test]
  async fn test_request_during_running_cycle_rearms_sync() {
    let h = gated_harness();
    h.mutations.enqueue(post("/tasks/a")).await;

    let running = h.scheduler.run_cycle();
    let meanwhile = async {
      h.fetcher.started.notified().await;
      h.mutations.enqueue(post("/tasks/b")).await;
      // Overlapping request is refused but remembered
      assert!(h.scheduler.run_cycle().await.is_none());
      assert!(h.scheduler.take_armed().is_empty());
      h.fetcher.gate.add_permits(10);
    };
    let (results, ()) = tokio::join!(running, meanwhile);

    assert_eq!(results.unwrap().len(), 1);
    assert_eq!(h.mutations.len().await, 1);
    assert_eq!(h.scheduler.take_armed(), vec![SyncTag::Mutations]);

    let second = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(second[0].item.url, "https://app.test/tasks/b");
    assert!(h.mutations.is_empty().await);
  }

  #[tokio::test]
  async fn test_uncontended_cycle_does_not_rearm() {
    let h = harness(false, vec![], 5);
    h.mutations.enqueue(post("/tasks")).await;
    h.scheduler.run_cycle().await.unwrap();
    assert!(h.scheduler.take_armed().is_empty());
  }

  #[tokio::test]
  async fn test_items_cleared_mid_cycle_are_not_sent() {
    let h = gated_harness();
    h.mutations.enqueue(post("/tasks/a")).await;
    h.mutations.enqueue(post("/tasks/b")).await;

    let running = h.scheduler.run_cycle();
    let clear = async {
      h.fetcher.started.notified().await;
      h.mutations.clear().await;
      h.fetcher.gate.add_permits(10);
    };
    let (results, ()) = tokio::join!(running, clear);

    let results = results.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].item.url, "https://app.test/tasks/a");
    assert_eq!(
      *h.fetcher.seen.lock().unwrap(),
      vec!["https://app.test/tasks/a"]
    );
    assert!(h.mutations.is_empty().await);
    assert_eq!(h.scheduler.state(), SyncState::Idle);
  }
}
