//! Durable FIFO queues for requests that could not reach the network.
//!
//! The in-memory vector is the working copy; every change is written through
//! to the [`DurableStore`] under a fixed key while the queue lock is held, so a
//! replay can never observe a half-applied update.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::DurableStore;
use crate::config::{Config, QueueConfig};
use crate::net::{Method, Request};

/// Durable-store key of the mutation queue.
pub const MUTATION_QUEUE_KEY: &str = "mutation_queue";
/// Durable-store key of the analytics queue.
pub const ANALYTICS_QUEUE_KEY: &str = "analytics_queue";

static RECORD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Stable identifier for a queued record.
fn record_id(kind: &str, detail: &str, at: DateTime<Utc>) -> String {
  let seq = RECORD_SEQ.fetch_add(1, Ordering::Relaxed);
  let mut hasher = Sha256::new();
  hasher.update(format!("{}:{}:{}:{}", kind, detail, at.to_rfc3339(), seq));
  let digest = hex::encode(hasher.finalize());
  digest[..16].to_string()
}

/// Records that can live in an [`OfflineQueue`].
pub trait QueueRecord: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  fn record_id(&self) -> &str;
}

/// A mutation that failed at the network boundary, awaiting replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
  pub id: String,
  pub url: String,
  pub method: Method,
  pub headers: Vec<(String, String)>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
  #[serde(default)]
  pub attempts: u32,
}

impl QueueItem {
  /// Snapshot a request for later replay.
  pub fn from_request(request: &Request, now: DateTime<Utc>) -> Self {
    let url = request.url.to_string();
    Self {
      id: record_id(request.method.as_str(), &url, now),
      url,
      method: request.method,
      headers: request.headers.clone(),
      body: request.body.clone(),
      enqueued_at: now,
      attempts: 0,
    }
  }

  /// Rebuild the original request.
  pub fn to_request(&self) -> Result<Request> {
    let url = url::Url::parse(&self.url)
      .map_err(|e| eyre!("Queued item {} has invalid URL '{}': {}", self.id, self.url, e))?;
    Ok(Request {
      method: self.method,
      url,
      headers: self.headers.clone(),
      body: self.body.clone(),
    })
  }
}

impl QueueRecord for QueueItem {
  fn record_id(&self) -> &str {
    &self.id
  }
}

/// An opaque analytics event, synced in batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRecord {
  pub id: String,
  pub payload: serde_json::Value,
  pub recorded_at: DateTime<Utc>,
}

impl AnalyticsRecord {
  pub fn new(payload: serde_json::Value, now: DateTime<Utc>) -> Self {
    Self {
      id: record_id("analytics", &payload.to_string(), now),
      payload,
      recorded_at: now,
    }
  }
}

impl QueueRecord for AnalyticsRecord {
  fn record_id(&self) -> &str {
    &self.id
  }
}

/// Bounded, durable FIFO.
pub struct OfflineQueue<T: QueueRecord> {
  key: &'static str,
  store: Arc<dyn DurableStore>,
  items: Mutex<Vec<T>>,
  max_len: usize,
  keep_on_overflow: usize,
}

impl<T: QueueRecord> OfflineQueue<T> {
  pub fn new(key: &'static str, config: &QueueConfig, store: Arc<dyn DurableStore>) -> Self {
    Self {
      key,
      store,
      items: Mutex::new(Vec::new()),
      max_len: config.max_len,
      keep_on_overflow: config.keep_on_overflow,
    }
  }

  /// Reconcile with the persisted copy. Must run before the queue is used.
  ///
  /// Persisted items come first; anything already in memory that the store
  /// does not know about is kept after them.
  pub async fn load(&self) -> Result<usize> {
    let mut items = self.items.lock().await;
    let persisted: Vec<T> = match self.store.load(self.key)? {
      Some(bytes) => match serde_json::from_slice(&bytes) {
        Ok(items) => items,
        Err(e) => {
          warn!(key = self.key, error = %e, "discarding unreadable persisted queue");
          Vec::new()
        }
      },
      None => Vec::new(),
    };

    let known: HashSet<String> = persisted.iter().map(|i| i.record_id().to_string()).collect();
    let pending: Vec<T> = items
      .drain(..)
      .filter(|i| !known.contains(i.record_id()))
      .collect();

    let merged_from_memory = !pending.is_empty();
    *items = persisted;
    items.extend(pending);
    if merged_from_memory {
      self.persist(&items);
    }

    debug!(key = self.key, len = items.len(), "loaded queue");
    Ok(items.len())
  }

  /// Append an item, applying the overflow policy. Returns the new length.
  pub async fn enqueue(&self, item: T) -> usize {
    let mut items = self.items.lock().await;
    items.push(item);

    if items.len() > self.max_len {
      let dropped = items.len() - self.keep_on_overflow;
      items.drain(..dropped);
      warn!(
        key = self.key,
        dropped, "queue overflow, discarded oldest unsynced items"
      );
    }

    self.persist(&items);
    items.len()
  }

  /// Snapshot of the queue in FIFO order. The queue itself is not cleared.
  pub async fn drain(&self) -> Vec<T> {
    self.items.lock().await.clone()
  }

  pub async fn len(&self) -> usize {
    self.items.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.items.lock().await.is_empty()
  }

  /// Whether an item with this id is still queued.
  pub async fn contains(&self, id: &str) -> bool {
    self.items.lock().await.iter().any(|i| i.record_id() == id)
  }

  /// Apply `f` to the queue under the writer lock and persist the result.
  pub async fn update<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
    let mut items = self.items.lock().await;
    let result = f(&mut items);
    self.persist(&items);
    result
  }

  /// Remove every item whose id is in `ids`, preserving the order of the rest.
  pub async fn remove_ids(&self, ids: &HashSet<String>) -> usize {
    self
      .update(|items| {
        let before = items.len();
        items.retain(|i| !ids.contains(i.record_id()));
        before - items.len()
      })
      .await
  }

  pub async fn clear(&self) {
    let mut items = self.items.lock().await;
    items.clear();
    if let Err(e) = self.store.remove(self.key) {
      warn!(key = self.key, error = %e, "failed to clear persisted queue");
    }
    info!(key = self.key, "queue cleared");
  }

  /// Write through to durable storage. Failure leaves the queue memory-only.
  fn persist(&self, items: &[T]) {
    let result = serde_json::to_vec(items)
      .map_err(|e| eyre!("Failed to serialize queue: {}", e))
      .and_then(|bytes| self.store.save(self.key, &bytes));

    if let Err(e) = result {
      warn!(key = self.key, error = %e, "queue not persisted, keeping in memory only");
    }
  }
}

/// Mutation queue built from the engine configuration.
pub fn mutation_queue(config: &Config, store: Arc<dyn DurableStore>) -> OfflineQueue<QueueItem> {
  OfflineQueue::new(MUTATION_QUEUE_KEY, &config.queue, store)
}

/// Analytics queue built from the engine configuration.
pub fn analytics_queue(
  config: &Config,
  store: Arc<dyn DurableStore>,
) -> OfflineQueue<AnalyticsRecord> {
  OfflineQueue::new(ANALYTICS_QUEUE_KEY, &config.queue, store)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use url::Url;

  fn item(path: &str) -> QueueItem {
    let request = Request::new(
      Method::Post,
      Url::parse(&format!("https://app.test{}", path)).unwrap(),
    )
    .with_header("Content-Type", "application/json")
    .with_body(r#"{"title":"x"}"#);
    QueueItem::from_request(&request, Utc::now())
  }

  fn queue(store: Arc<MemoryStorage>) -> OfflineQueue<QueueItem> {
    mutation_queue(&Config::default(), store)
  }

  #[tokio::test]
  async fn test_enqueue_preserves_order() {
    let q = queue(Arc::new(MemoryStorage::new()));
    q.enqueue(item("/a")).await;
    q.enqueue(item("/b")).await;
    q.enqueue(item("/c")).await;

    let urls: Vec<String> = q.drain().await.into_iter().map(|i| i.url).collect();
    assert_eq!(
      urls,
      vec!["https://app.test/a", "https://app.test/b", "https://app.test/c"]
    );
    // drain does not clear
    assert_eq!(q.len().await, 3);
  }

  #[tokio::test]
  async fn test_overflow_keeps_most_recent_25() {
    let q = queue(Arc::new(MemoryStorage::new()));
    let mut ids = Vec::new();
    for i in 0..51 {
      let it = item(&format!("/tasks/{}", i));
      ids.push(it.id.clone());
      q.enqueue(it).await;
    }

    let remaining: Vec<String> = q.drain().await.into_iter().map(|i| i.id).collect();
    assert_eq!(remaining.len(), 25);
    assert_eq!(remaining, ids[26..].to_vec());
  }

  #[tokio::test]
  async fn test_fifty_items_do_not_overflow() {
    let q = queue(Arc::new(MemoryStorage::new()));
    for i in 0..50 {
      q.enqueue(item(&format!("/tasks/{}", i))).await;
    }
    assert_eq!(q.len().await, 50);
  }

  #[tokio::test]
  async fn test_persisted_queue_reloads_after_restart() {
    let store = Arc::new(MemoryStorage::new());
    let first = item("/a");
    let second = item("/b");
    {
      let q = queue(store.clone());
      q.enqueue(first.clone()).await;
      q.enqueue(second.clone()).await;
    }

    let q = queue(store);
    assert_eq!(q.len().await, 0);
    assert_eq!(q.load().await.unwrap(), 2);
    assert_eq!(q.drain().await, vec![first, second]);
  }

  #[tokio::test]
  async fn test_overflow_truncation_is_persisted() {
    let store = Arc::new(MemoryStorage::new());
    let mut ids = Vec::new();
    {
      let q = queue(store.clone());
      for i in 0..51 {
        let it = item(&format!("/tasks/{}", i));
        ids.push(it.id.clone());
        q.enqueue(it).await;
      }
    }

    let q = queue(store);
    assert_eq!(q.load().await.unwrap(), 25);
    let reloaded: Vec<String> = q.drain().await.into_iter().map(|i| i.id).collect();
    assert_eq!(reloaded, ids[26..].to_vec());
  }

  #[tokio::test]
  async fn test_contains_tracks_membership() {
    let q = queue(Arc::new(MemoryStorage::new()));
    let it = item("/a");
    q.enqueue(it.clone()).await;
    assert!(q.contains(&it.id).await);

    q.clear().await;
    assert!(!q.contains(&it.id).await);
  }

  #[tokio::test]
  async fn test_corrupt_persisted_queue_starts_empty() {
    let store = Arc::new(MemoryStorage::new());
    store.save(MUTATION_QUEUE_KEY, b"not json").unwrap();
    let q = queue(store);
    assert_eq!(q.load().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_remove_ids_keeps_relative_order() {
    let q = queue(Arc::new(MemoryStorage::new()));
    let items: Vec<QueueItem> = ["/a", "/b", "/c"].iter().map(|p| item(p)).collect();
    for it in &items {
      q.enqueue(it.clone()).await;
    }

    let ids: HashSet<String> = [items[1].id.clone()].into_iter().collect();
    assert_eq!(q.remove_ids(&ids).await, 1);
    assert_eq!(q.drain().await, vec![items[0].clone(), items[2].clone()]);
  }

  #[tokio::test]
  async fn test_clear_removes_persisted_copy() {
    let store = Arc::new(MemoryStorage::new());
    let q = queue(store.clone());
    q.enqueue(item("/a")).await;
    q.clear().await;
    assert!(q.is_empty().await);
    assert!(store.load(MUTATION_QUEUE_KEY).unwrap().is_none());
  }

  #[test]
  fn test_queue_item_rebuilds_request() {
    let it = item("/tasks");
    let request = it.to_request().unwrap();
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.url.as_str(), "https://app.test/tasks");
    assert_eq!(request.body.as_deref(), Some(br#"{"title":"x"}"#.as_slice()));
  }

  #[test]
  fn test_record_ids_are_unique() {
    let now = Utc::now();
    let a = AnalyticsRecord::new(serde_json::json!({"event": "x"}), now);
    let b = AnalyticsRecord::new(serde_json::json!({"event": "x"}), now);
    assert_ne!(a.id, b.id);
  }
}
