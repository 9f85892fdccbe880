//! Control-plane protocol between the engine and its embedding application.
//!
//! Messages are JSON objects of the form `{ "type": TAG, "data": payload? }`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::queue::QueueItem;

/// Commands sent by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SkipWaiting,
  QueueAnalytics(serde_json::Value),
  ForceSync,
  ClearCache,
  GetStatus,
}

impl ControlMessage {
  /// Parse one control message. Malformed input is logged and dropped.
  pub fn parse(raw: &str) -> Option<Self> {
    match serde_json::from_str(raw) {
      Ok(message) => Some(message),
      Err(e) => {
        warn!(error = %e, "ignoring malformed control message");
        None
      }
    }
  }
}

/// Hit/miss counters across all tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
}

/// Reply to `GET_STATUS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
  pub tier_sizes: BTreeMap<String, usize>,
  pub mutation_queue_length: usize,
  pub analytics_queue_length: usize,
  pub version: String,
  pub cache_stats: CacheStats,
  pub sync_state: String,
}

/// Outcome of replaying one queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
  pub item: QueueItem,
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Dropped after reaching the replay attempt ceiling
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub discarded: bool,
}

/// Unsolicited messages broadcast to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Notification {
  SyncCompleted(Vec<SyncResult>),
  AnalyticsSynced { count: usize },
}

/// Synchronous reply to a control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Reply {
  Status(StatusReport),
}

/// Fan-out of notifications to connected clients.
#[derive(Clone)]
pub struct ClientMessenger {
  tx: broadcast::Sender<Notification>,
}

impl ClientMessenger {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Connect a client.
  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.tx.subscribe()
  }

  /// Send to every connected client. Returns how many received it.
  pub fn broadcast(&self, notification: Notification) -> usize {
    match self.tx.send(notification) {
      Ok(n) => n,
      Err(_) => {
        debug!("no clients connected, notification dropped");
        0
      }
    }
  }
}

impl Default for ClientMessenger {
  fn default() -> Self {
    Self::new(64)
  }
}
