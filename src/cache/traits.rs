//! Core traits and types for the tiered cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::net::Response;

/// The four independently bounded cache partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
  Static,
  Dynamic,
  Api,
  Images,
}

impl TierKind {
  pub const ALL: [TierKind; 4] = [
    TierKind::Static,
    TierKind::Dynamic,
    TierKind::Api,
    TierKind::Images,
  ];

  /// Suffix used in the versioned tier name (`{version}-{suffix}`).
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Api => "api",
      Self::Images => "images",
    }
  }
}

impl fmt::Display for TierKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A cached response. Entries are only ever replaced, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: String,
  pub response: Response,
  pub tier: TierKind,
}

/// Result from a strategy, including the response and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// The response handed back to the requester
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
}

impl CacheResult {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
    }
  }

  /// A synthesized fallback (offline page, placeholder, queued acknowledgement).
  pub fn offline(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from a cache tier
  Cache,
  /// Network unavailable and nothing usable cached; synthesized response
  Offline,
}

/// Storage backend for named cache tiers.
///
/// Each tier keeps its keys in insertion order. Re-putting an existing key
/// moves it to the newest position; reads never change the order.
pub trait TierStore: Send + Sync {
  /// Look up a cached response.
  fn get(&self, tier: &str, key: &str) -> Result<Option<Response>>;

  /// Write or overwrite an entry.
  fn put(&self, tier: &str, key: &str, response: &Response) -> Result<()>;

  /// Remove an entry. Returns whether it existed.
  fn delete(&self, tier: &str, key: &str) -> Result<bool>;

  /// Keys of a tier, oldest insertion first.
  fn keys(&self, tier: &str) -> Result<Vec<String>>;

  /// Names of every tier that currently holds entries.
  fn tier_names(&self) -> Result<Vec<String>>;

  /// Drop a whole tier. Returns whether it existed.
  fn delete_tier(&self, tier: &str) -> Result<bool>;
}

/// Side index of insertion times for API responses, since tiers have no expiry.
pub trait TtlStore: Send + Sync {
  fn stamp(&self, url: &str, stored_at: DateTime<Utc>) -> Result<()>;

  fn stored_at(&self, url: &str) -> Result<Option<DateTime<Utc>>>;

  fn unstamp(&self, url: &str) -> Result<()>;

  /// Every record in the index.
  fn stamps(&self) -> Result<Vec<(String, DateTime<Utc>)>>;

  fn clear_stamps(&self) -> Result<()>;
}

/// Durable key/value storage for the offline queues.
pub trait DurableStore: Send + Sync {
  fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

  fn save(&self, key: &str, value: &[u8]) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;
}
