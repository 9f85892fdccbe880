//! In-process storage with the same semantics as [`SqliteStorage`](super::SqliteStorage).
//! Used by `--ephemeral` hosts and tests.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::traits::{DurableStore, TierStore, TtlStore};
use crate::net::Response;

#[derive(Default)]
struct State {
  /// Tier name to entries, oldest first
  tiers: BTreeMap<String, Vec<(String, Response)>>,
  ttl: HashMap<String, DateTime<Utc>>,
  durable: HashMap<String, Vec<u8>>,
}

/// Memory-backed storage. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<State>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> Result<MutexGuard<'_, State>> {
    self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl TierStore for MemoryStorage {
  fn get(&self, tier: &str, key: &str) -> Result<Option<Response>> {
    let state = self.state()?;
    Ok(
      state
        .tiers
        .get(tier)
        .and_then(|entries| entries.iter().find(|(k, _)| k == key))
        .map(|(_, response)| response.clone()),
    )
  }

  fn put(&self, tier: &str, key: &str, response: &Response) -> Result<()> {
    let mut state = self.state()?;
    let entries = state.tiers.entry(tier.to_string()).or_default();
    entries.retain(|(k, _)| k != key);
    entries.push((key.to_string(), response.clone()));
    Ok(())
  }

  fn delete(&self, tier: &str, key: &str) -> Result<bool> {
    let mut state = self.state()?;
    let Some(entries) = state.tiers.get_mut(tier) else {
      return Ok(false);
    };
    let before = entries.len();
    entries.retain(|(k, _)| k != key);
    let removed = entries.len() != before;
    if entries.is_empty() {
      state.tiers.remove(tier);
    }
    Ok(removed)
  }

  fn keys(&self, tier: &str) -> Result<Vec<String>> {
    let state = self.state()?;
    Ok(
      state
        .tiers
        .get(tier)
        .map(|entries| entries.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default(),
    )
  }

  fn tier_names(&self) -> Result<Vec<String>> {
    Ok(self.state()?.tiers.keys().cloned().collect())
  }

  fn delete_tier(&self, tier: &str) -> Result<bool> {
    Ok(self.state()?.tiers.remove(tier).is_some())
  }
}

impl TtlStore for MemoryStorage {
  fn stamp(&self, url: &str, stored_at: DateTime<Utc>) -> Result<()> {
    self.state()?.ttl.insert(url.to_string(), stored_at);
    Ok(())
  }

  fn stored_at(&self, url: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(self.state()?.ttl.get(url).copied())
  }

  fn unstamp(&self, url: &str) -> Result<()> {
    self.state()?.ttl.remove(url);
    Ok(())
  }

  fn stamps(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
    Ok(
      self
        .state()?
        .ttl
        .iter()
        .map(|(url, at)| (url.clone(), *at))
        .collect(),
    )
  }

  fn clear_stamps(&self) -> Result<()> {
    self.state()?.ttl.clear();
    Ok(())
  }
}

impl DurableStore for MemoryStorage {
  fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.state()?.durable.get(key).cloned())
  }

  fn save(&self, key: &str, value: &[u8]) -> Result<()> {
    self.state()?.durable.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.state()?.durable.remove(key);
    Ok(())
  }
}
