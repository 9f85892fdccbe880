//! Versioned cache tiers with FIFO size bounds and TTL validation for API responses.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::traits::{CacheEntry, TierKind, TierStore, TtlStore};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::net::Response;

/// The engine's four cache tiers, named `{version}-{kind}`.
///
/// Owns the bounded-size policy and the TTL index; the underlying
/// [`TierStore`] knows nothing about either.
pub struct CacheTiers {
  version: String,
  store: Arc<dyn TierStore>,
  ttl: Arc<dyn TtlStore>,
  clock: Arc<dyn Clock>,
  max_entries: usize,
  expiry: Duration,
  sweep_interval: Duration,
  last_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl CacheTiers {
  pub fn new(
    version: impl Into<String>,
    config: &CacheConfig,
    store: Arc<dyn TierStore>,
    ttl: Arc<dyn TtlStore>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      version: version.into(),
      store,
      ttl,
      clock,
      max_entries: config.max_entries,
      expiry: Duration::hours(config.expiry_hours as i64),
      sweep_interval: Duration::minutes(config.sweep_interval_minutes as i64),
      last_sweep: Mutex::new(None),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Storage name of a tier for the current version.
  pub fn tier_name(&self, kind: TierKind) -> String {
    format!("{}-{}", self.version, kind.as_str())
  }

  /// Prefix shared by every version of this engine's tiers (`offsync-v1` -> `offsync-`).
  fn family_prefix(&self) -> String {
    match self.version.rsplit_once('-') {
      Some((family, _)) => format!("{}-", family),
      None => format!("{}-", self.version),
    }
  }

  pub fn get(&self, kind: TierKind, key: &str) -> Result<Option<Response>> {
    self.store.get(&self.tier_name(kind), key)
  }

  /// Write an entry, stamp it if it is an API response, then evict down to the bound.
  ///
  /// Returns the number of entries evicted.
  pub fn put(&self, kind: TierKind, key: &str, response: &Response) -> Result<usize> {
    self.store.put(&self.tier_name(kind), key, response)?;
    if kind == TierKind::Api {
      self.ttl.stamp(key, self.clock.now())?;
    }
    self.enforce_limit(kind)
  }

  /// [`put`](Self::put) for an owned entry.
  pub fn store(&self, entry: &CacheEntry) -> Result<usize> {
    self.put(entry.tier, &entry.key, &entry.response)
  }

  /// Remove the oldest entries until the tier is within `max_entries`.
  pub fn enforce_limit(&self, kind: TierKind) -> Result<usize> {
    let tier = self.tier_name(kind);
    let keys = self.store.keys(&tier)?;
    if keys.len() <= self.max_entries {
      return Ok(0);
    }

    let excess = keys.len() - self.max_entries;
    for key in &keys[..excess] {
      self.store.delete(&tier, key)?;
      if kind == TierKind::Api {
        self.ttl.unstamp(key)?;
      }
    }
    debug!(tier = %tier, evicted = excess, "evicted oldest entries");
    Ok(excess)
  }

  /// Trim every tier to its bound. Returns the total evicted.
  pub fn enforce_all(&self) -> Result<usize> {
    let mut evicted = 0;
    for kind in TierKind::ALL {
      evicted += self.enforce_limit(kind)?;
    }
    Ok(evicted)
  }

  fn is_expired(&self, stored_at: DateTime<Utc>) -> bool {
    self.clock.now() - stored_at >= self.expiry
  }

  /// Cached API response, only if its TTL record is still within the expiry window.
  ///
  /// A missing TTL record counts as expired.
  pub fn get_valid_api(&self, key: &str) -> Result<Option<Response>> {
    let Some(response) = self.get(TierKind::Api, key)? else {
      return Ok(None);
    };

    match self.ttl.stored_at(key)? {
      Some(stored_at) if !self.is_expired(stored_at) => Ok(Some(response)),
      _ => {
        debug!(key, "cached API response expired");
        Ok(None)
      }
    }
  }

  /// Delete API entries whose TTL record has expired.
  ///
  /// Runs at most once per sweep interval; returns `None` when skipped.
  pub fn sweep_expired(&self) -> Result<Option<usize>> {
    let now = self.clock.now();
    {
      let mut last = self
        .last_sweep
        .lock()
        .map_err(|e| color_eyre::eyre::eyre!("Lock poisoned: {}", e))?;
      if let Some(at) = *last {
        if now - at < self.sweep_interval {
          return Ok(None);
        }
      }
      *last = Some(now);
    }

    let api_tier = self.tier_name(TierKind::Api);
    let mut removed = 0;
    for (url, stored_at) in self.ttl.stamps()? {
      if self.is_expired(stored_at) {
        self.store.delete(&api_tier, &url)?;
        self.ttl.unstamp(&url)?;
        removed += 1;
      }
    }

    if removed > 0 {
      info!(removed, "swept expired API responses");
    }
    Ok(Some(removed))
  }

  /// Delete tiers left behind by previous versions. Returns their names.
  ///
  /// TTL records of an old api tier go with it, unless the current api tier
  /// holds the same URL.
  pub fn delete_stale_versions(&self) -> Result<Vec<String>> {
    let family = self.family_prefix();
    let current: Vec<String> = TierKind::ALL.iter().map(|k| self.tier_name(*k)).collect();
    let api_suffix = format!("-{}", TierKind::Api.as_str());
    let live_api: HashSet<String> = self
      .store
      .keys(&self.tier_name(TierKind::Api))?
      .into_iter()
      .collect();

    let mut deleted = Vec::new();
    for name in self.store.tier_names()? {
      if name.starts_with(&family) && !current.contains(&name) {
        if name.ends_with(&api_suffix) {
          for key in self.store.keys(&name)? {
            if !live_api.contains(&key) {
              self.ttl.unstamp(&key)?;
            }
          }
        }
        self.store.delete_tier(&name)?;
        info!(tier = %name, "deleted cache tier from old version");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Entry count per tier.
  pub fn sizes(&self) -> Result<BTreeMap<TierKind, usize>> {
    let mut sizes = BTreeMap::new();
    for kind in TierKind::ALL {
      sizes.insert(kind, self.store.keys(&self.tier_name(kind))?.len());
    }
    Ok(sizes)
  }

  /// Delete every tier and reset the TTL index.
  pub fn clear(&self) -> Result<()> {
    for name in self.store.tier_names()? {
      self.store.delete_tier(&name)?;
    }
    self.ttl.clear_stamps()?;
    Ok(())
  }
}
