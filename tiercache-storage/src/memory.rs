//! In-process cache tier.
//!
//! A concurrent map with per-entry absolute expiry. Expired entries are
//! dropped lazily on read and in bulk by [`InMemoryCacheClient::purge_expired`].
//! An optional entry bound evicts expired entries first, then the entry
//! closest to expiry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tiercache_core::{system_clock, BackendError, SharedClock};

use crate::client::CacheClient;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: DateTime<Utc>,
}

/// In-process cache client.
///
/// # Example
///
/// ```ignore
/// let local = Arc::new(InMemoryCacheClient::new().with_max_entries(10_000));
/// manager.register_client(ClientBinding::new(BackendKind::local(), local))?;
/// ```
#[derive(Debug)]
pub struct InMemoryCacheClient {
    entries: DashMap<String, StoredValue>,
    clock: SharedClock,
    max_entries: Option<usize>,
}

impl Default for InMemoryCacheClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheClient {
    /// Create an unbounded client on the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an unbounded client on the given clock.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            max_entries: None,
        }
    }

    /// Bound the number of stored entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max.max(1));
        self
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remaining lifetime of `key`, if present and unexpired.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .and_then(|stored| (stored.expires_at - now).to_std().ok())
            .filter(|remaining| !remaining.is_zero())
    }

    fn make_room(&self, incoming: &str) {
        let Some(max) = self.max_entries else {
            return;
        };
        if self.entries.len() < max || self.entries.contains_key(incoming) {
            return;
        }

        self.purge_expired();
        while self.entries.len() >= max {
            let victim = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().expires_at)
                .map(|entry| entry.key().clone());
            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl CacheClient for InMemoryCacheClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(stored) if stored.expires_at > now => return Ok(Some(stored.bytes.clone())),
            Some(_) => true,
        };
        if expired {
            self.entries.remove_if(key, |_, stored| stored.expires_at <= now);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| BackendError::unavailable(format!("ttl out of range: {}", e)))?;
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.make_room(key);
        self.entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.entries.remove(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
