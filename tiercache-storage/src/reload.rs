//! Background renewal of hot entries.
//!
//! A definition with a reload interval gets a [`Renewer`]. Reads that hit
//! an entry past its `reload_at` mark the key hot; every reload tick the
//! renewer drains the hot set, re-reads each key from the authoritative
//! tier and rewrites it into L1 with fresh timestamps and a full TTL.
//! Values are never recomputed and L2 is never rewritten, so a key that
//! keeps being read stays in L1 only as long as L2 still holds it.
//!
//! Foreground `put`/`evict` calls take a [`KeyWriteGuard`] for their key.
//! A renewal that overlaps one of them either skips the key or removes
//! what it just wrote from L1, so it never brings back a value the caller
//! replaced or evicted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tiercache_core::{CacheError, CacheResult, KeyComposer, SharedClock, TierFailure, TierLevel};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::envelope::CacheEntry;
use crate::registry::{ResolvedCache, Tier};
use crate::stats::CacheCounters;
use crate::tiers::{compose_keys, delete_entry, read_entry, write_entry, MAX_BATCH_KEYS};

/// A logical key together with the tenant it was read under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HotKey {
    pub tenant: Option<String>,
    pub key: String,
}

impl HotKey {
    fn new(tenant: Option<&str>, key: &str) -> Self {
        Self {
            tenant: tenant.map(str::to_string),
            key: key.to_string(),
        }
    }
}

/// Keys read past their reload point since the last cycle.
#[derive(Debug, Default)]
pub struct HotKeys {
    keys: Mutex<HashSet<HotKey>>,
}

impl HotKeys {
    pub fn mark(&self, tenant: Option<&str>, key: &str) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(HotKey::new(tenant, key));
    }

    /// Unmark a key. Returns whether it was marked.
    pub fn forget(&self, tenant: Option<&str>, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&HotKey::new(tenant, key))
    }

    /// Take every marked key, leaving the set empty.
    pub fn drain(&self) -> Vec<HotKey> {
        let taken = std::mem::take(&mut *self.keys.lock().unwrap_or_else(|e| e.into_inner()));
        taken.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-flight renewals and foreground writes of one key.
#[derive(Debug, Default)]
struct Activity {
    renewals: usize,
    writers: usize,
    /// A writer started while a renewal was in flight.
    disturbed: bool,
}

#[derive(Debug, Default)]
struct ActivityTable {
    keys: Mutex<HashMap<HotKey, Activity>>,
}

impl ActivityTable {
    fn with<R>(&self, hot: &HotKey, f: impl FnOnce(&mut Activity) -> R) -> R {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let activity = keys.entry(hot.clone()).or_default();
        let result = f(activity);
        if activity.renewals == 0 && activity.writers == 0 {
            keys.remove(hot);
        }
        result
    }

    fn begin_renewal<'a>(&'a self, hot: &'a HotKey) -> RenewalGuard<'a> {
        self.with(hot, |a| {
            if a.renewals == 0 {
                a.disturbed = false;
            }
            a.renewals += 1;
        });
        RenewalGuard { activity: self, hot }
    }

    /// Whether a foreground write overlapped the renewal so far.
    fn contended(&self, hot: &HotKey) -> bool {
        self.with(hot, |a| a.disturbed || a.writers > 0)
    }

    fn end_renewal(&self, hot: &HotKey) {
        self.with(hot, |a| a.renewals = a.renewals.saturating_sub(1));
    }

    fn begin_write(&self, hot: &HotKey) {
        self.with(hot, |a| {
            a.writers += 1;
            if a.renewals > 0 {
                a.disturbed = true;
            }
        });
    }

    fn end_write(&self, hot: &HotKey) {
        self.with(hot, |a| a.writers = a.writers.saturating_sub(1));
    }
}

/// Releases a renewal's activity slot, also when the renewal is cancelled.
struct RenewalGuard<'a> {
    activity: &'a ActivityTable,
    hot: &'a HotKey,
}

impl Drop for RenewalGuard<'_> {
    fn drop(&mut self) {
        self.activity.end_renewal(self.hot);
    }
}

/// Held by a foreground `put`/`evict` for the duration of its tier writes.
#[derive(Debug)]
pub struct KeyWriteGuard<'a> {
    activity: &'a ActivityTable,
    hot: HotKey,
}

impl Drop for KeyWriteGuard<'_> {
    fn drop(&mut self) {
        self.activity.end_write(&self.hot);
    }
}

/// Result of one renewal cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalReport {
    /// Rewritten into L1.
    pub renewed: usize,
    /// Gone from the authoritative tier; nothing to renew.
    pub dropped: usize,
    /// Not due, changed since it was marked, or raced with a foreground write.
    pub skipped: usize,
    pub failed: usize,
}

impl RenewalReport {
    pub fn total(&self) -> usize {
        self.renewed + self.dropped + self.skipped + self.failed
    }
}

enum Renewal {
    Renewed,
    Dropped,
    Skipped,
}

/// Renews hot entries of one cache.
#[derive(Debug)]
pub struct Renewer {
    cache: Arc<ResolvedCache>,
    composer: KeyComposer,
    clock: SharedClock,
    counters: Arc<CacheCounters>,
    hot: HotKeys,
    activity: ActivityTable,
}

impl Renewer {
    pub fn new(
        cache: Arc<ResolvedCache>,
        composer: KeyComposer,
        clock: SharedClock,
        counters: Arc<CacheCounters>,
    ) -> Self {
        Self {
            cache,
            composer,
            clock,
            counters,
            hot: HotKeys::default(),
            activity: ActivityTable::default(),
        }
    }

    pub fn cache_name(&self) -> &str {
        self.cache.name()
    }

    /// The reload interval, if the definition has one.
    pub fn period(&self) -> Option<Duration> {
        self.cache.definition.reload()
    }

    pub fn mark_hot(&self, tenant: Option<&str>, key: &str) {
        self.hot.mark(tenant, key);
    }

    pub fn hot_keys(&self) -> &HotKeys {
        &self.hot
    }

    /// Announce a foreground write of `key`. The key is unmarked and any
    /// renewal of it that overlaps the guard's lifetime backs off.
    pub fn write_guard(&self, tenant: Option<&str>, key: &str) -> KeyWriteGuard<'_> {
        let hot = HotKey::new(tenant, key);
        self.hot.forget(tenant, key);
        self.activity.begin_write(&hot);
        KeyWriteGuard {
            activity: &self.activity,
            hot,
        }
    }

    /// Run one renewal cycle over the keys marked since the last one.
    pub async fn run_once(&self) -> RenewalReport {
        let mut report = RenewalReport::default();
        let hot = self.hot.drain();

        for chunk in hot.chunks(MAX_BATCH_KEYS) {
            let results = join_all(chunk.iter().map(|hot| self.renew_tracked(hot))).await;
            for (hot, result) in chunk.iter().zip(results) {
                match result {
                    Ok(Renewal::Renewed) => {
                        report.renewed += 1;
                        CacheCounters::incr(&self.counters.renewals);
                        tracing::debug!(cache = %self.cache_name(), key = %hot.key, "Entry renewed");
                    }
                    Ok(Renewal::Dropped) => report.dropped += 1,
                    Ok(Renewal::Skipped) => report.skipped += 1,
                    Err(e) => {
                        report.failed += 1;
                        CacheCounters::incr(&self.counters.renewal_failures);
                        tracing::warn!(
                            cache = %self.cache_name(),
                            key = %hot.key,
                            error = %e,
                            "Entry renewal failed"
                        );
                    }
                }
            }
        }

        report
    }

    async fn renew_tracked(&self, hot: &HotKey) -> CacheResult<Renewal> {
        let _renewal = self.activity.begin_renewal(hot);
        self.renew(hot).await
    }

    async fn renew(&self, hot: &HotKey) -> CacheResult<Renewal> {
        let keys = compose_keys(&self.cache, &self.composer, &hot.key, hot.tenant.as_deref())?;
        let authoritative = self.cache.authoritative();
        let index = self
            .cache
            .tiers
            .iter()
            .position(|t| t.level == authoritative.level)
            .unwrap_or(0);
        let expire = self.cache.definition.expire();

        let Some(entry) = self.read_authoritative(authoritative, &keys[index]).await? else {
            return Ok(Renewal::Dropped);
        };
        let now = self.clock.now();
        if entry.remaining(expire, now).is_none() {
            return Ok(Renewal::Dropped);
        }
        if !entry.is_due(now) {
            return Ok(Renewal::Skipped);
        }

        // Confirm nothing replaced the entry while it was being inspected.
        match self.read_authoritative(authoritative, &keys[index]).await? {
            None => return Ok(Renewal::Dropped),
            Some(current) if current.written_at != entry.written_at => {
                return Ok(Renewal::Skipped);
            }
            Some(_) => {}
        }
        if self.activity.contended(hot) {
            return Ok(Renewal::Skipped);
        }

        let l1 = self.cache.l1();
        let renewed = entry.renewed(now, self.period());
        let written = write_entry(
            l1,
            self.counters.tier(TierLevel::L1),
            &keys[0],
            renewed.encode(),
            expire,
        )
        .await
        .result;
        if let Err(error) = written {
            return Err(CacheError::backend(TierFailure {
                level: TierLevel::L1,
                kind: l1.binding.kind().clone(),
                error,
            }));
        }

        if self.activity.contended(hot) {
            // A foreground write may have landed before ours; drop our copy.
            let removed = delete_entry(l1, self.counters.tier(TierLevel::L1), &keys[0]).await;
            if let Err(error) = removed.result {
                tracing::warn!(
                    cache = %self.cache_name(),
                    key = %hot.key,
                    error = %error,
                    "Could not withdraw renewal that raced a write"
                );
            }
            return Ok(Renewal::Skipped);
        }
        Ok(Renewal::Renewed)
    }

    async fn read_authoritative(
        &self,
        tier: &Tier,
        key: &tiercache_core::PhysicalKey,
    ) -> CacheResult<Option<CacheEntry>> {
        read_entry(tier, self.counters.tier(tier.level), key)
            .await
            .map_err(|error| {
                CacheError::backend(TierFailure {
                    level: tier.level,
                    kind: tier.binding.kind().clone(),
                    error,
                })
            })
    }
}

/// Renew hot entries every `period` until shutdown is signalled.
pub async fn reload_task(renewer: Arc<Renewer>, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    tracing::info!(
        cache = %renewer.cache_name(),
        period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        "Reload task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!(cache = %renewer.cache_name(), "Reload task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let report = renewer.run_once().await;
                if report.total() > 0 {
                    tracing::debug!(
                        cache = %renewer.cache_name(),
                        renewed = report.renewed,
                        dropped = report.dropped,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Reload cycle completed"
                    );
                } else {
                    tracing::trace!(cache = %renewer.cache_name(), "Reload cycle found no hot keys");
                }
            }
        }
    }
}
