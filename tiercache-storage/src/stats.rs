//! Cache statistics and the periodic stats logger.
//!
//! Counters are lock-free atomics recorded on every tier call. The logger
//! task emits one `tracing` line per tier per interval with the activity
//! since the previous line; cumulative values stay readable through
//! [`StatsRegistry::snapshot`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tiercache_core::{BackendKind, TierLevel};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::registry::ResolvedCache;

// ============================================================================
// COUNTERS
// ============================================================================

/// Counters for one tier of one cache.
#[derive(Debug)]
pub struct TierCounters {
    pub level: TierLevel,
    pub kind: BackendKind,
    pub gets: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub puts: AtomicU64,
    pub deletes: AtomicU64,
    pub errors: AtomicU64,
    /// Accumulated call latency in microseconds.
    pub latency_micros: AtomicU64,
}

impl TierCounters {
    fn new(level: TierLevel, kind: BackendKind) -> Self {
        Self {
            level,
            kind,
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
        }
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TierStats {
        TierStats {
            level: self.level,
            kind: self.kind.clone(),
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(self.latency_micros.load(Ordering::Relaxed)),
        }
    }
}

/// Counters for one cache across its tiers.
#[derive(Debug)]
pub struct CacheCounters {
    pub reads: AtomicU64,
    pub read_hits: AtomicU64,
    pub promotions: AtomicU64,
    pub fallthroughs: AtomicU64,
    pub partial_writes: AtomicU64,
    pub renewals: AtomicU64,
    pub renewal_failures: AtomicU64,
    tiers: Vec<TierCounters>,
}

impl CacheCounters {
    fn new(cache: &ResolvedCache) -> Self {
        Self {
            reads: AtomicU64::new(0),
            read_hits: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            fallthroughs: AtomicU64::new(0),
            partial_writes: AtomicU64::new(0),
            renewals: AtomicU64::new(0),
            renewal_failures: AtomicU64::new(0),
            tiers: cache
                .tiers
                .iter()
                .map(|tier| TierCounters::new(tier.level, tier.binding.kind().clone()))
                .collect(),
        }
    }

    /// Counters of the tier at `level`.
    ///
    /// Every resolved cache has an L1; asking for an absent L2 falls back
    /// to the L1 counters rather than panicking.
    pub fn tier(&self, level: TierLevel) -> &TierCounters {
        let index = match level {
            TierLevel::L1 => 0,
            TierLevel::L2 => 1,
        };
        &self.tiers[index.min(self.tiers.len() - 1)]
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache: &str) -> CacheStats {
        CacheStats {
            cache: cache.to_string(),
            reads: self.reads.load(Ordering::Relaxed),
            read_hits: self.read_hits.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            fallthroughs: self.fallthroughs.load(Ordering::Relaxed),
            partial_writes: self.partial_writes.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            renewal_failures: self.renewal_failures.load(Ordering::Relaxed),
            tiers: self.tiers.iter().map(TierCounters::snapshot).collect(),
        }
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Point-in-time statistics of one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierStats {
    pub level: TierLevel,
    pub kind: BackendKind,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub deletes: u64,
    pub errors: u64,
    pub total_latency: Duration,
}

impl TierStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        ratio(self.hits, self.hits + self.misses)
    }

    pub fn calls(&self) -> u64 {
        self.gets + self.puts + self.deletes
    }

    pub fn mean_latency(&self) -> Duration {
        match u32::try_from(self.calls()) {
            Ok(0) => Duration::ZERO,
            Ok(calls) => self.total_latency / calls,
            Err(_) => Duration::from_micros(
                u64::try_from(self.total_latency.as_micros()).unwrap_or(u64::MAX)
                    / self.calls(),
            ),
        }
    }

    /// Activity between `earlier` and `self`.
    fn since(&self, earlier: &TierStats) -> TierStats {
        TierStats {
            level: self.level,
            kind: self.kind.clone(),
            gets: self.gets.saturating_sub(earlier.gets),
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
            puts: self.puts.saturating_sub(earlier.puts),
            deletes: self.deletes.saturating_sub(earlier.deletes),
            errors: self.errors.saturating_sub(earlier.errors),
            total_latency: self.total_latency.saturating_sub(earlier.total_latency),
        }
    }
}

/// Point-in-time statistics of one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub cache: String,
    pub reads: u64,
    pub read_hits: u64,
    pub promotions: u64,
    pub fallthroughs: u64,
    pub partial_writes: u64,
    pub renewals: u64,
    pub renewal_failures: u64,
    pub tiers: Vec<TierStats>,
}

impl CacheStats {
    /// Fraction of reads answered by any tier (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        ratio(self.read_hits, self.reads)
    }

    pub fn tier(&self, level: TierLevel) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.level == level)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Counters for every registered cache.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    caches: DashMap<String, Arc<CacheCounters>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the counters for a newly registered cache.
    pub fn track(&self, cache: &ResolvedCache) -> Arc<CacheCounters> {
        let counters = Arc::new(CacheCounters::new(cache));
        self.caches
            .insert(cache.name().to_string(), Arc::clone(&counters));
        counters
    }

    pub fn counters(&self, cache: &str) -> Option<Arc<CacheCounters>> {
        self.caches.get(cache).map(|c| Arc::clone(c.value()))
    }

    /// Cumulative statistics for every cache, sorted by name.
    pub fn snapshot(&self) -> Vec<CacheStats> {
        let mut stats: Vec<CacheStats> = self
            .caches
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        stats.sort_by(|a, b| a.cache.cmp(&b.cache));
        stats
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Periodically log per-tier activity until shutdown is signalled.
pub async fn stats_logger_task(
    stats: Arc<StatsRegistry>,
    log_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(log_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; there is nothing to report yet.
    ticker.tick().await;

    let mut previous: HashMap<(String, TierLevel), TierStats> = HashMap::new();

    tracing::info!(
        interval_secs = log_interval.as_secs(),
        "Cache stats logger started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache stats logger shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                log_interval_stats(&stats, &mut previous);
            }
        }
    }
}

fn log_interval_stats(stats: &StatsRegistry, previous: &mut HashMap<(String, TierLevel), TierStats>) {
    for cache in stats.snapshot() {
        for tier in &cache.tiers {
            let key = (cache.cache.clone(), tier.level);
            let delta = match previous.get(&key) {
                Some(earlier) => tier.since(earlier),
                None => tier.clone(),
            };
            previous.insert(key, tier.clone());

            if delta.calls() == 0 {
                tracing::trace!(cache = %cache.cache, tier = %tier.level, "No cache activity");
                continue;
            }

            tracing::info!(
                cache = %cache.cache,
                tier = %delta.level,
                kind = %delta.kind,
                gets = delta.gets,
                hits = delta.hits,
                misses = delta.misses,
                hit_rate = delta.hit_rate(),
                puts = delta.puts,
                deletes = delta.deletes,
                errors = delta.errors,
                mean_latency_us = u64::try_from(delta.mean_latency().as_micros()).unwrap_or(u64::MAX),
                "Cache tier stats"
            );
        }
    }
}
