//! Instrumented tier calls and write fan-out.

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tiercache_core::{BackendError, CacheResult, KeyComposer, PhysicalKey};

use crate::envelope::CacheEntry;
use crate::outcome::TierResult;
use crate::registry::{ResolvedCache, Tier};
use crate::stats::{CacheCounters, TierCounters};

/// Keys per concurrent chunk in batch operations and renewal cycles.
pub const MAX_BATCH_KEYS: usize = 128;

/// Physical keys of every tier of `cache`, parallel to `cache.tiers`.
pub(crate) fn compose_keys(
    cache: &ResolvedCache,
    composer: &KeyComposer,
    logical_key: &str,
    tenant: Option<&str>,
) -> CacheResult<Vec<PhysicalKey>> {
    cache
        .tiers
        .iter()
        .map(|tier| {
            composer
                .compose(&cache.definition, tier.binding.scope(), logical_key, tenant)
                .map_err(Into::into)
        })
        .collect()
}

/// Read and decode one tier's entry.
pub(crate) async fn read_entry(
    tier: &Tier,
    counters: &TierCounters,
    key: &PhysicalKey,
) -> Result<Option<CacheEntry>, BackendError> {
    CacheCounters::incr(&counters.gets);
    let started = Instant::now();
    let result = tier.binding.client().get(key.as_str()).await;
    counters.record_latency(started.elapsed());

    let decoded = match result {
        Ok(Some(bytes)) => CacheEntry::decode(&bytes).map(Some).map_err(BackendError::from),
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    };
    match &decoded {
        Ok(Some(_)) => CacheCounters::incr(&counters.hits),
        Ok(None) => CacheCounters::incr(&counters.misses),
        Err(_) => CacheCounters::incr(&counters.errors),
    }
    decoded
}

/// Write one tier.
pub(crate) async fn write_entry(
    tier: &Tier,
    counters: &TierCounters,
    key: &PhysicalKey,
    bytes: Vec<u8>,
    ttl: Duration,
) -> TierResult {
    CacheCounters::incr(&counters.puts);
    let started = Instant::now();
    let result = tier.binding.client().put(key.as_str(), bytes, ttl).await;
    counters.record_latency(started.elapsed());
    if result.is_err() {
        CacheCounters::incr(&counters.errors);
    }
    TierResult {
        level: tier.level,
        kind: tier.binding.kind().clone(),
        result,
    }
}

/// Delete from one tier.
pub(crate) async fn delete_entry(
    tier: &Tier,
    counters: &TierCounters,
    key: &PhysicalKey,
) -> TierResult {
    CacheCounters::incr(&counters.deletes);
    let started = Instant::now();
    let result = tier.binding.client().delete(key.as_str()).await;
    counters.record_latency(started.elapsed());
    if result.is_err() {
        CacheCounters::incr(&counters.errors);
    }
    TierResult {
        level: tier.level,
        kind: tier.binding.kind().clone(),
        result,
    }
}

/// Write `entry` to every tier concurrently with the definition's TTL.
pub(crate) async fn write_all(
    cache: &ResolvedCache,
    counters: &CacheCounters,
    keys: &[PhysicalKey],
    entry: &CacheEntry,
) -> Vec<TierResult> {
    let bytes = entry.encode();
    let ttl = cache.definition.expire();
    join_all(cache.tiers.iter().zip(keys).map(|(tier, key)| {
        write_entry(tier, counters.tier(tier.level), key, bytes.clone(), ttl)
    }))
    .await
}

/// Delete from every tier concurrently.
pub(crate) async fn delete_all(
    cache: &ResolvedCache,
    counters: &CacheCounters,
    keys: &[PhysicalKey],
) -> Vec<TierResult> {
    join_all(
        cache
            .tiers
            .iter()
            .zip(keys)
            .map(|(tier, key)| delete_entry(tier, counters.tier(tier.level), key)),
    )
    .await
}
