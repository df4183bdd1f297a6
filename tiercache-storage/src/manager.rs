//! Tiered cache manager.
//!
//! Resolves cache names to definitions, composes physical keys per tier and
//! routes reads L1 then L2 with promotion, and writes through to every tier.
//!
//! # Lifecycle
//!
//! `Building → Ready → Closed`, one direction only. Clients and definitions
//! are registered while Building; [`TieredCacheManager::initialize`] freezes
//! the registry and starts the background tasks; [`TieredCacheManager::close`]
//! stops them. Backend clients are never closed by the manager.
//!
//! # Example
//!
//! ```ignore
//! let manager = TieredCacheManager::new(ManagerConfig::default().with_environment("live"))?;
//! manager.register_client(ClientBinding::new(BackendKind::local(), local))?;
//! manager.register_client(ClientBinding::new(BackendKind::remote(), remote))?;
//! manager.register_definition(
//!     CacheDefinition::builder("users", Duration::from_secs(300), BackendKind::local())
//!         .reload(Duration::from_secs(180))
//!         .level2(BackendKind::remote())
//!         .build()?,
//! )?;
//! manager.initialize()?;
//!
//! manager.put("users", "42", b"alice".to_vec(), Some("acme")).await?;
//! let value = manager.get("users", "42", Some("acme")).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tiercache_core::{
    system_clock, CacheDefinition, CacheError, CacheResult, CacheSettings, KeyComposer,
    LifecycleError, PhysicalKey, SharedClock, TierFailure, TierLevel,
    DEFAULT_STATS_LOG_INTERVAL_SECS,
};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::ClientBinding;
use crate::envelope::CacheEntry;
use crate::outcome::{BatchOutcome, TierResult, WriteOutcome};
use crate::registry::{DefinitionRegistry, ResolvedCache};
use crate::reload::{reload_task, RenewalReport, Renewer};
use crate::stats::{stats_logger_task, CacheCounters, CacheStats, StatsRegistry};
use crate::tiers::{
    compose_keys, delete_all, read_entry, write_all, write_entry, MAX_BATCH_KEYS,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Manager-wide settings that are not part of any one definition.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Environment id prefixed to keys on tiers whose scope asks for it.
    pub environment: Option<String>,
    /// Interval of the stats log line. `None` disables the logger.
    pub stats_log_interval: Option<Duration>,
    /// Time source for entry timestamps.
    pub clock: SharedClock,
    /// Compose keys with the load-test prefix on tiers that opt in.
    pub test_traffic: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            environment: None,
            stats_log_interval: None,
            clock: system_clock(),
            test_traffic: false,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for a long-running service: stats logged every minute.
    pub fn production() -> Self {
        Self {
            stats_log_interval: Some(Duration::from_secs(DEFAULT_STATS_LOG_INTERVAL_SECS)),
            ..Self::default()
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_stats_log_interval(mut self, interval: Duration) -> Self {
        self.stats_log_interval = Some(interval);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_test_traffic(mut self, test_traffic: bool) -> Self {
        self.test_traffic = test_traffic;
        self
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Lifecycle state of a [`TieredCacheManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Accepting registrations; runtime calls are rejected.
    Building,
    /// Serving; registration is closed.
    Ready,
    /// Background tasks stopped; every call is rejected.
    Closed,
}

const BUILDING: u8 = 0;
const READY: u8 = 1;
const CLOSED: u8 = 2;

impl ManagerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            BUILDING => Self::Building,
            READY => Self::Ready,
            _ => Self::Closed,
        }
    }
}

/// Everything the runtime path needs for one cache.
#[derive(Debug)]
struct CacheHandle {
    cache: Arc<ResolvedCache>,
    counters: Arc<CacheCounters>,
    renewer: Option<Arc<Renewer>>,
}

#[derive(Debug, Default)]
struct Registrations {
    registry: DefinitionRegistry,
    handles: HashMap<String, Arc<CacheHandle>>,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Multi-tier cache manager.
///
/// Safe to share across tasks behind an `Arc`. No lock is held across a
/// backend call.
pub struct TieredCacheManager {
    state: AtomicU8,
    registrations: RwLock<Registrations>,
    composer: KeyComposer,
    clock: SharedClock,
    stats: Arc<StatsRegistry>,
    stats_log_interval: Option<Duration>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for TieredCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCacheManager")
            .field("state", &self.state())
            .field("environment", &self.composer.environment())
            .field("stats_log_interval", &self.stats_log_interval)
            .finish_non_exhaustive()
    }
}

impl TieredCacheManager {
    /// Create a manager in the Building state.
    pub fn new(config: ManagerConfig) -> CacheResult<Self> {
        let composer = KeyComposer::new(config.environment)?.with_test_traffic(config.test_traffic);
        if config.stats_log_interval.is_some_and(|i| i.is_zero()) {
            return Err(tiercache_core::ConfigError::InvalidValue {
                field: "stats_log_interval".to_string(),
                value: "0s".to_string(),
                reason: "stats_log_interval must be positive".to_string(),
            }
            .into());
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            state: AtomicU8::new(BUILDING),
            registrations: RwLock::new(Registrations::default()),
            composer,
            clock: config.clock,
            stats: Arc::new(StatsRegistry::new()),
            stats_log_interval: config.stats_log_interval,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Build, register and initialize a manager from settings in one call.
    ///
    /// `bindings` must cover every kind the settings reference.
    pub fn from_config(
        settings: &CacheSettings,
        bindings: impl IntoIterator<Item = ClientBinding>,
        clock: SharedClock,
    ) -> CacheResult<Self> {
        let definitions = settings.definitions()?;
        let manager = Self::new(ManagerConfig {
            environment: settings.environment.clone(),
            stats_log_interval: settings.stats_log_interval(),
            clock,
            test_traffic: settings.test_traffic,
        })?;

        for binding in bindings {
            manager.register_client(binding)?;
        }
        for definition in definitions {
            manager.register_definition(definition)?;
        }
        manager.initialize()?;
        Ok(manager)
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn environment(&self) -> Option<&str> {
        self.composer.environment()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Bind a client to its backend kind. Only allowed while Building.
    pub fn register_client(&self, binding: ClientBinding) -> CacheResult<()> {
        let mut regs = self.write_registrations();
        self.ensure_building()?;
        let kind = binding.kind().clone();
        let client = binding.client().name().to_string();
        regs.registry.register_client(binding)?;
        tracing::debug!(kind = %kind, client = %client, "Cache client registered");
        Ok(())
    }

    /// Register a cache definition. Only allowed while Building, and only
    /// after the clients it references are registered.
    pub fn register_definition(&self, definition: CacheDefinition) -> CacheResult<()> {
        let mut regs = self.write_registrations();
        self.ensure_building()?;

        let cache = regs.registry.register(definition)?;
        let counters = self.stats.track(&cache);
        let renewer = cache.definition.reload().map(|_| {
            Arc::new(Renewer::new(
                Arc::clone(&cache),
                self.composer.clone(),
                Arc::clone(&self.clock),
                Arc::clone(&counters),
            ))
        });

        tracing::debug!(
            cache = %cache.name(),
            tiers = cache.tiers.len(),
            reload = ?cache.definition.reload(),
            "Cache definition registered"
        );

        regs.handles.insert(
            cache.name().to_string(),
            Arc::new(CacheHandle {
                cache,
                counters,
                renewer,
            }),
        );
        Ok(())
    }

    /// Freeze the registry and start background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn initialize(&self) -> CacheResult<()> {
        let runtime = Handle::try_current().map_err(|e| LifecycleError::NoRuntime {
            reason: e.to_string(),
        })?;

        let regs = self.read_registrations();
        if let Err(current) =
            self.state
                .compare_exchange(BUILDING, READY, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(match ManagerState::from_u8(current) {
                ManagerState::Closed => LifecycleError::Closed,
                _ => LifecycleError::AlreadyInitialized,
            }
            .into());
        }

        let mut spawned = Vec::new();
        for handle in regs.handles.values() {
            let Some(renewer) = &handle.renewer else {
                continue;
            };
            let Some(period) = renewer.period() else {
                continue;
            };
            spawned.push(runtime.spawn(reload_task(
                Arc::clone(renewer),
                period,
                self.shutdown_tx.subscribe(),
            )));
        }
        if let Some(interval) = self.stats_log_interval {
            spawned.push(runtime.spawn(stats_logger_task(
                Arc::clone(&self.stats),
                interval,
                self.shutdown_tx.subscribe(),
            )));
        }

        tracing::info!(
            caches = regs.handles.len(),
            background_tasks = spawned.len(),
            environment = ?self.composer.environment(),
            "Tiered cache manager initialized"
        );

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(spawned);
        Ok(())
    }

    /// Stop background tasks and reject further calls. Idempotent.
    pub async fn close(&self) {
        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        if previous == CLOSED {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Cache background task failed");
                }
            }
        }

        tracing::info!("Tiered cache manager closed");
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Read `key` from cache `name`.
    ///
    /// L1 is consulted first; on a miss L2 is consulted and a hit there is
    /// copied into L1 for the entry's remaining lifetime. A failing L1
    /// degrades to L2 when one is configured.
    pub async fn get(
        &self,
        name: &str,
        key: &str,
        tenant: Option<&str>,
    ) -> CacheResult<Option<Vec<u8>>> {
        let handle = self.ready_handle(name)?;
        self.get_with(&handle, key, tenant).await
    }

    async fn get_with(
        &self,
        handle: &CacheHandle,
        key: &str,
        tenant: Option<&str>,
    ) -> CacheResult<Option<Vec<u8>>> {
        let keys = compose_keys(&handle.cache, &self.composer, key, tenant)?;
        let counters = &handle.counters;
        CacheCounters::incr(&counters.reads);

        let l1 = handle.cache.l1();
        let mut l1_failed = false;
        match read_entry(l1, counters.tier(TierLevel::L1), &keys[0]).await {
            Ok(Some(entry)) => {
                if self.lifetime_left(handle, &entry).is_some() {
                    return Ok(Some(self.deliver(handle, entry, key, tenant)));
                }
                tracing::trace!(cache = %handle.cache.name(), "L1 entry past expire, treated as miss");
            }
            Ok(None) => {}
            Err(error) => {
                let failure = TierFailure {
                    level: TierLevel::L1,
                    kind: l1.binding.kind().clone(),
                    error,
                };
                if handle.cache.l2().is_none() {
                    tracing::warn!(
                        cache = %handle.cache.name(),
                        tier = %failure.level,
                        kind = %failure.kind,
                        error = %failure.error,
                        "Cache read failed"
                    );
                    return Err(CacheError::backend(failure));
                }
                CacheCounters::incr(&counters.fallthroughs);
                tracing::warn!(
                    cache = %handle.cache.name(),
                    tier = %failure.level,
                    kind = %failure.kind,
                    error = %failure.error,
                    "L1 read failed, falling through to L2"
                );
                l1_failed = true;
            }
        }

        let Some(l2) = handle.cache.l2() else {
            return Ok(None);
        };
        let entry = match read_entry(l2, counters.tier(TierLevel::L2), &keys[1]).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(error) => {
                let failure = TierFailure {
                    level: TierLevel::L2,
                    kind: l2.binding.kind().clone(),
                    error,
                };
                tracing::warn!(
                    cache = %handle.cache.name(),
                    tier = %failure.level,
                    kind = %failure.kind,
                    error = %failure.error,
                    "Cache read failed"
                );
                return Err(CacheError::backend(failure));
            }
        };

        let Some(remaining) = self.lifetime_left(handle, &entry) else {
            tracing::debug!(cache = %handle.cache.name(), "L2 entry past expire, treated as miss");
            return Ok(None);
        };
        if !l1_failed {
            self.promote(handle, &keys[0], &entry, remaining).await;
        }
        Ok(Some(self.deliver(handle, entry, key, tenant)))
    }

    /// Lifetime left on `entry` by its own timestamps, independent of the
    /// tier's TTL bookkeeping.
    fn lifetime_left(&self, handle: &CacheHandle, entry: &CacheEntry) -> Option<Duration> {
        entry.remaining(handle.cache.definition.expire(), self.clock.now())
    }

    /// Copy an L2 hit into L1 for the rest of its lifetime. Failures are
    /// logged and swallowed.
    async fn promote(
        &self,
        handle: &CacheHandle,
        l1_key: &PhysicalKey,
        entry: &CacheEntry,
        remaining: Duration,
    ) {
        let l1 = handle.cache.l1();
        let result = write_entry(
            l1,
            handle.counters.tier(TierLevel::L1),
            l1_key,
            entry.encode(),
            remaining,
        )
        .await;

        match result.result {
            Ok(()) => {
                CacheCounters::incr(&handle.counters.promotions);
                tracing::debug!(
                    cache = %handle.cache.name(),
                    ttl_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                    "Promoted L2 hit into L1"
                );
            }
            Err(error) => {
                tracing::warn!(
                    cache = %handle.cache.name(),
                    tier = %TierLevel::L1,
                    kind = %l1.binding.kind(),
                    error = %error,
                    "Promotion into L1 failed"
                );
            }
        }
    }

    fn deliver(
        &self,
        handle: &CacheHandle,
        entry: CacheEntry,
        key: &str,
        tenant: Option<&str>,
    ) -> Vec<u8> {
        CacheCounters::incr(&handle.counters.read_hits);
        if let Some(renewer) = &handle.renewer {
            if entry.is_due(self.clock.now()) {
                renewer.mark_hot(tenant, key);
            }
        }
        entry.value
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Write `value` to every tier of cache `name` with the definition's TTL.
    ///
    /// Succeeds when at least one tier accepted the write; the outcome
    /// reports which tiers did.
    pub async fn put(
        &self,
        name: &str,
        key: &str,
        value: Vec<u8>,
        tenant: Option<&str>,
    ) -> CacheResult<WriteOutcome> {
        let handle = self.ready_handle(name)?;
        self.put_with(&handle, key, value, tenant).await
    }

    async fn put_with(
        &self,
        handle: &CacheHandle,
        key: &str,
        value: Vec<u8>,
        tenant: Option<&str>,
    ) -> CacheResult<WriteOutcome> {
        let keys = compose_keys(&handle.cache, &self.composer, key, tenant)?;
        let entry = CacheEntry::new(value, self.clock.now(), handle.cache.definition.reload());
        let _guard = handle.renewer.as_ref().map(|r| r.write_guard(tenant, key));
        let results = write_all(&handle.cache, &handle.counters, &keys, &entry).await;
        self.aggregate(handle, "put", results)
    }

    /// Remove `key` from every tier of cache `name`. Idempotent.
    pub async fn evict(
        &self,
        name: &str,
        key: &str,
        tenant: Option<&str>,
    ) -> CacheResult<WriteOutcome> {
        let handle = self.ready_handle(name)?;
        self.evict_with(&handle, key, tenant).await
    }

    async fn evict_with(
        &self,
        handle: &CacheHandle,
        key: &str,
        tenant: Option<&str>,
    ) -> CacheResult<WriteOutcome> {
        let keys = compose_keys(&handle.cache, &self.composer, key, tenant)?;
        let _guard = handle.renewer.as_ref().map(|r| r.write_guard(tenant, key));
        let results = delete_all(&handle.cache, &handle.counters, &keys).await;
        self.aggregate(handle, "evict", results)
    }

    fn aggregate(
        &self,
        handle: &CacheHandle,
        operation: &'static str,
        results: Vec<TierResult>,
    ) -> CacheResult<WriteOutcome> {
        match WriteOutcome::from_tiers(handle.cache.name(), results) {
            Ok(outcome) => {
                if outcome.is_partial() {
                    CacheCounters::incr(&handle.counters.partial_writes);
                    for failure in outcome.failures() {
                        tracing::warn!(
                            cache = %handle.cache.name(),
                            operation,
                            tier = %failure.level,
                            kind = %failure.kind,
                            error = %failure.error,
                            "Cache write missed a tier"
                        );
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(
                    cache = %handle.cache.name(),
                    operation,
                    error = %e,
                    "Cache write failed on every tier"
                );
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Batch and typed helpers
    // ------------------------------------------------------------------

    /// Read many keys; each chunk of keys is read concurrently.
    pub async fn get_many<K: AsRef<str>>(
        &self,
        name: &str,
        keys: &[K],
        tenant: Option<&str>,
    ) -> CacheResult<BatchOutcome<Option<Vec<u8>>>> {
        let handle = self.ready_handle(name)?;
        let mut entries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_BATCH_KEYS) {
            let results = join_all(
                chunk
                    .iter()
                    .map(|key| self.get_with(&handle, key.as_ref(), tenant)),
            )
            .await;
            entries.extend(
                chunk
                    .iter()
                    .map(|key| key.as_ref().to_string())
                    .zip(results),
            );
        }
        Ok(BatchOutcome { entries })
    }

    /// Write many entries; each chunk is written concurrently.
    pub async fn put_many(
        &self,
        name: &str,
        entries: Vec<(String, Vec<u8>)>,
        tenant: Option<&str>,
    ) -> CacheResult<BatchOutcome<WriteOutcome>> {
        let handle = self.ready_handle(name)?;
        let mut outcomes = Vec::with_capacity(entries.len());
        let mut pending = entries.into_iter().peekable();
        while pending.peek().is_some() {
            let chunk: Vec<(String, Vec<u8>)> = pending.by_ref().take(MAX_BATCH_KEYS).collect();
            let results = join_all(
                chunk
                    .iter()
                    .map(|(key, value)| self.put_with(&handle, key, value.clone(), tenant)),
            )
            .await;
            outcomes.extend(chunk.into_iter().map(|(key, _)| key).zip(results));
        }
        Ok(BatchOutcome { entries: outcomes })
    }

    /// Evict many keys; each chunk is evicted concurrently.
    pub async fn evict_many<K: AsRef<str>>(
        &self,
        name: &str,
        keys: &[K],
        tenant: Option<&str>,
    ) -> CacheResult<BatchOutcome<WriteOutcome>> {
        let handle = self.ready_handle(name)?;
        let mut entries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_BATCH_KEYS) {
            let results = join_all(
                chunk
                    .iter()
                    .map(|key| self.evict_with(&handle, key.as_ref(), tenant)),
            )
            .await;
            entries.extend(
                chunk
                    .iter()
                    .map(|key| key.as_ref().to_string())
                    .zip(results),
            );
        }
        Ok(BatchOutcome { entries })
    }

    /// Read and deserialize a JSON value.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        name: &str,
        key: &str,
        tenant: Option<&str>,
    ) -> CacheResult<Option<T>> {
        match self.get(name, key, tenant).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CacheError::Serialization {
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Serialize a value as JSON and write it.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        name: &str,
        key: &str,
        value: &T,
        tenant: Option<&str>,
    ) -> CacheResult<WriteOutcome> {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        self.put(name, key, bytes, tenant).await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Run one renewal cycle for cache `name` now instead of waiting for
    /// its next tick. Caches without a reload interval report nothing.
    pub async fn renew_now(&self, name: &str) -> CacheResult<RenewalReport> {
        let handle = self.ready_handle(name)?;
        match &handle.renewer {
            Some(renewer) => Ok(renewer.run_once().await),
            None => Ok(RenewalReport::default()),
        }
    }

    /// The registered definition of cache `name`.
    pub fn definition(&self, name: &str) -> CacheResult<CacheDefinition> {
        self.read_registrations()
            .registry
            .lookup(name)
            .map(|cache| cache.definition.clone())
    }

    /// Names of every registered cache, sorted.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_registrations().handles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cumulative statistics of every cache.
    pub fn stats(&self) -> Vec<CacheStats> {
        self.stats.snapshot()
    }

    /// Cumulative statistics of cache `name`.
    pub fn cache_stats(&self, name: &str) -> CacheResult<CacheStats> {
        self.stats
            .counters(name)
            .map(|counters| counters.snapshot(name))
            .ok_or_else(|| CacheError::unknown_cache(name))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_building(&self) -> CacheResult<()> {
        match self.state() {
            ManagerState::Building => Ok(()),
            ManagerState::Ready => Err(LifecycleError::AlreadyInitialized.into()),
            ManagerState::Closed => Err(LifecycleError::Closed.into()),
        }
    }

    fn ensure_ready(&self) -> CacheResult<()> {
        match self.state() {
            ManagerState::Ready => Ok(()),
            ManagerState::Building => Err(LifecycleError::NotReady.into()),
            ManagerState::Closed => Err(LifecycleError::Closed.into()),
        }
    }

    fn ready_handle(&self, name: &str) -> CacheResult<Arc<CacheHandle>> {
        self.ensure_ready()?;
        self.read_registrations()
            .handles
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::unknown_cache(name))
    }

    fn read_registrations(&self) -> std::sync::RwLockReadGuard<'_, Registrations> {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn write_registrations(&self) -> std::sync::RwLockWriteGuard<'_, Registrations> {
        self.registrations
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TieredCacheManager {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CacheClient;
    use crate::memory::InMemoryCacheClient;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tiercache_core::{BackendError, BackendKind, ConfigError, ManualClock};
    use tokio::sync::Notify;

    /// Client whose every call fails while `down` is set.
    #[derive(Debug, Default)]
    struct Switchable {
        inner: InMemoryCacheClient,
        down: AtomicBool,
    }

    impl Switchable {
        fn check(&self) -> Result<(), BackendError> {
            if self.down.load(Ordering::SeqCst) {
                Err(BackendError::unavailable("switched off"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheClient for Switchable {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            self.check()?;
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
            self.check()?;
            self.inner.put(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), BackendError> {
            self.check()?;
            self.inner.delete(key).await
        }
    }

    struct Fixture {
        manager: TieredCacheManager,
        l1: Arc<Switchable>,
        l2: Arc<Switchable>,
        clock: ManualClock,
    }

    fn users(level2: bool) -> CacheDefinition {
        let builder =
            CacheDefinition::builder("users", Duration::from_secs(300), BackendKind::local())
                .reload(Duration::from_secs(180));
        let builder = if level2 {
            builder.level2(BackendKind::remote())
        } else {
            builder
        };
        builder.build().unwrap()
    }

    fn fixture(level2: bool) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let l1 = Arc::new(Switchable {
            inner: InMemoryCacheClient::with_clock(Arc::clone(&shared)),
            down: AtomicBool::new(false),
        });
        let l2 = Arc::new(Switchable {
            inner: InMemoryCacheClient::with_clock(Arc::clone(&shared)),
            down: AtomicBool::new(false),
        });

        let manager = TieredCacheManager::new(ManagerConfig::default().with_clock(shared)).unwrap();
        manager
            .register_client(ClientBinding::new(BackendKind::local(), l1.clone()))
            .unwrap();
        manager
            .register_client(ClientBinding::new(BackendKind::remote(), l2.clone()))
            .unwrap();
        manager.register_definition(users(level2)).unwrap();
        Fixture {
            manager,
            l1,
            l2,
            clock,
        }
    }

    async fn ready(level2: bool) -> Fixture {
        let f = fixture(level2);
        f.manager.initialize().unwrap();
        f
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let f = ready(true).await;
        let outcome = f.manager.put("users", "42", b"alice".to_vec(), None).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.tiers.len(), 2);
        assert_eq!(
            f.manager.get("users", "42", None).await.unwrap(),
            Some(b"alice".to_vec())
        );
    }

    #[tokio::test]
    async fn test_l1_hit_does_not_touch_l2() {
        let f = ready(true).await;
        f.manager.put("users", "42", b"alice".to_vec(), None).await.unwrap();
        f.l2.down.store(true, Ordering::SeqCst);
        assert_eq!(
            f.manager.get("users", "42", None).await.unwrap(),
            Some(b"alice".to_vec())
        );
        let stats = f.manager.cache_stats("users").unwrap();
        assert_eq!(stats.tier(TierLevel::L2).unwrap().gets, 0);
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_with_remaining_lifetime() {
        let f = ready(true).await;
        f.manager.put("users", "42", b"alice".to_vec(), None).await.unwrap();
        f.l1.inner.clear();

        f.clock.advance(Duration::from_secs(100));
        assert_eq!(
            f.manager.get("users", "42", None).await.unwrap(),
            Some(b"alice".to_vec())
        );
        assert_eq!(f.l1.inner.ttl_of("users:42"), Some(Duration::from_secs(200)));
        assert_eq!(f.manager.cache_stats("users").unwrap().promotions, 1);
    }

    #[tokio::test]
    async fn test_l1_failure_falls_through_to_l2() {
        let f = ready(true).await;
        f.manager.put("users", "42", b"alice".to_vec(), None).await.unwrap();
        f.l1.down.store(true, Ordering::SeqCst);

        assert_eq!(
            f.manager.get("users", "42", None).await.unwrap(),
            Some(b"alice".to_vec())
        );
        let stats = f.manager.cache_stats("users").unwrap();
        assert_eq!(stats.fallthroughs, 1);
        assert_eq!(stats.promotions, 0);
    }

    #[tokio::test]
    async fn test_l1_failure_without_l2_is_error() {
        let f = ready(false).await;
        f.l1.down.store(true, Ordering::SeqCst);
        let err = f.manager.get("users", "42", None).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Backend {
                level: TierLevel::L1,
                ..
            }
        ));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_l2_failure_on_l1_miss_is_error() {
        let f = ready(true).await;
        f.l2.down.store(true, Ordering::SeqCst);
        let err = f.manager.get("users", "42", None).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Backend {
                level: TierLevel::L2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_partial_write_reports_failed_tier() {
        let f = ready(true).await;
        f.l2.down.store(true, Ordering::SeqCst);
        let outcome = f.manager.put("users", "42", b"alice".to_vec(), None).await.unwrap();
        assert!(outcome.is_partial());
        assert_eq!(outcome.failures()[0].level, TierLevel::L2);
        assert_eq!(f.manager.cache_stats("users").unwrap().partial_writes, 1);
    }

    #[tokio::test]
    async fn test_write_failing_everywhere_is_error() {
        let f = ready(true).await;
        f.l1.down.store(true, Ordering::SeqCst);
        f.l2.down.store(true, Ordering::SeqCst);
        let err = f.manager.put("users", "42", b"alice".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, CacheError::AllTiersFailed { .. }));
    }

    #[tokio::test]
    async fn test_evict_removes_from_all_tiers() {
        let f = ready(true).await;
        f.manager.put("users", "42", b"alice".to_vec(), None).await.unwrap();
        f.manager.evict("users", "42", None).await.unwrap();
        assert!(f.manager.get("users", "42", None).await.unwrap().is_none());
        assert!(f.l2.inner.is_empty());

        // again, on an absent key
        assert!(f.manager.evict("users", "42", None).await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_unknown_cache() {
        let f = ready(true).await;
        let err = f.manager.get("orders", "1", None).await.unwrap_err();
        assert_eq!(err, CacheError::unknown_cache("orders"));
        assert!(f.manager.put("orders", "1", vec![], None).await.is_err());
        assert!(f.manager.evict("orders", "1", None).await.is_err());
        assert!(f.l1.inner.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_before_io() {
        let f = ready(true).await;
        let err = f.manager.put("users", "", b"x".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, CacheError::Key(_)));
        let err = f.manager.get("users", "42", Some("a@b")).await.unwrap_err();
        assert!(matches!(err, CacheError::Key(_)));
        assert!(f.l1.inner.is_empty());
    }

    #[tokio::test]
    async fn test_calls_before_initialize_are_rejected() {
        let f = fixture(true);
        let err = f.manager.get("users", "42", None).await.unwrap_err();
        assert_eq!(err, CacheError::Lifecycle(LifecycleError::NotReady));
    }

    #[tokio::test]
    async fn test_registration_after_initialize_is_rejected() {
        let f = ready(true).await;
        let err = f
            .manager
            .register_client(ClientBinding::new(
                BackendKind::new("other"),
                Arc::new(InMemoryCacheClient::new()),
            ))
            .unwrap_err();
        assert_eq!(err, CacheError::Lifecycle(LifecycleError::AlreadyInitialized));
        assert!(f.manager.initialize().is_err());
    }

    #[tokio::test]
    async fn test_close_rejects_calls_and_is_idempotent() {
        let f = ready(true).await;
        f.manager.close().await;
        f.manager.close().await;
        assert_eq!(f.manager.state(), ManagerState::Closed);
        let err = f.manager.get("users", "42", None).await.unwrap_err();
        assert_eq!(err, CacheError::Lifecycle(LifecycleError::Closed));
    }

    #[test]
    fn test_initialize_without_runtime_fails() {
        let f = fixture(true);
        let err = f.manager.initialize().unwrap_err();
        assert!(matches!(
            err,
            CacheError::Lifecycle(LifecycleError::NoRuntime { .. })
        ));
        assert_eq!(f.manager.state(), ManagerState::Building);
    }

    #[test]
    fn test_duplicate_definition_rejected() {
        let f = fixture(true);
        let err = f.manager.register_definition(users(true)).unwrap_err();
        assert!(matches!(
            err,
            CacheError::Config(ConfigError::DuplicateName { .. })
        ));
    }

    #[tokio::test]
    async fn test_due_hit_is_renewed_on_demand() {
        let f = ready(true).await;
        f.manager.put("users", "42", b"alice".to_vec(), None).await.unwrap();

        f.clock.advance(Duration::from_secs(200));
        f.manager.get("users", "42", None).await.unwrap();
        let report = f.manager.renew_now("users").await.unwrap();
        assert_eq!(report.renewed, 1);

        f.clock.advance(Duration::from_secs(200));
        assert_eq!(
            f.manager.get("users", "42", None).await.unwrap(),
            Some(b"alice".to_vec())
        );
    }

    /// Client that can park one `get` (after reading) or one `put` (before
    /// writing) until released.
    #[derive(Debug, Default)]
    struct Gated {
        inner: InMemoryCacheClient,
        hold_get: AtomicBool,
        hold_put: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl Gated {
        fn new(clock: SharedClock) -> Self {
            Self {
                inner: InMemoryCacheClient::with_clock(clock),
                ..Self::default()
            }
        }

        async fn pass(&self, hold: &AtomicBool) {
            if hold.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }
    }

    #[async_trait]
    impl CacheClient for Gated {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            let value = self.inner.get(key).await;
            self.pass(&self.hold_get).await;
            value
        }

        async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
            self.pass(&self.hold_put).await;
            self.inner.put(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), BackendError> {
            self.inner.delete(key).await
        }
    }

    /// A ready manager over gated tiers with `users:42` hot and due.
    async fn gated_with_hot_key() -> (TieredCacheManager, Arc<Gated>, Arc<Gated>, ManualClock) {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let l1 = Arc::new(Gated::new(Arc::clone(&shared)));
        let l2 = Arc::new(Gated::new(Arc::clone(&shared)));

        let manager = TieredCacheManager::new(ManagerConfig::default().with_clock(shared)).unwrap();
        manager
            .register_client(ClientBinding::new(BackendKind::local(), l1.clone()))
            .unwrap();
        manager
            .register_client(ClientBinding::new(BackendKind::remote(), l2.clone()))
            .unwrap();
        manager.register_definition(users(true)).unwrap();
        manager.initialize().unwrap();

        manager.put("users", "42", b"old".to_vec(), None).await.unwrap();
        clock.advance(Duration::from_secs(200));
        assert!(manager.get("users", "42", None).await.unwrap().is_some());
        (manager, l1, l2, clock)
    }

    #[tokio::test]
    async fn test_evict_during_renewal_read_stays_evicted() {
        let (manager, _l1, l2, _clock) = gated_with_hot_key().await;

        l2.hold_get.store(true, Ordering::SeqCst);
        let renewal = manager.renew_now("users");
        let eviction = async {
            l2.entered.notified().await;
            let outcome = manager.evict("users", "42", None).await.unwrap();
            l2.release.notify_one();
            outcome
        };
        let (report, outcome) = tokio::join!(renewal, eviction);

        assert!(outcome.is_complete());
        let report = report.unwrap();
        assert_eq!(report.renewed, 0);
        assert_eq!(report.dropped, 1);
        assert_eq!(manager.get("users", "42", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_evict_during_renewal_write_stays_evicted() {
        let (manager, l1, _l2, _clock) = gated_with_hot_key().await;

        l1.hold_put.store(true, Ordering::SeqCst);
        let renewal = manager.renew_now("users");
        let eviction = async {
            l1.entered.notified().await;
            let outcome = manager.evict("users", "42", None).await.unwrap();
            l1.release.notify_one();
            outcome
        };
        let (report, outcome) = tokio::join!(renewal, eviction);

        assert!(outcome.is_complete());
        assert_eq!(report.unwrap().skipped, 1);
        assert!(l1.inner.is_empty());
        assert_eq!(manager.get("users", "42", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_during_renewal_is_not_overwritten() {
        let (manager, _l1, l2, _clock) = gated_with_hot_key().await;

        l2.hold_get.store(true, Ordering::SeqCst);
        let renewal = manager.renew_now("users");
        let overwrite = async {
            l2.entered.notified().await;
            let outcome = manager.put("users", "42", b"new".to_vec(), None).await.unwrap();
            l2.release.notify_one();
            outcome
        };
        let (report, outcome) = tokio::join!(renewal, overwrite);

        assert!(outcome.is_complete());
        assert_eq!(report.unwrap().renewed, 0);
        assert_eq!(
            manager.get("users", "42", None).await.unwrap(),
            Some(b"new".to_vec())
        );
    }

    #[tokio::test]
    async fn test_l2_entry_past_expire_is_a_miss() {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let l1 = Arc::new(InMemoryCacheClient::with_clock(Arc::clone(&shared)));
        // Keeps wall-clock time, so it still holds the entry below.
        let l2 = Arc::new(InMemoryCacheClient::new());

        let manager = TieredCacheManager::new(ManagerConfig::default().with_clock(shared)).unwrap();
        manager
            .register_client(ClientBinding::new(BackendKind::local(), l1.clone()))
            .unwrap();
        manager
            .register_client(ClientBinding::new(BackendKind::remote(), l2.clone()))
            .unwrap();
        manager.register_definition(users(true)).unwrap();
        manager.initialize().unwrap();

        manager.put("users", "42", b"v".to_vec(), None).await.unwrap();
        clock.advance(Duration::from_secs(400));
        assert_eq!(l2.len(), 1);

        assert_eq!(manager.get("users", "42", None).await.unwrap(), None);
        let stats = manager.cache_stats("users").unwrap();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.read_hits, 0);
        assert_eq!(stats.promotions, 0);
        assert!(l1.is_empty());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_rejected_client_is_not_logged_as_registered() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(captured.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let manager = TieredCacheManager::new(ManagerConfig::default()).unwrap();
            manager
                .register_client(ClientBinding::new(
                    BackendKind::local(),
                    Arc::new(InMemoryCacheClient::new()),
                ))
                .unwrap();
            let err = manager
                .register_client(ClientBinding::new(
                    BackendKind::local(),
                    Arc::new(InMemoryCacheClient::new()),
                ))
                .unwrap_err();
            assert!(matches!(
                err,
                CacheError::Config(ConfigError::DuplicateClient { .. })
            ));
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output.matches("Cache client registered").count(), 1);
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let f = ready(true).await;
        let entries: Vec<(String, Vec<u8>)> = (0..300)
            .map(|i| (i.to_string(), i.to_string().into_bytes()))
            .collect();
        let written = f.manager.put_many("users", entries, None).await.unwrap();
        assert_eq!(written.len(), 300);
        assert!(written.is_complete());

        let keys: Vec<String> = (0..300).map(|i| i.to_string()).collect();
        let read = f.manager.get_many("users", &keys, None).await.unwrap();
        assert_eq!(read.entries[299].0, "299");
        assert_eq!(read.into_hits().len(), 300);

        f.manager.evict_many("users", &["0", "1"], None).await.unwrap();
        assert!(f.manager.get("users", "0", None).await.unwrap().is_none());
        assert!(f.manager.get("users", "2", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct User {
            id: u64,
            name: String,
        }

        let f = ready(true).await;
        let user = User {
            id: 42,
            name: "alice".to_string(),
        };
        f.manager.put_json("users", "42", &user, Some("acme")).await.unwrap();
        let back: Option<User> = f.manager.get_json("users", "42", Some("acme")).await.unwrap();
        assert_eq!(back, Some(user));

        f.manager.put("users", "bad", b"{".to_vec(), None).await.unwrap();
        let err = f.manager.get_json::<User>("users", "bad", None).await.unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }

    #[tokio::test]
    async fn test_environment_prefix_applies_per_scope() {
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        let local = Arc::new(InMemoryCacheClient::with_clock(Arc::clone(&clock)));
        let remote = Arc::new(InMemoryCacheClient::with_clock(Arc::clone(&clock)));

        let manager = TieredCacheManager::new(
            ManagerConfig::default()
                .with_environment("live")
                .with_clock(clock),
        )
        .unwrap();
        manager
            .register_client(
                ClientBinding::new(BackendKind::local(), local.clone())
                    .with_scope(tiercache_core::KeyScope::tenant_only()),
            )
            .unwrap();
        manager
            .register_client(ClientBinding::new(BackendKind::remote(), remote.clone()))
            .unwrap();
        manager.register_definition(users(true)).unwrap();
        manager.initialize().unwrap();

        manager.put("users", "42", b"alice".to_vec(), Some("acme")).await.unwrap();
        assert!(local.get("acme@users:42").await.unwrap().is_some());
        assert!(remote.get("live#acme@users:42").await.unwrap().is_some());
    }

    #[test]
    fn test_zero_stats_interval_rejected() {
        let result = TieredCacheManager::new(
            ManagerConfig::default().with_stats_log_interval(Duration::ZERO),
        );
        assert!(result.is_err());
    }
}
