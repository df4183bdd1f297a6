//! tiercache Test Utilities
//!
//! Shared test infrastructure for the tiercache workspace:
//! - Fault-injecting and recording cache clients
//! - Proptest generators for key segments and values
//! - Fixtures for the common one- and two-tier setups
//! - Assertions for tiercache-specific errors
//! - Tracing initialization for tests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

// Re-export the types most tests need
pub use tiercache_core::{
    BackendError, BackendKind, CacheDefinition, CacheError, CacheResult, CacheSettings,
    KeyScope, LifecycleError, ManualClock, SharedClock, TierLevel,
};
pub use tiercache_storage::{
    CacheClient, ClientBinding, InMemoryCacheClient, ManagerConfig, ManagerState,
    TieredCacheManager, WriteOutcome,
};

// ============================================================================
// MOCK CLIENTS
// ============================================================================

/// Failure a [`FaultyClient`] injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    Timeout,
}

impl Fault {
    fn to_error(self) -> BackendError {
        match self {
            Fault::Unavailable => BackendError::unavailable("injected fault"),
            Fault::Timeout => BackendError::Timeout {
                after: Duration::from_millis(250),
            },
        }
    }
}

/// In-memory client whose operations can be switched to fail.
#[derive(Debug)]
pub struct FaultyClient {
    inner: InMemoryCacheClient,
    get_fault: Mutex<Option<Fault>>,
    put_fault: Mutex<Option<Fault>>,
    delete_fault: Mutex<Option<Fault>>,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
}

impl FaultyClient {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: InMemoryCacheClient::with_clock(clock),
            get_fault: Mutex::new(None),
            put_fault: Mutex::new(None),
            delete_fault: Mutex::new(None),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Fail every operation.
    pub fn fail_all(&self, fault: Fault) {
        self.fail_gets(fault);
        self.fail_puts(fault);
        self.fail_deletes(fault);
    }

    pub fn fail_gets(&self, fault: Fault) {
        *self.get_fault.lock().unwrap() = Some(fault);
    }

    pub fn fail_puts(&self, fault: Fault) {
        *self.put_fault.lock().unwrap() = Some(fault);
    }

    pub fn fail_deletes(&self, fault: Fault) {
        *self.delete_fault.lock().unwrap() = Some(fault);
    }

    /// Stop injecting faults.
    pub fn heal(&self) {
        *self.get_fault.lock().unwrap() = None;
        *self.put_fault.lock().unwrap() = None;
        *self.delete_fault.lock().unwrap() = None;
    }

    /// The backing store, bypassing fault injection.
    pub fn store(&self) -> &InMemoryCacheClient {
        &self.inner
    }

    pub fn get_calls(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    fn injected(slot: &Mutex<Option<Fault>>) -> Result<(), BackendError> {
        match *slot.lock().unwrap() {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CacheClient for FaultyClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.get_fault)?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.put_fault)?;
        self.inner.put(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.delete_fault)?;
        self.inner.delete(key).await
    }

    fn name(&self) -> &str {
        "faulty"
    }
}

/// Kind of call seen by a [`RecordingClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Put,
    Delete,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub key: String,
    pub ttl: Option<Duration>,
}

/// In-memory client that records every physical key and TTL it is given.
#[derive(Debug)]
pub struct RecordingClient {
    inner: InMemoryCacheClient,
    calls: Mutex<Vec<Call>>,
}

impl RecordingClient {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: InMemoryCacheClient::with_clock(clock),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Distinct keys written, in first-write order.
    pub fn put_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for call in self.calls().into_iter().filter(|c| c.op == Op::Put) {
            if !keys.contains(&call.key) {
                keys.push(call.key);
            }
        }
        keys
    }

    /// TTL of the most recent write to `key`.
    pub fn last_ttl(&self, key: &str) -> Option<Duration> {
        self.calls()
            .into_iter()
            .rev()
            .find(|c| c.op == Op::Put && c.key == key)
            .and_then(|c| c.ttl)
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn store(&self) -> &InMemoryCacheClient {
        &self.inner
    }

    fn record(&self, op: Op, key: &str, ttl: Option<Duration>) {
        self.calls.lock().unwrap().push(Call {
            op,
            key: key.to_string(),
            ttl,
        });
    }
}

#[async_trait]
impl CacheClient for RecordingClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.record(Op::Get, key, None);
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
        self.record(Op::Put, key, Some(ttl));
        self.inner.put(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.record(Op::Delete, key, None);
        self.inner.delete(key).await
    }

    fn name(&self) -> &str {
        "recording"
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for tiercache inputs.

    use proptest::prelude::*;

    /// A valid namespace segment (cache name, version, tenant, environment).
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9.-][a-zA-Z0-9_.-]{0,11}"
    }

    /// Any non-empty logical key, including delimiter characters.
    pub fn arb_logical_key() -> impl Strategy<Value = String> {
        "[a-z0-9#@/:% _-]{1,16}"
    }

    pub fn arb_tenant() -> impl Strategy<Value = Option<String>> {
        proptest::option::of(arb_segment())
    }

    pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>(), 0..128)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built definitions and manager setups.

    use super::*;

    pub fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    /// A manual clock and its shared handle.
    pub fn manual_clock() -> (ManualClock, SharedClock) {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        (clock, shared)
    }

    /// `users`: expire 5 minutes, reload 3 minutes, local then remote.
    pub fn users_definition() -> CacheDefinition {
        CacheDefinition::builder("users", minutes(5), BackendKind::local())
            .reload(minutes(3))
            .level2(BackendKind::remote())
            .build()
            .expect("users definition is valid")
    }

    /// `users` at an explicit version.
    pub fn versioned_users_definition(version: &str) -> CacheDefinition {
        CacheDefinition::builder("users", minutes(5), BackendKind::local())
            .version(version)
            .reload(minutes(3))
            .level2(BackendKind::remote())
            .build()
            .expect("versioned users definition is valid")
    }

    /// `sessions`: local only, expire 1 minute, no reload.
    pub fn sessions_definition() -> CacheDefinition {
        CacheDefinition::builder("sessions", minutes(1), BackendKind::local())
            .build()
            .expect("sessions definition is valid")
    }

    /// A manager over two fault-injecting tiers sharing a manual clock.
    pub struct TwoTierSetup {
        pub manager: TieredCacheManager,
        pub l1: Arc<FaultyClient>,
        pub l2: Arc<FaultyClient>,
        pub clock: ManualClock,
    }

    /// Register `definitions` over `local` and `remote` faulty tiers.
    /// The manager is left in the Building state.
    pub fn two_tier(definitions: Vec<CacheDefinition>) -> TwoTierSetup {
        two_tier_with(ManagerConfig::default(), definitions)
    }

    pub fn two_tier_with(config: ManagerConfig, definitions: Vec<CacheDefinition>) -> TwoTierSetup {
        let (clock, shared) = manual_clock();
        let l1 = Arc::new(FaultyClient::new(Arc::clone(&shared)));
        let l2 = Arc::new(FaultyClient::new(Arc::clone(&shared)));

        let manager =
            TieredCacheManager::new(config.with_clock(shared)).expect("manager config is valid");
        manager
            .register_client(ClientBinding::new(BackendKind::local(), l1.clone()))
            .expect("local client registers");
        manager
            .register_client(ClientBinding::new(BackendKind::remote(), l2.clone()))
            .expect("remote client registers");
        for definition in definitions {
            manager
                .register_definition(definition)
                .expect("definition registers");
        }

        TwoTierSetup {
            manager,
            l1,
            l2,
            clock,
        }
    }

    /// [`two_tier`] with the manager initialized. Call from a Tokio runtime.
    pub fn ready_two_tier(definitions: Vec<CacheDefinition>) -> TwoTierSetup {
        let setup = two_tier(definitions);
        setup.manager.initialize().expect("manager initializes");
        setup
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for tiercache-specific results.

    use super::*;

    #[track_caller]
    pub fn assert_unknown_cache<T: std::fmt::Debug>(result: &CacheResult<T>, name: &str) {
        match result {
            Err(CacheError::UnknownCache { name: n }) => assert_eq!(n, name),
            other => panic!("Expected UnknownCache({}), got: {:?}", name, other),
        }
    }

    #[track_caller]
    pub fn assert_lifecycle<T: std::fmt::Debug>(result: &CacheResult<T>, expected: LifecycleError) {
        match result {
            Err(CacheError::Lifecycle(e)) => assert_eq!(*e, expected),
            other => panic!("Expected Lifecycle({:?}), got: {:?}", expected, other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert a write succeeded on some tiers and failed on exactly `failed`.
    #[track_caller]
    pub fn assert_partial(outcome: &WriteOutcome, failed: &[TierLevel]) {
        let levels: Vec<TierLevel> = outcome.failures().iter().map(|f| f.level).collect();
        assert!(outcome.is_partial(), "Expected partial write, got: {:?}", outcome);
        assert_eq!(levels, failed, "Wrong failed tiers");
    }

    #[track_caller]
    pub fn assert_all_tiers_failed<T: std::fmt::Debug>(result: &CacheResult<T>, cache: &str) {
        match result {
            Err(CacheError::AllTiersFailed { cache: c, failures }) => {
                assert_eq!(c, cache);
                assert!(!failures.is_empty());
            }
            other => panic!("Expected AllTiersFailed, got: {:?}", other),
        }
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-writer tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
