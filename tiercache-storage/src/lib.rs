//! tiercache Storage - Tiered Cache Manager
//!
//! The runtime half of tiercache: the byte-level client trait every tier
//! implements, an in-process tier, the definition registry, the L1/L2 read
//! path with promotion, write-through with per-tier outcomes, background
//! renewal of hot entries and per-tier statistics.

pub mod client;
pub mod envelope;
pub mod manager;
pub mod memory;
pub mod outcome;
pub mod registry;
pub mod reload;
pub mod stats;
mod tiers;

pub use client::{CacheClient, ClientBinding};
pub use envelope::{CacheEntry, EnvelopeError, ENVELOPE_FORMAT, ENVELOPE_MAGIC};
pub use manager::{ManagerConfig, ManagerState, TieredCacheManager};
pub use memory::InMemoryCacheClient;
pub use outcome::{BatchOutcome, TierResult, WriteOutcome};
pub use registry::{DefinitionRegistry, ResolvedCache, Tier};
pub use reload::{HotKey, HotKeys, KeyWriteGuard, RenewalReport, Renewer};
pub use stats::{CacheStats, StatsRegistry, TierStats};
pub use tiers::MAX_BATCH_KEYS;

// Re-export the core vocabulary so most callers need one import.
pub use tiercache_core::{
    BackendError, BackendKind, CacheDefinition, CacheError, CacheResult, CacheSettings,
    KeyScope, SharedClock, TierLevel,
};
