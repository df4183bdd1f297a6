//! tiercache Core - Definitions, Keys and Errors
//!
//! Pure data types shared by every tiercache crate: the error taxonomy,
//! count-plus-unit durations, backend identifiers, cache definitions, the
//! physical key composer, the clock abstraction and configuration loading.
//! Nothing in this crate performs I/O against a backend.

pub mod clock;
pub mod config;
pub mod definition;
pub mod duration;
pub mod error;
pub mod key;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CacheSettings, CacheSpec, DEFAULT_STATS_LOG_INTERVAL_SECS};
pub use definition::{BackendKind, CacheDefinition, CacheDefinitionBuilder, TierLevel};
pub use duration::{DurationSpec, TimeUnit};
pub use error::{
    BackendError, CacheError, CacheResult, ConfigError, KeyError, LifecycleError, TierFailure,
};
pub use key::{
    compose, KeyComposer, KeyParts, KeyScope, PhysicalKey, RESERVED, TEST_TRAFFIC_PREFIX,
};
