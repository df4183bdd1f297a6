//! Error types for tiercache operations

use crate::{BackendKind, TierLevel};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Setup-time configuration errors.
///
/// These are fatal: they surface while clients and definitions are being
/// registered and are never downgraded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cache definition already registered: {name}")]
    DuplicateName { name: String },

    #[error("Cache client already registered for kind {kind}")]
    DuplicateClient { kind: BackendKind },

    #[error("Cache {cache} references unregistered client {kind} as {level}")]
    UnknownClient {
        cache: String,
        kind: BackendKind,
        level: TierLevel,
    },

    #[error("Cache {cache} uses client {kind} for both levels")]
    SameTier { cache: String, kind: BackendKind },

    #[error("Cache {cache} reload {reload:?} must be shorter than expire {expire:?}")]
    InvalidReload {
        cache: String,
        reload: Duration,
        expire: Duration,
    },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse {format} configuration: {reason}")]
    Parse { format: String, reason: String },
}

/// Key composition errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key segment {segment} must not be empty")]
    Empty { segment: &'static str },

    #[error("Key segment {segment} starts with the reserved test-traffic prefix: {value}")]
    ReservedPrefix { segment: &'static str, value: String },

    #[error("Key segment {segment} contains reserved character {ch:?}: {value}")]
    ReservedCharacter {
        segment: &'static str,
        value: String,
        ch: char,
    },

    #[error("Malformed physical key: {key}")]
    Malformed { key: String },
}

/// Errors raised by a backend client.
///
/// The manager never retries these; retry policy belongs to the client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Backend timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Backend returned undecodable data: {reason}")]
    Codec { reason: String },
}

impl BackendError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn codec(reason: impl Into<String>) -> Self {
        Self::Codec {
            reason: reason.into(),
        }
    }

    /// Returns true for errors that may clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Manager lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Cache manager is already initialized; registration is closed")]
    AlreadyInitialized,

    #[error("Cache manager is not initialized yet")]
    NotReady,

    #[error("Cache manager is closed")]
    Closed,

    #[error("Cache manager requires a Tokio runtime: {reason}")]
    NoRuntime { reason: String },
}

/// A backend failure attributed to one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    pub level: TierLevel,
    pub kind: BackendKind,
    pub error: BackendError,
}

impl fmt::Display for TierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.level, self.kind, self.error)
    }
}

/// Master error type for all tiercache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid key: {0}")]
    Key(#[from] KeyError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Unknown cache: {name}")]
    UnknownCache { name: String },

    #[error("Backend error on {level} ({kind}): {source}")]
    Backend {
        level: TierLevel,
        kind: BackendKind,
        #[source]
        source: BackendError,
    },

    #[error("All tiers failed for cache {cache}: {}", format_failures(.failures))]
    AllTiersFailed {
        cache: String,
        failures: Vec<TierFailure>,
    },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },
}

impl CacheError {
    pub fn unknown_cache(name: impl Into<String>) -> Self {
        Self::UnknownCache { name: name.into() }
    }

    /// Wrap a tier's backend failure.
    pub fn backend(failure: TierFailure) -> Self {
        Self::Backend {
            level: failure.level,
            kind: failure.kind,
            source: failure.error,
        }
    }

    /// Returns true if this error is a transient backend condition.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend { source, .. } => source.is_transient(),
            Self::AllTiersFailed { failures, .. } => {
                failures.iter().all(|f| f.error.is_transient())
            }
            _ => false,
        }
    }
}

fn format_failures(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for tiercache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
