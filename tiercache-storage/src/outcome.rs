//! Per-tier results of write operations.

use std::collections::HashMap;

use tiercache_core::{BackendError, BackendKind, CacheError, CacheResult, TierFailure, TierLevel};

/// Result of one tier's part in a write or eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierResult {
    pub level: TierLevel,
    pub kind: BackendKind,
    pub result: Result<(), BackendError>,
}

impl TierResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    fn failure(&self) -> Option<TierFailure> {
        self.result.as_ref().err().map(|error| TierFailure {
            level: self.level,
            kind: self.kind.clone(),
            error: error.clone(),
        })
    }
}

/// Outcome of a `put` or `evict` that reached at least one tier.
///
/// A partial failure is still `Ok`; inspect [`WriteOutcome::failures`] to
/// see which tiers missed the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub cache: String,
    pub tiers: Vec<TierResult>,
}

impl WriteOutcome {
    /// Fold per-tier results: `Ok` if any tier succeeded.
    pub fn from_tiers(cache: impl Into<String>, tiers: Vec<TierResult>) -> CacheResult<Self> {
        let outcome = Self {
            cache: cache.into(),
            tiers,
        };
        if outcome.tiers.iter().any(TierResult::is_ok) {
            Ok(outcome)
        } else {
            Err(CacheError::AllTiersFailed {
                failures: outcome.failures(),
                cache: outcome.cache,
            })
        }
    }

    /// True when every tier accepted the operation.
    pub fn is_complete(&self) -> bool {
        self.tiers.iter().all(TierResult::is_ok)
    }

    pub fn is_partial(&self) -> bool {
        !self.is_complete()
    }

    pub fn failures(&self) -> Vec<TierFailure> {
        self.tiers.iter().filter_map(TierResult::failure).collect()
    }

    pub fn tier(&self, level: TierLevel) -> Option<&TierResult> {
        self.tiers.iter().find(|t| t.level == level)
    }
}

/// Per-key results of a batch operation, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome<T> {
    pub entries: Vec<(String, CacheResult<T>)>,
}

impl<T> BatchOutcome<T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when no key failed.
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|(_, result)| result.is_ok())
    }

    /// Keys whose operation failed, with the error.
    pub fn errors(&self) -> impl Iterator<Item = (&str, &CacheError)> {
        self.entries
            .iter()
            .filter_map(|(key, result)| result.as_ref().err().map(|e| (key.as_str(), e)))
    }
}

impl BatchOutcome<Option<Vec<u8>>> {
    /// Collect the hits, dropping misses and failures.
    pub fn into_hits(self) -> HashMap<String, Vec<u8>> {
        self.entries
            .into_iter()
            .filter_map(|(key, result)| result.ok().flatten().map(|value| (key, value)))
            .collect()
    }
}
