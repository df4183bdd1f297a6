//! Stored entry envelope.
//!
//! Every value written to a tier is framed with the timestamps the manager
//! needs for promotion and renewal:
//!
//! ```text
//! [magic: 1][format: 1][written_at millis: i64 BE][reload_at millis: i64 BE][value ...]
//! ```
//!
//! `reload_at` is `i64::MIN` when the definition has no reload interval.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tiercache_core::BackendError;

/// First byte of every envelope.
pub const ENVELOPE_MAGIC: u8 = 0xC7;

/// Current envelope format.
pub const ENVELOPE_FORMAT: u8 = 1;

const HEADER_LEN: usize = 2 + 8 + 8;
const NO_RELOAD: i64 = i64::MIN;

/// Envelope decoding failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Envelope truncated: {len} bytes, header needs 18")]
    Truncated { len: usize },

    #[error("Envelope magic mismatch: {found:#04x}")]
    BadMagic { found: u8 },

    #[error("Unsupported envelope format {found}")]
    UnsupportedFormat { found: u8 },

    #[error("Envelope timestamp out of range: {millis}")]
    BadTimestamp { millis: i64 },
}

impl From<EnvelopeError> for BackendError {
    fn from(e: EnvelopeError) -> Self {
        BackendError::codec(e.to_string())
    }
}

/// A cached value with its write and renewal timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub written_at: DateTime<Utc>,
    pub reload_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Stamp a fresh entry written at `now`.
    pub fn new(value: Vec<u8>, now: DateTime<Utc>, reload: Option<Duration>) -> Self {
        let reload_at = reload
            .and_then(|r| chrono::Duration::from_std(r).ok())
            .and_then(|r| now.checked_add_signed(r));
        Self {
            value,
            written_at: now,
            reload_at,
        }
    }

    /// Whether the entry's reload point has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.reload_at.is_some_and(|at| at <= now)
    }

    /// Lifetime left before an entry written with `expire` lapses.
    ///
    /// Returns `None` once the entry should already have expired.
    pub fn remaining(&self, expire: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let expire = chrono::Duration::from_std(expire).ok()?;
        let expires_at = self.written_at.checked_add_signed(expire)?;
        (expires_at - now).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Re-stamp the entry as written at `now`, keeping its value.
    pub fn renewed(self, now: DateTime<Utc>, reload: Option<Duration>) -> Self {
        Self::new(self.value, now, reload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let reload_millis = self
            .reload_at
            .map(|at| at.timestamp_millis())
            .unwrap_or(NO_RELOAD);

        let mut bytes = Vec::with_capacity(HEADER_LEN + self.value.len());
        bytes.push(ENVELOPE_MAGIC);
        bytes.push(ENVELOPE_FORMAT);
        bytes.extend_from_slice(&self.written_at.timestamp_millis().to_be_bytes());
        bytes.extend_from_slice(&reload_millis.to_be_bytes());
        bytes.extend_from_slice(&self.value);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < HEADER_LEN {
            return Err(EnvelopeError::Truncated { len: bytes.len() });
        }
        if bytes[0] != ENVELOPE_MAGIC {
            return Err(EnvelopeError::BadMagic { found: bytes[0] });
        }
        if bytes[1] != ENVELOPE_FORMAT {
            return Err(EnvelopeError::UnsupportedFormat { found: bytes[1] });
        }

        let written_millis = read_i64(&bytes[2..10]);
        let reload_millis = read_i64(&bytes[10..18]);

        let written_at = timestamp(written_millis)?;
        let reload_at = if reload_millis == NO_RELOAD {
            None
        } else {
            Some(timestamp(reload_millis)?)
        };

        Ok(Self {
            value: bytes[HEADER_LEN..].to_vec(),
            written_at,
            reload_at,
        })
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    i64::from_be_bytes(buf)
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, EnvelopeError> {
    DateTime::from_timestamp_millis(millis).ok_or(EnvelopeError::BadTimestamp { millis })
}
