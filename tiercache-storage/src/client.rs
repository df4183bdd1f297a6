//! Cache client trait and backend bindings.
//!
//! Every tier (in-process map, networked store) implements [`CacheClient`].
//! The contract is deliberately narrow: get, put with a TTL, delete, all on
//! opaque byte keys and values.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tiercache_core::{BackendError, BackendKind, KeyScope};

/// Byte-oriented key-value client used as a cache tier.
///
/// # Contract
///
/// - `get` returns `Ok(None)` for absent or expired keys; "not found" is
///   never an error.
/// - `put` stores with a relative expiry; last write wins.
/// - `delete` is idempotent and succeeds for absent keys.
/// - Any call may fail with [`BackendError::Unavailable`] or
///   [`BackendError::Timeout`]; implementations own their retries and
///   deadlines.
///
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Store `value` under `key` for `ttl`.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError>;

    /// Remove `key`.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Human-readable client name for logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A client registered under a backend kind.
///
/// The manager holds a shared handle only; connection lifecycle stays with
/// whoever built the client.
#[derive(Clone)]
pub struct ClientBinding {
    kind: BackendKind,
    client: Arc<dyn CacheClient>,
    scope: KeyScope,
}

impl ClientBinding {
    pub fn new(kind: BackendKind, client: Arc<dyn CacheClient>) -> Self {
        Self {
            kind,
            client,
            scope: KeyScope::default(),
        }
    }

    /// Override which key prefixes this tier applies.
    pub fn with_scope(mut self, scope: KeyScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn kind(&self) -> &BackendKind {
        &self.kind
    }

    pub fn client(&self) -> &Arc<dyn CacheClient> {
        &self.client
    }

    pub fn scope(&self) -> KeyScope {
        self.scope
    }
}

impl fmt::Debug for ClientBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBinding")
            .field("kind", &self.kind)
            .field("client", &self.client.name())
            .field("scope", &self.scope)
            .finish()
    }
}
