//! Cache definition registry.
//!
//! Holds backend bindings by kind and definitions by name. A definition is
//! resolved against the bindings when it is registered, so lookups on the
//! hot path hand back the tier clients directly.

use std::collections::HashMap;
use std::sync::Arc;

use tiercache_core::{
    BackendKind, CacheDefinition, CacheError, CacheResult, ConfigError, TierLevel,
};

use crate::client::ClientBinding;

/// One tier of a resolved cache.
#[derive(Debug, Clone)]
pub struct Tier {
    pub level: TierLevel,
    pub binding: ClientBinding,
}

/// A definition together with the bindings of its tiers.
#[derive(Debug)]
pub struct ResolvedCache {
    pub definition: CacheDefinition,
    /// Tiers in lookup order: L1, then L2 if configured.
    pub tiers: Vec<Tier>,
}

impl ResolvedCache {
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn l1(&self) -> &Tier {
        &self.tiers[0]
    }

    pub fn l2(&self) -> Option<&Tier> {
        self.tiers.get(1)
    }

    /// The tier whose copy is trusted during renewal: L2 when present.
    pub fn authoritative(&self) -> &Tier {
        self.l2().unwrap_or_else(|| self.l1())
    }
}

/// Registered bindings and definitions.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    clients: HashMap<BackendKind, ClientBinding>,
    caches: HashMap<String, Arc<ResolvedCache>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a client to its backend kind.
    pub fn register_client(&mut self, binding: ClientBinding) -> CacheResult<()> {
        if self.clients.contains_key(binding.kind()) {
            return Err(ConfigError::DuplicateClient {
                kind: binding.kind().clone(),
            }
            .into());
        }
        self.clients.insert(binding.kind().clone(), binding);
        Ok(())
    }

    /// Register a definition. Every tier it names must already be bound.
    pub fn register(&mut self, definition: CacheDefinition) -> CacheResult<Arc<ResolvedCache>> {
        definition.validate()?;

        if self.caches.contains_key(definition.name()) {
            return Err(ConfigError::DuplicateName {
                name: definition.name().to_string(),
            }
            .into());
        }

        let tiers = definition
            .tiers()
            .map(|(level, kind)| {
                self.clients
                    .get(kind)
                    .map(|binding| Tier {
                        level,
                        binding: binding.clone(),
                    })
                    .ok_or_else(|| ConfigError::UnknownClient {
                        cache: definition.name().to_string(),
                        kind: kind.clone(),
                        level,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let resolved = Arc::new(ResolvedCache { definition, tiers });
        self.caches
            .insert(resolved.name().to_string(), Arc::clone(&resolved));
        Ok(resolved)
    }

    pub fn lookup(&self, name: &str) -> CacheResult<Arc<ResolvedCache>> {
        self.caches
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::unknown_cache(name))
    }

    pub fn client(&self, kind: &BackendKind) -> Option<&ClientBinding> {
        self.clients.get(kind)
    }

    /// All resolved caches, in no particular order.
    pub fn caches(&self) -> impl Iterator<Item = &Arc<ResolvedCache>> {
        self.caches.values()
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}
