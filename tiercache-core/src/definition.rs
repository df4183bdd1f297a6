//! Cache definitions and backend identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::key::check_segment;
use crate::{CacheResult, ConfigError};

/// Identifier of a registered backend binding (`local`, `remote`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendKind(String);

impl BackendKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// The conventional in-process tier.
    pub fn local() -> Self {
        Self::new("local")
    }

    /// The conventional shared tier.
    pub fn remote() -> Self {
        Self::new("remote")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

/// Position of a tier in a definition's lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TierLevel {
    /// Consulted first; fast and usually in-process.
    L1,
    /// Consulted on an L1 miss; usually shared.
    L2,
}

impl fmt::Display for TierLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => f.write_str("L1"),
            Self::L2 => f.write_str("L2"),
        }
    }
}

/// Immutable configuration of one named cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDefinition {
    name: String,
    version: Option<String>,
    expire: Duration,
    reload: Option<Duration>,
    level1: BackendKind,
    level2: Option<BackendKind>,
}

impl CacheDefinition {
    /// Start a definition with its required fields.
    pub fn builder(
        name: impl Into<String>,
        expire: Duration,
        level1: BackendKind,
    ) -> CacheDefinitionBuilder {
        CacheDefinitionBuilder {
            name: name.into(),
            version: None,
            expire,
            reload: None,
            level1,
            level2: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn expire(&self) -> Duration {
        self.expire
    }

    pub fn reload(&self) -> Option<Duration> {
        self.reload
    }

    pub fn level1(&self) -> &BackendKind {
        &self.level1
    }

    pub fn level2(&self) -> Option<&BackendKind> {
        self.level2.as_ref()
    }

    /// Configured tiers in lookup order.
    pub fn tiers(&self) -> impl Iterator<Item = (TierLevel, &BackendKind)> {
        std::iter::once((TierLevel::L1, &self.level1))
            .chain(self.level2.iter().map(|kind| (TierLevel::L2, kind)))
    }

    /// Validate the fields that do not depend on registered clients.
    ///
    /// Validates:
    /// - name and version are usable key segments
    /// - expire is positive
    /// - reload, if present, is positive and shorter than expire
    /// - level2, if present, differs from level1
    pub fn validate(&self) -> CacheResult<()> {
        check_segment("cache name", &self.name).map_err(|e| ConfigError::InvalidValue {
            field: "name".to_string(),
            value: self.name.clone(),
            reason: e.to_string(),
        })?;

        if let Some(version) = &self.version {
            check_segment("version", version).map_err(|e| ConfigError::InvalidValue {
                field: format!("{}.version", self.name),
                value: version.clone(),
                reason: e.to_string(),
            })?;
        }

        if self.expire.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.expire", self.name),
                value: format!("{:?}", self.expire),
                reason: "expire must be positive".to_string(),
            }
            .into());
        }

        if let Some(reload) = self.reload {
            if reload.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.reload", self.name),
                    value: format!("{:?}", reload),
                    reason: "reload must be positive".to_string(),
                }
                .into());
            }
            if reload >= self.expire {
                return Err(ConfigError::InvalidReload {
                    cache: self.name.clone(),
                    reload,
                    expire: self.expire,
                }
                .into());
            }
        }

        if self.level2.as_ref() == Some(&self.level1) {
            return Err(ConfigError::SameTier {
                cache: self.name.clone(),
                kind: self.level1.clone(),
            }
            .into());
        }

        Ok(())
    }
}

/// Builder for [`CacheDefinition`]; `build()` validates.
#[derive(Debug, Clone)]
pub struct CacheDefinitionBuilder {
    name: String,
    version: Option<String>,
    expire: Duration,
    reload: Option<Duration>,
    level1: BackendKind,
    level2: Option<BackendKind>,
}

impl CacheDefinitionBuilder {
    /// Set the version tag. Rotating it invalidates every entry of the cache.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the reload interval.
    pub fn reload(mut self, reload: Duration) -> Self {
        self.reload = Some(reload);
        self
    }

    /// Set the secondary tier.
    pub fn level2(mut self, kind: BackendKind) -> Self {
        self.level2 = Some(kind);
        self
    }

    pub fn build(self) -> CacheResult<CacheDefinition> {
        let definition = CacheDefinition {
            name: self.name,
            version: self.version,
            expire: self.expire,
            reload: self.reload,
            level1: self.level1,
            level2: self.level2,
        };
        definition.validate()?;
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheError;

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    #[test]
    fn test_build_two_tier_definition() {
        let def = CacheDefinition::builder("users", minutes(5), BackendKind::local())
            .version("v2")
            .reload(minutes(3))
            .level2(BackendKind::remote())
            .build()
            .unwrap();

        assert_eq!(def.name(), "users");
        assert_eq!(def.version(), Some("v2"));
        assert_eq!(def.expire(), minutes(5));
        assert_eq!(def.reload(), Some(minutes(3)));
        let tiers: Vec<_> = def.tiers().map(|(level, kind)| (level, kind.clone())).collect();
        assert_eq!(
            tiers,
            vec![
                (TierLevel::L1, BackendKind::local()),
                (TierLevel::L2, BackendKind::remote())
            ]
        );
    }

    #[test]
    fn test_single_tier_has_one_tier() {
        let def = CacheDefinition::builder("sessions", minutes(1), BackendKind::local())
            .build()
            .unwrap();
        assert_eq!(def.tiers().count(), 1);
        assert!(def.level2().is_none());
    }

    #[test]
    fn test_reload_must_be_shorter_than_expire() {
        let err = CacheDefinition::builder("users", minutes(5), BackendKind::local())
            .reload(minutes(5))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Config(ConfigError::InvalidReload { .. })
        ));
    }

    #[test]
    fn test_zero_expire_rejected() {
        let err = CacheDefinition::builder("users", Duration::ZERO, BackendKind::local())
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_same_kind_on_both_levels_rejected() {
        let err = CacheDefinition::builder("users", minutes(5), BackendKind::local())
            .level2(BackendKind::local())
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::SameTier { .. })));
    }

    #[test]
    fn test_reserved_characters_in_name_rejected() {
        for name in ["", "a:b", "a/b", "a@b", "a#b", "100%"] {
            let result = CacheDefinition::builder(name, minutes(5), BackendKind::local()).build();
            assert!(result.is_err(), "name {:?} should be rejected", name);
        }
    }

    #[test]
    fn test_empty_version_rejected() {
        let result = CacheDefinition::builder("users", minutes(5), BackendKind::local())
            .version("")
            .build();
        assert!(result.is_err());
    }
}
