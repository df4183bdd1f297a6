//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::key::check_segment;
use crate::*;

/// Default interval between stats log lines.
pub const DEFAULT_STATS_LOG_INTERVAL_SECS: u64 = 60;

/// One cache definition as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub expire: DurationSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload: Option<DurationSpec>,
    pub level1: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level2: Option<BackendKind>,
}

impl CacheSpec {
    /// Build and validate the definition this spec describes.
    pub fn to_definition(&self) -> CacheResult<CacheDefinition> {
        let mut builder =
            CacheDefinition::builder(&self.name, self.expire.to_duration(), self.level1.clone());
        if let Some(version) = &self.version {
            builder = builder.version(version);
        }
        if let Some(reload) = self.reload {
            builder = builder.reload(reload.to_duration());
        }
        if let Some(level2) = &self.level2 {
            builder = builder.level2(level2.clone());
        }
        builder.build()
    }
}

/// Master configuration: environment, stats cadence and cache definitions.
///
/// Client handles are not part of configuration; they are registered at
/// runtime under the kinds named here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Environment id prefixed to keys on tiers that opt in (`live`, `staging`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// How often per-tier statistics are logged. Absent disables the logger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_log_interval: Option<DurationSpec>,

    /// Compose keys with the load-test prefix.
    #[serde(default)]
    pub test_traffic: bool,

    #[serde(default)]
    pub caches: Vec<CacheSpec>,
}

impl CacheSettings {
    /// Parse settings from TOML.
    pub fn from_toml_str(source: &str) -> CacheResult<Self> {
        toml::from_str(source).map_err(|e| {
            ConfigError::Parse {
                format: "toml".to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Parse settings from YAML.
    pub fn from_yaml_str(source: &str) -> CacheResult<Self> {
        serde_yaml::from_str(source).map_err(|e| {
            ConfigError::Parse {
                format: "yaml".to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Apply environment variable overrides.
    ///
    /// Environment variables:
    /// - `TIERCACHE_ENVIRONMENT`: environment id used as key prefix
    /// - `TIERCACHE_STATS_LOG_INTERVAL_SECS`: stats log interval, `0` disables
    /// - `TIERCACHE_TEST_TRAFFIC`: `true` or `1` prefixes keys for load tests
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(env) = std::env::var("TIERCACHE_ENVIRONMENT") {
            let env = env.trim();
            self.environment = if env.is_empty() {
                None
            } else {
                Some(env.to_string())
            };
        }

        if let Some(secs) = std::env::var("TIERCACHE_STATS_LOG_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            self.stats_log_interval = if secs == 0 {
                None
            } else {
                Some(DurationSpec::seconds(secs))
            };
        }

        if let Ok(flag) = std::env::var("TIERCACHE_TEST_TRAFFIC") {
            self.test_traffic = matches!(flag.trim().to_ascii_lowercase().as_str(), "true" | "1");
        }

        self
    }

    pub fn stats_log_interval(&self) -> Option<Duration> {
        self.stats_log_interval.map(DurationSpec::to_duration)
    }

    /// Validate the settings.
    /// Returns Ok(()) if valid, Err(CacheError::Config) if invalid.
    ///
    /// Validates:
    /// - environment is a usable key segment
    /// - stats_log_interval is positive
    /// - every cache spec is a valid definition
    /// - cache names are unique
    pub fn validate(&self) -> CacheResult<()> {
        if let Some(env) = &self.environment {
            check_segment("environment", env).map_err(|e| ConfigError::InvalidValue {
                field: "environment".to_string(),
                value: env.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Some(interval) = self.stats_log_interval {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "stats_log_interval".to_string(),
                    value: interval.to_string(),
                    reason: "stats_log_interval must be positive".to_string(),
                }
                .into());
            }
        }

        let mut seen = HashSet::new();
        for spec in &self.caches {
            spec.to_definition()?;
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    name: spec.name.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Validated definitions in declaration order.
    pub fn definitions(&self) -> CacheResult<Vec<CacheDefinition>> {
        self.validate()?;
        self.caches.iter().map(CacheSpec::to_definition).collect()
    }

    /// Every backend kind referenced by a definition.
    pub fn referenced_kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self
            .caches
            .iter()
            .flat_map(|spec| std::iter::once(spec.level1.clone()).chain(spec.level2.clone()))
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

// =============================================================================
// TESTS
// =============================================================================
