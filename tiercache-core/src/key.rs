//! Physical key composition.
//!
//! A physical key is what a backend sees. It is derived from the cache
//! name, the definition's version tag, the caller's logical key and the
//! optional tenant and environment prefixes:
//!
//! ```text
//! [env '#'] [tenant '@'] name ['/' version] ':' escaped(logical_key)
//! live#acme@users/v2:42
//! ```
//!
//! Each delimiter is reserved: name, version, tenant and environment must
//! not contain any of them, and reserved characters inside the logical key
//! are percent-escaped. The format is therefore injective over all
//! (env, tenant, name, version, key) tuples, and rotating the version
//! leaves every older key unreachable.
//!
//! A composer serving load-test traffic puts [`TEST_TRAFFIC_PREFIX`] in
//! front of the whole key on tiers that opt in, keeping synthetic entries
//! apart from real ones. No segment may start with that prefix.

use std::fmt;

use crate::{CacheDefinition, KeyError};

/// Terminates the environment segment.
const ENV_DELIMITER: char = '#';
/// Terminates the tenant segment.
const TENANT_DELIMITER: char = '@';
/// Separates the cache name from the version.
const VERSION_DELIMITER: char = '/';
/// Separates the namespace from the logical key.
const KEY_DELIMITER: char = ':';
const ESCAPE: char = '%';

/// Leads every key composed for load-test traffic.
pub const TEST_TRAFFIC_PREFIX: &str = "__test_";

/// Characters that may not appear in a namespace segment.
pub const RESERVED: [char; 5] = [
    ENV_DELIMITER,
    TENANT_DELIMITER,
    VERSION_DELIMITER,
    KEY_DELIMITER,
    ESCAPE,
];

/// Check that a namespace segment is non-empty and free of reserved characters.
pub fn check_segment(segment: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty { segment });
    }
    if let Some(ch) = value.chars().find(|c| RESERVED.contains(c)) {
        return Err(KeyError::ReservedCharacter {
            segment,
            value: value.to_string(),
            ch,
        });
    }
    if value.starts_with(TEST_TRAFFIC_PREFIX) {
        return Err(KeyError::ReservedPrefix {
            segment,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for ch in key.chars() {
        if RESERVED.contains(&ch) {
            escaped.push_str(&format!("%{:02X}", ch as u32));
        } else {
            escaped.push(ch);
        }
    }
    escaped
}

fn unescape_key(raw: &str, physical: &str) -> Result<String, KeyError> {
    let malformed = || KeyError::Malformed {
        key: physical.to_string(),
    };

    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != ESCAPE {
            out.push(ch);
            continue;
        }
        let hex: String = chars.by_ref().take(2).collect();
        if hex.len() != 2 {
            return Err(malformed());
        }
        let byte = u8::from_str_radix(&hex, 16).map_err(|_| malformed())?;
        if !byte.is_ascii() {
            return Err(malformed());
        }
        out.push(byte as char);
    }
    Ok(out)
}

/// Compose a physical key from its parts.
///
/// Fails with [`KeyError`] if the cache name or logical key is empty, or if
/// a namespace segment contains a reserved character.
pub fn compose(
    cache_name: &str,
    version: Option<&str>,
    logical_key: &str,
    tenant: Option<&str>,
    env: Option<&str>,
) -> Result<PhysicalKey, KeyError> {
    check_segment("cache name", cache_name)?;
    if logical_key.is_empty() {
        return Err(KeyError::Empty {
            segment: "logical key",
        });
    }

    let mut key = String::with_capacity(cache_name.len() + logical_key.len() + 16);

    if let Some(env) = env {
        check_segment("environment", env)?;
        key.push_str(env);
        key.push(ENV_DELIMITER);
    }
    if let Some(tenant) = tenant {
        check_segment("tenant", tenant)?;
        key.push_str(tenant);
        key.push(TENANT_DELIMITER);
    }

    key.push_str(cache_name);

    if let Some(version) = version {
        check_segment("version", version)?;
        key.push(VERSION_DELIMITER);
        key.push_str(version);
    }

    key.push(KEY_DELIMITER);
    key.push_str(&escape_key(logical_key));

    Ok(PhysicalKey(key))
}

/// A composed, backend-facing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalKey(String);

impl PhysicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Decode a physical key back into its parts.
    pub fn parse(key: &str) -> Result<KeyParts, KeyError> {
        let malformed = || KeyError::Malformed {
            key: key.to_string(),
        };

        let (test_traffic, unprefixed) = match key.strip_prefix(TEST_TRAFFIC_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, key),
        };
        let (namespace, raw_key) = unprefixed.split_once(KEY_DELIMITER).ok_or_else(malformed)?;
        if raw_key.is_empty() {
            return Err(malformed());
        }

        let (env, rest) = match namespace.split_once(ENV_DELIMITER) {
            Some((env, rest)) => (Some(env), rest),
            None => (None, namespace),
        };
        let (tenant, rest) = match rest.split_once(TENANT_DELIMITER) {
            Some((tenant, rest)) => (Some(tenant), rest),
            None => (None, rest),
        };
        let (cache_name, version) = match rest.split_once(VERSION_DELIMITER) {
            Some((name, version)) => (name, Some(version)),
            None => (rest, None),
        };

        check_segment("cache name", cache_name).map_err(|_| malformed())?;
        for (segment, value) in [("environment", env), ("tenant", tenant), ("version", version)] {
            if let Some(value) = value {
                check_segment(segment, value).map_err(|_| malformed())?;
            }
        }

        Ok(KeyParts {
            test_traffic,
            env: env.map(str::to_string),
            tenant: tenant.map(str::to_string),
            cache_name: cache_name.to_string(),
            version: version.map(str::to_string),
            logical_key: unescape_key(raw_key, key)?,
        })
    }
}

impl fmt::Display for PhysicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PhysicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The parts a physical key was composed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParts {
    pub test_traffic: bool,
    pub env: Option<String>,
    pub tenant: Option<String>,
    pub cache_name: String,
    pub version: Option<String>,
    pub logical_key: String,
}

/// Which prefixes a tier applies to its physical keys.
///
/// An in-process tier usually drops the environment prefix since it can
/// never be shared across environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyScope {
    pub env_prefix: bool,
    pub tenant_prefix: bool,
    /// Mark load-test keys with [`TEST_TRAFFIC_PREFIX`].
    pub test_prefix: bool,
}

impl Default for KeyScope {
    fn default() -> Self {
        Self::all()
    }
}

impl KeyScope {
    /// Environment and tenant prefixes.
    pub fn all() -> Self {
        Self {
            env_prefix: true,
            tenant_prefix: true,
            test_prefix: true,
        }
    }

    /// Tenant prefix only.
    pub fn tenant_only() -> Self {
        Self {
            env_prefix: false,
            tenant_prefix: true,
            test_prefix: true,
        }
    }

    /// No prefixes at all.
    pub fn none() -> Self {
        Self {
            env_prefix: false,
            tenant_prefix: false,
            test_prefix: false,
        }
    }

    pub fn without_test_prefix(mut self) -> Self {
        self.test_prefix = false;
        self
    }
}

/// Composes physical keys for definitions within one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyComposer {
    environment: Option<String>,
    test_traffic: bool,
}

impl KeyComposer {
    /// Create a composer; the environment id, if any, must be a valid segment.
    pub fn new(environment: Option<String>) -> Result<Self, KeyError> {
        if let Some(env) = &environment {
            check_segment("environment", env)?;
        }
        Ok(Self {
            environment,
            test_traffic: false,
        })
    }

    /// Compose keys for load-test traffic.
    pub fn with_test_traffic(mut self, test_traffic: bool) -> Self {
        self.test_traffic = test_traffic;
        self
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn is_test_traffic(&self) -> bool {
        self.test_traffic
    }

    /// Compose the physical key a tier with `scope` uses for `logical_key`.
    pub fn compose(
        &self,
        definition: &CacheDefinition,
        scope: KeyScope,
        logical_key: &str,
        tenant: Option<&str>,
    ) -> Result<PhysicalKey, KeyError> {
        let key = compose(
            definition.name(),
            definition.version(),
            logical_key,
            tenant.filter(|_| scope.tenant_prefix),
            self.environment().filter(|_| scope.env_prefix),
        )?;
        if self.test_traffic && scope.test_prefix {
            Ok(PhysicalKey(format!("{TEST_TRAFFIC_PREFIX}{}", key.0)))
        } else {
            Ok(key)
        }
    }
}
