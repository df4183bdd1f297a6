//! Durations expressed as a count plus a unit.
//!
//! Configuration front ends describe `expire` / `reload` as `5 minutes`,
//! `300ms`, or `{ count = 5, unit = "minutes" }`. All forms resolve to a
//! [`DurationSpec`], which converts to [`std::time::Duration`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::ConfigError;

/// Time unit, from milliseconds through days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Length of one unit in milliseconds.
    pub fn millis(self) -> u64 {
        match self {
            Self::Milliseconds => 1,
            Self::Seconds => 1_000,
            Self::Minutes => 60_000,
            Self::Hours => 3_600_000,
            Self::Days => 86_400_000,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Milliseconds => "ms",
            Self::Seconds => "s",
            Self::Minutes => "m",
            Self::Hours => "h",
            Self::Days => "d",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ms" | "millis" | "millisecond" | "milliseconds" => Ok(Self::Milliseconds),
            "s" | "sec" | "secs" | "second" | "seconds" => Ok(Self::Seconds),
            "m" | "min" | "mins" | "minute" | "minutes" => Ok(Self::Minutes),
            "h" | "hr" | "hrs" | "hour" | "hours" => Ok(Self::Hours),
            "d" | "day" | "days" => Ok(Self::Days),
            other => Err(ConfigError::InvalidValue {
                field: "unit".to_string(),
                value: other.to_string(),
                reason: "expected one of ms, s, m, h, d".to_string(),
            }),
        }
    }
}

/// A duration written as `count` of `unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DurationSpec {
    pub count: u64,
    pub unit: TimeUnit,
}

impl DurationSpec {
    pub fn new(count: u64, unit: TimeUnit) -> Self {
        Self { count, unit }
    }

    pub fn millis(count: u64) -> Self {
        Self::new(count, TimeUnit::Milliseconds)
    }

    pub fn seconds(count: u64) -> Self {
        Self::new(count, TimeUnit::Seconds)
    }

    pub fn minutes(count: u64) -> Self {
        Self::new(count, TimeUnit::Minutes)
    }

    pub fn hours(count: u64) -> Self {
        Self::new(count, TimeUnit::Hours)
    }

    pub fn days(count: u64) -> Self {
        Self::new(count, TimeUnit::Days)
    }

    /// Convert to a std duration, saturating on overflow.
    pub fn to_duration(self) -> Duration {
        Duration::from_millis(self.count.saturating_mul(self.unit.millis()))
    }

    pub fn is_zero(self) -> bool {
        self.count == 0
    }
}

impl From<DurationSpec> for Duration {
    fn from(spec: DurationSpec) -> Self {
        spec.to_duration()
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

impl FromStr for DurationSpec {
    type Err = ConfigError;

    /// Parse `5m`, `5 min`, `300ms`, `2 hours`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);

        if digits.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "duration".to_string(),
                value: s.to_string(),
                reason: "duration must start with a count".to_string(),
            });
        }
        let count = digits.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            field: "duration".to_string(),
            value: s.to_string(),
            reason: e.to_string(),
        })?;
        if unit.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "duration".to_string(),
                value: s.to_string(),
                reason: "duration is missing a unit".to_string(),
            });
        }

        Ok(Self::new(count, unit.parse()?))
    }
}

#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct DurationFields {
    count: u64,
    unit: TimeUnit,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Text(String),
    Fields(DurationFields),
}

impl<'de> Deserialize<'de> for DurationSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match DurationRepr::deserialize(deserializer)? {
            DurationRepr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            DurationRepr::Fields(fields) => Ok(Self::new(fields.count, fields.unit)),
        }
    }
}

impl Serialize for DurationSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
