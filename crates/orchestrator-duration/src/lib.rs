//! Duration parsing and serde codecs shared across the orchestration core.
//!
//! Every duration-shaped config field and wire value in this workspace goes
//! through [`HumanDuration`] so callers can write either a millisecond
//! integer or a human-readable string (`"500ms"`, `"30s"`, `"5m"`) and get
//! the same [`std::time::Duration`] out the other side.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A `Duration` newtype that (de)serializes from either milliseconds or a
/// human-readable string, and always serializes back out as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn new(d: Duration) -> Self {
        Self(d)
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn from_secs(s: u64) -> Self {
        Self(Duration::from_secs(s))
    }

    /// Parse a duration from either a bare integer (milliseconds) or a
    /// humantime string such as `"1s500ms"`.
    pub fn parse(s: &str) -> Result<Self, ParseDurationError> {
        let trimmed = s.trim();
        if let Ok(ms) = trimmed.parse::<u64>() {
            return Ok(Self(Duration::from_millis(ms)));
        }
        humantime::parse_duration(trimmed)
            .map(Self)
            .map_err(|e| ParseDurationError(e.to_string()))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<HumanDuration> for Duration {
    fn from(h: HumanDuration) -> Self {
        h.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration: {0}")]
pub struct ParseDurationError(pub String);

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0.as_millis() as u64)
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration in milliseconds or a humantime string like \"30s\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(HumanDuration::from_millis(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(HumanDuration::from_millis(v as u64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                if v < 0.0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(HumanDuration::from_millis(v as u64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                HumanDuration::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
