//! Schema versioning for persisted orchestration records.
//!
//! Every record the durable state store writes (pipelines, runs, node
//! results, schedules, schedule runs, circuit breakers, locks) is tagged
//! with a `SchemaVersion` so a future migration can tell which on-disk
//! shape it is looking at before deserializing the rest of the record.

use std::fmt;

/// The schema version this build of the core writes and expects to read.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// The lowest schema version this build can still read.
pub const MINIMUM_SUPPORTED_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(u32);

impl SchemaVersion {
    pub fn current() -> Self {
        Self(CURRENT_SCHEMA_VERSION)
    }

    pub fn new(version: u32) -> Self {
        Self(version)
    }

    pub fn version(&self) -> u32 {
        self.0
    }

    /// Parse a version string of the form `v3` or `3`.
    pub fn parse(s: &str) -> Result<Self, SchemaError> {
        let digits = s.strip_prefix('v').unwrap_or(s);
        digits
            .parse::<u32>()
            .map(Self)
            .map_err(|_| SchemaError::Malformed(s.to_string()))
    }

    pub fn is_supported(&self) -> bool {
        self.0 >= MINIMUM_SUPPORTED_SCHEMA_VERSION && self.0 <= CURRENT_SCHEMA_VERSION
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("malformed schema version: {0:?}")]
    Malformed(String),
    #[error("unsupported schema version {found}: supported range is {min}..={max}")]
    Unsupported { found: u32, min: u32, max: u32 },
}

/// Validate a version string against the range this build supports.
pub fn validate_schema_version(s: &str) -> Result<SchemaVersion, SchemaError> {
    let v = SchemaVersion::parse(s)?;
    if !v.is_supported() {
        return Err(SchemaError::Unsupported {
            found: v.version(),
            min: MINIMUM_SUPPORTED_SCHEMA_VERSION,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_prefix() {
        assert_eq!(SchemaVersion::parse("v1").unwrap().version(), 1);
        assert_eq!(SchemaVersion::parse("1").unwrap().version(), 1);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(SchemaVersion::parse("vnope").is_err());
    }

    #[test]
    fn current_is_supported() {
        assert!(SchemaVersion::current().is_supported());
    }

    #[test]
    fn future_version_is_unsupported() {
        let v = SchemaVersion::new(CURRENT_SCHEMA_VERSION + 1);
        assert!(!v.is_supported());
        assert!(validate_schema_version(&v.to_string()).is_err());
    }

    #[test]
    fn display_roundtrips_through_parse() {
        let v = SchemaVersion::current();
        assert_eq!(SchemaVersion::parse(&v.to_string()).unwrap(), v);
    }
}
