//! Instance fingerprinting for lock ownership and dispatcher identity.
//!
//! Every process that participates as a lock owner ([`orchestrator_lock`])
//! or as a dispatcher instance identifies itself with a stable
//! [`InstanceId`]: hostname, process id, and a random session nonce
//! generated once at startup. This is the `owner` value passed to the
//! distributed lock service, and is recorded on `LockInfo` and
//! `ScheduleRun.claimed_by` so a stale lock or an orphaned claim can be
//! traced back to the process that held it.

use std::fmt;
use std::sync::OnceLock;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// The stable identity of this process for lock-ownership purposes.
///
/// Two `InstanceId`s are equal only if hostname, pid, and nonce all match —
/// which in practice means only a clone of the exact same process instance,
/// since the nonce is re-rolled on every process start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub hostname: String,
    pub pid: u32,
    pub nonce: String,
}

impl InstanceId {
    /// Build a fresh fingerprint for the current process.
    pub fn generate() -> Self {
        let hostname = gethostname::gethostname()
            .to_string_lossy()
            .into_owned();
        let pid = std::process::id();
        let nonce = generate_nonce();
        Self { hostname, pid, nonce }
    }

    /// Parse an `InstanceId` back out of its `Display` form
    /// (`hostname:pid:nonce`).
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.rsplitn(3, ':');
        let nonce = parts.next()?.to_string();
        let pid = parts.next()?.parse().ok()?;
        let hostname = parts.next()?.to_string();
        Some(Self { hostname, pid, nonce })
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.hostname, self.pid, self.nonce)
    }
}

fn generate_nonce() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 8] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The current process's [`InstanceId`], generated once on first access and
/// stable for the lifetime of the process.
pub fn current_instance() -> &'static InstanceId {
    static INSTANCE: OnceLock<InstanceId> = OnceLock::new();
    INSTANCE.get_or_init(InstanceId::generate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn display_and_parse_round_trip() {
        let id = InstanceId::generate();
        let text = id.to_string();
        let parsed = InstanceId::parse(&text).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn two_generated_ids_have_distinct_nonces() {
        let a = InstanceId::generate();
        let b = InstanceId::generate();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    #[serial]
    fn current_instance_is_stable_across_calls() {
        let first = current_instance();
        let second = current_instance();
        assert_eq!(first, second);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(InstanceId::parse("not-enough-parts").is_none());
    }
}
