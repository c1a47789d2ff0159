//! Distributed lock service (C3): advisory leases keyed by scheduler
//! identity and per-run identity.
//!
//! `LockService` is the trait the engine and dispatcher consume.
//! [`FileLockService`] is the reference implementation for single-instance
//! deployments: a lock file per key recording `{owner, acquired_at,
//! lease_expires_at}`. A lock whose lease has visibly expired is eligible
//! for takeover by a subsequent `try_acquire` without manual cleanup, and a
//! held guard releases automatically on `Drop`. A store-backed (CAS on a
//! `locks` table) implementation would satisfy the same trait for
//! multi-instance deployments and share this crate's test suite.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use orchestrator_environment::InstanceId;
use orchestrator_types::Lock as LockRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("lock {0} is corrupted on disk")]
    Corrupt(String),
}

pub type LockResult<T> = Result<T, LockError>;

/// The distributed lock contract (C3).
pub trait LockService: Send + Sync {
    fn try_acquire(&self, key: &str, owner: &InstanceId, lease: Duration) -> LockResult<bool>;
    fn renew(&self, key: &str, owner: &InstanceId, lease: Duration) -> LockResult<bool>;
    fn release(&self, key: &str, owner: &InstanceId) -> LockResult<()>;
    fn inspect(&self, key: &str) -> LockResult<Option<LockRecord>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct OnDiskLock {
    record: LockRecord,
}

pub struct FileLockService {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl FileLockService {
    pub fn new(dir: impl Into<PathBuf>) -> LockResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| LockError::Io {
            key: dir.display().to_string(),
            source: e,
        })?;
        Ok(Self { dir, guard: Mutex::new(()) })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.lock.json"))
    }

    fn read(&self, key: &str) -> LockResult<Option<LockRecord>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| LockError::Io { key: key.to_string(), source: e })?;
        let on_disk: OnDiskLock =
            serde_json::from_slice(&bytes).map_err(|_| LockError::Corrupt(key.to_string()))?;
        Ok(Some(on_disk.record))
    }

    fn write(&self, record: &LockRecord) -> LockResult<()> {
        let path = self.path_for(&record.key);
        let bytes = serde_json::to_vec_pretty(&OnDiskLock { record: record.clone() })
            .map_err(|_| LockError::Corrupt(record.key.clone()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| LockError::Io { key: record.key.clone(), source: e })?;
        fs::rename(&tmp, &path).map_err(|e| LockError::Io { key: record.key.clone(), source: e })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> LockResult<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| LockError::Io { key: key.to_string(), source: e })?;
        }
        Ok(())
    }
}

impl LockService for FileLockService {
    fn try_acquire(&self, key: &str, owner: &InstanceId, lease: Duration) -> LockResult<bool> {
        let _g = self.guard.lock().unwrap();
        let now = Utc::now();
        if let Some(existing) = self.read(key)? {
            let held_by_other = existing.owner != *owner;
            if held_by_other && !existing.is_expired(now) {
                return Ok(false);
            }
        }
        let record = LockRecord {
            key: key.to_string(),
            owner: owner.clone(),
            acquired_at: now,
            lease_expires_at: now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero()),
        };
        self.write(&record)?;
        Ok(true)
    }

    fn renew(&self, key: &str, owner: &InstanceId, lease: Duration) -> LockResult<bool> {
        let _g = self.guard.lock().unwrap();
        let now = Utc::now();
        match self.read(key)? {
            Some(existing) if &existing.owner == owner && !existing.is_expired(now) => {
                let record = LockRecord {
                    lease_expires_at: now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero()),
                    ..existing
                };
                self.write(&record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, key: &str, owner: &InstanceId) -> LockResult<()> {
        let _g = self.guard.lock().unwrap();
        if let Some(existing) = self.read(key)? {
            if &existing.owner == owner {
                self.remove(key)?;
            }
        }
        Ok(())
    }

    fn inspect(&self, key: &str) -> LockResult<Option<LockRecord>> {
        self.read(key)
    }
}

/// RAII guard: acquires on construction, releases on `Drop`. The caller is
/// responsible for periodically calling [`LockGuard::renew`] before the
/// lease expires; a failed renewal means the caller must stop emitting
/// writes under this key immediately (per C3's ordering guarantee).
pub struct LockGuard<'a> {
    service: &'a dyn LockService,
    key: String,
    owner: InstanceId,
    held: bool,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(
        service: &'a dyn LockService,
        key: impl Into<String>,
        owner: InstanceId,
        lease: Duration,
    ) -> LockResult<Option<Self>> {
        let key = key.into();
        if service.try_acquire(&key, &owner, lease)? {
            Ok(Some(Self { service, key, owner, held: true }))
        } else {
            Ok(None)
        }
    }

    pub fn renew(&self, lease: Duration) -> LockResult<bool> {
        self.service.renew(&self.key, &self.owner, lease)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            let _ = self.service.release(&self.key, &self.owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn second_owner_cannot_acquire_a_live_lock() {
        let dir = tempdir().unwrap();
        let svc = FileLockService::new(dir.path()).unwrap();
        let a = InstanceId::generate();
        let b = InstanceId::generate();

        assert!(svc.try_acquire("k", &a, Duration::from_secs(30)).unwrap());
        assert!(!svc.try_acquire("k", &b, Duration::from_secs(30)).unwrap());
    }

    #[test]
    #[serial]
    fn expired_lock_is_eligible_for_takeover() {
        let dir = tempdir().unwrap();
        let svc = FileLockService::new(dir.path()).unwrap();
        let a = InstanceId::generate();
        let b = InstanceId::generate();

        assert!(svc.try_acquire("k", &a, Duration::from_millis(1)).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        assert!(svc.try_acquire("k", &b, Duration::from_secs(30)).unwrap());
    }

    #[test]
    #[serial]
    fn renew_fails_for_non_owner() {
        let dir = tempdir().unwrap();
        let svc = FileLockService::new(dir.path()).unwrap();
        let a = InstanceId::generate();
        let b = InstanceId::generate();

        svc.try_acquire("k", &a, Duration::from_secs(30)).unwrap();
        assert!(!svc.renew("k", &b, Duration::from_secs(30)).unwrap());
        assert!(svc.renew("k", &a, Duration::from_secs(30)).unwrap());
    }

    #[test]
    #[serial]
    fn release_only_affects_owner() {
        let dir = tempdir().unwrap();
        let svc = FileLockService::new(dir.path()).unwrap();
        let a = InstanceId::generate();
        let b = InstanceId::generate();

        svc.try_acquire("k", &a, Duration::from_secs(30)).unwrap();
        svc.release("k", &b).unwrap();
        assert!(svc.inspect("k").unwrap().is_some());
        svc.release("k", &a).unwrap();
        assert!(svc.inspect("k").unwrap().is_none());
    }

    #[test]
    #[serial]
    fn guard_releases_on_drop() {
        let dir = tempdir().unwrap();
        let svc = FileLockService::new(dir.path()).unwrap();
        let owner = InstanceId::generate();
        {
            let _guard = LockGuard::acquire(&svc, "k", owner.clone(), Duration::from_secs(30))
                .unwrap()
                .unwrap();
            assert!(svc.inspect("k").unwrap().is_some());
        }
        assert!(svc.inspect("k").unwrap().is_none());
    }
}
