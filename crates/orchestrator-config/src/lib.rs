//! Layered configuration for the orchestration core.
//!
//! Precedence, lowest to highest: compiled-in defaults, an optional
//! on-disk TOML file, environment variables (`ORCH_*`), explicit
//! overrides passed by the CLI or embedding API. Every layer merges onto
//! the previous one field-by-field; nothing is validated until all layers
//! are applied, then [`Config::validate`] runs eagerly so a bad value
//! fails at load time rather than on first use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use orchestrator_duration::HumanDuration;
use orchestrator_retry::RetryConfig;
use orchestrator_schema::{SchemaError, SchemaVersion, CURRENT_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = ".orchestrator.toml";
pub const ENV_PREFIX: &str = "ORCH_";

/// Which `StateStore` implementation to construct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    /// `orchestrator-storage`'s filesystem JSON backend, rooted at `dir`.
    FileSystem { dir: PathBuf },
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::FileSystem { dir: PathBuf::from("./orchestrator-data") }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Process-wide ready-node worker pool width.
    pub w_proc: usize,
    /// Per-run concurrency cap.
    pub w_run: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { w_proc: 64, w_run: 8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedFirePolicyKind {
    Coalesce,
    FireAll,
    SkipMissed,
}

impl Default for MissedFirePolicyKind {
    fn default() -> Self {
        MissedFirePolicyKind::Coalesce
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub tick_max: HumanDuration,
    pub batch_size: usize,
    pub lock_lease: HumanDuration,
    pub missed_fire_policy: MissedFirePolicyKind,
    pub max_missed_backfill: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_max: HumanDuration::from_secs(1),
            batch_size: 100,
            lock_lease: HumanDuration::from_secs(30),
            missed_fire_policy: MissedFirePolicyKind::default(),
            max_missed_backfill: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channel_webhooks: BTreeMap<String, String>,
    pub signing_secret: Option<String>,
    pub call_api_max_response_bytes: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { channel_webhooks: BTreeMap::new(), signing_secret: None, call_api_max_response_bytes: 16 * 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    pub store: StoreBackend,
    pub worker_pool: WorkerPoolConfig,
    pub default_retry: RetryConfig,
    pub per_attempt_timeout: HumanDuration,
    pub overall_timeout: HumanDuration,
    pub cb_threshold: u32,
    pub cb_cooldown: HumanDuration,
    pub time_zone: String,
    pub dispatcher: DispatcherConfig,
    pub notifications: NotificationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            store: StoreBackend::default(),
            worker_pool: WorkerPoolConfig::default(),
            default_retry: RetryConfig::default(),
            per_attempt_timeout: HumanDuration::from_secs(30),
            overall_timeout: HumanDuration::from_secs(600),
            cb_threshold: 5,
            cb_cooldown: HumanDuration::from_secs(30),
            time_zone: "UTC".to_string(),
            dispatcher: DispatcherConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("worker_pool.{field} must be at least 1, got {value}")]
    WorkerWidthZero { field: &'static str, value: usize },
    #[error("cb_threshold must be at least 1")]
    BreakerThresholdZero,
    #[error("dispatcher.batch_size must be at least 1")]
    BatchSizeZero,
    #[error("unknown time zone {0:?}")]
    UnknownTimeZone(String),
    #[error("invalid retry config: {0}")]
    Retry(#[from] orchestrator_retry::RetryConfigError),
    #[error("unsupported schema version: {0}")]
    Schema(#[from] SchemaError),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let version = SchemaVersion::new(self.schema_version);
        if !version.is_supported() {
            return Err(ConfigError::Schema(SchemaError::Unsupported {
                found: self.schema_version,
                min: orchestrator_schema::MINIMUM_SUPPORTED_SCHEMA_VERSION,
                max: CURRENT_SCHEMA_VERSION,
            }));
        }
        if self.worker_pool.w_proc == 0 {
            return Err(ConfigError::WorkerWidthZero { field: "w_proc", value: 0 });
        }
        if self.worker_pool.w_run == 0 {
            return Err(ConfigError::WorkerWidthZero { field: "w_run", value: 0 });
        }
        if self.cb_threshold == 0 {
            return Err(ConfigError::BreakerThresholdZero);
        }
        if self.dispatcher.batch_size == 0 {
            return Err(ConfigError::BatchSizeZero);
        }
        self.time_zone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ConfigError::UnknownTimeZone(self.time_zone.clone()))?;
        self.default_retry.validate()?;
        Ok(())
    }
}

/// Explicit, higher-precedence overrides — what a CLI flag or API
/// parameter supplies. `None` fields leave the lower layer's value intact.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub store_dir: Option<PathBuf>,
    pub w_proc: Option<usize>,
    pub w_run: Option<usize>,
    pub time_zone: Option<String>,
    pub tick_max: Option<Duration>,
}

impl ConfigOverrides {
    fn apply(self, config: &mut Config) {
        if let Some(dir) = self.store_dir {
            config.store = StoreBackend::FileSystem { dir };
        }
        if let Some(w) = self.w_proc {
            config.worker_pool.w_proc = w;
        }
        if let Some(w) = self.w_run {
            config.worker_pool.w_run = w;
        }
        if let Some(tz) = self.time_zone {
            config.time_zone = tz;
        }
        if let Some(d) = self.tick_max {
            config.dispatcher.tick_max = HumanDuration::new(d);
        }
    }
}

fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

fn apply_env(config: &mut Config) {
    if let Ok(dir) = std::env::var(format!("{ENV_PREFIX}STORE_DIR")) {
        config.store = StoreBackend::FileSystem { dir: PathBuf::from(dir) };
    }
    if let Ok(tz) = std::env::var(format!("{ENV_PREFIX}TIME_ZONE")) {
        config.time_zone = tz;
    }
    if let Ok(w) = std::env::var(format!("{ENV_PREFIX}W_PROC")) {
        if let Ok(w) = w.parse() {
            config.worker_pool.w_proc = w;
        }
    }
    if let Ok(w) = std::env::var(format!("{ENV_PREFIX}W_RUN")) {
        if let Ok(w) = w.parse() {
            config.worker_pool.w_run = w;
        }
    }
    if let Ok(secret) = std::env::var(format!("{ENV_PREFIX}SIGNING_SECRET")) {
        config.notifications.signing_secret = Some(secret);
    }
}

/// Load configuration from `dir`, layering defaults -> on-disk file (if
/// present) -> environment variables -> `overrides`, then validate eagerly.
pub fn load_config(dir: &Path, overrides: ConfigOverrides) -> Result<Config> {
    let mut config = Config::default();

    let path = config_path(dir);
    if path.exists() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file at {}", path.display()))?;
        let from_file: Config = toml::from_str(&text)
            .with_context(|| format!("parsing config file at {}", path.display()))?;
        config = from_file;
    }

    apply_env(&mut config);
    overrides.apply(&mut config);

    config.validate().with_context(|| "validating merged configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_worker_width_is_rejected() {
        let mut config = Config::default();
        config.worker_pool.w_proc = 0;
        assert!(matches!(config.validate(), Err(ConfigError::WorkerWidthZero { field: "w_proc", .. })));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let mut config = Config::default();
        config.time_zone = "Not/AZone".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownTimeZone(_))));
    }

    #[test]
    #[serial]
    fn file_layer_overrides_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(config_path(dir.path()), "time_zone = \"America/New_York\"\n").unwrap();
        let config = load_config(dir.path(), ConfigOverrides::default()).unwrap();
        assert_eq!(config.time_zone, "America/New_York");
    }

    #[test]
    #[serial]
    fn env_layer_overrides_file_layer() {
        let dir = tempdir().unwrap();
        std::fs::write(config_path(dir.path()), "time_zone = \"America/New_York\"\n").unwrap();
        temp_env::with_var(format!("{ENV_PREFIX}TIME_ZONE"), Some("Asia/Tokyo"), || {
            let config = load_config(dir.path(), ConfigOverrides::default()).unwrap();
            assert_eq!(config.time_zone, "Asia/Tokyo");
        });
    }

    #[test]
    #[serial]
    fn explicit_overrides_win_over_everything() {
        let dir = tempdir().unwrap();
        std::fs::write(config_path(dir.path()), "time_zone = \"America/New_York\"\n").unwrap();
        let overrides = ConfigOverrides { time_zone: Some("UTC".to_string()), ..Default::default() };
        let config = load_config(dir.path(), overrides).unwrap();
        assert_eq!(config.time_zone, "UTC");
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(dir.path(), ConfigOverrides::default()).unwrap();
        assert_eq!(config, Config::default());
    }
}
