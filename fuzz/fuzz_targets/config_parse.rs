#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use orchestrator_config::{load_config, ConfigOverrides, CONFIG_FILE};
use tempfile::tempdir;

// Arbitrary bytes as `.orchestrator.toml` should never panic the layered
// config loader (defaults -> file -> env -> overrides -> validate), only
// return a `ConfigError`.
fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    if fs::write(td.path().join(CONFIG_FILE), data).is_err() {
        return;
    }

    let _ = load_config(td.path(), ConfigOverrides::default());
});
