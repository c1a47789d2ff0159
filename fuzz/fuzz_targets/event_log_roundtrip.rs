#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use orchestrator_events::EventLog;
use tempfile::tempdir;

// Arbitrary bytes in place of a JSONL audit log should never panic the
// reader; any corruption surfaces as an `io::Error`-wrapped anyhow error.
fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("events.jsonl");
    if fs::write(&path, data).is_err() {
        return;
    }

    let _ = EventLog::read_from_file(&path);
});
