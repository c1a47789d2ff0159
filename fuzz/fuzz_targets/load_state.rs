#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use orchestrator_store::StateStore;
use orchestrator_storage::FileSystemBackend;
use orchestrator_types::PipelineId;
use tempfile::tempdir;

// Arbitrary bytes on disk where a pipeline record is expected should never
// panic the store, only surface as a `StoreError`.
fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let id = PipelineId::new();
    let dir = td.path().join("pipelines").join(id.to_string());
    if fs::create_dir_all(&dir).is_err() {
        return;
    }
    if fs::write(dir.join("0000000001.json"), data).is_err() {
        return;
    }

    if let Ok(backend) = FileSystemBackend::new(td.path()) {
        let _ = backend.get_pipeline(id, 1);
        let _ = backend.latest_pipeline_version(id);
    }
});
