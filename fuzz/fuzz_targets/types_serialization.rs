#![no_main]

use libfuzzer_sys::fuzz_target;
use orchestrator_types::{Pipeline, RunSnapshot, Schedule};

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else { return };

    if let Ok(pipeline) = serde_json::from_str::<Pipeline>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&pipeline) {
            if let Ok(parsed) = serde_json::from_str::<Pipeline>(&roundtripped) {
                assert_eq!(pipeline.id, parsed.id);
                assert_eq!(pipeline.nodes.len(), parsed.nodes.len());
                assert_eq!(pipeline.edges.len(), parsed.edges.len());
            }
        }
    }

    if let Ok(schedule) = serde_json::from_str::<Schedule>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&schedule) {
            if let Ok(parsed) = serde_json::from_str::<Schedule>(&roundtripped) {
                assert_eq!(schedule.id, parsed.id);
                assert_eq!(schedule.enabled, parsed.enabled);
            }
        }
    }

    if let Ok(snapshot) = serde_json::from_str::<RunSnapshot>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&snapshot) {
            if let Ok(parsed) = serde_json::from_str::<RunSnapshot>(&roundtripped) {
                assert_eq!(snapshot.run.id, parsed.run.id);
            }
        }
    }
});