//! Emits git SHA, build profile, and rustc version as `rustc-env` values
//! consumed by `--version --verbose`. Stdlib + `git` subprocess only — no
//! vergen — to keep the supply chain tight.

use std::process::Command;

fn main() {
    let sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=ORCH_GIT_SHA={sha}");

    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=ORCH_BUILD_PROFILE={profile}");

    let rustc_version = Command::new(std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string()))
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=ORCH_RUSTC_VERSION={rustc_version}");

    println!("cargo:rerun-if-changed=../../.git/HEAD");
}
