use std::env;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=FLEET_BUILD_ID_OVERRIDE");
    for watched in [".git/HEAD", ".git/refs"] {
        if Path::new(watched).exists() {
            println!("cargo:rerun-if-changed={}", watched);
        }
    }

    let built_at = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let revision = git_revision().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("FLEET_BUILD_ID_OVERRIDE")
        .ok()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("{} | {}", built_at, revision));

    println!("cargo:rustc-env=FLEET_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=FLEET_BUILD_GIT={}", revision);
}

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!label.is_empty()).then_some(label)
}
