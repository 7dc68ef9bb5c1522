//! Injects the release version and git SHA at compile time.
//!
//! - PHB_VERSION: release version (falls back to CARGO_PKG_VERSION)
//! - PHB_GIT_SHA: short commit SHA (falls back to GITHUB_SHA, then `git rev-parse`)

use std::process::Command;

fn main() {
    let version = std::env::var("PHB_VERSION").unwrap_or_else(|_| {
        std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "unknown".into())
    });
    println!("cargo:rustc-env=PHB_VERSION={}", version);

    let git_sha = std::env::var("PHB_GIT_SHA")
        .or_else(|_| {
            std::env::var("GITHUB_SHA").map(|s| s.chars().take(7).collect::<String>())
        })
        .unwrap_or_else(|_| short_sha());
    println!("cargo:rustc-env=PHB_GIT_SHA={}", git_sha);

    println!("cargo:rerun-if-env-changed=PHB_VERSION");
    println!("cargo:rerun-if-env-changed=PHB_GIT_SHA");
    println!("cargo:rerun-if-env-changed=GITHUB_SHA");
}

fn short_sha() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}
