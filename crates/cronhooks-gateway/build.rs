use std::process::Command;

/// Short commit hash for `/health`. Release tarballs have no `.git`, so CI
/// can pass it in through `CRONHOOKS_BUILD_SHA` instead.
fn git_sha() -> String {
    if let Ok(sha) = std::env::var("CRONHOOKS_BUILD_SHA") {
        if !sha.trim().is_empty() {
            return sha.trim().to_string();
        }
    }
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env=CRONHOOKS_GIT_SHA={}", git_sha());
    println!("cargo:rerun-if-env-changed=CRONHOOKS_BUILD_SHA");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
}
