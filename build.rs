//! Stamps `tsk --version` with where and when the binary came from.
//!
//! - `TSK_BUILD_TIMESTAMP`: UTC build time, taken from `SOURCE_DATE_EPOCH`
//!   when set so packaged builds are reproducible
//! - `TSK_GIT_COMMIT`: short commit hash, suffixed with `-dirty` for a
//!   modified work tree, `unknown` outside a checkout

use std::env;
use std::process::Command;

use chrono::{DateTime, Utc};

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    println!(
        "cargo:rustc-env=TSK_BUILD_TIMESTAMP={}",
        build_time().format("%Y-%m-%dT%H:%M:%SZ")
    );
    println!(
        "cargo:rustc-env=TSK_GIT_COMMIT={}",
        commit().unwrap_or_else(|| "unknown".to_string())
    );
}

fn build_time() -> DateTime<Utc> {
    env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|secs| secs.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

fn commit() -> Option<String> {
    let hash = git(&["rev-parse", "--short", "HEAD"])?;
    let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
        .is_some_and(|changes| !changes.is_empty());
    Some(if dirty { format!("{}-dirty", hash) } else { hash })
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8(output.stdout).ok()?.trim().to_string())
}
