//! Stamps the `routectl --version` string: commit, build day and target.

use std::env;
use std::process::Command;

use time::OffsetDateTime;

fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Reproducible builds pin the day through `SOURCE_DATE_EPOCH`.
fn build_day() -> String {
    let now = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|secs| secs.parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    now.date().to_string()
}

fn stamp(key: &str, value: &str) {
    println!("cargo:rustc-env={key}={value}");
}

fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/index");

    let commit = git(&["describe", "--always", "--dirty", "--abbrev=10"]);
    stamp("ROUTECTL_COMMIT", commit.as_deref().unwrap_or("unreleased"));
    stamp("ROUTECTL_BUILD_DAY", &build_day());
    stamp(
        "ROUTECTL_TARGET",
        &env::var("TARGET").unwrap_or_else(|_| "unknown-target".to_string()),
    );
}
