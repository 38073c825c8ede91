//! Exports the queue wire format declared in `[package.metadata.relaybus]`
//! and the build provenance as compile-time environment variables.

use chrono::Utc;
use std::error::Error;
use std::path::Path;
use std::process::Command;

fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=.git/HEAD");

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")?;
    let wire_format = wire_format(&Path::new(&manifest_dir).join("Cargo.toml"))?;

    println!("cargo:rustc-env=RELAYBUS_WIRE_FORMAT={}", wire_format);
    println!(
        "cargo:rustc-env=RELAYBUS_BUILD_TIME={}",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "cargo:rustc-env=RELAYBUS_GIT_HASH={}",
        git_hash().unwrap_or_else(|| "unknown".to_string())
    );
    Ok(())
}

/// Stamped into every shared queue segment; must fit the 32-bit header field
fn wire_format(manifest: &Path) -> Result<u32, Box<dyn Error>> {
    let manifest: toml::Table = std::fs::read_to_string(manifest)?.parse()?;
    let version = manifest
        .get("package")
        .and_then(|package| package.get("metadata"))
        .and_then(|metadata| metadata.get("relaybus"))
        .and_then(|relaybus| relaybus.get("wire_format_version"))
        .and_then(toml::Value::as_integer)
        .ok_or("Cargo.toml must set [package.metadata.relaybus] wire_format_version")?;
    u32::try_from(version)
        .ok()
        .filter(|version| *version > 0)
        .ok_or_else(|| format!("wire_format_version {} is not a positive 32-bit integer", version).into())
}

fn git_hash() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|hash| hash.trim().to_string())
}
