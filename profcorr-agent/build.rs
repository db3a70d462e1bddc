//! Build script for profcorr-agent.
//!
//! Records build metadata for the status payload and the runtime search path
//! of the correlation thread-local library.

use std::process::Command;

fn capture(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    // Git SHA (short)
    let git_sha = capture("git", &["rev-parse", "--short", "HEAD"]);
    println!("cargo:rustc-env=PROFCORR_GIT_SHA={git_sha}");

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let rustc_version = capture(&rustc, &["--version"]);
    println!("cargo:rustc-env=PROFCORR_RUSTC_VERSION={rustc_version}");

    // The correlation thread-local lives in libprofcorr_tls next to the agent
    // library once deployed; during development it stays in profcorr's OUT_DIR.
    let origin = match std::env::var("CARGO_CFG_TARGET_OS").as_deref() {
        Ok("macos") => "@loader_path",
        _ => "$ORIGIN",
    };
    println!("cargo:rustc-link-arg=-Wl,-rpath,{origin}");
    if let Ok(tls_dir) = std::env::var("DEP_PROFCORR_TLS_LIB_DIR") {
        println!("cargo:rustc-link-arg=-Wl,-rpath,{tls_dir}");
    }

    // Rebuild if git HEAD changes
    println!("cargo:rerun-if-changed=../.git/HEAD");
    println!("cargo:rerun-if-changed=../.git/refs");
}
