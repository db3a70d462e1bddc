//! Build script for profcorr.
//!
//! Builds the thread-local correlation symbol as its own shared object,
//! `libprofcorr_tls`. Stable Rust cannot export a `#[no_mangle]` thread-local,
//! and a static C archive linked into a Rust `cdylib` ends up behind rustc's
//! version script (`local: *`). A separate shared object keeps the symbol
//! global in its own dynamic symbol table.
//!
//! The directory holding the library is published as `DEP_PROFCORR_TLS_LIB_DIR`
//! for dependents that need to set a runtime search path.

use std::env;
use std::path::PathBuf;

const SOURCE: &str = "csrc/correlation_tls.c";

fn main() {
    println!("cargo:rerun-if-changed={SOURCE}");

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    let (file_name, link_flags): (&str, Vec<String>) = if target_os == "macos" {
        (
            "libprofcorr_tls.dylib",
            vec![
                "-dynamiclib".to_string(),
                "-Wl,-install_name,@rpath/libprofcorr_tls.dylib".to_string(),
            ],
        )
    } else {
        (
            "libprofcorr_tls.so",
            vec![
                "-shared".to_string(),
                "-Wl,-soname,libprofcorr_tls.so".to_string(),
            ],
        )
    };
    let library = out_dir.join(file_name);

    let compiler = cc::Build::new().pic(true).get_compiler();
    let status = compiler
        .to_command()
        .args(&link_flags)
        .arg("-fvisibility=default")
        .arg("-o")
        .arg(&library)
        .arg(SOURCE)
        .status()
        .expect("failed to run the C compiler");
    assert!(status.success(), "compiling {SOURCE} failed with {status}");

    println!("cargo:rustc-link-search=native={}", out_dir.display());
    println!("cargo:rustc-link-lib=dylib=profcorr_tls");
    // Test binaries of this package find the library without LD_LIBRARY_PATH.
    println!("cargo:rustc-link-arg=-Wl,-rpath,{}", out_dir.display());
    println!("cargo:lib_dir={}", out_dir.display());
}
