//! Build script for collins-screen
//!
//! This script handles:
//! - FFmpeg library detection (libavformat, libavcodec, libswscale, libswresample)
//! - Copying FFmpeg DLLs next to the binary on Windows
//!
//! Linking itself is done by ffmpeg-sys-next; everything here only warns.

use std::env;
use std::path::{Path, PathBuf};

const FFMPEG_LIBS: [&str; 4] = ["libavformat", "libavcodec", "libswscale", "libswresample"];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=FFMPEG_DIR");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    match detect_ffmpeg() {
        Ok(source) => println!("cargo:warning=FFmpeg found via {}", source),
        Err(missing) => {
            println!("cargo:warning=FFmpeg development files not found: {}", missing.join(", "));
            print_install_hint(&target_os);
        }
    }

    if target_os == "windows" {
        if let Some(dir) = env::var_os("FFMPEG_DIR").map(PathBuf::from) {
            if let Err(e) = copy_ffmpeg_dlls(&dir) {
                println!("cargo:warning=Failed to copy FFmpeg DLLs: {}", e);
            }
        }
    }
}

/// Probe the FFmpeg libraries, returning which detection path succeeded
fn detect_ffmpeg() -> Result<&'static str, Vec<&'static str>> {
    if env::var_os("FFMPEG_DIR").map(|d| Path::new(&d).join("include").exists()) == Some(true) {
        return Ok("FFMPEG_DIR");
    }

    let missing: Vec<&'static str> = FFMPEG_LIBS
        .iter()
        .copied()
        .filter(|lib| {
            pkg_config::Config::new()
                .cargo_metadata(false)
                .probe(lib)
                .is_err()
        })
        .collect();

    if missing.is_empty() {
        Ok("pkg-config")
    } else {
        Err(missing)
    }
}

fn print_install_hint(target_os: &str) {
    match target_os {
        "windows" => {
            println!("cargo:warning=  Download a shared build and set FFMPEG_DIR to its root");
        }
        "macos" => {
            println!("cargo:warning=  Run: brew install ffmpeg pkg-config");
        }
        "linux" => {
            println!("cargo:warning=  Ubuntu/Debian: sudo apt install libavformat-dev libavcodec-dev libswscale-dev libswresample-dev");
            println!("cargo:warning=  Fedora: sudo dnf install ffmpeg-devel");
        }
        _ => {}
    }
}

/// Copy FFmpeg DLLs to the output directory on Windows
fn copy_ffmpeg_dlls(ffmpeg_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = env::var("OUT_DIR")?;
    let bin_path = ffmpeg_path.join("bin");

    if !bin_path.exists() {
        return Ok(());
    }

    let target_dir = match Path::new(&out_dir).ancestors().nth(3) {
        Some(dir) => dir.to_path_buf(),
        None => return Ok(()),
    };

    for pattern in ["avcodec-*.dll", "avformat-*.dll", "avutil-*.dll", "swscale-*.dll", "swresample-*.dll"] {
        let glob_pattern = bin_path.join(pattern).to_string_lossy().to_string();

        for dll_path in glob::glob(&glob_pattern)?.flatten() {
            if let Some(dll_name) = dll_path.file_name() {
                let dest = target_dir.join(dll_name);
                if !dest.exists() {
                    std::fs::copy(&dll_path, &dest)?;
                }
            }
        }
    }

    Ok(())
}
