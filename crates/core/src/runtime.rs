//! Locating external runtime pieces: `ffmpeg`/`ffprobe` binaries and the
//! dynamically loaded ONNX Runtime library.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// Directories next to the executable are searched before the working
/// directory, so bundled copies win over whatever is on `PATH`.
fn exe_relative_dirs(leaf: &str, include_exe_dir: bool) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            if include_exe_dir {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join(leaf));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join(leaf));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        if include_exe_dir && !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_leaf = cwd.join(leaf);
        if !dirs.contains(&cwd_leaf) {
            dirs.push(cwd_leaf);
        }
    }
    dirs
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    exe_relative_dirs("bin", true)
}

fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = exe_relative_dirs("lib", cfg!(windows));
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn candidate_binary_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Build a [`ProcessCommand`] for `binary`, preferring a bundled copy.
pub fn command_for(binary: &str) -> ProcessCommand {
    match find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Point the `ort` loader at a bundled ONNX Runtime when none was configured.
///
/// Call at the start of `main()`, before any session is built.
pub fn setup_runtime_libs() {
    if env::var_os(ORT_DYLIB_ENV).is_some() {
        return;
    }
    if let Some(path) = find_ort_dylib_in_dirs(&candidate_lib_dirs()) {
        env::set_var(ORT_DYLIB_ENV, &path);
    }
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!("ONNX Runtime library: {ort}"),
        Ok(ort) => warn!("{ORT_DYLIB_ENV} set to {ort} but file not found"),
        Err(_) => warn!("{ORT_DYLIB_ENV} not set, local pipelines rely on default search paths"),
    }
}
