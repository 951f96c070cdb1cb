//! Executable lookup against an explicit search path.
//!
//! Lookups take the search path as an argument instead of reading `PATH` from the
//! process, so a freshly installed tool becomes visible as soon as its directory is
//! prepended to the forwarded search path.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const EXECUTABLE_EXTENSIONS: &[&str] = &["exe", "cmd", "bat", "com"];

/// Finds `binary` in `search_path`.
///
/// A name containing a path separator is checked as-is.
pub fn find_executable(binary: &str, search_path: &OsStr) -> Option<PathBuf> {
    if binary.is_empty() {
        return None;
    }

    let direct = Path::new(binary);
    if direct.components().count() > 1 {
        return candidates(direct).into_iter().find(|p| is_executable(p));
    }

    std::env::split_paths(search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .flat_map(|dir| candidates(&dir.join(binary)))
        .find(|p| is_executable(p))
}

#[cfg(windows)]
fn candidates(base: &Path) -> Vec<PathBuf> {
    let mut out = vec![base.to_path_buf()];
    if base.extension().is_none() {
        out.extend(EXECUTABLE_EXTENSIONS.iter().map(|ext| base.with_extension(ext)));
    }
    out
}

#[cfg(not(windows))]
fn candidates(base: &Path) -> Vec<PathBuf> {
    vec![base.to_path_buf()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
