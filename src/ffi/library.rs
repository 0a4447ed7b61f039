//! Interpreter shared-library discovery and loading
//!
//! Search order:
//! 1. `PYBRIDGE_PYTHON` environment variable (explicit path or name)
//! 2. `library.path` from the configuration
//! 3. `library.candidates` from the configuration
//! 4. Platform defaults, newest interpreter version first

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::logging::{debug, info};

/// Environment variable naming the interpreter library explicitly
pub const LIBRARY_ENV: &str = "PYBRIDGE_PYTHON";

/// Interpreter versions tried when nothing is configured, newest first
pub const DEFAULT_VERSIONS: &[&str] = &["3.13", "3.12", "3.11", "3.10", "3.9", "3.8"];

/// Ordered list of library names/paths to attempt
pub fn candidates(config: &BridgeConfig) -> Vec<String> {
    let mut out = Vec::new();

    if let Ok(explicit) = std::env::var(LIBRARY_ENV) {
        if !explicit.trim().is_empty() {
            out.push(explicit);
        }
    }

    if let Some(path) = &config.library.path {
        out.push(path.to_string_lossy().into_owned());
    }

    out.extend(config.library.candidates.iter().cloned());

    let versions: Vec<&str> = if config.library.versions.is_empty() {
        DEFAULT_VERSIONS.to_vec()
    } else {
        config.library.versions.iter().map(String::as_str).collect()
    };

    for version in versions {
        out.extend(platform_names(version));
    }

    out
}

#[cfg(target_os = "linux")]
fn platform_names(version: &str) -> Vec<String> {
    vec![
        format!("libpython{version}.so.1.0"),
        format!("libpython{version}.so"),
    ]
}

#[cfg(target_os = "macos")]
fn platform_names(version: &str) -> Vec<String> {
    vec![
        format!("libpython{version}.dylib"),
        format!("/opt/homebrew/Frameworks/Python.framework/Versions/{version}/Python"),
        format!("/usr/local/Frameworks/Python.framework/Versions/{version}/Python"),
        format!("/Library/Frameworks/Python.framework/Versions/{version}/Python"),
    ]
}

#[cfg(windows)]
fn platform_names(version: &str) -> Vec<String> {
    vec![format!("python{}.dll", version.replace('.', ""))]
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn platform_names(version: &str) -> Vec<String> {
    vec![format!("libpython{version}.so")]
}

/// Load the first candidate that opens
pub fn load_library(config: &BridgeConfig) -> Result<(libloading::Library, String)> {
    let mut tried = Vec::new();

    for name in candidates(config) {
        match open(&name) {
            Ok(lib) => {
                info!(target: "ffi", library = %name, "interpreter library loaded");
                return Ok((lib, name));
            }
            Err(e) => {
                debug!(target: "ffi", library = %name, error = %e, "candidate rejected");
                tried.push(name);
            }
        }
    }

    Err(Error::LibraryNotFound { tried })
}

/// Open with global symbol visibility so C extension modules resolve
/// `Py*` symbols against the same interpreter
#[cfg(unix)]
fn open(name: &str) -> std::result::Result<libloading::Library, libloading::Error> {
    use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};

    // Safety: loading libpython runs no initialisers beyond the C runtime's
    unsafe { Library::open(Some(name), RTLD_NOW | RTLD_GLOBAL) }.map(Into::into)
}

#[cfg(not(unix))]
fn open(name: &str) -> std::result::Result<libloading::Library, libloading::Error> {
    // Safety: as above
    unsafe { libloading::Library::new(name) }
}
