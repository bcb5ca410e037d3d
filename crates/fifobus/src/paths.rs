//! Endpoint path layout and filesystem helpers.
//!
//! Every logical stream lives in its own directory under [`DEFAULT_BASE_DIR`],
//! e.g. `/run/mpa/imu0/`. The base dir is memory-backed so stale endpoints do
//! not survive a reboot, and it can be bind-mounted into containers to share
//! streams across them.

use crate::errors::{PipeError, Result};
use nix::sys::stat::Mode;
use std::path::{Path, PathBuf};

/// Recommended parent directory for endpoints when only a short name is given.
pub const DEFAULT_BASE_DIR: &str = "/run/mpa/";

/// Maximum length of a fully expanded endpoint directory string.
pub const MAX_DIR_LEN: usize = 64;

/// Maximum length of a pipe or client name.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum length of a full path to a data pipe.
pub const MAX_PATH_LEN: usize = MAX_DIR_LEN + MAX_NAME_LEN;

/// Maximum length of the `type` string in the endpoint descriptor.
pub const MAX_TYPE_LEN: usize = 32;

/// Default kernel buffer size for per-client data pipes (1 MiB).
pub const DEFAULT_PIPE_SIZE: u32 = 1024 * 1024;

/// Name of the rendezvous pipe inside an endpoint directory.
pub const REQUEST_PIPE_NAME: &str = "request";

/// Name of the optional command pipe inside an endpoint directory.
pub const CONTROL_PIPE_NAME: &str = "control";

/// Name of the JSON descriptor file inside an endpoint directory.
pub const INFO_FILE_NAME: &str = "info";

/// Expand a pipe name, partial location, or full location into a canonical
/// endpoint directory string ending in `/`.
///
/// Examples of input > output behavior:
///
/// - `imu0`     > `/run/mpa/imu0/`
/// - `imu0/`    > `/run/mpa/imu0/`
/// - `/foo/bar` > `/foo/bar/`
/// - `/foo`     > `/foo/`
///
/// This only formats the string, it does not guarantee the path exists.
pub fn expand_location(name_or_location: &str) -> Result<String> {
    if name_or_location.is_empty() {
        return Err(PipeError::invalid_arg("empty pipe name or location"));
    }

    let mut out = if name_or_location.starts_with('/') {
        name_or_location.to_string()
    } else {
        format!("{DEFAULT_BASE_DIR}{name_or_location}")
    };
    if !out.ends_with('/') {
        out.push('/');
    }

    if out.len() > MAX_DIR_LEN {
        return Err(PipeError::invalid_arg(format!(
            "expanded location '{out}' exceeds {MAX_DIR_LEN} bytes"
        )));
    }
    Ok(out)
}

/// Create a directory and all missing parents with permissive (0666-style)
/// access so unprivileged clients can traverse into the endpoint.
///
/// The string must contain a trailing `/` after the last directory to be
/// created; anything after the final slash is treated as a file name and
/// never created. Existing directories are success.
pub fn mkdir_recursive(dir: &str) -> Result<()> {
    let Some(last_slash) = dir.rfind('/') else {
        return Err(PipeError::invalid_arg(format!(
            "'{dir}' contains no directory component"
        )));
    };

    let mut partial = String::with_capacity(last_slash + 1);
    for component in dir[..last_slash].split('/') {
        partial.push_str(component);
        partial.push('/');
        if component.is_empty() || Path::new(&partial).is_dir() {
            continue;
        }
        match nix::unistd::mkdir(
            partial.trim_end_matches('/'),
            Mode::from_bits_truncate(0o777),
        ) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => {
                tracing::error!("failed to create directory {}: {}", partial, e);
                return Err(PipeError::FileIo(e.into()));
            }
        }
    }
    Ok(())
}

/// Best-effort equivalent of `rm -r`.
pub fn remove_recursive(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(());
    }
    std::fs::remove_dir_all(path).map_err(|e| {
        tracing::warn!("failed to remove {}: {}", path.display(), e);
        PipeError::FileIo(e)
    })
}

/// Readability wrapper for "does this path exist".
pub fn exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}

/// Full path of the rendezvous pipe for an endpoint directory.
pub fn request_path(dir: &str) -> PathBuf {
    PathBuf::from(format!("{dir}{REQUEST_PIPE_NAME}"))
}

/// Full path of the control pipe for an endpoint directory.
pub fn control_path(dir: &str) -> PathBuf {
    PathBuf::from(format!("{dir}{CONTROL_PIPE_NAME}"))
}

/// Full path of the JSON descriptor for an endpoint directory.
pub fn info_path(dir: &str) -> PathBuf {
    PathBuf::from(format!("{dir}{INFO_FILE_NAME}"))
}
