//! The `info` descriptor file and endpoint discovery helpers.
//!
//! Servers advertise their capabilities by writing a small JSON document into
//! the endpoint directory. Clients read it to check the payload type before
//! attaching and to find the PID of the owning server. Servers may add
//! arbitrary vendor keys (lens calibrations, hardware descriptors, ...) which
//! are reachable through the raw [`serde_json::Value`] form.

use crate::errors::{PipeError, Result};
use crate::lifecycle::{pid_is_alive, wait_for_exit};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Descriptor for one endpoint, mirrored as JSON in its `info` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Short name, e.g. "imu0".
    pub name: String,
    /// Full endpoint directory, e.g. "/run/mpa/imu0/". Always ends in '/'.
    pub location: String,
    /// Payload type tag, e.g. "imu_data_t", "camera", "point_cloud".
    #[serde(rename = "type")]
    pub type_name: String,
    /// Name of the server process that created the endpoint.
    pub server_name: String,
    /// Kernel buffer size the server will give each client's data pipe.
    pub size_bytes: u32,
    /// Process ID of the server, for liveness checks.
    pub server_pid: i32,
    /// Commands the server understands on its control pipe, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_commands: Option<Vec<String>>,
}

impl EndpointInfo {
    pub fn new(name: &str, type_name: &str, server_name: &str) -> Self {
        EndpointInfo {
            name: name.to_string(),
            location: String::new(),
            type_name: type_name.to_string(),
            server_name: server_name.to_string(),
            size_bytes: paths::DEFAULT_PIPE_SIZE,
            server_pid: 0,
            available_commands: None,
        }
    }

    pub fn with_size(mut self, size_bytes: u32) -> Self {
        self.size_bytes = size_bytes;
        self
    }
}

/// Check whether an endpoint exists and its server can take attach requests.
///
/// Looks for the rendezvous pipe inside the endpoint directory, which only
/// the owning server creates.
pub fn endpoint_exists(name_or_location: &str) -> bool {
    let Ok(dir) = paths::expand_location(name_or_location) else {
        return false;
    };
    paths::request_path(&dir).exists()
}

/// Check whether an endpoint exists and publishes the desired payload type.
///
/// Returns false for a missing endpoint as well as a mismatched type; call
/// [`endpoint_exists`] first to tell the two apart.
pub fn endpoint_is_type(name_or_location: &str, desired_type: &str) -> bool {
    if !endpoint_exists(name_or_location) {
        return false;
    }
    match read_info(name_or_location) {
        Ok(info) => info.type_name == desired_type,
        Err(_) => false,
    }
}

/// Read and parse the `info` file into a typed descriptor.
///
/// This opens, reads, and closes a file, so keep it to one-off checks rather
/// than per-record hot paths.
pub fn read_info(name_or_location: &str) -> Result<EndpointInfo> {
    let dir = paths::expand_location(name_or_location)?;
    let raw = std::fs::read_to_string(paths::info_path(&dir))
        .map_err(|_| PipeError::InfoNotAvailable)?;
    serde_json::from_str(&raw).map_err(|e| {
        tracing::warn!("malformed info file in {}: {}", dir, e);
        PipeError::InfoNotAvailable
    })
}

/// Read the `info` file as a raw JSON document, vendor keys included.
pub fn read_info_json(name_or_location: &str) -> Result<serde_json::Value> {
    let dir = paths::expand_location(name_or_location)?;
    let raw = std::fs::read_to_string(paths::info_path(&dir))
        .map_err(|_| PipeError::InfoNotAvailable)?;
    serde_json::from_str(&raw).map_err(|e| {
        tracing::warn!("malformed info file in {}: {}", dir, e);
        PipeError::InfoNotAvailable
    })
}

pub(crate) fn write_info_json(dir: &str, json: &serde_json::Value) -> Result<()> {
    let path = paths::info_path(dir);
    let pretty = serde_json::to_string_pretty(json)
        .map_err(|e| PipeError::other(format!("failed to serialize info: {e}")))?;
    std::fs::write(&path, pretty).map_err(PipeError::FileIo)
}

/// What [`stop_server_process`] found at the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No live process owned the endpoint; any stale tree was swept.
    NotRunning,
    /// The server exited on SIGINT within the timeout.
    StoppedCleanly,
    /// The server ignored SIGINT and had to be killed.
    ForceKilled,
}

/// Safely shut down the server owning an endpoint and sweep its pipe tree.
///
/// Sends SIGINT to the PID advertised in the `info` file and polls for exit
/// for `timeout` (min 0.1 s, 2 s is usually good), escalating to SIGKILL if
/// the process will not die. Whatever happens to the process, a dangling
/// endpoint tree is removed so a replacement server can start cleanly.
pub fn stop_server_process(name_or_location: &str, timeout: Duration) -> Result<StopOutcome> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if timeout < Duration::from_millis(100) {
        return Err(PipeError::invalid_arg("timeout must be >= 0.1s"));
    }
    let dir = paths::expand_location(name_or_location)?;

    let pid = match read_info(&dir) {
        Ok(info) => info.server_pid,
        Err(_) => {
            // No readable descriptor. Nothing to stop, but a leftover tree
            // with no live owner is still worth sweeping.
            if paths::exists(&dir) {
                tracing::info!("sweeping ownerless endpoint {}", dir);
                paths::remove_recursive(&dir)?;
            }
            return Ok(StopOutcome::NotRunning);
        }
    };

    if pid == nix::unistd::getpid().as_raw() || !pid_is_alive(pid) {
        paths::remove_recursive(&dir)?;
        return Ok(StopOutcome::NotRunning);
    }

    tracing::info!("stopping server pid {} for endpoint {}", pid, dir);
    match kill(Pid::from_raw(pid), Signal::SIGINT) {
        Ok(()) => {}
        Err(nix::errno::Errno::EPERM) => {
            return Err(PipeError::other(format!(
                "insufficient permission to stop pid {pid}, it is probably running as root"
            )));
        }
        Err(_) => {
            paths::remove_recursive(&dir)?;
            return Ok(StopOutcome::NotRunning);
        }
    }

    if wait_for_exit(pid, timeout) {
        paths::remove_recursive(&dir)?;
        return Ok(StopOutcome::StoppedCleanly);
    }

    tracing::warn!("server pid {} ignored SIGINT, sending SIGKILL", pid);
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    if !wait_for_exit(pid, timeout) {
        return Err(PipeError::Timeout);
    }
    paths::remove_recursive(&dir)?;
    Ok(StopOutcome::ForceKilled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_endpoint(dir: &str, info: &EndpointInfo) {
        std::fs::create_dir_all(dir).unwrap();
        let json = serde_json::to_value(info).unwrap();
        write_info_json(&format!("{dir}/"), &json).unwrap();
    }

    #[test]
    fn test_info_json_round_trip() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("imu0");
        let dir_str = format!("{}/", dir.display());

        let mut info = EndpointInfo::new("imu0", "imu_data_t", "imu-server");
        info.location = dir_str.clone();
        info.server_pid = 1234;
        write_endpoint(dir.to_str().unwrap(), &info);

        let back = read_info(&dir_str).unwrap();
        assert_eq!(back.name, "imu0");
        assert_eq!(back.type_name, "imu_data_t");
        assert_eq!(back.server_name, "imu-server");
        assert_eq!(back.size_bytes, paths::DEFAULT_PIPE_SIZE);
        assert_eq!(back.server_pid, 1234);
        assert!(back.available_commands.is_none());
    }

    #[test]
    fn test_type_field_serializes_as_type() {
        let info = EndpointInfo::new("cam0", "camera", "cam-server");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "camera");
        assert!(json.get("type_name").is_none());
    }

    #[test]
    fn test_vendor_keys_survive_in_raw_json() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("cam0");
        let dir_str = format!("{}/", dir.display());

        let mut info = serde_json::to_value(EndpointInfo::new("cam0", "camera", "s")).unwrap();
        info["lens_cal"] = serde_json::json!({"fx": 500.0, "fy": 500.0});
        std::fs::create_dir_all(&dir).unwrap();
        write_info_json(&dir_str, &info).unwrap();

        let back = read_info_json(&dir_str).unwrap();
        assert_eq!(back["lens_cal"]["fx"], 500.0);
        // and the typed read still works with extra keys present
        assert_eq!(read_info(&dir_str).unwrap().name, "cam0");
    }

    #[test]
    fn test_missing_info_is_distinct_error() {
        let tmp = tempdir().unwrap();
        let dir_str = format!("{}/nothing/", tmp.path().display());
        let err = read_info(&dir_str).unwrap_err();
        assert_eq!(err.code(), -9);
    }

    #[test]
    fn test_endpoint_exists_needs_request_pipe() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("probe");
        let dir_str = format!("{}/", dir.display());
        std::fs::create_dir_all(&dir).unwrap();
        assert!(!endpoint_exists(&dir_str), "dir alone is not an endpoint");

        std::fs::write(dir.join("request"), b"").unwrap();
        assert!(endpoint_exists(&dir_str));
    }

    #[test]
    fn test_endpoint_is_type_matches_descriptor() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("tof0");
        let dir_str = format!("{}/", dir.display());

        let mut info = EndpointInfo::new("tof0", "point_cloud", "tof-server");
        info.location = dir_str.clone();
        write_endpoint(dir.to_str().unwrap(), &info);
        std::fs::write(dir.join("request"), b"").unwrap();

        assert!(endpoint_is_type(&dir_str, "point_cloud"));
        assert!(!endpoint_is_type(&dir_str, "camera"));
    }

    #[test]
    fn test_stop_rejects_tiny_timeout() {
        let err = stop_server_process("whatever", Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.code(), -6);
    }

    #[test]
    fn test_stop_sweeps_dead_endpoint() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("stale");
        let dir_str = format!("{}/", dir.display());

        // descriptor points at a PID that cannot be alive
        let mut info = EndpointInfo::new("stale", "text", "gone-server");
        info.location = dir_str.clone();
        info.server_pid = i32::MAX - 1;
        write_endpoint(dir.to_str().unwrap(), &info);
        std::fs::write(dir.join("request"), b"").unwrap();

        let outcome = stop_server_process(&dir_str, Duration::from_millis(200)).unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert!(!dir.exists(), "stale endpoint tree must be swept");
    }

    #[test]
    fn test_stop_sweeps_tree_without_descriptor() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("husk");
        let dir_str = format!("{}/", dir.display());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("request"), b"").unwrap();

        let outcome = stop_server_process(&dir_str, Duration::from_millis(200)).unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert!(!dir.exists());
    }
}
