//! Process lifecycle helpers for server daemons.
//!
//! A pipe server is typically a long-running background process started at
//! boot. These helpers cover the standard shape of such a process: a
//! signal-driven shutdown flag for the main loop, a PID file so a new
//! instance (or [`crate::info::stop_server_process`]) can find and stop an
//! old one, and scheduling-priority setters for latency-sensitive pipelines.

use crate::errors::{PipeError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative shutdown flag for a server's main loop and worker threads.
///
/// SIGINT and SIGTERM request shutdown; SIGHUP (terminal closed) is ignored
/// so daemons survive their launching shell. All long-running loops should
/// poll [`ShutdownFlag::should_run`] and exit at the next suspension point.
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    /// Register the signal handlers and return the flag.
    pub fn install() -> Result<Self> {
        let requested = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGINT, Arc::clone(&requested))
            .map_err(PipeError::FileIo)?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&requested))
            .map_err(PipeError::FileIo)?;
        // carry on when the controlling terminal goes away
        unsafe { signal_hook::low_level::register(SIGHUP, || {}) }
            .map_err(PipeError::FileIo)?;
        Ok(Self { requested })
    }

    pub fn should_run(&self) -> bool {
        !self.requested.load(Ordering::Acquire)
    }

    /// Request shutdown from code, same effect as receiving SIGINT.
    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// Share the underlying flag with code that wants the raw atomic.
    pub fn raw(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.requested)
    }
}

fn pid_file_path(name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(PipeError::invalid_arg(
            "process name for PID file must be at least 1 character",
        ));
    }
    Ok(PathBuf::from(format!("/run/{name}.pid")))
}

/// Write the calling process's PID to `/run/<name>.pid`.
///
/// Fails if the file already exists; call [`kill_existing_process`] first so
/// a crashed predecessor's file gets cleaned up.
pub fn make_pid_file(name: &str) -> Result<()> {
    let path = pid_file_path(name)?;
    if path.exists() {
        return Err(PipeError::other(format!(
            "{} already exists, stop the existing instance first",
            path.display()
        )));
    }
    std::fs::write(&path, nix::unistd::getpid().as_raw().to_string()).map_err(PipeError::FileIo)
}

/// Remove this process's PID file. Missing file is success.
pub fn remove_pid_file(name: &str) -> Result<()> {
    let path = pid_file_path(name)?;
    if path.exists() {
        std::fs::remove_file(&path).map_err(PipeError::FileIo)?;
    }
    Ok(())
}

/// Result of asking an existing instance to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// No instance was running (stale files were cleaned up).
    NotRunning,
    /// The instance exited on SIGINT within the timeout.
    StoppedCleanly,
    /// The instance had to be killed with SIGKILL.
    ForceKilled,
}

pub(crate) fn pid_is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

pub(crate) fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    !pid_is_alive(pid)
}

/// Stop a previous instance of a process identified by its PID file.
///
/// Sends SIGINT, polls for exit every 100 ms up to `timeout` (min 0.1 s), and
/// escalates to SIGKILL if needed. Stale or unreadable PID files are removed.
pub fn kill_existing_process(name: &str, timeout: Duration) -> Result<KillOutcome> {
    if timeout < Duration::from_millis(100) {
        return Err(PipeError::invalid_arg("timeout must be >= 0.1s"));
    }
    let path = pid_file_path(name)?;
    if !path.exists() {
        return Ok(KillOutcome::NotRunning);
    }

    let old_pid = match std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
    {
        Some(pid) if pid > 0 => pid,
        _ => {
            tracing::warn!("PID file {} has invalid contents, removing it", path.display());
            let _ = std::fs::remove_file(&path);
            return Ok(KillOutcome::NotRunning);
        }
    };

    if old_pid == nix::unistd::getpid().as_raw() {
        return Ok(KillOutcome::NotRunning);
    }
    if !pid_is_alive(old_pid) {
        let _ = std::fs::remove_file(&path);
        return Ok(KillOutcome::NotRunning);
    }

    tracing::info!("existing instance of {} found, attempting to stop it", name);
    match kill(Pid::from_raw(old_pid), Signal::SIGINT) {
        Ok(()) => {}
        Err(nix::errno::Errno::EPERM) => {
            return Err(PipeError::other(format!(
                "insufficient permission to stop pid {old_pid}, it is probably running as root"
            )));
        }
        Err(_) => {
            let _ = std::fs::remove_file(&path);
            return Ok(KillOutcome::NotRunning);
        }
    }

    if wait_for_exit(old_pid, timeout) {
        let _ = std::fs::remove_file(&path);
        return Ok(KillOutcome::StoppedCleanly);
    }

    tracing::warn!("pid {} ignored SIGINT, sending SIGKILL", old_pid);
    let _ = kill(Pid::from_raw(old_pid), Signal::SIGKILL);
    if !wait_for_exit(old_pid, timeout) {
        return Err(PipeError::Timeout);
    }
    let _ = std::fs::remove_file(&path);
    Ok(KillOutcome::ForceKilled)
}

fn sched_params(priority: i32) -> Result<(libc::c_int, libc::sched_param)> {
    let policy = if priority == 0 {
        libc::SCHED_OTHER
    } else {
        let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
        let min = unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) };
        if priority < min || priority > max {
            return Err(PipeError::invalid_arg(format!(
                "priority must be between {min} and {max}"
            )));
        }
        libc::SCHED_FIFO
    };
    Ok((policy, libc::sched_param { sched_priority: priority }))
}

/// Set the scheduling policy for the whole process.
///
/// Priority 0 selects the default scheduler; 1-99 selects the real-time FIFO
/// scheduler. A refusal (common when launched from a console rather than as
/// a boot service) is logged but not fatal.
pub fn set_process_priority(priority: i32) -> Result<()> {
    let (policy, param) = sched_params(priority)?;
    let ret = unsafe { libc::sched_setscheduler(0, policy, &param) };
    if ret == -1 {
        tracing::warn!(
            "failed to set process priority {}: {}",
            priority,
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Set the scheduling policy for the calling thread.
pub fn set_thread_priority(priority: i32) -> Result<()> {
    let (policy, param) = sched_params(priority)?;
    let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) };
    if ret != 0 {
        tracing::warn!(
            "failed to set thread priority {}: errno {}",
            priority,
            ret
        );
    }
    Ok(())
}
