//! Thin safe wrappers over the pipe-specific syscalls.
//!
//! Everything here is Linux-flavored: `F_GETPIPE_SZ`/`F_SETPIPE_SZ` for the
//! kernel buffer capacity, `FIONREAD` for the queued byte count that drives
//! back-pressure decisions, and an eventfd used to interrupt blocking reads.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Upper bound accepted for a requested pipe capacity (256 MiB).
pub const MAX_PIPE_SIZE: u32 = 256 * 1024 * 1024;

/// Requests below this floor fall back to [`crate::paths::DEFAULT_PIPE_SIZE`].
pub const MIN_PIPE_SIZE: u32 = 4 * 1024;

/// Cancellation primitive for the blocking reader threads.
///
/// Readers poll their pipe fd together with this eventfd; a `notify()` from
/// the closing thread wakes the poll immediately, which keeps cancellation
/// latency at one scheduler wakeup instead of a kill signal.
pub struct CancelEvent {
    fd: OwnedFd,
}

impl CancelEvent {
    pub fn new() -> io::Result<Self> {
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    /// Wake every poller waiting on this event.
    pub fn notify(&self) {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            tracing::error!(
                "failed to signal cancel event: {}",
                io::Error::last_os_error()
            );
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Outcome of waiting on a pipe fd with a cancellation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The pipe fd is readable (or hung up, which a read will report).
    Readable,
    /// The cancel event fired.
    Cancelled,
    /// The timeout elapsed with no activity.
    TimedOut,
}

/// Block until `fd` is readable or `cancel` fires.
///
/// `timeout` of `None` waits forever. EINTR is retried internally.
pub fn wait_readable(fd: RawFd, cancel: &CancelEvent, timeout: Option<Duration>) -> io::Result<Wait> {
    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
    };

    loop {
        let mut fds = [
            libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: cancel.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(Wait::TimedOut);
        }
        if fds[1].revents != 0 {
            return Ok(Wait::Cancelled);
        }
        return Ok(Wait::Readable);
    }
}

/// Sleep for `timeout`, returning early (true) if the cancel event fires.
pub fn cancellable_sleep(cancel: &CancelEvent, timeout: Duration) -> bool {
    let mut fds = [libc::pollfd {
        fd: cancel.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
    rc > 0
}

/// Number of bytes currently queued in the kernel buffer of a pipe.
pub fn bytes_in_pipe(fd: RawFd) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Kernel buffer capacity of a pipe.
pub fn get_pipe_size(fd: RawFd) -> io::Result<u32> {
    let rc = unsafe { libc::fcntl(fd, libc::F_GETPIPE_SZ) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as u32)
}

/// Ask the kernel to resize a pipe's buffer.
///
/// Returns the size the kernel reports after the call. A failed resize falls
/// back to re-querying with `F_GETPIPE_SZ`, since some kernels report 0 from
/// a failed `F_SETPIPE_SZ` instead of the retained capacity.
pub fn set_pipe_size(fd: RawFd, size_bytes: u32) -> io::Result<u32> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETPIPE_SZ, size_bytes as libc::c_int) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            tracing::warn!("insufficient permission for a {} byte pipe", size_bytes);
        }
        return Err(err);
    }
    if (rc as u32) < size_bytes || rc == 0 {
        return get_pipe_size(fd);
    }
    Ok(rc as u32)
}

/// The largest pipe an unprivileged process may request, as advertised by the
/// kernel, or 1 MiB when the proc file cannot be read.
pub fn system_max_pipe_size() -> u32 {
    std::fs::read_to_string("/proc/sys/fs/pipe-max-size")
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(crate::paths::DEFAULT_PIPE_SIZE)
}

/// Drain and discard everything currently queued in a pipe.
pub fn drain_pipe(file: &File) -> io::Result<usize> {
    use std::io::Read;

    let queued = bytes_in_pipe(file.as_raw_fd())?;
    if queued == 0 {
        return Ok(0);
    }
    let mut sink = vec![0u8; queued];
    let mut total = 0;
    while total < queued {
        let n = (&*file).read(&mut sink[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
