use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Retry a fallible operation at a fixed interval until it succeeds or the
/// attempts run out.
///
/// Pipe endpoints appear in the filesystem asynchronously (the peer may still
/// be mid-handshake), so every open in this workspace is a bounded poll
/// rather than a single try. The last error is returned when all attempts
/// are exhausted.
///
/// # Arguments
/// * `attempts` - Maximum number of tries (must be >= 1)
/// * `interval` - Sleep between tries
/// * `f` - The operation to retry
pub fn poll_until<F, T, E>(attempts: u32, interval: Duration, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < attempts {
                    std::thread::sleep(interval);
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt was made"))
}

/// Join a thread with a deadline.
///
/// std has no timed join, so this watches `is_finished()` and only calls
/// `join()` once the thread has actually returned. On timeout the handle is
/// dropped (the thread is detached) and a warning is logged; callers carry on
/// with cleanup either way, matching how the rest of this workspace treats a
/// wedged reader.
///
/// Returns true if the thread was joined within the deadline.
pub fn join_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!("timed out joining {} thread, detaching it", name);
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if let Err(e) = handle.join() {
        tracing::error!("{} thread panicked: {:?}", name, e);
    }
    true
}
