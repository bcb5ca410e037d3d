//! Server connection engine.
//!
//! A [`Server`] owns one endpoint directory: it advertises the descriptor,
//! listens for attach requests on the rendezvous pipe, gives every client its
//! own data pipe with a sized kernel buffer, and fans records out to all of
//! them with non-blocking writes. One misbehaving client can only lose its
//! own data; the server never blocks on a full pipe, it skips the record for
//! that client and moves on.
//!
//! Channel state lives in a fixed arena of slots addressed by index, with two
//! disjoint locks per channel: a lifecycle lock around structural changes
//! (create, attach, close) and one steady-state lock per client slot for the
//! write hot path. The fan-out writer takes one slot lock at a time and never
//! the lifecycle lock.

use crate::callbacks::CallbackSlot;
use crate::errors::{PipeError, Result};
use crate::framing::{
    self, CameraMeta, EncodedFrameKind, PointCloudMeta, IMAGE_FORMAT_H264, IMAGE_FORMAT_H265,
    MAGIC_NUMBER,
};
use crate::info::{write_info_json, EndpointInfo};
use crate::paths;
use crate::sys::{self, CancelEvent, Wait, MAX_PIPE_SIZE, MIN_PIPE_SIZE};
use nix::sys::stat::Mode;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

/// Number of server channels one process can run.
pub const MAX_CHANNELS: usize = 16;

/// Number of client slots per channel.
pub const MAX_CLIENTS_PER_CHANNEL: usize = 16;

const OPEN_ATTEMPTS: u32 = 500;
const OPEN_INTERVAL: Duration = Duration::from_millis(1);
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_CONTROL_PIPE_SIZE: u32 = 64 * 1024;
const DEFAULT_CONTROL_READ_BUF_SIZE: usize = 1024;
const REQUEST_READ_BUF_SIZE: usize = 256;

/// Attachment state of one server-side client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Slot has never been used.
    Unused,
    /// Data pipe is open but nothing has been delivered yet.
    Initialized,
    /// At least one record has been delivered.
    Connected,
    /// The client went away; the slot keeps its handle for a reconnect.
    Disconnected,
}

/// Options applied when creating a server endpoint.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Create and read the client-to-server command pipe.
    pub enable_control_pipe: bool,
    /// Legacy: also create `info` as a FIFO for pre-descriptor-file readers.
    pub enable_info_pipe: bool,
    /// Narrate every transition at debug level.
    pub debug_prints: bool,
    /// Kernel buffer capacity for the control pipe (0 picks 64 KiB).
    pub control_pipe_size: u32,
    /// Read buffer size for the control listener (0 picks 1 KiB).
    pub control_read_buf_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            enable_control_pipe: false,
            enable_info_pipe: false,
            debug_prints: false,
            control_pipe_size: 0,
            control_read_buf_size: 0,
        }
    }
}

type ServerClientCb = dyn FnMut(usize, usize, &str) + Send;
type ControlCb = dyn FnMut(usize, &[u8]) + Send;

struct ClientSlot {
    state: ClientState,
    name: String,
    path: PathBuf,
    file: Option<File>,
    /// Kernel capacity the data pipe actually has; the ceiling for
    /// back-pressure decisions.
    actual_pipe_size: u32,
    /// Whether this client has seen an I-frame since its last (re)connect
    /// or header, and may therefore receive P-frames.
    accepting_p_frames: bool,
}

impl ClientSlot {
    fn new() -> Self {
        ClientSlot {
            state: ClientState::Unused,
            name: String::new(),
            path: PathBuf::new(),
            file: None,
            actual_pipe_size: 0,
            accepting_p_frames: false,
        }
    }

    fn wipe(&mut self) {
        *self = ClientSlot::new();
    }
}

struct ChannelCore {
    dir: String,
    request_file: Arc<File>,
    control_file: Option<Arc<File>>,
    info: EndpointInfo,
    info_json: serde_json::Value,
    options: ServerOptions,
    /// Cached encoded-video header, replayed to every newly attached client.
    encoded_header: Option<(CameraMeta, Vec<u8>)>,
    cancel: Arc<CancelEvent>,
    request_thread: Option<thread::JoinHandle<()>>,
    control_thread: Option<thread::JoinHandle<()>>,
}

struct ServerChannel {
    claimed: AtomicBool,
    running: AtomicBool,
    debug: AtomicBool,
    n_clients: AtomicUsize,
    core: Mutex<Option<ChannelCore>>,
    clients: [Mutex<ClientSlot>; MAX_CLIENTS_PER_CHANNEL],
    connect_cb: CallbackSlot<ServerClientCb>,
    disconnect_cb: CallbackSlot<ServerClientCb>,
    control_cb: CallbackSlot<ControlCb>,
}

impl ServerChannel {
    fn new() -> Self {
        ServerChannel {
            claimed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            n_clients: AtomicUsize::new(0),
            core: Mutex::new(None),
            clients: std::array::from_fn(|_| Mutex::new(ClientSlot::new())),
            connect_cb: CallbackSlot::new(),
            disconnect_cb: CallbackSlot::new(),
            control_cb: CallbackSlot::new(),
        }
    }

    fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }
}

fn channels() -> &'static [ServerChannel; MAX_CHANNELS] {
    static TABLE: OnceLock<[ServerChannel; MAX_CHANNELS]> = OnceLock::new();
    TABLE.get_or_init(|| std::array::from_fn(|_| ServerChannel::new()))
}

// Protects the claimed flags of all channels so slot acquisition never
// contends with in-flight I/O.
static CLAIM_MTX: Mutex<()> = Mutex::new(());

fn check_channel(ch: usize) -> Result<()> {
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    Ok(())
}

fn check_client_id(id: usize) -> Result<()> {
    if id >= MAX_CLIENTS_PER_CHANNEL {
        return Err(PipeError::invalid_arg(format!(
            "client id must be below {MAX_CLIENTS_PER_CHANNEL}"
        )));
    }
    Ok(())
}

fn unclaim(ch: usize) {
    let _guard = CLAIM_MTX.lock().unwrap();
    channels()[ch].claimed.store(false, Ordering::Release);
}

/// Split a rendezvous read into sanitized handle strings.
///
/// Two clients racing the handshake can land in the same read, so every
/// NUL-terminated token is honored. Each token is truncated at the first
/// byte outside the printable range.
fn parse_requested_handles(buf: &[u8]) -> Vec<String> {
    buf.split(|&b| b == 0)
        .map(|token| {
            let end = token
                .iter()
                .position(|&b| !(32..=122).contains(&b))
                .unwrap_or(token.len());
            String::from_utf8_lossy(&token[..end]).into_owned()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn request_listener(ch: usize, file: Arc<File>, cancel: Arc<CancelEvent>) {
    let chan = &channels()[ch];
    let mut buf = [0u8; REQUEST_READ_BUF_SIZE];

    while chan.running.load(Ordering::Acquire) {
        match sys::wait_readable(file.as_raw_fd(), &cancel, None) {
            Ok(Wait::Readable) => {}
            Ok(Wait::Cancelled) => break,
            Ok(Wait::TimedOut) => continue,
            Err(e) => {
                tracing::error!("channel {} request listener poll failed: {}", ch, e);
                thread::sleep(Duration::from_millis(500));
                continue;
            }
        }

        let n = match (&*file).read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                if !chan.running.load(Ordering::Acquire) {
                    break;
                }
                tracing::error!("channel {} request listener read failed: {}", ch, e);
                thread::sleep(Duration::from_millis(500));
                continue;
            }
        };

        for handle in parse_requested_handles(&buf[..n]) {
            if let Err(e) = add_client(ch, &handle) {
                tracing::error!("channel {} failed to add client '{}': {}", ch, handle, e);
            }
        }
    }

    if chan.debug() {
        tracing::debug!("channel {} request thread closing", ch);
    }
}

fn control_listener(ch: usize, file: Arc<File>, cancel: Arc<CancelEvent>, buf_size: usize) {
    let chan = &channels()[ch];
    let mut buf = vec![0u8; buf_size];

    while chan.running.load(Ordering::Acquire) {
        match sys::wait_readable(file.as_raw_fd(), &cancel, None) {
            Ok(Wait::Readable) => {}
            Ok(Wait::Cancelled) => break,
            Ok(Wait::TimedOut) => continue,
            Err(e) => {
                tracing::error!("channel {} control listener poll failed: {}", ch, e);
                thread::sleep(Duration::from_millis(500));
                continue;
            }
        }

        let n = match (&*file).read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                if !chan.running.load(Ordering::Acquire) {
                    break;
                }
                tracing::error!("channel {} control listener read failed: {}", ch, e);
                thread::sleep(Duration::from_millis(500));
                continue;
            }
        };

        if !chan.running.load(Ordering::Acquire) {
            break;
        }
        if let Some(cb) = chan.control_cb.get() {
            let mut cb = cb.lock().unwrap();
            (*cb)(ch, &buf[..n]);
        }
    }

    if chan.debug() {
        tracing::debug!("channel {} control thread closing", ch);
    }
}

/// Attach a client by handle: reuse its old slot on reconnect, otherwise take
/// the next unused one, then create and open its data pipe.
fn add_client(ch: usize, name: &str) -> Result<usize> {
    let chan = &channels()[ch];
    if !chan.running.load(Ordering::Acquire) {
        return Err(PipeError::other(format!("channel {ch} not running")));
    }
    if name.is_empty() || name.len() >= paths::MAX_NAME_LEN {
        return Err(PipeError::invalid_arg(format!(
            "client name '{name}' is empty or too long"
        )));
    }

    let debug = chan.debug();
    let mut core_guard = chan.core.lock().unwrap();
    let Some(core) = core_guard.as_mut() else {
        return Err(PipeError::other(format!("channel {ch} has no endpoint")));
    };

    // a returning handle gets its old slot back
    let n_known = chan.n_clients.load(Ordering::Acquire);
    let mut reconnect_id = None;
    for id in 0..n_known {
        if chan.clients[id].lock().unwrap().name == name {
            reconnect_id = Some(id);
            break;
        }
    }
    if reconnect_id.is_none() && n_known >= MAX_CLIENTS_PER_CHANNEL {
        return Err(PipeError::other(format!(
            "channel {ch} has no free client slots"
        )));
    }
    if debug {
        match reconnect_id {
            Some(id) => tracing::debug!("client {} (id {}) reconnecting to channel {}", name, id, ch),
            None => tracing::debug!("new client {} on channel {}", name, ch),
        }
    }

    let path = PathBuf::from(format!("{}{}", core.dir, name));
    match nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o666)) {
        Ok(()) => {}
        Err(nix::errno::Errno::EEXIST) => {}
        Err(e) => return Err(PipeError::FileIo(e.into())),
    }

    // Nonblocking write-only opens fail until the client has the read end
    // open, so ride out the race with a bounded poll.
    let file = common::poll::poll_until(OPEN_ATTEMPTS, OPEN_INTERVAL, || {
        OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
    })
    .map_err(|e| {
        tracing::error!("removing data pipe {} nobody opened: {}", path.display(), e);
        let _ = std::fs::remove_file(&path);
        PipeError::FileIo(e)
    })?;

    // Size the kernel buffer; fall back to the system limit when the request
    // is refused, and trust only a re-queried value after a refusal.
    let requested = core.info.size_bytes;
    let achieved = match sys::set_pipe_size(file.as_raw_fd(), requested) {
        Ok(size) if size >= requested => size,
        other => {
            tracing::warn!(
                "channel {} could not get a {} byte pipe (got {:?}), falling back",
                ch,
                requested,
                other
            );
            let fallback = sys::system_max_pipe_size();
            core.info.size_bytes = fallback;
            sys::set_pipe_size(file.as_raw_fd(), fallback)
                .or_else(|_| sys::get_pipe_size(file.as_raw_fd()))
                .map_err(PipeError::FileIo)?
        }
    };
    if achieved == 0 {
        let _ = std::fs::remove_file(&path);
        return Err(PipeError::other("kernel reports a zero-capacity pipe"));
    }
    if debug {
        tracing::debug!("channel {} pipe size achieved {} requested {}", ch, achieved, requested);
    }

    let id = reconnect_id.unwrap_or(n_known);
    {
        let mut slot = chan.clients[id].lock().unwrap();
        slot.state = ClientState::Initialized;
        slot.name = name.to_string();
        slot.path = path;
        slot.file = Some(file);
        slot.actual_pipe_size = achieved;
        slot.accepting_p_frames = false;
    }
    if reconnect_id.is_none() {
        chan.n_clients.store(n_known + 1, Ordering::Release);
    }

    let replay = core.encoded_header.clone();
    drop(core_guard);

    if let Some(cb) = chan.connect_cb.get() {
        let mut cb = cb.lock().unwrap();
        (*cb)(ch, id, name);
    }

    // late joiners need the codec header before anything else
    if let Some((meta, header)) = replay {
        let _ = write_chunks_to_client(ch, id, &[framing::record_bytes(&meta), &header]);
    }

    Ok(id)
}

enum WriteOutcome {
    Written,
    /// Skipped for this client only; back-pressure or a partial transfer.
    Dropped,
    /// The write failed outright and the slot was transitioned.
    Disconnected,
}

/// Write one record (possibly scattered across chunks) to one client under
/// its slot lock, honoring the capacity pre-check.
fn locked_write(ch: usize, id: usize, slot: &mut ClientSlot, chunks: &[&[u8]]) -> WriteOutcome {
    let debug = channels()[ch].debug();
    let total: usize = chunks.iter().map(|c| c.len()).sum();

    let failed = {
        let Some(file) = slot.file.as_ref() else {
            return WriteOutcome::Dropped;
        };

        let queued = match sys::bytes_in_pipe(file.as_raw_fd()) {
            Ok(q) => q,
            Err(_) => return WriteOutcome::Dropped,
        };
        let room = (slot.actual_pipe_size as usize).saturating_sub(queued);
        if total > room {
            if debug {
                tracing::debug!(
                    "client {} pipe backed up ({} queued), dropping {} bytes",
                    slot.name,
                    queued,
                    total
                );
            }
            return WriteOutcome::Dropped;
        }

        let mut failed = false;
        for chunk in chunks {
            match (&*file).write(chunk) {
                Ok(n) if n == chunk.len() => {}
                Ok(n) => {
                    // capacity was pre-checked, so a short write is rare
                    tracing::warn!(
                        "partial write to client {} ({} of {} bytes), record dropped",
                        slot.name,
                        n,
                        chunk.len()
                    );
                    return WriteOutcome::Dropped;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if debug {
                        tracing::debug!("client {} pipe full, record dropped", slot.name);
                    }
                    return WriteOutcome::Dropped;
                }
                Err(e) => {
                    if debug {
                        tracing::debug!("write to client {} failed: {}", slot.name, e);
                    }
                    failed = true;
                    break;
                }
            }
        }
        failed
    };

    if failed {
        // most likely the client closed its read end
        slot.state = ClientState::Disconnected;
        slot.file = None;
        slot.accepting_p_frames = false;
        let _ = std::fs::remove_file(&slot.path);
        WriteOutcome::Disconnected
    } else {
        slot.state = ClientState::Connected;
        WriteOutcome::Written
    }
}

/// Write to one client, invoking the disconnect callback outside the lock if
/// the write reveals the client is gone.
fn write_chunks_to_client(ch: usize, id: usize, chunks: &[&[u8]]) -> Result<bool> {
    let chan = &channels()[ch];

    let (outcome, name) = {
        let mut slot = chan.clients[id].lock().unwrap();
        if slot.state == ClientState::Disconnected || slot.file.is_none() {
            return Err(PipeError::NotConnected);
        }
        let outcome = locked_write(ch, id, &mut slot, chunks);
        (outcome, slot.name.clone())
    };

    match outcome {
        WriteOutcome::Written => Ok(true),
        WriteOutcome::Dropped => Ok(false),
        WriteOutcome::Disconnected => {
            if let Some(cb) = chan.disconnect_cb.get() {
                let mut cb = cb.lock().unwrap();
                (*cb)(ch, id, &name);
            }
            Err(PipeError::other(format!("client {name} disconnected")))
        }
    }
}

/// Frame gating applied during an encoded-video fan-out.
#[derive(Clone, Copy, PartialEq)]
enum FanoutGate {
    All,
    /// Only clients whose accepting-P flag is set.
    AcceptingP,
    /// Everyone, and set the accepting-P flag on successful delivery.
    SetAcceptingP,
    /// Everyone, and clear the accepting-P flag (a new header resets GOPs).
    ClearAcceptingP,
}

fn fanout_chunks(ch: usize, chunks: &[&[u8]], gate: FanoutGate) {
    let chan = &channels()[ch];
    let n = chan.n_clients.load(Ordering::Acquire);

    for id in 0..n {
        let (outcome, name) = {
            let mut slot = chan.clients[id].lock().unwrap();
            if slot.state == ClientState::Disconnected || slot.file.is_none() {
                continue;
            }
            if gate == FanoutGate::AcceptingP && !slot.accepting_p_frames {
                continue;
            }
            let outcome = locked_write(ch, id, &mut slot, chunks);
            if let WriteOutcome::Written = outcome {
                match gate {
                    FanoutGate::SetAcceptingP => slot.accepting_p_frames = true,
                    FanoutGate::ClearAcceptingP => slot.accepting_p_frames = false,
                    _ => {}
                }
            }
            (outcome, slot.name.clone())
        };

        if let WriteOutcome::Disconnected = outcome {
            if let Some(cb) = chan.disconnect_cb.get() {
                let mut cb = cb.lock().unwrap();
                (*cb)(ch, id, &name);
            }
        }
    }
}

fn close_channel(ch: usize) {
    let chan = &channels()[ch];
    if !chan.running.swap(false, Ordering::AcqRel) {
        // never ran (or already closed); just release any claim
        unclaim(ch);
        return;
    }

    chan.connect_cb.clear();
    chan.disconnect_cb.clear();
    chan.control_cb.clear();

    // wake and join the listeners before taking the lifecycle lock; a
    // listener mid-attach holds that lock and must be able to finish
    let threads = {
        let mut core_guard = chan.core.lock().unwrap();
        core_guard.as_mut().map(|core| {
            core.cancel.notify();
            (core.request_thread.take(), core.control_thread.take())
        })
    };
    if let Some((request_thread, control_thread)) = threads {
        if let Some(handle) = request_thread {
            common::poll::join_timeout(handle, JOIN_TIMEOUT, "request listener");
        }
        if let Some(handle) = control_thread {
            common::poll::join_timeout(handle, JOIN_TIMEOUT, "control listener");
        }
    }

    let mut core_guard = chan.core.lock().unwrap();
    if let Some(core) = core_guard.take() {
        for slot in &chan.clients {
            slot.lock().unwrap().wipe();
        }
        chan.n_clients.store(0, Ordering::Release);

        // dropping the core closes the rendezvous/control fds, then the
        // whole endpoint tree goes away
        let dir = core.dir.clone();
        drop(core);
        let _ = paths::remove_recursive(&dir);
    }
    drop(core_guard);

    chan.debug.store(false, Ordering::Relaxed);
    unclaim(ch);
}

/// One published endpoint. Closing (or dropping) removes the endpoint tree
/// from the filesystem.
#[derive(Debug)]
pub struct Server {
    ch: usize,
}

impl Server {
    /// Create an endpoint on the next unclaimed channel.
    pub fn create(info: EndpointInfo, options: ServerOptions) -> Result<Server> {
        let ch = {
            let _guard = CLAIM_MTX.lock().unwrap();
            let Some(ch) = (0..MAX_CHANNELS)
                .find(|&ch| !channels()[ch].claimed.load(Ordering::Acquire))
            else {
                return Err(PipeError::other("all server channels are claimed"));
            };
            channels()[ch].claimed.store(true, Ordering::Release);
            ch
        };
        Self::setup(ch, info, options).inspect_err(|_| unclaim(ch))
    }

    /// Create an endpoint on a specific channel index.
    pub fn create_on(ch: usize, info: EndpointInfo, options: ServerOptions) -> Result<Server> {
        check_channel(ch)?;
        let was_claimed = {
            let _guard = CLAIM_MTX.lock().unwrap();
            channels()[ch].claimed.swap(true, Ordering::AcqRel)
        };
        let result = if channels()[ch].running.load(Ordering::Acquire) {
            Err(PipeError::other(format!("channel {ch} already running")))
        } else {
            Self::setup(ch, info, options)
        };
        result.inspect_err(|_| {
            if !was_claimed {
                unclaim(ch);
            }
        })
    }

    fn setup(ch: usize, mut info: EndpointInfo, mut options: ServerOptions) -> Result<Server> {
        let chan = &channels()[ch];

        if info.name.is_empty() {
            return Err(PipeError::invalid_arg("pipe name must not be empty"));
        }
        if info.name.contains('/') {
            return Err(PipeError::invalid_arg("pipe name can't contain '/'"));
        }
        if info.name.contains("unknown") {
            return Err(PipeError::invalid_arg("pipe name can't be 'unknown'"));
        }

        let dir = if info.location.starts_with('/') {
            paths::expand_location(&info.location)?
        } else {
            paths::expand_location(&info.name)?
        };
        info.location = dir.clone();
        info.server_pid = nix::unistd::getpid().as_raw();

        if info.size_bytes < MIN_PIPE_SIZE {
            tracing::warn!(
                "requested pipe size {} below 4k, using default of 1M",
                info.size_bytes
            );
            info.size_bytes = paths::DEFAULT_PIPE_SIZE;
        }
        if info.size_bytes > MAX_PIPE_SIZE {
            tracing::warn!("pipe sizes over 256MiB probably won't work");
        }
        if options.control_pipe_size == 0 {
            options.control_pipe_size = DEFAULT_CONTROL_PIPE_SIZE;
        }
        if options.control_read_buf_size == 0 {
            options.control_read_buf_size = DEFAULT_CONTROL_READ_BUF_SIZE;
        }

        // refuse a directory another channel already publishes
        for (other, other_chan) in channels().iter().enumerate() {
            if other == ch {
                continue;
            }
            if let Some(other_core) = other_chan.core.lock().unwrap().as_ref() {
                if other_core.dir == dir {
                    return Err(PipeError::invalid_arg(format!(
                        "{dir} already in use by channel {other}"
                    )));
                }
            }
        }

        // a dead client must never take the server down with it
        unsafe {
            use nix::sys::signal::{signal, SigHandler, Signal};
            signal(Signal::SIGPIPE, SigHandler::SigIgn)
                .map_err(|e| PipeError::other(format!("failed to ignore SIGPIPE: {e}")))?;
        }

        paths::mkdir_recursive(&dir)?;

        let info_json = serde_json::to_value(&info)
            .map_err(|e| PipeError::other(format!("failed to build info json: {e}")))?;
        write_info_json(&dir, &info_json)?;

        let request_path = paths::request_path(&dir);
        match nix::unistd::mkfifo(&request_path, Mode::from_bits_truncate(0o666)) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(PipeError::FileIo(e.into())),
        }
        // read-write even though we never write: a FIFO with no writer
        // reports end-of-file to readers, and this keeps that from happening
        let request_file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&request_path)
                .map_err(PipeError::FileIo)?,
        );

        let control_file = if options.enable_control_pipe {
            let control_path = paths::control_path(&dir);
            match nix::unistd::mkfifo(&control_path, Mode::from_bits_truncate(0o666)) {
                Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
                Err(e) => return Err(PipeError::FileIo(e.into())),
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&control_path)
                .map_err(PipeError::FileIo)?;
            let achieved = sys::set_pipe_size(file.as_raw_fd(), options.control_pipe_size)
                .map_err(PipeError::FileIo)?;
            if achieved < options.control_pipe_size {
                return Err(PipeError::other(format!(
                    "failed to set control pipe size to {}",
                    options.control_pipe_size
                )));
            }
            Some(Arc::new(file))
        } else {
            None
        };

        if options.enable_info_pipe {
            match nix::unistd::mkfifo(&paths::info_path(&dir), Mode::from_bits_truncate(0o666)) {
                Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
                Err(e) => return Err(PipeError::FileIo(e.into())),
            }
        }

        let cancel = Arc::new(CancelEvent::new().map_err(PipeError::FileIo)?);
        chan.debug.store(options.debug_prints, Ordering::Relaxed);
        chan.running.store(true, Ordering::Release);

        let request_thread = {
            let file = Arc::clone(&request_file);
            let cancel = Arc::clone(&cancel);
            thread::Builder::new()
                .name(format!("pipe-request-{ch}"))
                .spawn(move || request_listener(ch, file, cancel))
                .map_err(|e| {
                    chan.running.store(false, Ordering::Release);
                    PipeError::FileIo(e)
                })?
        };
        let control_thread = match &control_file {
            Some(file) => {
                let file = Arc::clone(file);
                let listener_cancel = Arc::clone(&cancel);
                let buf_size = options.control_read_buf_size;
                let spawned = thread::Builder::new()
                    .name(format!("pipe-control-{ch}"))
                    .spawn(move || control_listener(ch, file, listener_cancel, buf_size));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        chan.running.store(false, Ordering::Release);
                        cancel.notify();
                        common::poll::join_timeout(request_thread, JOIN_TIMEOUT, "request listener");
                        return Err(PipeError::FileIo(e));
                    }
                }
            }
            None => None,
        };

        *chan.core.lock().unwrap() = Some(ChannelCore {
            dir,
            request_file,
            control_file,
            info,
            info_json,
            options,
            encoded_header: None,
            cancel,
            request_thread: Some(request_thread),
            control_thread,
        });

        Ok(Server { ch })
    }

    /// The channel index backing this endpoint.
    pub fn channel(&self) -> usize {
        self.ch
    }

    /// The endpoint directory, e.g. `/run/mpa/imu0/`.
    pub fn location(&self) -> Result<String> {
        self.with_core(|core| core.dir.clone())
    }

    fn with_core<T>(&self, f: impl FnOnce(&mut ChannelCore) -> T) -> Result<T> {
        let mut guard = channels()[self.ch].core.lock().unwrap();
        match guard.as_mut() {
            Some(core) => Ok(f(core)),
            None => Err(PipeError::other("endpoint is closed")),
        }
    }

    /// Register a handler invoked when a client attaches.
    pub fn set_connect_callback(
        &self,
        cb: impl FnMut(usize, usize, &str) + Send + 'static,
    ) {
        channels()[self.ch].connect_cb.set(Box::new(cb));
    }

    /// Register a handler invoked when a client's write path fails.
    pub fn set_disconnect_callback(
        &self,
        cb: impl FnMut(usize, usize, &str) + Send + 'static,
    ) {
        channels()[self.ch].disconnect_cb.set(Box::new(cb));
    }

    /// Register a handler for bytes arriving on the control pipe.
    pub fn set_control_callback(&self, cb: impl FnMut(usize, &[u8]) + Send + 'static) {
        channels()[self.ch].control_cb.set(Box::new(cb));
    }

    /// Fan one record out to all attached clients.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(PipeError::invalid_arg("nothing to write"));
        }
        fanout_chunks(self.ch, &[data], FanoutGate::All);
        Ok(())
    }

    /// Fan a string out to all clients, including its terminating NUL.
    ///
    /// The string and its NUL go out as one write so readers see whole
    /// records.
    pub fn write_string(&self, s: &str) -> Result<()> {
        if s.is_empty() {
            return Err(PipeError::invalid_arg("got empty string"));
        }
        let mut record = Vec::with_capacity(s.len() + 1);
        record.extend_from_slice(s.as_bytes());
        record.push(0);
        fanout_chunks(self.ch, &[&record], FanoutGate::All);
        Ok(())
    }

    /// Fan a scattered record out to all clients; the chunks are delivered
    /// back to back under one capacity check per client.
    pub fn write_list(&self, chunks: &[&[u8]]) -> Result<()> {
        if chunks.is_empty() || chunks.iter().any(|c| c.is_empty()) {
            return Err(PipeError::invalid_arg("each chunk needs at least 1 byte"));
        }
        fanout_chunks(self.ch, chunks, FanoutGate::All);
        Ok(())
    }

    /// Write one record to a single client.
    ///
    /// Returns `Ok(true)` when delivered and `Ok(false)` when dropped by
    /// back-pressure for this client.
    pub fn write_to_client(&self, client_id: usize, data: &[u8]) -> Result<bool> {
        check_client_id(client_id)?;
        if data.is_empty() {
            return Err(PipeError::invalid_arg("nothing to write"));
        }
        write_chunks_to_client(self.ch, client_id, &[data])
    }

    /// Publish a camera frame: metadata record then payload.
    ///
    /// H264/H265 streams get the codec-aware treatment: headers are cached
    /// and replayed to late joiners, and a client receives no P-frame before
    /// its reference I-frame.
    pub fn write_camera_frame(&self, mut meta: CameraMeta, data: &[u8]) -> Result<()> {
        let size = meta.size_bytes;
        if size <= 0 || data.len() != size as usize {
            return Err(PipeError::invalid_arg(format!(
                "payload of {} bytes does not match size_bytes {}",
                data.len(),
                size
            )));
        }
        meta.magic_number = MAGIC_NUMBER;

        let format = meta.format;
        if format == IMAGE_FORMAT_H264 || format == IMAGE_FORMAT_H265 {
            match framing::classify_encoded_frame(format, data) {
                Some(EncodedFrameKind::Header) => {
                    self.with_core(|core| {
                        core.encoded_header = Some((meta, data.to_vec()));
                    })?;
                    // a new header starts a new sequence for everyone
                    fanout_chunks(
                        self.ch,
                        &[framing::record_bytes(&meta), data],
                        FanoutGate::ClearAcceptingP,
                    );
                    return Ok(());
                }
                Some(EncodedFrameKind::Intra) => {
                    fanout_chunks(
                        self.ch,
                        &[framing::record_bytes(&meta), data],
                        FanoutGate::SetAcceptingP,
                    );
                    return Ok(());
                }
                Some(EncodedFrameKind::Predicted) => {
                    fanout_chunks(
                        self.ch,
                        &[framing::record_bytes(&meta), data],
                        FanoutGate::AcceptingP,
                    );
                    return Ok(());
                }
                // unclassifiable (B?) frames already warned; send them plain
                None => {}
            }
        }

        fanout_chunks(self.ch, &[framing::record_bytes(&meta), data], FanoutGate::All);
        Ok(())
    }

    /// Publish a stereo pair: metadata, then left and right halves.
    pub fn write_stereo_frame(
        &self,
        mut meta: CameraMeta,
        left: &[u8],
        right: &[u8],
    ) -> Result<()> {
        let size = meta.size_bytes;
        if size <= 0 || size % 2 != 0 {
            return Err(PipeError::invalid_arg(
                "stereo size_bytes must be positive and even",
            ));
        }
        let half = size as usize / 2;
        if left.len() != half || right.len() != half {
            return Err(PipeError::invalid_arg(
                "left and right must each be half of size_bytes",
            ));
        }
        meta.magic_number = MAGIC_NUMBER;
        fanout_chunks(
            self.ch,
            &[framing::record_bytes(&meta), left, right],
            FanoutGate::All,
        );
        Ok(())
    }

    /// Publish a point cloud: metadata, then the points.
    pub fn write_point_cloud(&self, mut meta: PointCloudMeta, data: &[u8]) -> Result<()> {
        let expected = framing::point_cloud_size_bytes(&meta)?;
        if data.len() != expected {
            return Err(PipeError::invalid_arg(format!(
                "payload of {} bytes does not match metadata ({} expected)",
                data.len(),
                expected
            )));
        }
        meta.magic_number = MAGIC_NUMBER;
        fanout_chunks(
            self.ch,
            &[framing::record_bytes(&meta), data],
            FanoutGate::All,
        );
        Ok(())
    }

    /// Number of clients currently attached (Initialized or Connected).
    pub fn num_clients(&self) -> usize {
        let chan = &channels()[self.ch];
        let n = chan.n_clients.load(Ordering::Acquire);
        (0..n)
            .filter(|&id| {
                let slot = chan.clients[id].lock().unwrap();
                matches!(
                    slot.state,
                    ClientState::Initialized | ClientState::Connected
                )
            })
            .count()
    }

    /// Attachment state of a client slot.
    pub fn client_state(&self, client_id: usize) -> Result<ClientState> {
        check_client_id(client_id)?;
        Ok(channels()[self.ch].clients[client_id].lock().unwrap().state)
    }

    /// Handle registered in a client slot, if any.
    pub fn client_name(&self, client_id: usize) -> Result<Option<String>> {
        check_client_id(client_id)?;
        let slot = channels()[self.ch].clients[client_id].lock().unwrap();
        Ok((!slot.name.is_empty()).then(|| slot.name.clone()))
    }

    /// Slot index registered for a handle, if any.
    pub fn client_id_for_name(&self, name: &str) -> Option<usize> {
        let chan = &channels()[self.ch];
        let n = chan.n_clients.load(Ordering::Acquire);
        (0..n).find(|&id| chan.clients[id].lock().unwrap().name == name)
    }

    /// Bytes currently queued in a client's data pipe.
    pub fn bytes_in_pipe(&self, client_id: usize) -> Result<usize> {
        check_client_id(client_id)?;
        let slot = channels()[self.ch].clients[client_id].lock().unwrap();
        let file = slot.file.as_ref().ok_or(PipeError::NotConnected)?;
        sys::bytes_in_pipe(file.as_raw_fd()).map_err(PipeError::FileIo)
    }

    /// Kernel buffer capacity of a client's data pipe.
    pub fn pipe_size(&self, client_id: usize) -> Result<u32> {
        check_client_id(client_id)?;
        let slot = channels()[self.ch].clients[client_id].lock().unwrap();
        let file = slot.file.as_ref().ok_or(PipeError::NotConnected)?;
        sys::get_pipe_size(file.as_raw_fd()).map_err(PipeError::FileIo)
    }

    /// Resize a client's data pipe, returning the capacity actually granted.
    pub fn set_pipe_size(&self, client_id: usize, size_bytes: u32) -> Result<u32> {
        check_client_id(client_id)?;
        let mut slot = channels()[self.ch].clients[client_id].lock().unwrap();
        let file = slot.file.as_ref().ok_or(PipeError::NotConnected)?;
        let achieved = sys::set_pipe_size(file.as_raw_fd(), size_bytes)
            .or_else(|_| sys::get_pipe_size(file.as_raw_fd()))
            .map_err(PipeError::FileIo)?;
        slot.actual_pipe_size = achieved;
        Ok(achieved)
    }

    /// Advertise the commands the control pipe understands.
    pub fn set_available_commands(&self, commands: &[&str]) -> Result<()> {
        self.with_core(|core| {
            let list: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
            core.info.available_commands = Some(list.clone());
            core.info_json["available_commands"] = serde_json::json!(list);
            write_info_json(&core.dir, &core.info_json)
        })?
    }

    /// Mutate the descriptor JSON (vendor keys welcome) and rewrite `info`.
    pub fn update_info(&self, f: impl FnOnce(&mut serde_json::Value)) -> Result<()> {
        self.with_core(|core| {
            f(&mut core.info_json);
            write_info_json(&core.dir, &core.info_json)
        })?
    }

    /// A copy of the descriptor this endpoint advertises.
    pub fn info(&self) -> Result<EndpointInfo> {
        self.with_core(|core| core.info.clone())
    }

    /// Tear the endpoint down: stop the listeners, close every pipe, and
    /// remove the endpoint tree.
    pub fn close(self) {
        // Drop does the work
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        close_channel(self.ch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requested_handles_single() {
        assert_eq!(parse_requested_handles(b"viewer0\0"), vec!["viewer0"]);
    }

    #[test]
    fn test_parse_requested_handles_multiple_tokens() {
        assert_eq!(
            parse_requested_handles(b"alpha0\0beta0\0"),
            vec!["alpha0", "beta0"],
            "racing handshakes can share one read"
        );
    }

    #[test]
    fn test_parse_requested_handles_sanitizes_garbage() {
        assert_eq!(parse_requested_handles(b"log\x01ger0\0"), vec!["log"]);
        assert!(parse_requested_handles(b"\0\0\0").is_empty());
        assert!(parse_requested_handles(b"\x07\x07\0").is_empty());
    }

    #[test]
    fn test_create_rejects_bad_names() {
        let bad = ["", "a/b", "unknown", "very-unknown-name"];
        for name in bad {
            let err = Server::create(
                EndpointInfo::new(name, "text", "test-server"),
                ServerOptions::default(),
            )
            .unwrap_err();
            assert_eq!(err.code(), -6, "name {name:?} should be rejected");
        }
    }

    #[test]
    fn test_create_on_rejects_out_of_bounds_channel() {
        let err = Server::create_on(
            MAX_CHANNELS,
            EndpointInfo::new("oob", "text", "test-server"),
            ServerOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.code(), -10);
    }
}
