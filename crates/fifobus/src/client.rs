//! Client attach engine.
//!
//! A [`Client`] rendezvouses with a server through the endpoint's `request`
//! pipe, receives its own uniquely-named data pipe, and (in the helper modes)
//! owns a background reader that parses the stream and hands records to
//! caller-supplied callbacks. When the server goes away the helper closes up,
//! reports the disconnect, and quietly retries until the server is back,
//! unless auto-reconnect is disabled.

use crate::callbacks::CallbackSlot;
use crate::errors::{PipeError, Result};
use crate::framing::{self, CameraMeta, PointCloudMeta, MAGIC_NUMBER};
use crate::info::EndpointInfo;
use crate::lifecycle;
use crate::paths;
use crate::sys::{self, CancelEvent, Wait};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

/// Number of client channels one process can run. Clients are cheap, so the
/// table is much larger than the server's.
pub const MAX_CHANNELS: usize = 128;

/// How many suffix digits are tried when picking a unique handle.
const MAX_NAME_ATTEMPTS: usize = 8;

const OPEN_ATTEMPTS: u32 = 500;
const OPEN_INTERVAL: Duration = Duration::from_millis(1);
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Background reader flavor. Each parses the stream differently before
/// dispatching to its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperMode {
    /// Deliver whatever a single read returns.
    Simple,
    /// Parse a camera metadata record, then read the frame it describes.
    Camera,
    /// Parse a point-cloud metadata record, then read the points.
    PointCloud,
}

/// Options applied when opening a client channel.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Background reader mode; `None` means the caller reads manually.
    pub helper: Option<HelperMode>,
    /// Give up after one failed connection instead of retrying forever.
    pub disable_auto_reconnect: bool,
    /// Open the channel without connecting; `resume()` connects later.
    pub start_paused: bool,
    /// Narrate every transition at debug level.
    pub debug_prints: bool,
    /// Scheduling priority for the helper thread (0 = default, 1-99 = RT).
    pub helper_priority: i32,
}

type SimpleCb = dyn FnMut(usize, &[u8]) + Send;
type CameraCb = dyn FnMut(usize, &CameraMeta, &[u8]) + Send;
type PointCloudCb = dyn FnMut(usize, &PointCloudMeta, &[u8]) + Send;
type PresenceCb = dyn FnMut(usize) + Send;

struct ClientCore {
    dir: String,
    name: String,
    data_path: PathBuf,
    data_file: Option<Arc<File>>,
    control_file: Option<File>,
    buf_len: usize,
    options: ClientOptions,
    cancel: Arc<CancelEvent>,
}

struct HelperHandle {
    handle: thread::JoinHandle<()>,
    thread_id: thread::ThreadId,
}

struct ClientChannel {
    claimed: AtomicBool,
    running: AtomicBool,
    debug: AtomicBool,
    core: Mutex<Option<ClientCore>>,
    helper: Mutex<Option<HelperHandle>>,
    simple_cb: CallbackSlot<SimpleCb>,
    camera_cb: CallbackSlot<CameraCb>,
    point_cloud_cb: CallbackSlot<PointCloudCb>,
    connect_cb: CallbackSlot<PresenceCb>,
    disconnect_cb: CallbackSlot<PresenceCb>,
}

impl ClientChannel {
    fn new() -> Self {
        ClientChannel {
            claimed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            core: Mutex::new(None),
            helper: Mutex::new(None),
            simple_cb: CallbackSlot::new(),
            camera_cb: CallbackSlot::new(),
            point_cloud_cb: CallbackSlot::new(),
            connect_cb: CallbackSlot::new(),
            disconnect_cb: CallbackSlot::new(),
        }
    }

    fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }
}

fn channels() -> &'static [ClientChannel; MAX_CHANNELS] {
    static TABLE: OnceLock<[ClientChannel; MAX_CHANNELS]> = OnceLock::new();
    TABLE.get_or_init(|| std::array::from_fn(|_| ClientChannel::new()))
}

static CLAIM_MTX: Mutex<()> = Mutex::new(());

fn unclaim(ch: usize) {
    let _guard = CLAIM_MTX.lock().unwrap();
    channels()[ch].claimed.store(false, Ordering::Release);
}

/// Sweep a dead server's endpoint tree, but only after confirming the PID it
/// advertised really is gone. A live server cleans up after itself; only a
/// crashed one needs the favor.
fn sweep_dead_endpoint(dir: &str) {
    match crate::info::read_info(dir) {
        Ok(info) if lifecycle::pid_is_alive(info.server_pid) => {
            tracing::warn!(
                "request pipe in {} is broken but pid {} is alive, leaving it alone",
                dir,
                info.server_pid
            );
        }
        _ => {
            tracing::warn!("server for {} is gone, sweeping its pipes", dir);
            let _ = paths::remove_recursive(dir);
        }
    }
}

/// One rendezvous handshake: pick a free suffixed handle, announce it on the
/// request pipe, and open the data pipe the server creates in response.
fn connect_to_server(ch: usize) -> Result<()> {
    let chan = &channels()[ch];
    let debug = chan.debug();

    {
        let mut core_guard = chan.core.lock().unwrap();
        let Some(core) = core_guard.as_mut() else {
            return Err(PipeError::other("channel has not been opened"));
        };

        let request_path = paths::request_path(&core.dir);
        if !request_path.exists() {
            return Err(PipeError::ServerNotAvailable);
        }

        // find the next free index for this name: viewer0, viewer1, ...
        let mut chosen = None;
        for i in 0..MAX_NAME_ATTEMPTS {
            let handle = format!("{}{}", core.name, i);
            let candidate = PathBuf::from(format!("{}{}", core.dir, handle));
            if !candidate.exists() {
                chosen = Some((handle, candidate));
                break;
            }
        }
        let Some((handle, data_path)) = chosen else {
            return Err(PipeError::ReachedMaxNameIndex);
        };
        if debug {
            tracing::debug!("requesting handle {} at {}", handle, data_path.display());
        }

        let request_file = match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&request_path)
        {
            Ok(f) => f,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                // no reader on the request pipe: the server stopped without
                // cleaning up
                sweep_dead_endpoint(&core.dir);
                return Err(PipeError::FileIo(e));
            }
            Err(e) => return Err(PipeError::FileIo(e)),
        };

        let mut announcement = handle.clone().into_bytes();
        announcement.push(0);
        (&request_file)
            .write_all(&announcement)
            .map_err(PipeError::FileIo)?;
        drop(request_file);

        // the control pipe is optional; only its absence is fine
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(paths::control_path(&core.dir))
        {
            Ok(f) => core.control_file = Some(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipeError::FileIo(e)),
        }

        // wait for the server to service the request and create our pipe
        let data_file = common::poll::poll_until(OPEN_ATTEMPTS, OPEN_INTERVAL, || {
            OpenOptions::new().read(true).open(&data_path)
        })
        .map_err(|_| {
            core.control_file = None;
            PipeError::Timeout
        })?;

        core.data_path = data_path;
        core.data_file = Some(Arc::new(data_file));
        if debug {
            tracing::debug!("channel {} connected as {}", ch, handle);
        }
    }

    if let Some(cb) = chan.connect_cb.get() {
        let mut cb = cb.lock().unwrap();
        (*cb)(ch);
    }
    Ok(())
}

enum ReadStatus {
    Data(usize),
    Disconnected,
    Cancelled,
}

/// Cancellable blocking read from the data pipe.
fn read_pipe(ch: usize, file: &File, cancel: &CancelEvent, buf: &mut [u8]) -> ReadStatus {
    let chan = &channels()[ch];

    match sys::wait_readable(file.as_raw_fd(), cancel, None) {
        Ok(Wait::Readable) => {}
        Ok(Wait::Cancelled) => return ReadStatus::Cancelled,
        Ok(Wait::TimedOut) => return ReadStatus::Cancelled,
        Err(_) => return ReadStatus::Disconnected,
    }

    let result = (&*file).read(buf);
    if !chan.running.load(Ordering::Acquire) {
        return ReadStatus::Cancelled;
    }
    match result {
        Ok(0) | Err(_) => ReadStatus::Disconnected,
        Ok(n) => ReadStatus::Data(n),
    }
}

/// Close the pipe fds and report the disconnect. With auto-reconnect off the
/// helper has nothing left to do and stops running.
fn handle_disconnect(ch: usize, auto_reconnect: bool) {
    let chan = &channels()[ch];
    if chan.debug() {
        tracing::debug!("channel {} server disconnected", ch);
    }
    {
        let mut core_guard = chan.core.lock().unwrap();
        if let Some(core) = core_guard.as_mut() {
            core.data_file = None;
            core.control_file = None;
        }
    }
    if let Some(cb) = chan.disconnect_cb.get() {
        let mut cb = cb.lock().unwrap();
        (*cb)(ch);
    }
    if !auto_reconnect {
        chan.running.store(false, Ordering::Release);
    }
}

fn flush_data_pipe(file: &File) {
    if let Err(e) = sys::drain_pipe(file) {
        tracing::warn!("failed to flush data pipe: {}", e);
    }
}

enum ParsedMeta {
    Camera(CameraMeta),
    PointCloud(PointCloudMeta),
}

/// Read a metadata-prefixed payload (camera or point cloud) and dispatch it.
///
/// Returns false if the helper should leave its loop.
fn metadata_iteration(
    ch: usize,
    file: &File,
    cancel: &CancelEvent,
    buf: &mut Vec<u8>,
    mode: HelperMode,
    auto_reconnect: bool,
) -> bool {
    let chan = &channels()[ch];

    // one fixed-size metadata record first
    let meta_size = match mode {
        HelperMode::Camera => CameraMeta::SIZE,
        _ => PointCloudMeta::SIZE,
    };
    let mut meta_buf = [0u8; 64];
    debug_assert!(meta_size <= meta_buf.len());

    match read_pipe(ch, file, cancel, &mut meta_buf[..meta_size]) {
        ReadStatus::Data(n) if n == meta_size => {}
        ReadStatus::Data(n) => {
            tracing::error!("short metadata read of {} bytes, resyncing", n);
            flush_data_pipe(file);
            return true;
        }
        ReadStatus::Disconnected => {
            handle_disconnect(ch, auto_reconnect);
            return auto_reconnect;
        }
        ReadStatus::Cancelled => return false,
    }

    // derive the payload length from the metadata, with sanity checks
    let (meta, bytes_to_read) = match mode {
        HelperMode::Camera => {
            let cam: CameraMeta =
                framing::record_from_bytes(&meta_buf[..meta_size]).expect("sized above");
            let magic = cam.magic_number;
            if magic != MAGIC_NUMBER {
                tracing::error!(
                    "invalid camera metadata, magic {:#010x}, expected {:#010x}",
                    magic,
                    MAGIC_NUMBER
                );
                flush_data_pipe(file);
                return true;
            }
            let (w, h, size) = (cam.width as i64, cam.height as i64, cam.size_bytes as i64);
            // a corrupt stream must not drive the allocation below
            if size <= 0 || size > w * h * 10 {
                tracing::error!("received unreasonable camera frame size {}", size);
                flush_data_pipe(file);
                return true;
            }
            (ParsedMeta::Camera(cam), size as usize)
        }
        _ => {
            let pc: PointCloudMeta =
                framing::record_from_bytes(&meta_buf[..meta_size]).expect("sized above");
            let magic = pc.magic_number;
            if magic != MAGIC_NUMBER {
                tracing::error!(
                    "invalid point cloud metadata, magic {:#010x}, expected {:#010x}",
                    magic,
                    MAGIC_NUMBER
                );
                flush_data_pipe(file);
                return true;
            }
            match framing::point_cloud_size_bytes(&pc) {
                Ok(size) => (ParsedMeta::PointCloud(pc), size),
                Err(e) => {
                    tracing::error!("bad point cloud metadata: {}", e);
                    flush_data_pipe(file);
                    return true;
                }
            }
        }
    };

    if buf.len() < bytes_to_read {
        buf.resize(bytes_to_read, 0);
    }

    // The payload may arrive in a few pieces (stereo halves, Y then UV
    // planes), one per server-side write. A handful of reads covers it.
    let mut total = 0;
    let mut tries = 0;
    while chan.running.load(Ordering::Acquire) && tries < 10 && total < bytes_to_read {
        match read_pipe(ch, file, cancel, &mut buf[total..bytes_to_read]) {
            ReadStatus::Data(n) => {
                total += n;
                tries += 1;
            }
            ReadStatus::Disconnected => {
                handle_disconnect(ch, auto_reconnect);
                return auto_reconnect;
            }
            ReadStatus::Cancelled => return false,
        }
    }
    if total != bytes_to_read {
        tracing::error!("only read {} of {} payload bytes", total, bytes_to_read);
        return true;
    }

    match meta {
        ParsedMeta::Camera(cam) => {
            if let Some(cb) = chan.camera_cb.get() {
                let mut cb = cb.lock().unwrap();
                (*cb)(ch, &cam, &buf[..bytes_to_read]);
            }
        }
        ParsedMeta::PointCloud(pc) => {
            if let Some(cb) = chan.point_cloud_cb.get() {
                let mut cb = cb.lock().unwrap();
                (*cb)(ch, &pc, &buf[..bytes_to_read]);
            }
        }
    }
    true
}

fn helper_loop(ch: usize) {
    let chan = &channels()[ch];

    let (mode, auto_reconnect, buf_len, priority, cancel) = {
        let core_guard = chan.core.lock().unwrap();
        let Some(core) = core_guard.as_ref() else {
            return;
        };
        (
            core.options.helper.expect("helper thread needs a mode"),
            !core.options.disable_auto_reconnect,
            core.buf_len,
            core.options.helper_priority,
            Arc::clone(&core.cancel),
        )
    };

    if priority > 0 {
        let _ = lifecycle::set_thread_priority(priority);
    }
    if chan.debug() {
        tracing::debug!("starting helper thread for channel {}", ch);
    }

    // simple mode reads into a fixed buffer; metadata modes grow on demand
    let mut buf = vec![0u8; buf_len];

    while chan.running.load(Ordering::Acquire) {
        let file = {
            let core_guard = chan.core.lock().unwrap();
            core_guard.as_ref().and_then(|c| c.data_file.clone())
        };

        let Some(file) = file else {
            if !auto_reconnect {
                break;
            }
            if let Err(e) = connect_to_server(ch) {
                if chan.debug() {
                    tracing::debug!(
                        "channel {} reconnect failed ({}), sleeping before retry",
                        ch,
                        e
                    );
                }
                if sys::cancellable_sleep(&cancel, RECONNECT_DELAY) {
                    break;
                }
            }
            continue;
        };

        match mode {
            HelperMode::Simple => match read_pipe(ch, &file, &cancel, &mut buf) {
                ReadStatus::Data(n) => {
                    if let Some(cb) = chan.simple_cb.get() {
                        let mut cb = cb.lock().unwrap();
                        (*cb)(ch, &buf[..n]);
                    }
                }
                ReadStatus::Disconnected => {
                    handle_disconnect(ch, auto_reconnect);
                    if !auto_reconnect {
                        break;
                    }
                }
                ReadStatus::Cancelled => break,
            },
            HelperMode::Camera | HelperMode::PointCloud => {
                if !metadata_iteration(ch, &file, &cancel, &mut buf, mode, auto_reconnect) {
                    break;
                }
            }
        }
    }

    if chan.debug() {
        tracing::debug!("exiting helper thread for channel {}", ch);
    }
}

/// Stop the helper (if any), close the pipes, and unlink the local data pipe
/// so the handle becomes available again.
fn stop_and_detach(ch: usize) {
    let chan = &channels()[ch];
    chan.running.store(false, Ordering::Release);

    let helper = chan.helper.lock().unwrap().take();
    if let Some(helper) = helper {
        if helper.thread_id == thread::current().id() {
            // called from inside a callback on the helper thread itself: no
            // signaling or joining, the loop unwinds when the callback
            // returns and sees running cleared
        } else {
            let cancel = {
                let core_guard = chan.core.lock().unwrap();
                core_guard.as_ref().map(|c| Arc::clone(&c.cancel))
            };
            if let Some(cancel) = cancel {
                cancel.notify();
            }
            common::poll::join_timeout(helper.handle, JOIN_TIMEOUT, "client helper");
        }
    }

    let mut core_guard = chan.core.lock().unwrap();
    if let Some(core) = core_guard.as_mut() {
        core.data_file = None;
        core.control_file = None;
        if core.data_path != PathBuf::new() {
            if chan.debug() {
                tracing::debug!("deleting pipe {}", core.data_path.display());
            }
            let _ = std::fs::remove_file(&core.data_path);
            core.data_path = PathBuf::new();
        }
    }
}

/// One attachment to a published endpoint. Closing (or dropping) detaches
/// and releases the slot; callbacks survive for the next open on the slot.
#[derive(Debug)]
pub struct Client {
    ch: usize,
}

impl Client {
    /// Open a client channel on the next unclaimed slot.
    ///
    /// `buf_len` sizes the read buffer: the fixed buffer for Simple mode, or
    /// the starting allocation for the metadata modes (which grow on demand).
    /// Unless `start_paused` is set this also connects (or starts the helper
    /// that will).
    pub fn open(
        name_or_location: &str,
        client_name: &str,
        buf_len: usize,
        options: ClientOptions,
    ) -> Result<Client> {
        let ch = {
            let _guard = CLAIM_MTX.lock().unwrap();
            let Some(ch) = (0..MAX_CHANNELS)
                .find(|&ch| !channels()[ch].claimed.load(Ordering::Acquire))
            else {
                return Err(PipeError::other("all client channels are claimed"));
            };
            channels()[ch].claimed.store(true, Ordering::Release);
            ch
        };
        Self::setup(ch, name_or_location, client_name, buf_len, options)
            .inspect_err(|_| unclaim(ch))
    }

    /// Open a client channel on a specific slot index.
    pub fn open_on(
        ch: usize,
        name_or_location: &str,
        client_name: &str,
        buf_len: usize,
        options: ClientOptions,
    ) -> Result<Client> {
        if ch >= MAX_CHANNELS {
            return Err(PipeError::ChannelOob);
        }
        let was_claimed = {
            let _guard = CLAIM_MTX.lock().unwrap();
            channels()[ch].claimed.swap(true, Ordering::AcqRel)
        };
        let result = if channels()[ch].running.load(Ordering::Acquire) {
            Err(PipeError::other(format!("channel {ch} already running")))
        } else {
            Self::setup(ch, name_or_location, client_name, buf_len, options)
        };
        result.inspect_err(|_| {
            if !was_claimed {
                unclaim(ch);
            }
        })
    }

    fn setup(
        ch: usize,
        name_or_location: &str,
        client_name: &str,
        buf_len: usize,
        mut options: ClientOptions,
    ) -> Result<Client> {
        let chan = &channels()[ch];

        match options.helper {
            Some(HelperMode::Simple) | Some(HelperMode::PointCloud) if buf_len == 0 => {
                return Err(PipeError::invalid_arg("buffer length must be > 0"));
            }
            None => {
                // without a helper there is nobody to reconnect
                options.disable_auto_reconnect = true;
            }
            _ => {}
        }

        if client_name.is_empty() {
            return Err(PipeError::invalid_arg("empty client name provided"));
        }
        // leave room for the suffix digit appended during the handshake
        if client_name.len() >= paths::MAX_NAME_LEN - 1 {
            return Err(PipeError::invalid_arg("client name is too long"));
        }
        if client_name.contains('/') {
            return Err(PipeError::invalid_arg("client name can't contain '/'"));
        }

        let dir = paths::expand_location(name_or_location)?;

        chan.debug.store(options.debug_prints, Ordering::Relaxed);
        let start_paused = options.start_paused;
        *chan.core.lock().unwrap() = Some(ClientCore {
            dir,
            name: client_name.to_string(),
            data_path: PathBuf::new(),
            data_file: None,
            control_file: None,
            buf_len,
            options,
            cancel: Arc::new(CancelEvent::new().map_err(PipeError::FileIo)?),
        });

        let client = Client { ch };
        if !start_paused {
            client.resume()?;
        }
        Ok(client)
    }

    /// The channel index backing this client.
    pub fn channel(&self) -> usize {
        self.ch
    }

    /// Connect (or start the helper that will) after a paused open or a
    /// pause.
    pub fn resume(&self) -> Result<()> {
        let chan = &channels()[self.ch];
        if chan.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let (helper_enabled, auto_reconnect) = {
            let mut core_guard = chan.core.lock().unwrap();
            let Some(core) = core_guard.as_mut() else {
                return Err(PipeError::other("channel has not been set up"));
            };
            // a previous pause may have fired the cancel event; the helper
            // needs a fresh one
            core.cancel = Arc::new(CancelEvent::new().map_err(PipeError::FileIo)?);
            (
                core.options.helper.is_some(),
                !core.options.disable_auto_reconnect,
            )
        };

        // without auto-reconnect the caller wants the handshake result now
        if !auto_reconnect {
            connect_to_server(self.ch)?;
        }

        chan.running.store(true, Ordering::Release);

        if helper_enabled {
            let ch = self.ch;
            let handle = thread::Builder::new()
                .name(format!("pipe-helper-{ch}"))
                .spawn(move || helper_loop(ch))
                .map_err(|e| {
                    chan.running.store(false, Ordering::Release);
                    PipeError::FileIo(e)
                })?;
            let thread_id = handle.thread().id();
            *chan.helper.lock().unwrap() = Some(HelperHandle { handle, thread_id });
        }
        Ok(())
    }

    /// Stop reading and detach from the server, keeping the slot and its
    /// callbacks so `resume()` can pick up where `open` left off.
    pub fn pause(&self) {
        if channels()[self.ch].running.load(Ordering::Acquire) {
            stop_and_detach(self.ch);
        }
    }

    /// Whether a data pipe is currently open to the server.
    pub fn is_connected(&self) -> bool {
        let core_guard = channels()[self.ch].core.lock().unwrap();
        core_guard
            .as_ref()
            .map(|c| c.data_file.is_some())
            .unwrap_or(false)
    }

    /// Register the handler for Simple-mode reads.
    pub fn set_simple_callback(&self, cb: impl FnMut(usize, &[u8]) + Send + 'static) {
        channels()[self.ch].simple_cb.set(Box::new(cb));
    }

    /// Register the handler for camera frames.
    pub fn set_camera_callback(
        &self,
        cb: impl FnMut(usize, &CameraMeta, &[u8]) + Send + 'static,
    ) {
        channels()[self.ch].camera_cb.set(Box::new(cb));
    }

    /// Register the handler for point clouds.
    pub fn set_point_cloud_callback(
        &self,
        cb: impl FnMut(usize, &PointCloudMeta, &[u8]) + Send + 'static,
    ) {
        channels()[self.ch].point_cloud_cb.set(Box::new(cb));
    }

    /// Register a handler invoked after each successful handshake.
    pub fn set_connect_callback(&self, cb: impl FnMut(usize) + Send + 'static) {
        channels()[self.ch].connect_cb.set(Box::new(cb));
    }

    /// Register a handler invoked when the server goes away.
    pub fn set_disconnect_callback(&self, cb: impl FnMut(usize) + Send + 'static) {
        channels()[self.ch].disconnect_cb.set(Box::new(cb));
    }

    fn data_file(&self) -> Result<Arc<File>> {
        let core_guard = channels()[self.ch].core.lock().unwrap();
        core_guard
            .as_ref()
            .and_then(|c| c.data_file.clone())
            .ok_or(PipeError::NotConnected)
    }

    /// Blocking read straight off the data pipe, for helper-less clients.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let file = self.data_file()?;
        (&*file).read(buf).map_err(PipeError::FileIo)
    }

    /// Discard everything currently queued in the data pipe.
    pub fn flush(&self) -> Result<()> {
        let file = self.data_file()?;
        sys::drain_pipe(&file).map_err(PipeError::FileIo)?;
        Ok(())
    }

    /// Bytes currently queued in the data pipe.
    pub fn bytes_in_pipe(&self) -> Result<usize> {
        let file = self.data_file()?;
        sys::bytes_in_pipe(file.as_raw_fd()).map_err(PipeError::FileIo)
    }

    /// Kernel buffer capacity of the data pipe.
    pub fn pipe_size(&self) -> Result<u32> {
        let file = self.data_file()?;
        sys::get_pipe_size(file.as_raw_fd()).map_err(PipeError::FileIo)
    }

    /// Ask the kernel to resize the data pipe, returning the granted size.
    pub fn set_pipe_size(&self, size_bytes: u32) -> Result<u32> {
        let file = self.data_file()?;
        sys::set_pipe_size(file.as_raw_fd(), size_bytes)
            .or_else(|_| sys::get_pipe_size(file.as_raw_fd()))
            .map_err(PipeError::FileIo)
    }

    /// Typed descriptor of the endpoint this client is attached to.
    pub fn info(&self) -> Result<EndpointInfo> {
        let dir = self.endpoint_dir()?;
        crate::info::read_info(&dir)
    }

    /// Raw descriptor JSON of the endpoint, vendor keys included.
    pub fn info_json(&self) -> Result<serde_json::Value> {
        let dir = self.endpoint_dir()?;
        crate::info::read_info_json(&dir)
    }

    fn endpoint_dir(&self) -> Result<String> {
        let core_guard = channels()[self.ch].core.lock().unwrap();
        core_guard
            .as_ref()
            .map(|c| c.dir.clone())
            .ok_or(PipeError::NotConnected)
    }

    /// Send a command string (with terminating NUL) to the server's control
    /// pipe.
    pub fn send_control(&self, cmd: &str) -> Result<()> {
        let mut bytes = cmd.as_bytes().to_vec();
        bytes.push(0);
        self.send_control_bytes(&bytes)
    }

    /// Send raw bytes to the server's control pipe.
    pub fn send_control_bytes(&self, data: &[u8]) -> Result<()> {
        let chan = &channels()[self.ch];
        let core_guard = chan.core.lock().unwrap();
        let Some(core) = core_guard.as_ref() else {
            return Err(PipeError::NotConnected);
        };
        if core.data_file.is_none() {
            return Err(PipeError::NotConnected);
        }
        let Some(control) = core.control_file.as_ref() else {
            return Err(PipeError::CtrlNotAvailable);
        };
        (&*control).write_all(data).map_err(PipeError::FileIo)
    }

    /// Detach and release the slot. Callbacks are left registered, matching
    /// the behavior callers rely on when cycling a channel.
    pub fn close(self) {
        // Drop does the work
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        stop_and_detach(self.ch);
        *channels()[self.ch].core.lock().unwrap() = None;
        unclaim(self.ch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_bad_client_names() {
        let opts = ClientOptions::default();
        assert_eq!(
            Client::open("nowhere", "", 64, opts.clone()).unwrap_err().code(),
            -6
        );
        assert_eq!(
            Client::open("nowhere", "a/b", 64, opts.clone())
                .unwrap_err()
                .code(),
            -6
        );
        let long = "x".repeat(paths::MAX_NAME_LEN - 1);
        assert_eq!(
            Client::open("nowhere", &long, 64, opts).unwrap_err().code(),
            -6
        );
    }

    #[test]
    fn test_open_rejects_zero_buffer_for_simple_helper() {
        let opts = ClientOptions {
            helper: Some(HelperMode::Simple),
            ..Default::default()
        };
        assert_eq!(
            Client::open("nowhere", "probe", 0, opts).unwrap_err().code(),
            -6
        );
    }

    #[test]
    fn test_open_on_rejects_out_of_bounds_channel() {
        let err = Client::open_on(MAX_CHANNELS, "nowhere", "probe", 64, ClientOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), -10);
    }

    #[test]
    fn test_one_shot_open_fails_without_server() {
        // no helper implies no auto-reconnect, so open reports the handshake
        // failure directly
        let err = Client::open("no-such-endpoint-here", "probe", 64, ClientOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), -2, "expected SERVER_NOT_AVAILABLE");
    }
}
