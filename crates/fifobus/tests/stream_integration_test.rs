use fifobus::{
    Client, ClientOptions, ClientState, EndpointInfo, HelperMode, Server, ServerOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn endpoint_under(dir: &tempfile::TempDir, name: &str) -> String {
    format!("{}/{}", dir.path().display(), name)
}

/// Hello string stream: ten records in, ten callbacks out, bytewise intact.
#[test]
fn test_hello_string_stream() {
    common::logging::init_for_tests();
    let tmp = tempdir().unwrap();
    let location = endpoint_under(&tmp, "hello");

    let mut info = EndpointInfo::new("hello", "text", "hello-server");
    info.location = location.clone();
    let server = Server::create(info, ServerOptions::default()).unwrap();

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let client = Client::open(
        &location,
        "hello-client",
        32,
        ClientOptions {
            helper: Some(HelperMode::Simple),
            ..Default::default()
        },
    )
    .unwrap();
    client.set_simple_callback(move |_ch, bytes| {
        sink.lock().unwrap().push(bytes.to_vec());
    });

    assert!(
        wait_until(Duration::from_secs(2), || server.num_clients() == 1),
        "client should attach"
    );

    for i in 0..10 {
        server.write_string(&format!("hello{i}")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
    }

    assert!(
        wait_until(Duration::from_secs(2), || received.lock().unwrap().len() >= 10),
        "expected all ten records"
    );
    let got = received.lock().unwrap();
    assert_eq!(got.len(), 10, "exactly one callback per record");
    for (i, payload) in got.iter().enumerate() {
        assert_eq!(payload, format!("hello{i}\0").as_bytes());
    }

    assert!(client.is_connected());
    drop(client);
    drop(server);
}

/// A stalled reader loses its own data only; its peer sees every record.
#[test]
fn test_stalled_reader_does_not_affect_peer() {
    common::logging::init_for_tests();
    let tmp = tempdir().unwrap();
    let location = endpoint_under(&tmp, "firehose");

    const RECORD_SIZE: usize = 64;
    const N_RECORDS: usize = 4000;
    const PIPE_SIZE: u32 = 64 * 1024;

    let mut info = EndpointInfo::new("firehose", "text", "hose-server").with_size(PIPE_SIZE);
    info.location = location.clone();
    let server = Server::create(info, ServerOptions::default()).unwrap();

    let disconnects = Arc::new(AtomicUsize::new(0));
    let disconnect_count = Arc::clone(&disconnects);
    server.set_disconnect_callback(move |_ch, _id, _name| {
        disconnect_count.fetch_add(1, Ordering::SeqCst);
    });

    // A attaches but never reads
    let stalled = Client::open(&location, "stalled", 0, ClientOptions::default()).unwrap();
    assert!(stalled.is_connected());

    // B reads through the simple helper
    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = Arc::clone(&received);
    let live = Client::open(
        &location,
        "live",
        8192,
        ClientOptions {
            helper: Some(HelperMode::Simple),
            ..Default::default()
        },
    )
    .unwrap();
    live.set_simple_callback(move |_ch, bytes| {
        sink.lock().unwrap().extend_from_slice(bytes);
    });

    assert!(
        wait_until(Duration::from_secs(2), || server.num_clients() == 2),
        "both clients should attach"
    );

    for seq in 0..N_RECORDS as u64 {
        let mut record = [0u8; RECORD_SIZE];
        record[..8].copy_from_slice(&seq.to_le_bytes());
        server.write(&record).unwrap();
        // don't outrun the live reader's kernel buffer
        if seq % 200 == 0 {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            received.lock().unwrap().len() >= N_RECORDS * RECORD_SIZE
        }),
        "live client should receive every record, got {} bytes",
        received.lock().unwrap().len()
    );

    let bytes = received.lock().unwrap();
    assert_eq!(bytes.len(), N_RECORDS * RECORD_SIZE);
    for (i, record) in bytes.chunks_exact(RECORD_SIZE).enumerate() {
        let seq = u64::from_le_bytes(record[..8].try_into().unwrap());
        assert_eq!(seq, i as u64, "records must arrive in order without gaps");
    }

    // the stalled client holds at most its kernel buffer and was skipped
    // past that, never disconnected
    let backlog = stalled.bytes_in_pipe().unwrap();
    assert!(backlog <= PIPE_SIZE as usize + RECORD_SIZE);
    assert!(backlog < N_RECORDS * RECORD_SIZE);
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    let stalled_id = server.client_id_for_name("stalled0").unwrap();
    assert!(matches!(
        server.client_state(stalled_id).unwrap(),
        ClientState::Connected | ClientState::Initialized
    ));
}

/// Suffix assignment is dense and bounded to eight attempts.
#[test]
fn test_handle_suffix_assignment_and_exhaustion() {
    common::logging::init_for_tests();
    let tmp = tempdir().unwrap();
    let location = endpoint_under(&tmp, "probe");

    let mut info = EndpointInfo::new("probe", "text", "probe-server");
    info.location = location.clone();
    let server = Server::create(info, ServerOptions::default()).unwrap();

    let mut clients = Vec::new();
    for i in 0..5 {
        let client = Client::open(&location, "viewer", 0, ClientOptions::default()).unwrap();
        assert!(client.is_connected(), "viewer{i} should connect");
        clients.push(client);
    }
    for i in 0..5 {
        assert_eq!(
            server.client_id_for_name(&format!("viewer{i}")),
            Some(i),
            "handles must be assigned densely from suffix 0"
        );
    }

    // a sixth attach with the same base name takes the next suffix
    let sixth = Client::open(&location, "viewer", 0, ClientOptions::default()).unwrap();
    assert_eq!(server.client_id_for_name("viewer5"), Some(5));

    // with all eight suffixes taken the ninth attempt must fail cleanly
    let expanded = fifobus::paths::expand_location(&location).unwrap();
    std::fs::write(format!("{expanded}viewer6"), b"").unwrap();
    std::fs::write(format!("{expanded}viewer7"), b"").unwrap();
    let err = Client::open(&location, "viewer", 0, ClientOptions::default()).unwrap_err();
    assert_eq!(err.code(), -3, "expected REACHED_MAX_NAME_INDEX");

    drop(sixth);
    drop(clients);
    drop(server);
}

/// A handle that detaches and comes back lands in its old slot.
#[test]
fn test_reconnect_returns_same_slot() {
    common::logging::init_for_tests();
    let tmp = tempdir().unwrap();
    let location = endpoint_under(&tmp, "ident");

    let mut info = EndpointInfo::new("ident", "text", "ident-server");
    info.location = location.clone();
    let server = Server::create(info, ServerOptions::default()).unwrap();

    let disconnected: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&disconnected);
    server.set_disconnect_callback(move |_ch, id, _name| {
        sink.lock().unwrap().push(id);
    });

    let first = Client::open(&location, "viewer", 0, ClientOptions::default()).unwrap();
    let second = Client::open(&location, "viewer", 0, ClientOptions::default()).unwrap();
    assert_eq!(server.client_id_for_name("viewer0"), Some(0));
    assert_eq!(server.client_id_for_name("viewer1"), Some(1));

    // detach the first client; the server notices on its next write
    drop(first);
    assert!(wait_until(Duration::from_secs(2), || {
        server.write(b"tick\0").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        server.client_state(0).unwrap() == ClientState::Disconnected
    }));
    assert_eq!(*disconnected.lock().unwrap(), vec![0]);

    // same base name reattaches: same handle, same slot
    let third = Client::open(&location, "viewer", 0, ClientOptions::default()).unwrap();
    assert!(third.is_connected());
    assert_eq!(
        server.client_id_for_name("viewer0"),
        Some(0),
        "reconnecting handle must return to its old slot"
    );
    assert!(matches!(
        server.client_state(0).unwrap(),
        ClientState::Initialized | ClientState::Connected
    ));

    drop(second);
    drop(third);
}

/// Control pipe: client command bytes reach the server callback verbatim.
#[test]
fn test_control_pipe_echo() {
    common::logging::init_for_tests();
    let tmp = tempdir().unwrap();
    let location = endpoint_under(&tmp, "ctl");

    let mut info = EndpointInfo::new("ctl", "text", "ctl-server");
    info.location = location.clone();
    let server = Server::create(
        info,
        ServerOptions {
            enable_control_pipe: true,
            ..Default::default()
        },
    )
    .unwrap();
    server.set_available_commands(&["ping", "reset"]).unwrap();

    let captured: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    server.set_control_callback(move |_ch, bytes| {
        sink.lock().unwrap().push(bytes.to_vec());
    });

    let client = Client::open(&location, "commander", 0, ClientOptions::default()).unwrap();

    // the descriptor advertises the commands
    let advertised = client.info().unwrap().available_commands.unwrap();
    assert_eq!(advertised, vec!["ping".to_string(), "reset".to_string()]);

    client.send_control("ping").unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || !captured.lock().unwrap().is_empty()),
        "control callback should fire"
    );
    let got = captured.lock().unwrap();
    assert_eq!(got.len(), 1, "exactly one callback for one command");
    assert_eq!(got[0], b"ping\0");
}

/// A client without a control pipe on the server gets a distinct error.
#[test]
fn test_control_unavailable_without_control_pipe() {
    common::logging::init_for_tests();
    let tmp = tempdir().unwrap();
    let location = endpoint_under(&tmp, "noctl");

    let mut info = EndpointInfo::new("noctl", "text", "noctl-server");
    info.location = location.clone();
    let _server = Server::create(info, ServerOptions::default()).unwrap();

    let client = Client::open(&location, "commander", 0, ClientOptions::default()).unwrap();
    assert_eq!(client.send_control("ping").unwrap_err().code(), -8);
}

/// Pause keeps the slot and callbacks; resume reconnects.
#[test]
fn test_pause_and_resume() {
    common::logging::init_for_tests();
    let tmp = tempdir().unwrap();
    let location = endpoint_under(&tmp, "pausable");

    let mut info = EndpointInfo::new("pausable", "text", "pause-server");
    info.location = location.clone();
    let server = Server::create(info, ServerOptions::default()).unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&received);

    let client = Client::open(
        &location,
        "dozer",
        64,
        ClientOptions {
            helper: Some(HelperMode::Simple),
            start_paused: true,
            ..Default::default()
        },
    )
    .unwrap();
    client.set_simple_callback(move |_ch, _bytes| {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    // paused means no connection attempt was made yet
    assert!(!client.is_connected());
    assert_eq!(server.num_clients(), 0);

    client.resume().unwrap();
    assert!(wait_until(Duration::from_secs(2), || client.is_connected()));
    server.write_string("one").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        received.load(Ordering::SeqCst) == 1
    }));

    client.pause();
    assert!(!client.is_connected());

    client.resume().unwrap();
    assert!(wait_until(Duration::from_secs(2), || client.is_connected()));
    server.write_string("two").unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || received.load(Ordering::SeqCst) == 2),
        "callback must survive a pause/resume cycle"
    );
}

/// Graceful close removes the whole endpoint tree.
#[test]
fn test_close_cleans_up_filesystem() {
    common::logging::init_for_tests();
    let tmp = tempdir().unwrap();
    let location = endpoint_under(&tmp, "tidy");
    let expanded = fifobus::paths::expand_location(&location).unwrap();

    let mut info = EndpointInfo::new("tidy", "text", "tidy-server");
    info.location = location.clone();
    let server = Server::create(
        info,
        ServerOptions {
            enable_control_pipe: true,
            ..Default::default()
        },
    )
    .unwrap();

    assert!(fifobus::endpoint_exists(&location));
    assert!(fifobus::endpoint_is_type(&location, "text"));
    assert!(std::path::Path::new(&format!("{expanded}request")).exists());
    assert!(std::path::Path::new(&format!("{expanded}control")).exists());
    assert!(std::path::Path::new(&format!("{expanded}info")).exists());

    let client = Client::open(&location, "witness", 0, ClientOptions::default()).unwrap();
    assert!(client.is_connected());
    drop(client);

    server.close();
    assert!(
        !std::path::Path::new(expanded.trim_end_matches('/')).exists(),
        "endpoint directory must be gone after close"
    );
    assert!(!fifobus::endpoint_exists(&location));
}

/// Two channels cannot publish the same directory.
#[test]
fn test_duplicate_endpoint_directory_is_refused() {
    common::logging::init_for_tests();
    let tmp = tempdir().unwrap();
    let location = endpoint_under(&tmp, "dup");

    let mut info = EndpointInfo::new("dup", "text", "dup-server");
    info.location = location.clone();
    let _server = Server::create(info.clone(), ServerOptions::default()).unwrap();

    let err = Server::create(info, ServerOptions::default()).unwrap_err();
    assert_eq!(err.code(), -6);
}

/// The descriptor advertises what create() actually did.
#[test]
fn test_info_reflects_creation() {
    common::logging::init_for_tests();
    let tmp = tempdir().unwrap();
    let location = endpoint_under(&tmp, "desc");

    let mut info = EndpointInfo::new("desc", "imu_data_t", "imu-server").with_size(128 * 1024);
    info.location = location.clone();
    let server = Server::create(info, ServerOptions::default()).unwrap();

    let read_back = fifobus::read_info(&location).unwrap();
    assert_eq!(read_back.name, "desc");
    assert_eq!(read_back.type_name, "imu_data_t");
    assert_eq!(read_back.server_name, "imu-server");
    assert_eq!(read_back.size_bytes, 128 * 1024);
    assert_eq!(read_back.server_pid, std::process::id() as i32);
    assert!(read_back.location.ends_with('/'));

    // vendor keys can be added live
    server
        .update_info(|json| {
            json["sensor_id"] = serde_json::json!(7);
        })
        .unwrap();
    let raw = fifobus::read_info_json(&location).unwrap();
    assert_eq!(raw["sensor_id"], 7);
}
