//! Listener behaviour over raw frames: limits, lifecycle, shutdown.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rawrpc::frame;
use rawrpc::{Config, Connection, ConnectionInfo, Listener, ListenerState, Observer};

fn echo(conn: &Arc<Connection>, body: &[u8]) -> rawrpc::Result<()> {
    conn.send(body.to_vec())
}

fn ignore(_: &Arc<Connection>, _: &[u8]) -> rawrpc::Result<()> {
    Ok(())
}

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn write_frame(s: &mut TcpStream, body: &[u8]) {
    let mut out = Vec::new();
    frame::encode(body, &mut out);
    s.write_all(&out).unwrap();
}

fn read_frame(s: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut head = [0; frame::HEAD_SIZE];
    s.read_exact(&mut head)?;
    let len = frame::parse_head(&head).unwrap();
    let mut body = vec![0; len];
    s.read_exact(&mut body)?;
    Ok(body)
}

// Reads until the server closes the connection.
fn expect_eof(s: &mut TcpStream) {
    s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0; 256];
    loop {
        match s.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::ConnectionReset => return,
            Err(e) => panic!("expected eof, got {e}"),
        }
    }
}

#[derive(Default)]
struct Recorder {
    created: Mutex<Vec<u64>>,
    closed: Mutex<Vec<u64>>,
    aborted: Mutex<Vec<u64>>,
    received: AtomicUsize,
    sent: AtomicUsize,
    lifecycle: Mutex<Vec<&'static str>>,
}

impl Observer for Recorder {
    fn server_starting(&self) {
        self.lifecycle.lock().unwrap().push("starting");
    }
    fn server_started(&self, _: SocketAddr) {
        self.lifecycle.lock().unwrap().push("started");
    }
    fn server_stopping(&self) {
        self.lifecycle.lock().unwrap().push("stopping");
    }
    fn server_stopped(&self) {
        self.lifecycle.lock().unwrap().push("stopped");
    }
    fn connection_created(&self, info: &ConnectionInfo) {
        self.created.lock().unwrap().push(info.id);
    }
    fn connection_closed(&self, info: &ConnectionInfo) {
        self.closed.lock().unwrap().push(info.id);
    }
    fn connection_aborted(&self, info: &ConnectionInfo) {
        self.aborted.lock().unwrap().push(info.id);
    }
    fn message_received(&self, _: &Connection, _: &[u8]) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }
    fn message_sent(&self, _: &Connection, _: usize) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn split_and_coalesced_frames() {
    init();
    let listener = Listener::new(Config::new().buffer_size(8), echo);
    let addr = listener.start("127.0.0.1:0").unwrap();
    let mut s = TcpStream::connect(addr).unwrap();

    // two frames in one write
    let mut out = Vec::new();
    frame::encode(b"first", &mut out);
    frame::encode(b"", &mut out);
    s.write_all(&out).unwrap();

    // one frame dribbled a byte at a time
    let mut out = Vec::new();
    frame::encode(b"a frame longer than the receive buffer", &mut out);
    for b in out {
        s.write_all(&[b]).unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(read_frame(&mut s).unwrap(), b"first");
    assert_eq!(read_frame(&mut s).unwrap(), b"");
    assert_eq!(
        read_frame(&mut s).unwrap(),
        b"a frame longer than the receive buffer"
    );
}

#[test]
fn ids_are_sequential_and_closes_notified() {
    init();
    let recorder = Arc::new(Recorder::default());
    let listener = Listener::new(Config::new(), echo);
    listener.observe(recorder.clone());
    let addr = listener.start("127.0.0.1:0").unwrap();

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let mut s = TcpStream::connect(addr).unwrap();
        write_frame(&mut s, &[i]);
        assert_eq!(read_frame(&mut s).unwrap(), [i]);
        clients.push(s);
    }
    assert_eq!(listener.connection_ids(), [1, 2, 3]);
    assert_eq!(*recorder.created.lock().unwrap(), [1, 2, 3]);
    assert_eq!(recorder.received.load(Ordering::SeqCst), 3);
    wait_until("sent notifications", || {
        recorder.sent.load(Ordering::SeqCst) == 3
    });

    drop(clients);
    wait_until("all closed", || recorder.closed.lock().unwrap().len() == 3);
    assert_eq!(listener.connection_count(), 0);
    let mut closed = recorder.closed.lock().unwrap().clone();
    closed.sort_unstable();
    assert_eq!(closed, [1, 2, 3]);
    assert!(recorder.aborted.lock().unwrap().is_empty());

    wait_until("receive buffers returned", || {
        listener.recv_pool_stats().checked_out == 0
    });
    wait_until("permits released", || {
        listener.available_permits() == listener.config().max_connections
    });

    listener.stop();
    assert_eq!(
        *recorder.lifecycle.lock().unwrap(),
        ["starting", "started", "stopping", "stopped"]
    );
}

#[test]
fn third_connection_waits_for_a_permit() {
    init();
    let listener = Listener::new(Config::new().max_connections(2), echo);
    let addr = listener.start("127.0.0.1:0").unwrap();

    let mut c1 = TcpStream::connect(addr).unwrap();
    let mut c2 = TcpStream::connect(addr).unwrap();
    write_frame(&mut c1, b"1");
    write_frame(&mut c2, b"2");
    assert_eq!(read_frame(&mut c1).unwrap(), b"1");
    assert_eq!(read_frame(&mut c2).unwrap(), b"2");

    // held in the backlog, not refused
    let mut c3 = TcpStream::connect(addr).unwrap();
    write_frame(&mut c3, b"3");
    c3.set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let err = read_frame(&mut c3).unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut
    ));
    assert_eq!(listener.connection_count(), 2);

    drop(c1);
    c3.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(read_frame(&mut c3).unwrap(), b"3");
    assert_eq!(listener.connection_ids(), [2, 3]);
}

// Echo, except that "slow" keeps the receive worker busy for a while.
fn slow_echo(conn: &Arc<Connection>, body: &[u8]) -> rawrpc::Result<()> {
    if body == b"slow" {
        thread::sleep(Duration::from_millis(1800));
    }
    conn.send(body.to_vec())
}

#[test]
fn closed_connection_frees_its_slot_only_after_its_worker_lets_go() {
    init();
    let recorder = Arc::new(Recorder::default());
    let listener = Listener::new(Config::new().max_connections(2).recv_workers(1), slow_echo);
    listener.observe(recorder.clone());
    let addr = listener.start("127.0.0.1:0").unwrap();

    let mut a = TcpStream::connect(addr).unwrap();
    let _b = TcpStream::connect(addr).unwrap();
    wait_until("2 connections", || listener.connection_count() == 2);

    write_frame(&mut a, b"slow");
    wait_until("worker busy", || recorder.received.load(Ordering::SeqCst) == 1);
    assert!(listener.connection(2).unwrap().close());

    // waits for the busy worker to drop connection 2, then gets its slot
    let mut c = TcpStream::connect(addr).unwrap();
    write_frame(&mut c, b"hi");
    assert_eq!(read_frame(&mut a).unwrap(), b"slow");
    assert_eq!(read_frame(&mut c).unwrap(), b"hi");

    assert!(recorder.aborted.lock().unwrap().is_empty());
    assert_eq!(*recorder.created.lock().unwrap(), [1, 2, 3]);
    assert_eq!(listener.connection_ids(), [1, 3]);
}

#[test]
fn send_refuses_bodies_above_the_frame_limit() {
    init();
    let listener = Listener::new(Config::new().max_frame_size(16), ignore);
    let addr = listener.start("127.0.0.1:0").unwrap();
    let mut s = TcpStream::connect(addr).unwrap();
    wait_until("accepted", || listener.connection_count() == 1);
    let id = listener.connection_ids()[0];

    assert!(matches!(
        listener.send(id, vec![0; 17]),
        Err(rawrpc::Error::FrameTooLarge(17, 16))
    ));
    listener.send(id, vec![3; 16]).unwrap();
    assert_eq!(read_frame(&mut s).unwrap(), [3; 16]);
}

#[test]
fn oversized_frame_closes_only_that_connection() {
    init();
    let recorder = Arc::new(Recorder::default());
    let listener = Listener::new(Config::new().max_frame_size(16), echo);
    listener.observe(recorder.clone());
    let addr = listener.start("127.0.0.1:0").unwrap();

    let mut bad = TcpStream::connect(addr).unwrap();
    let mut good = TcpStream::connect(addr).unwrap();
    write_frame(&mut good, b"ok");
    assert_eq!(read_frame(&mut good).unwrap(), b"ok");

    bad.write_all(&17u32.to_le_bytes()).unwrap();
    expect_eof(&mut bad);

    write_frame(&mut good, &[7; 16]);
    assert_eq!(read_frame(&mut good).unwrap(), [7; 16]);
    wait_until("bad connection closed", || {
        recorder.closed.lock().unwrap().len() == 1
    });
    assert_eq!(listener.connection_count(), 1);
}

#[test]
fn send_text_frames_utf8() {
    init();
    let listener = Listener::new(Config::new(), ignore);
    let addr = listener.start("127.0.0.1:0").unwrap();
    let mut s = TcpStream::connect(addr).unwrap();
    wait_until("accepted", || listener.connection_count() == 1);

    let id = listener.connection_ids()[0];
    listener.send_text(id, "héllo wörld").unwrap();
    let body = read_frame(&mut s).unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), "héllo wörld");

    assert!(listener.send(id + 100, vec![1]).is_err());
}

// Blocks the send worker on its first package until released.
struct Gate {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
    armed: AtomicBool,
    dropped: AtomicUsize,
    closed: AtomicUsize,
}

impl Observer for Gate {
    fn message_sending(&self, _: &Connection, _: usize) {
        if self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
    }
    fn message_dropped(&self, _: &Connection, _: usize) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
    fn connection_closed(&self, _: &ConnectionInfo) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn stop_drops_queued_packages_and_frees_the_port() {
    init();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gate = Arc::new(Gate {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
        armed: AtomicBool::new(true),
        dropped: AtomicUsize::new(0),
        closed: AtomicUsize::new(0),
    });

    let listener = Arc::new(Listener::new(Config::new(), ignore));
    listener.observe(gate.clone());
    let addr = listener.start("127.0.0.1:0").unwrap();

    let mut clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
    wait_until("3 connections", || listener.connection_count() == 3);
    let ids = listener.connection_ids();

    // first package parks the send worker in the gate
    listener.send(ids[0], b"in flight".to_vec()).unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    for i in 0..5 {
        listener.send(ids[i % 3], vec![i as u8; 10]).unwrap();
    }
    assert_eq!(listener.queued_packages(), 5);

    let stopper = {
        let listener = listener.clone();
        thread::spawn(move || listener.stop())
    };
    wait_until("stopping", || listener.state() == ListenerState::Stopping);
    release_tx.send(()).unwrap();
    stopper.join().unwrap();

    assert_eq!(listener.state(), ListenerState::Stopped);
    assert_eq!(gate.dropped.load(Ordering::SeqCst), 5);
    assert_eq!(gate.closed.load(Ordering::SeqCst), 3);
    assert_eq!(listener.connection_count(), 0);
    assert!(listener.send(ids[1], vec![1]).is_err());

    for c in &mut clients {
        expect_eof(c);
    }

    let again = Listener::new(Config::new(), echo);
    assert_eq!(again.start(addr).unwrap(), addr);
    let mut s = TcpStream::connect(addr).unwrap();
    write_frame(&mut s, b"back");
    assert_eq!(read_frame(&mut s).unwrap(), b"back");
}
