//! Echo round trips through a full server: accept hand-off, message
//! callback, half-close from the client, and connection teardown.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use sluice::{InetAddr, PollerKind, Reactor, TcpServer, TcpServerConfig};

struct EchoServer {
    addr: InetAddr,
    reactor: Arc<Reactor>,
    up: Arc<AtomicUsize>,
    down: Arc<AtomicUsize>,
    down_rx: mpsc::Receiver<()>,
    thread: thread::JoinHandle<()>,
}

fn spawn_echo_server(poller: PollerKind, worker_count: usize) -> EchoServer {
    let up = Arc::new(AtomicUsize::new(0));
    let down = Arc::new(AtomicUsize::new(0));
    let (addr_tx, addr_rx) = mpsc::channel();
    let (reactor_tx, reactor_rx) = mpsc::channel();
    let (down_tx, down_rx) = mpsc::channel();

    let up_counter = up.clone();
    let down_counter = down.clone();
    let down_tx = Mutex::new(down_tx);
    let thread = thread::spawn(move || {
        let reactor = Reactor::new().unwrap();
        let config = TcpServerConfig::builder()
            .name("echo")
            .address(InetAddr::loopback(0))
            .poller(poller)
            .worker_count(worker_count)
            .build();
        let server = TcpServer::new(&reactor, config).unwrap();

        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                up_counter.fetch_add(1, Ordering::SeqCst);
            } else {
                down_counter.fetch_add(1, Ordering::SeqCst);
                let _ = down_tx.lock().unwrap().send(());
            }
        });
        server.set_message_callback(|conn, buf, _at| {
            let bytes = buf.retrieve_all_as_bytes();
            conn.send(&bytes);
        });
        server.start();

        addr_tx.send(server.listen_addr()).unwrap();
        reactor_tx.send(reactor.clone()).unwrap();
        reactor.run();
        drop(server);
    });

    EchoServer {
        addr: addr_rx.recv().unwrap(),
        reactor: reactor_rx.recv().unwrap(),
        up,
        down,
        down_rx,
        thread,
    }
}

fn run_echo_round_trip(poller: PollerKind, worker_count: usize) {
    let server = spawn_echo_server(poller, worker_count);

    let mut client = TcpStream::connect(server.addr.socket_addr()).unwrap();
    client.write_all(b"ping").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, b"ping");

    server
        .down_rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(server.up.load(Ordering::SeqCst), 1);
    assert_eq!(server.down.load(Ordering::SeqCst), 1);

    server.reactor.quit();
    server.thread.join().unwrap();
}

#[test]
fn test_echo_round_trip_edge_backend() {
    run_echo_round_trip(PollerKind::EdgeReady, 2);
}

#[test]
fn test_echo_round_trip_level_backend() {
    run_echo_round_trip(PollerKind::LevelTriggered, 2);
}

#[test]
fn test_echo_single_threaded_mode() {
    run_echo_round_trip(PollerKind::EdgeReady, 0);
}

#[test]
fn test_many_sequential_clients() {
    let server = spawn_echo_server(PollerKind::EdgeReady, 3);

    for i in 0..20u32 {
        let mut client = TcpStream::connect(server.addr.socket_addr()).unwrap();
        let payload = format!("message-{i}");
        client.write_all(payload.as_bytes()).unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let mut echoed = String::new();
        client.read_to_string(&mut echoed).unwrap();
        assert_eq!(echoed, payload);
        server
            .down_rx
            .recv_timeout(Duration::from_secs(10))
            .unwrap();
    }
    assert_eq!(server.up.load(Ordering::SeqCst), 20);
    assert_eq!(server.down.load(Ordering::SeqCst), 20);

    server.reactor.quit();
    server.thread.join().unwrap();
}
