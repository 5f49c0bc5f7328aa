//! Close-path semantics: graceful shutdown drains buffered output before the
//! half-close, force close abandons it, and delayed force close fires
//! through the timer surface.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use sluice::{InetAddr, Reactor, TcpServer, TcpServerConfig, TcpConnectionPtr};

const PAYLOAD: usize = 8 * 1024 * 1024;

struct Harness {
    addr: InetAddr,
    reactor: Arc<Reactor>,
    down: Arc<AtomicUsize>,
    write_complete: Arc<AtomicUsize>,
    down_rx: mpsc::Receiver<()>,
    thread: thread::JoinHandle<()>,
}

fn spawn_server<F>(on_connect: F) -> Harness
where
    F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
{
    let down = Arc::new(AtomicUsize::new(0));
    let write_complete = Arc::new(AtomicUsize::new(0));
    let (addr_tx, addr_rx) = mpsc::channel();
    let (reactor_tx, reactor_rx) = mpsc::channel();
    let (down_tx, down_rx) = mpsc::channel();

    let down_counter = down.clone();
    let wc_counter = write_complete.clone();
    let down_tx = Mutex::new(down_tx);
    let thread = thread::spawn(move || {
        let reactor = Reactor::new().unwrap();
        let config = TcpServerConfig::builder()
            .name("closer")
            .address(InetAddr::loopback(0))
            .worker_count(1)
            .build();
        let server = TcpServer::new(&reactor, config).unwrap();

        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                on_connect(conn);
            } else {
                down_counter.fetch_add(1, Ordering::SeqCst);
                let _ = down_tx.lock().unwrap().send(());
            }
        });
        server.set_write_complete_callback(move |_conn| {
            wc_counter.fetch_add(1, Ordering::SeqCst);
        });
        server.start();

        addr_tx.send(server.listen_addr()).unwrap();
        reactor_tx.send(reactor.clone()).unwrap();
        reactor.run();
        drop(server);
    });

    Harness {
        addr: addr_rx.recv().unwrap(),
        reactor: reactor_rx.recv().unwrap(),
        down,
        write_complete,
        down_rx,
        thread,
    }
}

#[test]
fn test_graceful_shutdown_drains_before_half_close() {
    let server = spawn_server(|conn| {
        conn.send(&vec![0xaau8; PAYLOAD]);
        conn.shutdown();
    });

    let mut client = TcpStream::connect(server.addr.socket_addr()).unwrap();
    // Every buffered byte must arrive before the EOF from the half-close.
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received.len(), PAYLOAD);
    assert!(received.iter().all(|&b| b == 0xaa));

    drop(client);
    server
        .down_rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(server.down.load(Ordering::SeqCst), 1);

    thread::sleep(Duration::from_millis(100));
    server.reactor.quit();
    server.thread.join().unwrap();
}

#[test]
fn test_force_close_abandons_buffered_output() {
    let server = spawn_server(|conn| {
        conn.send(&vec![0xbbu8; 2 * PAYLOAD]);
        conn.force_close();
    });

    let mut client = TcpStream::connect(server.addr.socket_addr()).unwrap();
    server
        .down_rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap();

    // The connection died with output pending: some prefix of the payload,
    // then EOF or a reset.
    let mut chunk = vec![0u8; 64 * 1024];
    let mut received = 0usize;
    loop {
        match client.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => received += n,
        }
    }
    assert!(received < 2 * PAYLOAD);

    thread::sleep(Duration::from_millis(200));
    assert_eq!(server.down.load(Ordering::SeqCst), 1);
    assert_eq!(
        server.write_complete.load(Ordering::SeqCst),
        0,
        "no write-complete after an abandoned buffer"
    );

    server.reactor.quit();
    server.thread.join().unwrap();
}

#[test]
fn test_force_close_with_delay_fires_through_timer() {
    let server = spawn_server(|conn| {
        conn.force_close_with_delay(Duration::from_millis(50));
    });

    let mut client = TcpStream::connect(server.addr.socket_addr()).unwrap();
    server
        .down_rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap();

    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(_) => panic!("unexpected data"),
    }
    assert_eq!(server.down.load(Ordering::SeqCst), 1);

    server.reactor.quit();
    server.thread.join().unwrap();
}
