//! Operations invoked off the worker reactor: sends forwarded through the
//! task queue arrive in FIFO order, and stop/start read gate delivery.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use sluice::{InetAddr, Reactor, TcpConnectionPtr, TcpServer, TcpServerConfig};

struct Harness {
    addr: InetAddr,
    reactor: Arc<Reactor>,
    conn_rx: mpsc::Receiver<TcpConnectionPtr>,
    thread: thread::JoinHandle<()>,
}

fn spawn_capture_server() -> Harness {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (reactor_tx, reactor_rx) = mpsc::channel();
    let (conn_tx, conn_rx) = mpsc::channel();

    let thread = thread::spawn(move || {
        let reactor = Reactor::new().unwrap();
        let config = TcpServerConfig::builder()
            .name("capture")
            .address(InetAddr::loopback(0))
            .worker_count(1)
            .build();
        let server = TcpServer::new(&reactor, config).unwrap();

        let conn_tx = Mutex::new(conn_tx);
        server.set_connection_callback(move |conn| {
            if conn.is_connected() {
                let _ = conn_tx.lock().unwrap().send(conn.clone());
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

    Harness {
        addr: addr_rx.recv().unwrap(),
        reactor: reactor_rx.recv().unwrap(),
        conn_rx,
        thread,
    }
}

#[test]
fn test_cross_thread_sends_arrive_in_order() {
    let server = spawn_capture_server();

    let mut client = TcpStream::connect(server.addr.socket_addr()).unwrap();
    let conn = server
        .conn_rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap();

    // This test thread is not the worker reactor; every send goes through
    // the task queue and the wakeup byte.
    assert!(!conn.reactor().is_in_loop_thread());
    conn.send(b"hello ");
    conn.send(b"world");

    let mut received = [0u8; 11];
    client.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"hello world");

    drop(conn);
    drop(client);
    thread::sleep(Duration::from_millis(100));
    server.reactor.quit();
    server.thread.join().unwrap();
}

#[test]
fn test_sends_from_many_threads_all_arrive() {
    let server = spawn_capture_server();

    let mut client = TcpStream::connect(server.addr.socket_addr()).unwrap();
    let conn = server
        .conn_rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap();

    let senders: Vec<_> = (0..4)
        .map(|_| {
            let conn = conn.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    conn.send(&[0x5a; 16]);
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    let mut received = vec![0u8; 4 * 50 * 16];
    client.read_exact(&mut received).unwrap();
    assert!(received.iter().all(|&b| b == 0x5a));

    drop(conn);
    drop(client);
    thread::sleep(Duration::from_millis(100));
    server.reactor.quit();
    server.thread.join().unwrap();
}

#[test]
fn test_stop_read_gates_delivery_until_start_read() {
    let server = spawn_capture_server();

    let mut client = TcpStream::connect(server.addr.socket_addr()).unwrap();
    let conn = server
        .conn_rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap();

    conn.stop_read();
    thread::sleep(Duration::from_millis(100));

    client.write_all(b"delayed").unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut buf = [0u8; 7];
    // Read interest is off, so nothing echoes back yet.
    assert!(client.read_exact(&mut buf).is_err());

    conn.start_read();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"delayed");

    drop(conn);
    drop(client);
    thread::sleep(Duration::from_millis(100));
    server.reactor.quit();
    server.thread.join().unwrap();
}
