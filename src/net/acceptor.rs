//! Listening-socket owner.
//!
//! Accepts connections on read readiness and hands each accepted socket plus
//! peer endpoint to the new-connection callback. A placeholder descriptor on
//! `/dev/null` is kept open so that hitting the process descriptor limit
//! degrades into rejected connections instead of a read-ready busy loop.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::Channel;
use crate::error::Result;
use crate::logger::{LogLevel, Logger};
use crate::net::addr::InetAddr;
use crate::net::socket::Socket;
use crate::net::NewConnectionCallback;
use crate::reactor::Reactor;

pub struct Acceptor {
    reactor: Arc<Reactor>,
    socket: Socket,
    channel: Arc<Channel>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
    idle_fd: Mutex<Option<File>>,
    logger: Arc<dyn Logger>,
}

impl Acceptor {
    pub(crate) fn new(
        reactor: &Arc<Reactor>,
        listen_addr: &InetAddr,
        reuse_port: bool,
        logger: Arc<dyn Logger>,
    ) -> Result<Arc<Acceptor>> {
        let socket = Socket::new_nonblocking(listen_addr)?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(listen_addr)?;

        let channel = Channel::new(Arc::downgrade(reactor), socket.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            reactor: reactor.clone(),
            socket,
            channel,
            new_connection_cb: Mutex::new(None),
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(File::open("/dev/null").ok()),
            logger,
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(Box::new(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Actual bound endpoint, resolved after bind (useful with port 0).
    pub fn local_addr(&self) -> Result<InetAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Start listening and enable read interest. Runs on the owning
    /// reactor's thread.
    pub(crate) fn listen(self: &Arc<Self>) {
        self.reactor.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        if let Err(e) = self.socket.listen() {
            self.logger
                .log(LogLevel::Error, &format!("acceptor: listen failed: {e}"));
            panic!("acceptor: listen failed: {e}");
        }
        self.channel.enable_reading();
    }

    fn handle_read(self: &Arc<Self>) {
        self.reactor.assert_in_loop_thread();
        loop {
            match self.socket.accept() {
                Ok((socket, peer_addr)) => {
                    let mut cb = self.new_connection_cb.lock().unwrap();
                    match cb.as_mut() {
                        Some(cb) => cb(socket, peer_addr),
                        // Nobody to hand the connection to; dropping the
                        // socket closes it.
                        None => drop(socket),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_transient_accept_error(&e) => {
                    self.logger
                        .log(LogLevel::Debug, &format!("acceptor: transient accept error: {e}"));
                }
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    self.logger.log(
                        LogLevel::Error,
                        "acceptor: out of file descriptors, shedding one connection",
                    );
                    self.shed_one_connection();
                }
                Err(e) => {
                    // EBADF, ENOMEM, ENOTSOCK and friends mean the listening
                    // socket itself is unusable.
                    self.logger
                        .log(LogLevel::Error, &format!("acceptor: accept failed: {e}"));
                    panic!("acceptor: accept failed: {e}");
                }
            }
        }
    }

    /// The idle-descriptor dance: close the placeholder to free a slot,
    /// accept the pending connection, close it immediately, and reopen the
    /// placeholder. Guarantees forward progress under EMFILE.
    fn shed_one_connection(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        idle.take();
        if let Ok((socket, _)) = self.socket.accept() {
            drop(socket);
        }
        *idle = File::open("/dev/null").ok();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINTR) | Some(libc::ECONNABORTED) | Some(libc::EPROTO) | Some(libc::EPERM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoOpLogger;
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_accepts_and_reports_peer() {
        let (tx, rx) = mpsc::channel();
        let (addr_tx, addr_rx) = mpsc::channel();
        let (reactor_tx, reactor_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let reactor = Reactor::new().unwrap();
            let acceptor = Acceptor::new(
                &reactor,
                &InetAddr::loopback(0),
                false,
                Arc::new(NoOpLogger),
            )
            .unwrap();
            acceptor.set_new_connection_callback(Box::new(move |socket, peer| {
                tx.send((socket.as_raw_fd(), peer)).unwrap();
            }));
            acceptor.listen();
            assert!(acceptor.listening());
            addr_tx.send(acceptor.local_addr().unwrap()).unwrap();
            reactor_tx.send(reactor.clone()).unwrap();
            reactor.run();
            drop(acceptor);
        });

        let addr = addr_rx.recv().unwrap();
        let reactor = reactor_rx.recv().unwrap();
        let client = TcpStream::connect(addr.socket_addr()).unwrap();

        let (_fd, peer) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(peer.socket_addr(), client.local_addr().unwrap());

        reactor.quit();
        handle.join().unwrap();
    }

    #[test]
    fn test_without_callback_accepted_socket_is_closed() {
        let (addr_tx, addr_rx) = mpsc::channel();
        let (reactor_tx, reactor_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let reactor = Reactor::new().unwrap();
            let acceptor = Acceptor::new(
                &reactor,
                &InetAddr::loopback(0),
                false,
                Arc::new(NoOpLogger),
            )
            .unwrap();
            acceptor.listen();
            addr_tx.send(acceptor.local_addr().unwrap()).unwrap();
            reactor_tx.send(reactor.clone()).unwrap();
            reactor.run();
            drop(acceptor);
        });

        let addr = addr_rx.recv().unwrap();
        let reactor = reactor_rx.recv().unwrap();

        let mut client = TcpStream::connect(addr.socket_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        // The dropped socket turns into EOF (or a reset) on our side.
        use std::io::Read;
        let mut buf = [0u8; 1];
        match client.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(_) => panic!("unexpected data from closed connection"),
        }

        reactor.quit();
        handle.join().unwrap();
    }
}
