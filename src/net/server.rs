//! Server façade: acceptor plus worker pool plus the connection map.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::logger::{LogLevel, Logger};
use crate::net::acceptor::Acceptor;
use crate::net::addr::InetAddr;
use crate::net::config::TcpServerConfig;
use crate::net::conn::{ConnOptions, TcpConnection, TcpConnectionPtr};
use crate::net::socket::Socket;
use crate::net::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::buffer::Buffer;
use crate::reactor::Reactor;
use crate::reactor_pool::ReactorPool;
use crate::timestamp::Timestamp;

/// Multi-reactor TCP server.
///
/// Owns the acceptor on the given reactor and a pool of worker reactors.
/// Each accepted connection is named, bound to a worker picked round-robin,
/// inserted into the connection map, and established on its worker. The map
/// is mutated only on the listening reactor's thread.
pub struct TcpServer {
    reactor: Arc<Reactor>,
    name: String,
    ip_port: String,
    listen_addr: InetAddr,
    acceptor: Arc<Acceptor>,
    pool: ReactorPool,
    config: TcpServerConfig,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    started: AtomicBool,
    logger: Arc<dyn Logger>,
}

impl TcpServer {
    /// Bind the listening socket. The server does not accept until `start`.
    pub fn new(reactor: &Arc<Reactor>, config: TcpServerConfig) -> Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(
            reactor,
            &config.address,
            config.reuse_port,
            config.logger.clone(),
        )?;
        let listen_addr = acceptor.local_addr()?;

        let server = Arc::new(TcpServer {
            reactor: reactor.clone(),
            name: config.name.clone(),
            ip_port: listen_addr.to_string(),
            listen_addr,
            acceptor,
            pool: ReactorPool::new(reactor.clone(), &config.name),
            logger: config.logger.clone(),
            config,
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual bound endpoint (resolves port 0 binds).
    pub fn listen_addr(&self) -> InetAddr {
        self.listen_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        *self.connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync + 'static,
    {
        *self.message_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        *self.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
    {
        *self.high_water_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Start the worker pool and begin accepting. Idempotent and safe from
    /// any thread.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.start(
            self.config.worker_count,
            self.config.poller,
            self.config.logger.clone(),
            self.config.thread_init.clone(),
        );
        let acceptor = self.acceptor.clone();
        self.reactor.run_in_loop(move || acceptor.listen());
    }

    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: InetAddr) {
        self.reactor.assert_in_loop_thread();
        let worker = self.pool.get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        self.logger.log(
            LogLevel::Info,
            &format!("{}: new connection [{conn_name}] from {peer_addr}", self.name),
        );

        let local_addr = socket.local_addr().unwrap_or(self.listen_addr);
        let conn = TcpConnection::new(
            worker.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
            &ConnOptions {
                keep_alive: self.config.keep_alive,
                no_delay: self.config.no_delay,
                high_water_mark: self.config.high_water_mark,
                logger: self.config.logger.clone(),
            },
        );

        conn.set_connection_callback(self.connection_cb.lock().unwrap().clone());
        conn.set_message_callback(self.message_cb.lock().unwrap().clone());
        conn.set_write_complete_callback(self.write_complete_cb.lock().unwrap().clone());
        conn.set_high_water_mark_callback(self.high_water_cb.lock().unwrap().clone());
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());
        worker.run_in_loop(move || conn.connect_established());
    }

    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        // Weak, so a task stranded in a stopped reactor's queue cannot move
        // the server's final drop onto a foreign thread.
        let weak = Arc::downgrade(self);
        let conn = conn.clone();
        self.reactor.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(&conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.reactor.assert_in_loop_thread();
        self.logger.log(
            LogLevel::Info,
            &format!("{}: removing connection [{}]", self.name, conn.name()),
        );
        self.connections.lock().unwrap().remove(conn.name());
        let conn = conn.clone();
        conn.reactor()
            .clone()
            .queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections = mem::take(&mut *self.connections.lock().unwrap());
        for (_, conn) in connections {
            let worker = conn.reactor().clone();
            worker.queue_in_loop(move || conn.connect_destroyed());
        }
        // The pool field drops next, quitting each worker after its queued
        // destroys have run.
    }
}
