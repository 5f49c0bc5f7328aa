//! Per-connection state machine.
//!
//! A `TcpConnection` owns its socket, its channel, and an input and output
//! buffer. After the accept hand-off it lives exclusively on one worker
//! reactor: every public operation is safe from any thread and forwards
//! itself to that reactor when called elsewhere, and all state mutation
//! happens in-loop.
//!
//! ```text
//! Connecting --established--> Connected
//! Connected --shutdown--> Disconnecting --writes drained--> half-close --peer FIN--> Disconnected
//! Connected --peer FIN / fatal error--> Disconnected
//! Connecting/Connected --force_close--> Disconnecting --> Disconnected
//! ```

use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::logger::{LogLevel, Logger};
use crate::net::addr::InetAddr;
use crate::net::socket::Socket;
use crate::net::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::reactor::Reactor;
use crate::timestamp::Timestamp;

pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Output-buffer occupancy threshold above which the high-water callback
/// fires, unless configured otherwise.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

pub(crate) struct ConnOptions {
    pub keep_alive: bool,
    pub no_delay: bool,
    pub high_water_mark: usize,
    pub logger: Arc<dyn Logger>,
}

pub struct TcpConnection {
    reactor: Arc<Reactor>,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    logger: Arc<dyn Logger>,
}

impl TcpConnection {
    pub(crate) fn new(
        reactor: Arc<Reactor>,
        name: String,
        socket: Socket,
        local_addr: InetAddr,
        peer_addr: InetAddr,
        options: &ConnOptions,
    ) -> TcpConnectionPtr {
        if let Err(e) = socket.set_keep_alive(options.keep_alive) {
            options
                .logger
                .log(LogLevel::Warn, &format!("{name}: SO_KEEPALIVE failed: {e}"));
        }
        if options.no_delay {
            if let Err(e) = socket.set_tcp_no_delay(true) {
                options
                    .logger
                    .log(LogLevel::Warn, &format!("{name}: TCP_NODELAY failed: {e}"));
            }
        }

        let channel = Channel::new(Arc::downgrade(&reactor), socket.as_raw_fd());
        let conn = Arc::new(TcpConnection {
            reactor,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(true),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(options.high_water_mark),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            context: Mutex::new(None),
            logger: options.logger.clone(),
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(Box::new(move |at| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(at);
            }
        }));
        let weak = Arc::downgrade(&conn);
        conn.channel.set_write_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        }));
        let weak = Arc::downgrade(&conn);
        conn.channel.set_close_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        }));
        let weak = Arc::downgrade(&conn);
        conn.channel.set_error_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddr {
        self.peer_addr
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Relaxed);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = self.socket.set_tcp_no_delay(on) {
            self.logger
                .log(LogLevel::Warn, &format!("{}: TCP_NODELAY failed: {e}", self.name));
        }
    }

    /// Attach embedder state to this connection.
    pub fn set_context(&self, context: Box<dyn Any + Send + Sync>) {
        *self.context.lock().unwrap() = Some(context);
    }

    pub fn context(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send + Sync>>> {
        self.context.lock().unwrap()
    }

    /// Bytes queued in the output buffer and not yet written to the socket.
    pub fn pending_bytes(&self) -> usize {
        self.output.lock().unwrap().readable_bytes()
    }

    /// Send `data`, writing directly when nothing is queued and buffering
    /// the remainder. Safe from any thread.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.reactor.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let data = data.to_vec();
            self.reactor.queue_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Half-close the write direction once buffered output has drained.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = self.clone();
            self.reactor.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Close without waiting for buffered output.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let conn = self.clone();
            self.reactor.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let weak = Arc::downgrade(self);
            // force_close, not force_close_in_loop: the timer callback may
            // race a close that already happened.
            self.reactor.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Resume read interest after `stop_read`.
    pub fn start_read(self: &Arc<Self>) {
        let conn = self.clone();
        self.reactor.run_in_loop(move || {
            if !conn.reading.load(Ordering::Acquire) || !conn.channel.is_reading() {
                conn.channel.enable_reading();
                conn.reading.store(true, Ordering::Release);
            }
        });
    }

    /// Drop read interest without closing the connection.
    pub fn stop_read(self: &Arc<Self>) {
        let conn = self.clone();
        self.reactor.run_in_loop(move || {
            if conn.reading.load(Ordering::Acquire) || conn.channel.is_reading() {
                conn.channel.disable_reading();
                conn.reading.store(false, Ordering::Release);
            }
        });
    }

    pub(crate) fn set_connection_callback(&self, cb: Option<ConnectionCallback>) {
        *self.connection_cb.lock().unwrap() = cb;
    }

    pub(crate) fn set_message_callback(&self, cb: Option<MessageCallback>) {
        *self.message_cb.lock().unwrap() = cb;
    }

    pub(crate) fn set_write_complete_callback(&self, cb: Option<WriteCompleteCallback>) {
        *self.write_complete_cb.lock().unwrap() = cb;
    }

    pub(crate) fn set_high_water_mark_callback(&self, cb: Option<HighWaterMarkCallback>) {
        *self.high_water_cb.lock().unwrap() = cb;
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    /// Final step of the accept hand-off, run on the worker reactor.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.reactor.assert_in_loop_thread();
        debug_assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        self.reading.store(true, Ordering::Release);
        self.channel.tie(self.clone());
        self.channel.enable_reading();
        self.fire_connection_callback();
    }

    /// Last in-loop step after the server dropped its map entry: detach the
    /// channel so the final reference can go away.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        self.reactor.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            self.fire_connection_callback();
        }
        self.channel.remove();
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn fire_connection_callback(self: &Arc<Self>) {
        let cb = self.connection_cb.lock().unwrap().clone();
        match cb {
            Some(cb) => cb(self),
            None => self.logger.log(
                LogLevel::Debug,
                &format!(
                    "{}: {} -> {} is {}",
                    self.name,
                    self.local_addr,
                    self.peer_addr,
                    if self.is_connected() { "UP" } else { "DOWN" }
                ),
            ),
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.reactor.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            self.logger.log(
                LogLevel::Warn,
                &format!("{}: disconnected, giving up the write", self.name),
            );
            return;
        }

        let mut wrote = 0;
        let mut fault = false;
        // Nothing queued and write interest off: try the direct write first.
        if !self.channel.is_writing() && self.output.lock().unwrap().readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                            let conn = self.clone();
                            self.reactor.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.logger
                        .log(LogLevel::Error, &format!("{}: write failed: {e}", self.name));
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) {
                        fault = true;
                    }
                }
            }
        }

        let remaining = data.len() - wrote;
        if !fault && remaining > 0 {
            let mut output = self.output.lock().unwrap();
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            // One shot per upward crossing of the threshold.
            if old_len + remaining >= mark && old_len < mark {
                if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
                    let conn = self.clone();
                    let pending = old_len + remaining;
                    self.reactor.queue_in_loop(move || cb(&conn, pending));
                }
            }
            output.append(&data[wrote..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.reactor.assert_in_loop_thread();
        // With buffered output still in flight the half-close is deferred to
        // handle_write, which performs it once the buffer drains.
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                self.logger
                    .log(LogLevel::Error, &format!("{}: shutdown failed: {e}", self.name));
            }
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.reactor.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            // Same path as receiving a FIN.
            self.handle_close();
        }
    }

    fn handle_read(self: &Arc<Self>, at: Timestamp) {
        self.reactor.assert_in_loop_thread();
        loop {
            let result = self.input.lock().unwrap().read_fd(self.channel.fd());
            match result {
                Ok(0) => {
                    self.handle_close();
                    return;
                }
                Ok(_) => {
                    let cb = self.message_cb.lock().unwrap().clone();
                    let mut input = self.input.lock().unwrap();
                    match cb {
                        Some(cb) => cb(self, &mut input, at),
                        None => input.retrieve_all(),
                    }
                    // Keep draining: under the edge-ready backend this
                    // readiness will not be reported again.
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.logger
                        .log(LogLevel::Error, &format!("{}: read failed: {e}", self.name));
                    self.handle_error();
                    self.handle_close();
                    return;
                }
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.reactor.assert_in_loop_thread();
        if !self.channel.is_writing() {
            self.logger.log(
                LogLevel::Debug,
                &format!("{}: connection is down, no more writing", self.name),
            );
            return;
        }
        loop {
            let result = {
                let output = self.output.lock().unwrap();
                if output.readable_bytes() == 0 {
                    break;
                }
                self.socket.write(output.peek())
            };
            match result {
                Ok(0) => {
                    self.logger.log(
                        LogLevel::Error,
                        &format!("{}: wrote nothing with output pending", self.name),
                    );
                    self.handle_close();
                    return;
                }
                Ok(n) => {
                    let drained = {
                        let mut output = self.output.lock().unwrap();
                        output.retrieve(n);
                        output.readable_bytes() == 0
                    };
                    if drained {
                        self.channel.disable_writing();
                        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                            let conn = self.clone();
                            self.reactor.queue_in_loop(move || cb(&conn));
                        }
                        if self.state() == State::Disconnecting {
                            self.shutdown_in_loop();
                        }
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.logger
                        .log(LogLevel::Error, &format!("{}: write failed: {e}", self.name));
                    break;
                }
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.reactor.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            return;
        }
        self.logger.log(
            LogLevel::Debug,
            &format!("{}: closing, state = {:?}", self.name, self.state()),
        );
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        self.fire_connection_callback();
        let close_cb = self.close_cb.lock().unwrap().clone();
        if let Some(cb) = close_cb {
            // Must stay last: the receiver drops the server's map entry.
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = self.socket.take_error().ok().flatten();
        self.logger.log(
            LogLevel::Error,
            &format!("{}: SO_ERROR = {}", self.name, err.map_or_else(|| "none".to_string(), |e| e.to_string())),
        );
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug_assert_eq!(self.state(), State::Disconnected);
    }
}
