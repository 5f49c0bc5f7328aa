use std::sync::Arc;

use crate::logger::{Logger, NoOpLogger};
use crate::net::addr::InetAddr;
use crate::net::conn::DEFAULT_HIGH_WATER_MARK;
use crate::poll::PollerKind;
use crate::reactor_pool::ThreadInitCallback;

/// Configuration for a TCP server.
///
/// Controls the listen endpoint, worker distribution, socket options on
/// accepted connections, and the logger shared by every component. Use
/// `TcpServerConfig::builder()` for ergonomic construction.
///
/// ## Socket options
///
/// - `no_delay`: when enabled (default), disables Nagle's algorithm on
///   accepted sockets for lower latency
/// - `keep_alive`: sets `SO_KEEPALIVE` on accepted sockets (default on)
/// - `reuse_port`: sets `SO_REUSEPORT` on the listening socket so several
///   processes can share the port with kernel-side load distribution
///
/// ## Distribution
///
/// - `worker_count`: reactor threads accepting hand-offs; zero means the
///   listening reactor serves connections itself
/// - `thread_init`: runs on each worker thread before its loop starts
#[derive(Clone)]
pub struct TcpServerConfig {
    /// Server name, used in connection names and thread names
    pub name: String,
    /// Address to bind to
    pub address: InetAddr,
    /// Enable SO_REUSEPORT on the listening socket
    pub reuse_port: bool,
    /// Number of worker reactors
    pub worker_count: usize,
    /// Demultiplexer backend for all reactors started by this server
    pub poller: PollerKind,
    /// Enable TCP_NODELAY on accepted sockets
    pub no_delay: bool,
    /// Enable SO_KEEPALIVE on accepted sockets
    pub keep_alive: bool,
    /// Output-buffer occupancy threshold for the high-water callback
    pub high_water_mark: usize,
    /// Runs on each worker thread after its reactor exists
    pub thread_init: Option<ThreadInitCallback>,
    /// Logger for server events
    pub logger: Arc<dyn Logger>,
}

impl TcpServerConfig {
    /// Create a new builder for TcpServerConfig
    pub fn builder() -> TcpServerConfigBuilder {
        TcpServerConfigBuilder::new()
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            name: "sluice-server".to_string(),
            address: InetAddr::loopback(0),
            reuse_port: false,
            worker_count: 0,
            poller: PollerKind::default(),
            no_delay: true,
            keep_alive: true,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            thread_init: None,
            logger: Arc::new(NoOpLogger),
        }
    }
}

/// Builder for TcpServerConfig using the builder pattern.
///
/// All fields are optional and fall back to `TcpServerConfig::default()`.
pub struct TcpServerConfigBuilder {
    name: Option<String>,
    address: Option<InetAddr>,
    reuse_port: Option<bool>,
    worker_count: Option<usize>,
    poller: Option<PollerKind>,
    no_delay: Option<bool>,
    keep_alive: Option<bool>,
    high_water_mark: Option<usize>,
    thread_init: Option<ThreadInitCallback>,
    logger: Option<Arc<dyn Logger>>,
}

impl TcpServerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            name: None,
            address: None,
            reuse_port: None,
            worker_count: None,
            poller: None,
            no_delay: None,
            keep_alive: None,
            high_water_mark: None,
            thread_init: None,
            logger: None,
        }
    }

    /// Set the server name
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set the address to bind to
    pub fn address(mut self, address: InetAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Enable or disable SO_REUSEPORT
    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = Some(enabled);
        self
    }

    /// Set the number of worker reactors
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Choose the demultiplexer backend
    pub fn poller(mut self, kind: PollerKind) -> Self {
        self.poller = Some(kind);
        self
    }

    /// Enable or disable TCP_NODELAY on accepted sockets
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Enable or disable SO_KEEPALIVE on accepted sockets
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = Some(enabled);
        self
    }

    /// Set the high-water mark for connection output buffers
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = Some(bytes);
        self
    }

    /// Set the per-worker thread initialization callback
    pub fn thread_init(mut self, init: ThreadInitCallback) -> Self {
        self.thread_init = Some(init);
        self
    }

    /// Set the logger implementation
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the TcpServerConfig
    pub fn build(self) -> TcpServerConfig {
        let default = TcpServerConfig::default();
        TcpServerConfig {
            name: self.name.unwrap_or(default.name),
            address: self.address.unwrap_or(default.address),
            reuse_port: self.reuse_port.unwrap_or(default.reuse_port),
            worker_count: self.worker_count.unwrap_or(default.worker_count),
            poller: self.poller.unwrap_or(default.poller),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            high_water_mark: self.high_water_mark.unwrap_or(default.high_water_mark),
            thread_init: self.thread_init.or(default.thread_init),
            logger: self.logger.unwrap_or(default.logger),
        }
    }
}

impl Default for TcpServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
