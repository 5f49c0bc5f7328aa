//! A thread-safe, non-blocking, multi-reactor TCP networking library.
//!
//! One event loop runs per thread: the listening reactor accepts
//! connections and hands each one off to a worker reactor, where all of its
//! reads, buffered writes, and close processing happen from then on. The
//! design eliminates the need for async/await while providing efficient
//! non-blocking I/O through per-connection callbacks.
//!
//! # Example
//!
//! ```rust,no_run
//! use sluice::{Reactor, TcpServer, TcpServerConfig};
//!
//! fn main() -> sluice::Result<()> {
//!     let reactor = Reactor::new()?;
//!     let config = TcpServerConfig::builder()
//!         .name("echo")
//!         .address("127.0.0.1:7000".parse()?)
//!         .worker_count(4)
//!         .build();
//!     let server = TcpServer::new(&reactor, config)?;
//!     server.set_message_callback(|conn, buf, _at| {
//!         let bytes = buf.retrieve_all_as_bytes();
//!         conn.send(&bytes);
//!     });
//!     server.start();
//!     reactor.run();
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod channel;
pub mod error;
pub mod logger;
pub mod net;
pub mod poll;
pub mod reactor;
pub mod reactor_pool;
pub mod timer;
pub mod timestamp;

pub use buffer::Buffer;
pub use channel::Channel;
pub use error::{Error, Result};
pub use logger::{LogLevel, Logger, NoOpLogger};
pub use net::{
    ConnectionCallback, HighWaterMarkCallback, InetAddr, MessageCallback, TcpConnection,
    TcpConnectionPtr, TcpServer, TcpServerConfig, TcpServerConfigBuilder,
    WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
pub use poll::PollerKind;
pub use reactor::Reactor;
pub use reactor_pool::{ReactorPool, ThreadInitCallback};
pub use timer::TimerId;
pub use timestamp::Timestamp;
