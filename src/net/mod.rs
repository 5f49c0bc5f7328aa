//! TCP networking on top of the reactor core.
//!
//! The server façade binds an acceptor to its listening reactor and
//! distributes accepted connections across a pool of worker reactors:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     User Application                     │
//! │        connection / message / write-complete /           │
//! │               high-water callbacks                       │
//! └──────────────▲───────────────────────────────────────────┘
//!                │ callbacks on worker reactors
//! ┌──────────────┴───────────────────────────────────────────┐
//! │ TcpServer                                                │
//! │   ┌──────────┐   hand-off   ┌─────────────────────────┐  │
//! │   │ Acceptor │─────────────▶│ ReactorPool (N workers) │  │
//! │   │ (listen  │  round-robin │  one TcpConnection per  │  │
//! │   │ reactor) │              │  accepted socket        │  │
//! │   └──────────┘              └─────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! After the hand-off a connection's reads, writes, and close run
//! exclusively on its worker reactor.

pub mod acceptor;
pub mod addr;
pub mod config;
pub mod conn;
pub mod server;
pub mod socket;

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::timestamp::Timestamp;

pub use addr::InetAddr;
pub use config::{TcpServerConfig, TcpServerConfigBuilder};
pub use conn::{TcpConnection, TcpConnectionPtr, DEFAULT_HIGH_WATER_MARK};
pub use server::TcpServer;
pub use socket::Socket;

/// Fired on entry to Connected and again on entry to Disconnected.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired with the connection's input buffer after bytes arrive; the callback
/// consumes what it wants via `retrieve`/typed reads and may leave a partial
/// message for the next round.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;

/// Scheduled once each time the output buffer drains to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired once per upward crossing of the output-buffer threshold, with the
/// pending byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Installed by the server; the receiver removes the connection from the map
/// and schedules the in-loop destroy.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Acceptor to server: an accepted socket and its peer endpoint.
pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddr) + Send>;
