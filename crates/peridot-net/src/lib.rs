//! # peridot-net: multi-reactor TCP server framework
//!
//! A non-blocking TCP transport foundation for Linux hosts. The server
//! accepts connections on a listening endpoint, deals them round-robin
//! across a fixed pool of I/O reactors, and delivers byte-stream events
//! (connection up, data arrived, write buffer drained, connection closed)
//! to application callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Server                             │
//! │  ┌──────────┐    ┌───────────────────────┐   ┌────────────┐  │
//! │  │ acceptor │ →  │ io-0 .. io-N reactors │ → │ callbacks  │  │
//! │  │ reactor  │    │ (one epoll + thread)  │   │ (your code)│  │
//! │  └──────────┘    └───────────────────────┘   └────────────┘  │
//! │        ↑ accept4 burst         ↑ post + eventfd wakeup       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each reactor is a single-threaded epoll loop; a connection lives its
//! whole life on the reactor it was dealt to, so per-connection state needs
//! no coordination. Other threads reach a reactor only by posting tasks,
//! which wake it through a counting eventfd. An idle-connection sweeper
//! ticks once a second, and read/write scratch memory comes from a
//! size-classed buffer pool with move-only handles.
//!
//! ## Usage
//!
//! ```ignore
//! use peridot_net::{Server, ServerConfig};
//!
//! let config = ServerConfig::new("0.0.0.0", 7000)?.with_name("echo");
//! let server = Server::bind(config)?;
//! server.set_message_callback(|conn, buffer, _ts| {
//!     conn.send(buffer.as_slice());
//! });
//! server.serve_forever();
//! ```

pub mod addr;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod socket;
pub mod timeout;
pub mod timestamp;

pub use addr::Address;
pub use buffer::Buffer;
pub use channel::{Channel, ChannelState, EventSet};
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{NetError, NetResult};
pub use pool::{BufferPool, PooledBuffer};
pub use reactor::EventLoop;
pub use server::{Server, ShutdownHandle};
pub use socket::Socket;
pub use timeout::TimeoutManager;
pub use timestamp::Timestamp;
