//! # Millrace
//! A multi-threaded reactor engine for non-blocking TCP that provides buffered
//! connections with backpressure, without relying on heavyweight async
//! runtimes like Tokio.
//! Millrace follows the classic one-loop-per-thread reactor design on top of
//! [`mio`]: a base loop accepts connections and a configurable pool of I/O
//! loops serves them, each descriptor owned by exactly one loop for its whole
//! life.
//! ## Core Philosophy
//! Millrace was designed for services that require:
//! - **Predictable threading**: every callback for a connection runs on one
//!   known thread, so handlers rarely need their own locks
//! - **Runtime-agnostic architecture** that doesn't force async/await patterns
//! - **Explicit backpressure** through output-queue high-water marks
//! ## Architecture Overview
//! ```text
//! ┌───────────┐    ┌────────────┐    ┌───────────────┐
//! │ TcpServer │───▶│  Acceptor  │───▶│   base loop   │
//! └───────────┘    └────────────┘    └───────────────┘
//!       │
//!       ▼
//! ┌────────────────┐    ┌─────────────────────────────┐
//! │ LoopThreadPool │───▶│ I/O loops (one per thread)  │
//! └────────────────┘    │  └─ TcpConnection × N       │
//!                       └─────────────────────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use millrace::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let mut base_loop = EventLoop::new()?;
//!
//!     let config = ServerConfig::new("127.0.0.1:8080".parse()?, "echo")
//!         .with_worker_loops(4);
//!     let server = TcpServer::new(base_loop.handle(), config)?;
//!
//!     server.set_message_callback(Arc::new(|conn, input, _at| {
//!         let n = input.readable_bytes();
//!         let payload = input.consume_as_string(n);
//!         conn.send(payload.as_bytes());
//!     }));
//!
//!     server.start();
//!     base_loop.run(); // blocks until base_loop.handle().quit()
//!     Ok(())
//! }
//! ```

pub mod acceptor;
pub mod buffer;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod event_source;
pub mod loop_pool;
pub mod loop_thread;
pub mod poller;
pub mod server;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use connection::{ConnState, TcpConnection, DEFAULT_HIGH_WATER_MARK};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use event_source::EventSource;
pub use loop_pool::LoopThreadPool;
pub use loop_thread::LoopThread;
pub use poller::{Multiplexer, PollMultiplexer};
pub use server::{ServerConfig, TcpServer};

/// Convenient single import for server code.
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::connection::{
        ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
        WriteCompleteCallback,
    };
    pub use crate::error::{Error, Result};
    pub use crate::event_loop::{EventLoop, LoopHandle};
    pub use crate::loop_thread::ThreadInitCallback;
    pub use crate::server::{ServerConfig, TcpServer};
}
