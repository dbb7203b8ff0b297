//! evio - multi-threaded reactor runtime for TCP services.
//!
//! The core of this crate is a classic one-loop-per-thread reactor: each
//! [`EventLoop`] blocks on a readiness [`Poller`](poller::Poller), dispatches
//! ready file descriptors through per-fd [`Channel`]s, fires expired timers,
//! and drains tasks queued from other threads. [`TcpServer`] composes a
//! listening [`Acceptor`] on a base loop with a pool of worker loops and
//! hands every accepted [`TcpConnection`] to one worker for its lifetime.
//!
//! # Threading model
//!
//! A loop is driven only by the thread that created it. Everything another
//! thread wants done on a loop travels through that loop's [`LoopHandle`] as
//! a queued task, woken via an `eventfd`. Connections are `Arc`-shared so a
//! callback may keep one alive across an asynchronous close, but their
//! buffers and state machine are touched exclusively on the owning loop
//! thread.
//!
//! # Quick start
//!
//! ```ignore
//! use evio::{EventLoop, InetAddress, TcpServer, PortReuse};
//!
//! let mut base_loop = EventLoop::new()?;
//! let addr = InetAddress::any(18080);
//! let server = TcpServer::new(base_loop.handle(), &addr, "echo", PortReuse::Enabled)?;
//! server.set_message_callback(|conn, buffer, _when| {
//!     let bytes = buffer.retrieve_all_as_bytes();
//!     conn.send(&bytes);
//! });
//! server.start(4);
//! base_loop.run();
//! ```

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod event_loop_thread;
pub mod event_loop_thread_pool;
pub mod inet_address;
pub mod poller;
pub mod sockets;
pub mod tcp_connection;
pub mod tcp_server;
pub mod timer;
pub mod timestamp;

pub use acceptor::Acceptor;
pub use buffer::ByteBuffer;
pub use channel::Channel;
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use inet_address::InetAddress;
pub use poller::PollerKind;
pub use sockets::Socket;
pub use tcp_connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use tcp_server::{PortReuse, TcpServer};
pub use timer::TimerId;
pub use timestamp::Timestamp;
