//! One-acceptor / N-worker-loop TCP server.

use crate::acceptor::Acceptor;
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::event_loop_thread::ThreadInitCallback;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::inet_address::InetAddress;
use crate::poller::PollerKind;
use crate::sockets::{self, Socket};
use crate::tcp_connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Whether the listening socket sets `SO_REUSEPORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortReuse {
    Disabled,
    #[default]
    Enabled,
}

struct ServerInner {
    base_loop: LoopHandle,
    name: String,
    hostport: String,
    acceptor: Acceptor,
    pool: Mutex<EventLoopThreadPool>,
    /// Accepted connections by name; mutated only in the base loop.
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
}

/// A multi-loop TCP server.
///
/// The acceptor runs on the base loop; each accepted connection is assigned
/// a worker loop round-robin and lives there until it closes.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn new(
        base_loop: LoopHandle,
        listen_addr: &InetAddress,
        name: &str,
        reuse: PortReuse,
    ) -> Result<Self, Error> {
        Self::with_poller(base_loop, listen_addr, name, reuse, PollerKind::default())
    }

    /// Like [`new`](Self::new), choosing the poller backend the worker
    /// loops will use.
    pub fn with_poller(
        base_loop: LoopHandle,
        listen_addr: &InetAddress,
        name: &str,
        reuse: PortReuse,
        poller_kind: PollerKind,
    ) -> Result<Self, Error> {
        let acceptor = Acceptor::new(
            base_loop.clone(),
            listen_addr,
            reuse == PortReuse::Enabled,
        )?;
        let pool = EventLoopThreadPool::new(base_loop.clone(), name.to_string(), poller_kind);

        let inner = Arc::new(ServerInner {
            base_loop,
            name: name.to_string(),
            hostport: listen_addr.to_ip_port(),
            acceptor,
            pool: Mutex::new(pool),
            connections: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
        });

        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        inner.acceptor.set_new_connection_callback(move |socket, peer| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::new_connection(&inner, socket, peer);
            }
        });

        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configured `"ip:port"` string.
    pub fn hostport(&self) -> &str {
        &self.inner.hostport
    }

    /// The bound listen address (resolves a requested port of 0).
    pub fn listen_address(&self) -> io::Result<InetAddress> {
        self.inner.acceptor.listen_address()
    }

    pub fn base_loop(&self) -> &LoopHandle {
        &self.inner.base_loop
    }

    pub fn set_connection_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        *self.inner.connection_callback.lock() = Some(Arc::new(callback));
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr, &mut crate::buffer::ByteBuffer, crate::timestamp::Timestamp)
            + Send
            + Sync
            + 'static,
    {
        *self.inner.message_callback.lock() = Some(Arc::new(callback));
    }

    pub fn set_write_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        *self.inner.write_complete_callback.lock() = Some(Arc::new(callback));
    }

    /// Run `callback` inside each worker loop thread as it starts. Set
    /// before [`start`](Self::start).
    pub fn set_thread_init_callback<F>(&self, callback: F)
    where
        F: Fn(&LoopHandle) + Send + Sync + 'static,
    {
        *self.inner.thread_init_callback.lock() = Some(Arc::new(callback));
    }

    /// Start the worker pool and begin listening. Idempotent.
    pub fn start(&self, worker_threads: usize) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            name = %self.inner.name,
            addr = %self.inner.hostport,
            workers = worker_threads,
            "starting server"
        );

        let init = self.inner.thread_init_callback.lock().clone();
        self.inner.pool.lock().start(worker_threads, init);

        let acceptor = self.inner.acceptor.clone();
        self.inner.base_loop.run_in_loop(move || {
            if let Err(e) = acceptor.listen() {
                panic!("failed to listen: {e}");
            }
        });
    }

    /// Stop accepting and tear down every live connection.
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.inner.name, "stopping server");

        let inner = self.inner.clone();
        self.inner.base_loop.run_in_loop(move || {
            inner.acceptor.stop_listening();
            let connections: Vec<TcpConnectionPtr> =
                inner.connections.lock().drain().map(|(_, c)| c).collect();
            for conn in connections {
                let worker = conn.loop_handle().clone();
                worker.queue_in_loop(move || conn.connect_destroyed());
            }
        });

        self.inner.pool.lock().stop();
    }
}

impl ServerInner {
    /// Runs in the base loop for every accepted socket: name it, bind it to
    /// the next worker loop, wire its callbacks, and hand it over.
    fn new_connection(inner: &Arc<ServerInner>, socket: Socket, peer: InetAddress) {
        inner.base_loop.assert_in_loop_thread();

        let worker = inner.pool.lock().get_next_loop();
        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}#{}", inner.hostport, id);

        let local = match sockets::local_address(socket.fd()) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "getsockname failed on accepted socket");
                InetAddress::any(0)
            }
        };
        info!(name = %name, peer = %peer, "new connection");

        let conn = TcpConnection::new(worker.clone(), name.clone(), socket, local, peer);
        conn.set_connection_callback_arc(inner.connection_callback.lock().clone());
        conn.set_message_callback_arc(inner.message_callback.lock().clone());
        conn.set_write_complete_callback_arc(inner.write_complete_callback.lock().clone());
        {
            let weak = Arc::downgrade(inner);
            conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
                if let Some(inner) = weak.upgrade() {
                    ServerInner::remove_connection(&inner, conn.clone());
                }
            }));
        }

        inner.connections.lock().insert(name, conn.clone());
        worker.run_in_loop(move || conn.connect_established());
    }

    /// Thread-safe: hop to the base loop, where the map lives.
    fn remove_connection(inner: &Arc<ServerInner>, conn: TcpConnectionPtr) {
        let inner = inner.clone();
        let base = inner.base_loop.clone();
        base.run_in_loop(move || ServerInner::remove_connection_in_loop(&inner, conn));
    }

    fn remove_connection_in_loop(inner: &Arc<ServerInner>, conn: TcpConnectionPtr) {
        inner.base_loop.assert_in_loop_thread();
        debug!(name = %conn.name(), "removing connection");
        inner.connections.lock().remove(conn.name());

        // Queued, not run inline: the connection must stay alive until the
        // worker loop re-enters its task drain, even when removal happens
        // in the middle of a callback stack unwind.
        let worker = conn.loop_handle().clone();
        worker.queue_in_loop(move || conn.connect_destroyed());
    }
}
