//! Wires the TCP server to file sessions.

use crate::config::ServerConfig;
use crate::file_manager::FileManager;
use crate::metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE};
use crate::session::FileSession;
use evio::{Error, InetAddress, LoopHandle, PortReuse, TcpServer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// The file-transfer server: a [`TcpServer`] whose connections each carry a
/// [`FileSession`], plus the shared [`FileManager`].
pub struct FileServer {
    server: TcpServer,
    worker_threads: usize,
}

impl FileServer {
    pub fn new(
        base_loop: LoopHandle,
        config: &ServerConfig,
        cache_dir: &Path,
    ) -> Result<Self, Error> {
        let listen_addr = InetAddress::from_ip_port(&config.listen_ip, config.listen_port)?;
        let reuse = if config.reuse_port {
            PortReuse::Enabled
        } else {
            PortReuse::Disabled
        };

        let manager = Arc::new(FileManager::new(cache_dir)?);
        let server = TcpServer::with_poller(
            base_loop,
            &listen_addr,
            "fileserver",
            reuse,
            config.poller,
        )?;

        let sessions: Arc<Mutex<HashMap<String, Arc<FileSession>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        {
            let sessions = sessions.clone();
            let manager = manager.clone();
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    CONNECTIONS_ACCEPTED.increment();
                    CONNECTIONS_ACTIVE.increment();
                    let session = Arc::new(FileSession::new(conn, manager.clone()));
                    sessions.lock().insert(conn.name().to_string(), session);
                    debug!(name = conn.name(), peer = %conn.peer_address(), "session opened");
                } else {
                    CONNECTIONS_ACTIVE.decrement();
                    sessions.lock().remove(conn.name());
                    debug!(name = conn.name(), "session closed");
                }
            });
        }
        {
            let sessions = sessions.clone();
            server.set_message_callback(move |conn, buffer, when| {
                let session = sessions.lock().get(conn.name()).cloned();
                match session {
                    Some(session) => session.on_read(conn, buffer, when),
                    // Data raced ahead of the connection callback; leave it
                    // buffered for the next readable event.
                    None => debug!(name = conn.name(), "message before session exists"),
                }
            });
        }

        Ok(FileServer {
            server,
            worker_threads: config.worker_threads,
        })
    }

    /// The bound listen address (resolves a configured port of 0).
    pub fn listen_address(&self) -> std::io::Result<InetAddress> {
        self.server.listen_address()
    }

    pub fn start(&self) {
        self.server.start(self.worker_threads);
    }

    pub fn stop(&self) {
        self.server.stop();
    }
}
