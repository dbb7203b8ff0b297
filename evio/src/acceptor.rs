//! Listening socket management for the base loop.

use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::inet_address::InetAddress;
use crate::sockets::{self, Socket};
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

/// Invoked in the base loop for every accepted connection.
pub type NewConnectionCallback = Arc<dyn Fn(Socket, InetAddress) + Send + Sync>;

struct AcceptorInner {
    loop_handle: LoopHandle,
    socket: Socket,
    channel: Channel,
    listening: AtomicBool,
    /// Reserved descriptor (open on /dev/null) released to absorb an
    /// `EMFILE` accept storm.
    idle_fd: Mutex<RawFd>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

/// Owns the listening socket and turns readiness on it into
/// new-connection callbacks, all on the base loop.
#[derive(Clone)]
pub struct Acceptor {
    inner: Arc<AcceptorInner>,
}

impl Acceptor {
    /// Bind the listening socket (not yet listening). `SO_REUSEADDR` is
    /// always set; `SO_REUSEPORT` on request.
    pub fn new(
        loop_handle: LoopHandle,
        listen_addr: &InetAddress,
        reuse_port: bool,
    ) -> Result<Self, Error> {
        let socket = Socket::bind_listener(listen_addr, reuse_port)?;
        let idle_fd = open_idle_fd()?;
        let channel = Channel::new(loop_handle.clone(), socket.fd());

        let inner = Arc::new(AcceptorInner {
            loop_handle,
            socket,
            channel,
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(idle_fd),
            new_connection_callback: Mutex::new(None),
        });

        let weak: Weak<AcceptorInner> = Arc::downgrade(&inner);
        inner.channel.set_read_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                handle_read(&inner);
            }
        });

        Ok(Acceptor { inner })
    }

    pub fn set_new_connection_callback<F>(&self, callback: F)
    where
        F: Fn(Socket, InetAddress) + Send + Sync + 'static,
    {
        *self.inner.new_connection_callback.lock() = Some(Arc::new(callback));
    }

    pub fn listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// The address the socket is actually bound to (resolves port 0).
    pub fn listen_address(&self) -> io::Result<InetAddress> {
        sockets::local_address(self.inner.socket.fd())
    }

    /// Start listening and arm read interest. Base-loop thread only.
    pub fn listen(&self) -> Result<(), Error> {
        self.inner.loop_handle.assert_in_loop_thread();
        self.inner.socket.listen()?;
        self.inner.listening.store(true, Ordering::Release);
        self.inner.channel.enable_reading();
        info!(addr = %self.listen_address().map(|a| a.to_ip_port()).unwrap_or_default(), "listening");
        Ok(())
    }

    /// Stop accepting and unregister the channel. Base-loop thread only.
    pub fn stop_listening(&self) {
        self.inner.loop_handle.assert_in_loop_thread();
        if self.inner.listening.swap(false, Ordering::AcqRel) {
            self.inner.channel.disable_all();
            self.inner.channel.remove();
        }
    }
}

impl Drop for AcceptorInner {
    fn drop(&mut self) {
        unsafe {
            libc::close(*self.idle_fd.lock());
        }
    }
}

/// Accept until the backlog is drained.
fn handle_read(inner: &Arc<AcceptorInner>) {
    inner.loop_handle.assert_in_loop_thread();
    loop {
        match inner.socket.accept() {
            Ok((socket, peer)) => {
                let callback = inner.new_connection_callback.lock().clone();
                match callback {
                    Some(callback) => callback(socket, peer),
                    // No consumer yet: closing the socket (by drop) refuses
                    // the connection instead of leaking it.
                    None => warn!(peer = %peer, "no new-connection callback, dropping"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                recover_from_fd_exhaustion(inner);
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// The reserved-fd dance: close the idle fd to free a table slot, accept
/// and immediately close the pending connection so the peer sees an orderly
/// refusal instead of a hung connect, then re-reserve the slot.
fn recover_from_fd_exhaustion(inner: &AcceptorInner) {
    error!("fd table exhausted, shedding one pending connection");
    let mut idle = inner.idle_fd.lock();
    unsafe {
        libc::close(*idle);
        let conn_fd = libc::accept(
            inner.socket.fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        );
        if conn_fd >= 0 {
            libc::close(conn_fd);
        }
    }
    *idle = open_idle_fd().unwrap_or(-1);
}

fn open_idle_fd() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::open(
            c"/dev/null".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}
