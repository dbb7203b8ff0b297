//! Per-connection state machine with buffered, backpressured I/O.

use crate::buffer::ByteBuffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::inet_address::InetAddress;
use crate::sockets::{self, Socket};
use crate::timestamp::Timestamp;
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Shared ownership handle for a connection; callbacks capture clones so a
/// connection outlives its removal from the server map until the last
/// in-flight callback resolves.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Fires on both the up and the down transition; disambiguate with
/// [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Fires with the input buffer whenever bytes arrive.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut ByteBuffer, Timestamp) + Send + Sync>;
/// Fires when the output buffer fully drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Fires when pending output first crosses the high-water threshold.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Pending output bytes at which the high-water callback fires.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
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

/// One accepted TCP connection, forever bound to one worker loop.
///
/// All I/O and every state transition happen on that loop's thread; the
/// thread-safe entry points (`send`, `shutdown`, `force_close`) hop there
/// when called from elsewhere.
pub struct TcpConnection {
    /// Back-reference to the `Arc` this connection lives in, for callbacks
    /// that must capture an owning handle.
    self_ref: Weak<TcpConnection>,
    loop_handle: LoopHandle,
    name: String,
    socket: Socket,
    channel: Channel,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    state: AtomicU8,
    input_buffer: Mutex<ByteBuffer>,
    output_buffer: Mutex<ByteBuffer>,
    high_water_mark: AtomicUsize,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    /// Wrap an accepted socket. The connection starts in `Connecting`; the
    /// server calls [`connect_established`](Self::connect_established) on
    /// the worker loop to bring it up.
    pub fn new(
        loop_handle: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> TcpConnectionPtr {
        let channel = Channel::new(loop_handle.clone(), socket.fd());
        socket.set_keep_alive(true);

        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| TcpConnection {
            self_ref: weak.clone(),
            loop_handle,
            name,
            socket,
            channel,
            local_addr,
            peer_addr,
            state: AtomicU8::new(State::Connecting as u8),
            input_buffer: Mutex::new(ByteBuffer::new()),
            output_buffer: Mutex::new(ByteBuffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
        });
        trace!(name = %conn.name, fd = conn.channel.fd(), "connection created");

        {
            let weak = conn.self_ref.clone();
            conn.channel.set_read_callback(move |when| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(when);
                }
            });
        }
        {
            let weak = conn.self_ref.clone();
            conn.channel.set_write_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            });
        }
        {
            let weak = conn.self_ref.clone();
            conn.channel.set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
        }
        {
            let weak = conn.self_ref.clone();
            conn.channel.set_error_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            });
        }

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_address(&self) -> &InetAddress {
        &self.local_addr
    }

    pub fn peer_address(&self) -> &InetAddress {
        &self.peer_addr
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// The input buffer. Loop-thread use only; during the message callback
    /// the buffer is handed out directly instead.
    pub fn input_buffer(&self) -> MutexGuard<'_, ByteBuffer> {
        self.input_buffer.lock()
    }

    /// The output buffer. Loop-thread use only.
    pub fn output_buffer(&self) -> MutexGuard<'_, ByteBuffer> {
        self.output_buffer.lock()
    }

    pub fn set_connection_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        *self.connection_callback.lock() = Some(Arc::new(callback));
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr, &mut ByteBuffer, Timestamp) + Send + Sync + 'static,
    {
        *self.message_callback.lock() = Some(Arc::new(callback));
    }

    pub fn set_write_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        *self.write_complete_callback.lock() = Some(Arc::new(callback));
    }

    /// Notify when pending output first reaches `threshold` bytes.
    pub fn set_high_water_mark_callback<F>(&self, callback: F, threshold: usize)
    where
        F: Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
    {
        self.high_water_mark.store(threshold, Ordering::Release);
        *self.high_water_mark_callback.lock() = Some(Arc::new(callback));
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_callback.lock() = Some(callback);
    }

    pub(crate) fn set_connection_callback_arc(&self, callback: Option<ConnectionCallback>) {
        *self.connection_callback.lock() = callback;
    }

    pub(crate) fn set_message_callback_arc(&self, callback: Option<MessageCallback>) {
        *self.message_callback.lock() = callback;
    }

    pub(crate) fn set_write_complete_callback_arc(&self, callback: Option<WriteCompleteCallback>) {
        *self.write_complete_callback.lock() = callback;
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    /// Send bytes, from any thread. Off-thread callers pay one copy; the
    /// payload of a single `send` is never interleaved with another.
    pub fn send(&self, data: &[u8]) {
        if data.is_empty() || self.state() != State::Connected {
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let message = data.to_vec();
            let conn = self.shared_self();
            self.loop_handle
                .run_in_loop(move || conn.send_in_loop(&message));
        }
    }

    /// Send the readable contents of `buffer`, draining it synchronously.
    pub fn send_buffer(&self, buffer: &mut ByteBuffer) {
        if self.state() != State::Connected {
            return;
        }
        let message = buffer.retrieve_all_as_bytes();
        if message.is_empty() {
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(&message);
        } else {
            let conn = self.shared_self();
            self.loop_handle
                .run_in_loop(move || conn.send_in_loop(&message));
        }
    }

    /// Close the write half once pending output drains.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.shared_self();
            self.loop_handle.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Tear the connection down from any live state, discarding pending
    /// output. A no-op once disconnected.
    pub fn force_close(&self) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let conn = self.shared_self();
            self.loop_handle
                .queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Bring the connection up. Called once by the server on the worker
    /// loop.
    pub fn connect_established(&self) {
        self.loop_handle.assert_in_loop_thread();
        if self.state() != State::Connecting {
            return;
        }
        self.set_state(State::Connected);

        // The peer may already have vanished between accept and now.
        if !self.channel.enable_reading() {
            error!(name = %self.name, "failed to arm read interest");
            self.handle_close();
            return;
        }

        if let Some(callback) = self.connection_callback.lock().clone() {
            callback(&self.shared_self());
        }
    }

    /// Final teardown, queued onto the worker loop by the server after the
    /// connection leaves its map.
    pub fn connect_destroyed(&self) {
        self.loop_handle.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            if let Some(callback) = self.connection_callback.lock().clone() {
                callback(&self.shared_self());
            }
        }
        self.channel.remove();
    }

    /// An owning handle to this very connection. Infallible while any
    /// method on `self` is running, since the caller's reference keeps the
    /// `Arc` alive.
    fn shared_self(&self) -> TcpConnectionPtr {
        self.self_ref
            .upgrade()
            .expect("connection alive during its own method")
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn handle_read(&self, receive_time: Timestamp) {
        self.loop_handle.assert_in_loop_thread();
        let result = {
            let mut input = self.input_buffer.lock();
            input.read_fd(self.channel.fd())
        };
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                trace!(name = %self.name, bytes = n, "readable");
                let callback = self.message_callback.lock().clone();
                match callback {
                    Some(callback) => {
                        // Hand the buffer out without holding its lock so
                        // the callback may call back into this connection.
                        let mut input = std::mem::take(&mut *self.input_buffer.lock());
                        callback(&self.shared_self(), &mut input, receive_time);
                        *self.input_buffer.lock() = input;
                    }
                    None => self.input_buffer.lock().retrieve_all(),
                }
            }
            Err(e) => {
                error!(name = %self.name, error = %e, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.loop_handle.assert_in_loop_thread();
        if !self.channel.is_writing() {
            debug!(fd = self.channel.fd(), "connection is down, no more writing");
            return;
        }

        let result = {
            let mut output = self.output_buffer.lock();
            match sockets::write(self.channel.fd(), output.peek()) {
                Ok(n) => {
                    output.retrieve(n);
                    Ok(output.readable_bytes())
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(0) => {
                self.channel.disable_writing();
                if let Some(callback) = self.write_complete_callback.lock().clone() {
                    let conn = self.shared_self();
                    self.loop_handle.queue_in_loop(move || callback(&conn));
                }
                if self.state() == State::Disconnecting {
                    self.shutdown_in_loop();
                }
            }
            Ok(_) => {
                // Partial write: stay armed for the next writable event.
            }
            Err(e) => {
                error!(name = %self.name, error = %e, "write failed");
                self.handle_close();
            }
        }
    }

    /// Idempotent teardown: disables interest, then fires the connection
    /// callback and finally the server's close callback, holding a strong
    /// self-reference so the connection survives both.
    fn handle_close(&self) {
        if self.state() == State::Disconnected {
            return;
        }
        self.loop_handle.assert_in_loop_thread();
        debug!(name = %self.name, fd = self.channel.fd(), "closing");

        self.set_state(State::Disconnected);
        self.channel.disable_all();

        let guard = self.shared_self();
        if let Some(callback) = self.connection_callback.lock().clone() {
            callback(&guard);
        }
        // Must run last: the server drops its map entry here.
        if let Some(callback) = self.close_callback.lock().clone() {
            callback(&guard);
        }
    }

    fn handle_error(&self) {
        let err = sockets::socket_error(self.channel.fd());
        error!(
            name = %self.name,
            error = %io::Error::from_raw_os_error(err),
            "connection error"
        );
        self.handle_close();
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.loop_handle.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!(name = %self.name, "disconnected, giving up the write");
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        // Try the socket directly only when nothing is already queued,
        // otherwise bytes would reorder ahead of the buffered backlog.
        if !self.channel.is_writing() && self.output_buffer.lock().readable_bytes() == 0 {
            match sockets::write(self.channel.fd(), data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        if let Some(callback) = self.write_complete_callback.lock().clone() {
                            let conn = self.shared_self();
                            self.loop_handle.queue_in_loop(move || callback(&conn));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!(name = %self.name, error = %e, "direct write failed");
                        if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let mut output = self.output_buffer.lock();
            let old_len = output.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Acquire);

            if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                if let Some(callback) = self.high_water_mark_callback.lock().clone() {
                    let conn = self.shared_self();
                    let queued = old_len + remaining;
                    self.loop_handle
                        .queue_in_loop(move || callback(&conn, queued));
                }
            }

            output.append(&data[nwrote..]);
            drop(output);

            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_handle.assert_in_loop_thread();
        // With output still queued the shutdown is deferred; handle_write
        // re-enters here after the drain.
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                warn!(name = %self.name, error = %e, "shutdown failed");
            }
        }
    }

    fn force_close_in_loop(&self) {
        self.loop_handle.assert_in_loop_thread();
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            // As if the peer had closed on us.
            self.handle_close();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        trace!(name = %self.name, fd = self.channel.fd(), "connection dropped");
        // The socket closes with the Socket field; the channel was removed
        // during connect_destroyed.
    }
}
