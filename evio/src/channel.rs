//! Per-fd registration record: interest mask, ready mask, and callbacks.

use crate::event_loop::LoopHandle;
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::{trace, warn};

/// Readiness event bits, poll(2)-compatible.
///
/// On Linux the epoll constants are numerically identical to the poll ones,
/// which lets every poller backend share these masks.
pub mod event {
    pub const NONE: u32 = 0;
    pub const IN: u32 = libc::POLLIN as u32;
    pub const PRI: u32 = libc::POLLPRI as u32;
    pub const OUT: u32 = libc::POLLOUT as u32;
    pub const ERR: u32 = libc::POLLERR as u32;
    pub const HUP: u32 = libc::POLLHUP as u32;
    pub const NVAL: u32 = libc::POLLNVAL as u32;
    pub const RDHUP: u32 = libc::POLLRDHUP as u32;

    pub const READ: u32 = IN | PRI;
    pub const WRITE: u32 = OUT;
}

const _: () = {
    assert!(event::IN == libc::EPOLLIN as u32);
    assert!(event::PRI == libc::EPOLLPRI as u32);
    assert!(event::OUT == libc::EPOLLOUT as u32);
    assert!(event::ERR == libc::EPOLLERR as u32);
    assert!(event::HUP == libc::EPOLLHUP as u32);
    assert!(event::RDHUP == libc::EPOLLRDHUP as u32);
};

/// Callback for readable events; receives the poll-return timestamp.
pub type ReadEventCallback = Arc<dyn Fn(Timestamp) + Send + Sync>;
/// Callback for write / close / error events.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

struct ChannelInner {
    fd: RawFd,
    events: u32,
    revents: u32,
    index: i32,
    loop_handle: LoopHandle,
    read_callback: Option<ReadEventCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

/// A cheaply-clonable handle to one fd's registration with its loop.
///
/// The channel does not own the descriptor. Lifecycle contract: construct,
/// register interest, then before dropping the last clone disable all
/// interest and call [`remove`](Channel::remove). A channel must never
/// outlive its loop and is only manipulated on that loop's thread.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Mutex<ChannelInner>>,
}

impl Channel {
    /// Index value for a channel the poller has never seen.
    pub const INDEX_NEW: i32 = -1;

    pub fn new(loop_handle: LoopHandle, fd: RawFd) -> Self {
        Channel {
            inner: Arc::new(Mutex::new(ChannelInner {
                fd,
                events: event::NONE,
                revents: event::NONE,
                index: Self::INDEX_NEW,
                loop_handle,
                read_callback: None,
                write_callback: None,
                close_callback: None,
                error_callback: None,
            })),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.lock().fd
    }

    /// The current interest mask.
    pub fn events(&self) -> u32 {
        self.inner.lock().events
    }

    /// The ready mask reported by the last poll cycle.
    pub fn revents(&self) -> u32 {
        self.inner.lock().revents
    }

    pub fn set_revents(&self, revents: u32) {
        self.inner.lock().revents = revents;
    }

    /// Overwrite the interest mask without notifying any poller. Used by
    /// poller unit tests that register channels by hand.
    #[cfg(test)]
    pub(crate) fn set_events(&self, events: u32) {
        self.inner.lock().events = events;
    }

    /// The poller's registration bookkeeping slot.
    pub fn index(&self) -> i32 {
        self.inner.lock().index
    }

    pub fn set_index(&self, index: i32) {
        self.inner.lock().index = index;
    }

    pub fn is_none_event(&self) -> bool {
        self.inner.lock().events == event::NONE
    }

    pub fn is_reading(&self) -> bool {
        self.inner.lock().events & event::READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.inner.lock().events & event::WRITE != 0
    }

    /// Two handles to the same underlying channel?
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_read_callback<F>(&self, callback: F)
    where
        F: Fn(Timestamp) + Send + Sync + 'static,
    {
        self.inner.lock().read_callback = Some(Arc::new(callback));
    }

    pub fn set_write_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().write_callback = Some(Arc::new(callback));
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().close_callback = Some(Arc::new(callback));
    }

    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().error_callback = Some(Arc::new(callback));
    }

    pub fn enable_reading(&self) -> bool {
        {
            self.inner.lock().events |= event::READ;
        }
        self.update()
    }

    pub fn disable_reading(&self) -> bool {
        {
            self.inner.lock().events &= !event::READ;
        }
        self.update()
    }

    pub fn enable_writing(&self) -> bool {
        {
            self.inner.lock().events |= event::WRITE;
        }
        self.update()
    }

    pub fn disable_writing(&self) -> bool {
        {
            self.inner.lock().events &= !event::WRITE;
        }
        self.update()
    }

    pub fn disable_all(&self) -> bool {
        {
            self.inner.lock().events = event::NONE;
        }
        self.update()
    }

    /// Unregister from the poller. Valid only once interest is none.
    pub fn remove(&self) {
        if !self.is_none_event() {
            return;
        }
        let loop_handle = self.inner.lock().loop_handle.clone();
        loop_handle.remove_channel(self);
    }

    fn update(&self) -> bool {
        let loop_handle = self.inner.lock().loop_handle.clone();
        loop_handle.update_channel(self)
    }

    /// Dispatch the ready mask to the registered callbacks.
    ///
    /// Order matters: close fires only when the peer hung up with nothing
    /// left to read (a half-closed peer with pending data presents as
    /// `HUP|IN` and must be drained through the read path first), then
    /// error, read, write.
    ///
    /// The lock is released before any callback runs, so callbacks may
    /// re-arm interest on this very channel.
    pub fn handle_event(&self, receive_time: Timestamp) {
        let (fd, revents, read_cb, write_cb, close_cb, error_cb) = {
            let inner = self.inner.lock();
            (
                inner.fd,
                inner.revents,
                inner.read_callback.clone(),
                inner.write_callback.clone(),
                inner.close_callback.clone(),
                inner.error_callback.clone(),
            )
        };

        trace!(fd, revents = %revents_to_string(revents), "dispatch");

        if revents & event::HUP != 0 && revents & event::IN == 0 {
            if let Some(cb) = &close_cb {
                cb();
            }
        }

        if revents & event::NVAL != 0 {
            warn!(fd, "POLLNVAL on registered channel");
        }

        if revents & (event::ERR | event::NVAL) != 0 {
            if let Some(cb) = &error_cb {
                cb();
            }
        }

        if revents & (event::IN | event::PRI | event::RDHUP) != 0 {
            if let Some(cb) = &read_cb {
                cb(receive_time);
            }
        }

        if revents & event::OUT != 0 {
            if let Some(cb) = &write_cb {
                cb();
            }
        }
    }
}

fn revents_to_string(revents: u32) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (event::IN, "IN"),
        (event::PRI, "PRI"),
        (event::OUT, "OUT"),
        (event::HUP, "HUP"),
        (event::RDHUP, "RDHUP"),
        (event::ERR, "ERR"),
        (event::NVAL, "NVAL"),
    ] {
        if revents & bit != 0 {
            let _ = write!(out, "{name} ");
        }
    }
    out
}
