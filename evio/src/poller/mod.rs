//! Readiness multiplexers over a set of registered channels.

mod epoll;
mod poll;
mod select;

pub use epoll::EpollPoller;
pub use poll::PollPoller;
pub use select::SelectPoller;

use crate::channel::Channel;
use crate::timestamp::Timestamp;
use serde::Deserialize;
use std::io;

/// Which multiplexer backend a loop should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollerKind {
    /// epoll(7), the platform default.
    #[default]
    Epoll,
    /// poll(2) with a mirrored pollfd vector.
    Poll,
    /// select(2); capped at `FD_SETSIZE` descriptors.
    Select,
}

/// A readiness multiplexer.
///
/// The poller keeps the authoritative `fd -> Channel` map for its loop and
/// records its registration state in each channel's `index` slot; the two
/// must always agree. Every method is called only from the owning loop
/// thread (the loop asserts affinity before reaching the poller).
pub trait Poller: Send {
    /// Block up to `timeout_ms` and append every channel with nonzero ready
    /// events to `active`, with its ready mask set. Returns the timestamp
    /// sampled after the wait ends.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp;

    /// Add, modify, or delete the channel's registration according to its
    /// index and interest mask. Returns `false` if the kernel rejected the
    /// update.
    fn update_channel(&mut self, channel: &Channel) -> bool;

    /// Erase the channel's map entry. The channel's interest must already
    /// be none.
    fn remove_channel(&mut self, channel: &Channel);

    /// Is this exact channel currently registered?
    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Construct the backend for `kind`.
pub fn new_poller(kind: PollerKind) -> io::Result<Box<dyn Poller>> {
    match kind {
        PollerKind::Epoll => Ok(Box::new(EpollPoller::new()?)),
        PollerKind::Poll => Ok(Box::new(PollPoller::new())),
        PollerKind::Select => Ok(Box::new(SelectPoller::new())),
    }
}
