//! poll(2) backend.

use crate::channel::Channel;
use crate::poller::Poller;
use crate::timestamp::Timestamp;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use tracing::error;

/// Readiness poller over poll(2).
///
/// Keeps a `pollfd` vector mirrored with the channel map: each registered
/// channel's `index` is its slot in the vector, so removal is an O(1)
/// swap-pop. A channel with no interest keeps its slot but the slot's fd is
/// negated (poll ignores negative fds), so re-arming never reallocates.
pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Channel>,
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl PollPoller {
    pub fn new() -> Self {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    /// The fd a slot refers to, undoing the ignored-slot negation.
    fn slot_fd(pfd: &libc::pollfd) -> RawFd {
        if pfd.fd < 0 {
            -pfd.fd - 1
        } else {
            pfd.fd
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Timestamp::now();

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(error = %err, "poll failed");
            }
            return now;
        }

        let mut remaining = n;
        for pfd in &self.pollfds {
            if remaining <= 0 {
                break;
            }
            if pfd.revents != 0 {
                remaining -= 1;
                if pfd.fd < 0 {
                    continue;
                }
                if let Some(channel) = self.channels.get(&pfd.fd) {
                    channel.set_revents(pfd.revents as u32 & 0xffff);
                    active.push(channel.clone());
                }
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) -> bool {
        let fd = channel.fd();
        let index = channel.index();

        if index == Channel::INDEX_NEW {
            debug_assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd: if channel.is_none_event() { -fd - 1 } else { fd },
                events: channel.events() as libc::c_short,
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            self.channels.insert(fd, channel.clone());
        } else {
            debug_assert!(self
                .channels
                .get(&fd)
                .is_some_and(|known| known.same_channel(channel)));
            let slot = index as usize;
            debug_assert!(slot < self.pollfds.len());
            debug_assert_eq!(Self::slot_fd(&self.pollfds[slot]), fd);
            let pfd = &mut self.pollfds[slot];
            pfd.events = channel.events() as libc::c_short;
            pfd.revents = 0;
            // Negative fds are skipped by the kernel; that is how a channel
            // with no interest stays resident without being polled.
            pfd.fd = if channel.is_none_event() { -fd - 1 } else { fd };
        }
        true
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        debug_assert!(channel.is_none_event());
        if self.channels.remove(&fd).is_none() {
            return;
        }

        let slot = channel.index() as usize;
        debug_assert!(slot < self.pollfds.len());
        let last = self.pollfds.len() - 1;
        if slot != last {
            let moved_fd = Self::slot_fd(&self.pollfds[last]);
            self.pollfds.swap(slot, last);
            if let Some(moved) = self.channels.get(&moved_fd) {
                moved.set_index(slot as i32);
            }
        }
        self.pollfds.pop();
        channel.set_index(Channel::INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|known| known.same_channel(channel))
    }
}
