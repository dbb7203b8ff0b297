//! epoll(7) backend.

use crate::channel::Channel;
use crate::poller::Poller;
use crate::timestamp::Timestamp;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use tracing::{error, trace};

/// Registered and armed in the epoll set.
const INDEX_ADDED: i32 = 1;
/// Known to the map but disarmed (`EPOLL_CTL_DEL` issued); re-add is O(1).
const INDEX_DELETED: i32 = 2;

const INITIAL_EVENT_CAPACITY: usize = 16;

/// Readiness poller over an epoll instance.
pub struct EpollPoller {
    epoll_fd: RawFd,
    /// Kernel-filled event list; doubled whenever a wait fills it.
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Channel>,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENT_CAPACITY],
            channels: HashMap::new(),
        })
    }

    fn control(&self, op: libc::c_int, fd: RawFd, interest: u32) -> bool {
        let mut ev = libc::epoll_event {
            events: interest,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            error!(
                fd,
                op,
                error = %io::Error::last_os_error(),
                "epoll_ctl failed"
            );
            return false;
        }
        true
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = Timestamp::now();

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(error = %err, "epoll_wait failed");
            }
            return now;
        }

        let n = n as usize;
        if n > 0 {
            trace!(ready = n, "epoll events");
            for event in &self.events[..n] {
                let fd = event.u64 as RawFd;
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_revents(event.events);
                    active.push(channel.clone());
                }
            }
            if n == self.events.len() {
                // Filled to capacity: there may be more ready fds than
                // slots, so double for the next wait.
                self.events
                    .resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) -> bool {
        let fd = channel.fd();
        let index = channel.index();

        if index == Channel::INDEX_NEW || index == INDEX_DELETED {
            if index == Channel::INDEX_NEW {
                debug_assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                debug_assert!(self
                    .channels
                    .get(&fd)
                    .is_some_and(|known| known.same_channel(channel)));
            }
            if !self.control(libc::EPOLL_CTL_ADD, fd, channel.events()) {
                return false;
            }
            channel.set_index(INDEX_ADDED);
            true
        } else {
            debug_assert_eq!(index, INDEX_ADDED);
            debug_assert!(self
                .channels
                .get(&fd)
                .is_some_and(|known| known.same_channel(channel)));
            if channel.is_none_event() {
                // Disarm but keep the map entry so a re-add stays cheap.
                if !self.control(libc::EPOLL_CTL_DEL, fd, 0) {
                    return false;
                }
                channel.set_index(INDEX_DELETED);
                true
            } else {
                self.control(libc::EPOLL_CTL_MOD, fd, channel.events())
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        debug_assert!(channel.is_none_event());
        self.channels.remove(&fd);
        if channel.index() == INDEX_ADDED {
            self.control(libc::EPOLL_CTL_DEL, fd, 0);
        }
        channel.set_index(Channel::INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|known| known.same_channel(channel))
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
