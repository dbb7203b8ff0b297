//! select(2) backend.

use crate::channel::{event, Channel};
use crate::poller::Poller;
use crate::timestamp::Timestamp;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use tracing::error;

/// Registered with this poller.
const INDEX_ADDED: i32 = 1;

/// Readiness poller over select(2).
///
/// The fd sets are rebuilt from the channel map on every call; select keeps
/// no kernel-side registration, so there is nothing else to maintain.
/// Descriptors must be below `FD_SETSIZE`.
pub struct SelectPoller {
    channels: HashMap<RawFd, Channel>,
}

impl Default for SelectPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectPoller {
    pub fn new() -> Self {
        SelectPoller {
            channels: HashMap::new(),
        }
    }
}

impl Poller for SelectPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp {
        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut except_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut except_set);
        }

        let mut max_fd: RawFd = -1;
        for (&fd, channel) in &self.channels {
            let interest = channel.events();
            if interest == event::NONE {
                continue;
            }
            if interest & event::READ != 0 {
                unsafe { libc::FD_SET(fd, &mut read_set) };
            }
            if interest & event::WRITE != 0 {
                unsafe { libc::FD_SET(fd, &mut write_set) };
            }
            unsafe { libc::FD_SET(fd, &mut except_set) };
            max_fd = max_fd.max(fd);
        }

        let mut timeout = libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: (timeout_ms % 1000) as libc::suseconds_t * 1000,
        };

        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                &mut except_set,
                &mut timeout,
            )
        };
        let now = Timestamp::now();

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(error = %err, "select failed");
            }
            return now;
        }
        if n == 0 {
            return now;
        }

        for (&fd, channel) in &self.channels {
            let mut revents = 0u32;
            unsafe {
                if libc::FD_ISSET(fd, &read_set) {
                    revents |= event::IN;
                }
                if libc::FD_ISSET(fd, &write_set) {
                    revents |= event::OUT;
                }
                if libc::FD_ISSET(fd, &except_set) {
                    revents |= event::ERR;
                }
            }
            if revents != 0 {
                channel.set_revents(revents);
                active.push(channel.clone());
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) -> bool {
        let fd = channel.fd();
        if fd as usize >= libc::FD_SETSIZE {
            error!(fd, "descriptor beyond FD_SETSIZE");
            return false;
        }
        if channel.index() == Channel::INDEX_NEW {
            debug_assert!(!self.channels.contains_key(&fd));
            self.channels.insert(fd, channel.clone());
            channel.set_index(INDEX_ADDED);
        }
        // Interest lives on the channel itself; the sets are rebuilt on the
        // next poll.
        true
    }

    fn remove_channel(&mut self, channel: &Channel) {
        debug_assert!(channel.is_none_event());
        self.channels.remove(&channel.fd());
        channel.set_index(Channel::INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|known| known.same_channel(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::io::Write;
    use std::os::unix::io::{AsRawFd, FromRawFd};

    fn pipe_pair() -> (std::fs::File, std::fs::File) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            (
                std::fs::File::from_raw_fd(fds[1]),
                std::fs::File::from_raw_fd(fds[0]),
            )
        }
    }

    #[test]
    fn test_poll_with_no_channels_returns_immediately() {
        let mut poller = SelectPoller::new();
        let mut active = Vec::new();
        poller.poll(0, &mut active);
        assert!(active.is_empty());
    }

    #[test]
    fn test_readable_event_reported() {
        let event_loop = EventLoop::new().unwrap();
        let mut poller = SelectPoller::new();
        let (mut writer, reader) = pipe_pair();

        let channel = Channel::new(event_loop.handle(), reader.as_raw_fd());
        channel.set_events(event::READ);
        assert!(poller.update_channel(&channel));
        assert!(poller.has_channel(&channel));

        writer.write_all(b"x").unwrap();
        let mut active = Vec::new();
        poller.poll(100, &mut active);
        assert_eq!(active.len(), 1);
        assert!(active[0].revents() & event::IN != 0);

        channel.set_events(event::NONE);
        poller.remove_channel(&channel);
        assert!(!poller.has_channel(&channel));
    }

    #[test]
    fn test_disarmed_channel_not_polled() {
        let event_loop = EventLoop::new().unwrap();
        let mut poller = SelectPoller::new();
        let (mut writer, reader) = pipe_pair();

        let channel = Channel::new(event_loop.handle(), reader.as_raw_fd());
        channel.set_events(event::READ);
        poller.update_channel(&channel);
        channel.set_events(event::NONE);
        poller.update_channel(&channel);

        writer.write_all(b"x").unwrap();
        let mut active = Vec::new();
        poller.poll(10, &mut active);
        assert!(active.is_empty());
    }
}
