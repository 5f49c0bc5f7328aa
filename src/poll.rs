//! Pluggable event demultiplexer backends.
//!
//! A backend blocks on the registered descriptor/interest pairs and fills a
//! ready list of channels, stamping each channel's returned-event bits. Two
//! backends are provided: an edge-ready one on `mio::Poll` and a
//! level-triggered one on `poll(2)`. The reactor picks one at construction.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lockfree::map::Map;
use mio::unix::SourceFd;
use mio::{Events, Interest, Registry, Token};

use crate::channel::{
    Channel, EVENT_ERROR, EVENT_HUP, EVENT_NONE, EVENT_READ, EVENT_WRITE, STATUS_ADDED,
    STATUS_IDLE, STATUS_NEW,
};
use crate::timestamp::Timestamp;

const EVENTS_CAPACITY: usize = 1024;

/// Which demultiplexing backend a reactor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollerKind {
    /// `poll(2)`: readiness is reported again on every call until consumed.
    LevelTriggered,
    /// `mio::Poll` (epoll on Linux): readiness is reported once per edge,
    /// so consumers drain until `WouldBlock`.
    #[default]
    EdgeReady,
}

pub(crate) trait PollBackend: Send + Sync {
    /// Block up to `timeout`, then push ready channels with their event bits
    /// stamped. Interruption by a signal returns an empty ready set, not an
    /// error. Ready descriptors with no registered channel are dropped.
    fn poll(&self, timeout: Option<Duration>, ready: &mut Vec<Arc<Channel>>)
        -> io::Result<Timestamp>;

    /// Install or modify kernel interest from the channel's current mask.
    fn update_channel(&self, channel: &Arc<Channel>);

    /// Forget the channel. Its interest mask must already be empty.
    fn remove_channel(&self, channel: &Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

pub(crate) fn new_backend(kind: PollerKind) -> io::Result<Box<dyn PollBackend>> {
    match kind {
        PollerKind::EdgeReady => Ok(Box::new(EdgePoller::new()?)),
        PollerKind::LevelTriggered => Ok(Box::new(LevelPoller::new())),
    }
}

fn to_mio_interest(bits: u8) -> Interest {
    match (bits & EVENT_READ != 0, bits & EVENT_WRITE != 0) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => unreachable!("empty interest is never registered"),
    }
}

/// Edge-ready backend over `mio::Poll`.
///
/// mio cannot keep a zero-interest registration, so a channel whose mask
/// drops to empty is deregistered from the kernel but stays in the registry
/// map with an idle status and re-registers on the next enable.
struct EdgePoller {
    poll: Mutex<mio::Poll>,
    events: Mutex<Events>,
    registry: Registry,
    channels: Map<usize, Arc<Channel>>,
}

impl EdgePoller {
    fn new() -> io::Result<Self> {
        let poll = mio::Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(EdgePoller {
            poll: Mutex::new(poll),
            events: Mutex::new(Events::with_capacity(EVENTS_CAPACITY)),
            registry,
            channels: Map::new(),
        })
    }
}

impl PollBackend for EdgePoller {
    fn poll(
        &self,
        timeout: Option<Duration>,
        ready: &mut Vec<Arc<Channel>>,
    ) -> io::Result<Timestamp> {
        let mut poll = self.poll.lock().unwrap();
        let mut events = self.events.lock().unwrap();
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Timestamp::now()),
            Err(e) => return Err(e),
        }
        let at = Timestamp::now();
        for event in events.iter() {
            let entry = match self.channels.get(&event.token().0) {
                Some(entry) => entry,
                // Removed between kernel delivery and processing; drop it.
                None => continue,
            };
            let channel = entry.1.clone();
            let mut bits = EVENT_NONE;
            if event.is_readable() || event.is_read_closed() {
                bits |= EVENT_READ;
            }
            if event.is_writable() {
                bits |= EVENT_WRITE;
            }
            if event.is_error() {
                bits |= EVENT_ERROR;
            }
            if event.is_read_closed() && event.is_write_closed() {
                bits |= EVENT_HUP;
            }
            channel.set_revents(bits);
            ready.push(channel);
        }
        Ok(at)
    }

    fn update_channel(&self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let interest = channel.interest();
        match channel.status() {
            STATUS_ADDED => {
                if interest == EVENT_NONE {
                    self.registry
                        .deregister(&mut SourceFd(&fd))
                        .unwrap_or_else(|e| panic!("poller: deregister fd={fd} failed: {e}"));
                    channel.set_status(STATUS_IDLE);
                } else {
                    self.registry
                        .reregister(
                            &mut SourceFd(&fd),
                            Token(fd as usize),
                            to_mio_interest(interest),
                        )
                        .unwrap_or_else(|e| panic!("poller: reregister fd={fd} failed: {e}"));
                }
            }
            status => {
                if status == STATUS_NEW {
                    self.channels.insert(fd as usize, channel.clone());
                }
                if interest == EVENT_NONE {
                    channel.set_status(STATUS_IDLE);
                    return;
                }
                self.registry
                    .register(&mut SourceFd(&fd), Token(fd as usize), to_mio_interest(interest))
                    .unwrap_or_else(|e| panic!("poller: register fd={fd} failed: {e}"));
                channel.set_status(STATUS_ADDED);
            }
        }
    }

    fn remove_channel(&self, channel: &Channel) {
        assert!(
            channel.is_none_interest(),
            "removing a channel with live interest"
        );
        let fd = channel.fd();
        self.channels.remove(&(fd as usize));
        if channel.status() == STATUS_ADDED {
            let _ = self.registry.deregister(&mut SourceFd(&fd));
        }
        channel.set_status(STATUS_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.get(&(channel.fd() as usize)).is_some()
    }
}

/// Level-triggered backend over `poll(2)`. The descriptor array is rebuilt
/// from the registry on every call.
struct LevelPoller {
    channels: Map<usize, Arc<Channel>>,
}

impl LevelPoller {
    fn new() -> Self {
        LevelPoller { channels: Map::new() }
    }
}

impl PollBackend for LevelPoller {
    fn poll(
        &self,
        timeout: Option<Duration>,
        ready: &mut Vec<Arc<Channel>>,
    ) -> io::Result<Timestamp> {
        let mut pollfds = Vec::new();
        let mut polled = Vec::new();
        for entry in self.channels.iter() {
            let channel = &entry.1;
            let interest = channel.interest();
            if interest == EVENT_NONE {
                continue;
            }
            let mut events: libc::c_short = 0;
            if interest & EVENT_READ != 0 {
                events |= libc::POLLIN | libc::POLLPRI;
            }
            if interest & EVENT_WRITE != 0 {
                events |= libc::POLLOUT;
            }
            pollfds.push(libc::pollfd {
                fd: channel.fd(),
                events,
                revents: 0,
            });
            polled.push(channel.clone());
        }

        let timeout_ms =
            timeout.map_or(-1, |d| d.as_millis().min(i32::MAX as u128) as libc::c_int);
        let n = unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
        };
        let at = Timestamp::now();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(at);
            }
            return Err(err);
        }

        for (pollfd, channel) in pollfds.iter().zip(polled) {
            if pollfd.revents == 0 {
                continue;
            }
            // Removed between kernel delivery and processing; drop it.
            if self.channels.get(&(pollfd.fd as usize)).is_none() {
                continue;
            }
            let mut bits = EVENT_NONE;
            if pollfd.revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                bits |= EVENT_READ;
            }
            if pollfd.revents & libc::POLLOUT != 0 {
                bits |= EVENT_WRITE;
            }
            if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                bits |= EVENT_ERROR;
            }
            if pollfd.revents & libc::POLLHUP != 0 {
                bits |= EVENT_HUP;
            }
            channel.set_revents(bits);
            ready.push(channel);
        }
        Ok(at)
    }

    fn update_channel(&self, channel: &Arc<Channel>) {
        if channel.status() == STATUS_NEW {
            self.channels.insert(channel.fd() as usize, channel.clone());
        }
        channel.set_status(if channel.is_none_interest() {
            STATUS_IDLE
        } else {
            STATUS_ADDED
        });
    }

    fn remove_channel(&self, channel: &Channel) {
        assert!(
            channel.is_none_interest(),
            "removing a channel with live interest"
        );
        self.channels.remove(&(channel.fd() as usize));
        channel.set_status(STATUS_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.get(&(channel.fd() as usize)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Weak;

    fn backend_reports_readable(kind: PollerKind) {
        let backend = new_backend(kind).unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        // A channel with a dead reactor reference mutates only its own mask,
        // so the backend can be driven directly here.
        let channel = Channel::new(Weak::new(), b.as_raw_fd());
        channel.enable_reading();
        backend.update_channel(&channel);
        assert!(backend.has_channel(&channel));

        a.write_all(b"x").unwrap();
        let mut ready = Vec::new();
        backend
            .poll(Some(Duration::from_secs(2)), &mut ready)
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd(), b.as_raw_fd());

        channel.disable_all();
        backend.update_channel(&channel);
        backend.remove_channel(&channel);
        assert!(!backend.has_channel(&channel));
    }

    #[test]
    fn test_edge_backend_reports_readable() {
        backend_reports_readable(PollerKind::EdgeReady);
    }

    #[test]
    fn test_level_backend_reports_readable() {
        backend_reports_readable(PollerKind::LevelTriggered);
    }

    #[test]
    fn test_poll_times_out_with_no_ready_channels() {
        let backend = new_backend(PollerKind::EdgeReady).unwrap();
        let mut ready = Vec::new();
        backend
            .poll(Some(Duration::from_millis(20)), &mut ready)
            .unwrap();
        assert!(ready.is_empty());
    }
}
