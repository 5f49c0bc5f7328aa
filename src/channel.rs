//! Per-descriptor event dispatcher.
//!
//! A `Channel` pairs a descriptor with an interest mask and routes the ready
//! bits returned by the poller to per-channel callbacks. It never owns the
//! descriptor; the socket (or pipe) owner does. A channel belongs to exactly
//! one reactor and all of its interest mutations happen on that reactor's
//! thread.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::reactor::Reactor;
use crate::timestamp::Timestamp;

pub(crate) const EVENT_NONE: u8 = 0;
pub(crate) const EVENT_READ: u8 = 0b0001;
pub(crate) const EVENT_WRITE: u8 = 0b0010;
pub(crate) const EVENT_ERROR: u8 = 0b0100;
pub(crate) const EVENT_HUP: u8 = 0b1000;

/// Poller-side registration status.
pub(crate) const STATUS_NEW: u8 = 0;
pub(crate) const STATUS_ADDED: u8 = 1;
pub(crate) const STATUS_IDLE: u8 = 2;

type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Handlers {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

pub struct Channel {
    fd: RawFd,
    reactor: Weak<Reactor>,
    interest: AtomicU8,
    revents: AtomicU8,
    status: AtomicU8,
    handling: AtomicBool,
    handlers: Mutex<Handlers>,
    // Weak back-reference to the owning object, upgraded for the duration
    // of one dispatch so a close callback cannot free the owner mid-event.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub(crate) fn new(reactor: Weak<Reactor>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            fd,
            reactor,
            interest: AtomicU8::new(EVENT_NONE),
            revents: AtomicU8::new(EVENT_NONE),
            status: AtomicU8::new(STATUS_NEW),
            handling: AtomicBool::new(false),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn set_read_callback(&self, cb: ReadCallback) {
        self.handlers.lock().unwrap().read = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        self.handlers.lock().unwrap().write = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        self.handlers.lock().unwrap().close = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        self.handlers.lock().unwrap().error = Some(cb);
    }

    /// Keep a weak reference to the object whose callbacks are installed
    /// here. Must never be promoted to a stored strong reference; the owner
    /// owns the channel, not the other way around.
    pub(crate) fn tie(&self, owner: Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(Arc::downgrade(&owner));
    }

    pub(crate) fn interest(&self) -> u8 {
        self.interest.load(Ordering::Acquire)
    }

    pub fn is_reading(&self) -> bool {
        self.interest() & EVENT_READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.interest() & EVENT_WRITE != 0
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest() == EVENT_NONE
    }

    pub(crate) fn enable_reading(self: &Arc<Self>) {
        self.interest.fetch_or(EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn disable_reading(self: &Arc<Self>) {
        self.interest.fetch_and(!EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn enable_writing(self: &Arc<Self>) {
        self.interest.fetch_or(EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn disable_writing(self: &Arc<Self>) {
        self.interest.fetch_and(!EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn disable_all(self: &Arc<Self>) {
        self.interest.store(EVENT_NONE, Ordering::Release);
        self.update();
    }

    fn update(self: &Arc<Self>) {
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.update_channel(self);
        }
    }

    /// Detach from the reactor. Interest must already be empty.
    pub(crate) fn remove(self: &Arc<Self>) {
        assert!(self.is_none_interest(), "removing a channel with live interest");
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.remove_channel(self);
        } else {
            self.status.store(STATUS_NEW, Ordering::Release);
        }
    }

    pub(crate) fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    pub(crate) fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::Release);
    }

    pub(crate) fn set_revents(&self, revents: u8) {
        self.revents.store(revents, Ordering::Release);
    }

    /// Route the ready bits to the callbacks: hang-up without read readiness
    /// goes to close first, then error, then read (with the poll-return
    /// timestamp), then write.
    pub(crate) fn handle_event(self: &Arc<Self>, at: Timestamp) {
        let tie = self.tie.lock().unwrap().clone();
        match tie {
            Some(owner) => {
                // Hold the owner alive across dispatch; if it is already
                // gone there is nobody left to deliver to.
                if let Some(_guard) = owner.upgrade() {
                    self.dispatch(at);
                }
            }
            None => self.dispatch(at),
        }
    }

    fn dispatch(&self, at: Timestamp) {
        self.handling.store(true, Ordering::Release);
        let revents = self.revents.load(Ordering::Acquire);
        let mut handlers = self.handlers.lock().unwrap();
        if revents & EVENT_HUP != 0 && revents & EVENT_READ == 0 {
            if let Some(cb) = handlers.close.as_mut() {
                cb();
            }
        }
        if revents & EVENT_ERROR != 0 {
            if let Some(cb) = handlers.error.as_mut() {
                cb();
            }
        }
        if revents & EVENT_READ != 0 {
            if let Some(cb) = handlers.read.as_mut() {
                cb(at);
            }
        }
        if revents & EVENT_WRITE != 0 {
            if let Some(cb) = handlers.write.as_mut() {
                cb();
            }
        }
        self.handling.store(false, Ordering::Release);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(
            !self.handling.load(Ordering::Acquire),
            "channel destroyed while dispatching"
        );
    }
}
