//! One event loop per thread.
//!
//! A `Reactor` polls its backend, dispatches ready channels, runs expired
//! timers, and then drains tasks queued from other threads. The thread that
//! constructs a reactor owns it: channel and poller mutations must happen on
//! that thread, while `run_in_loop`/`queue_in_loop`/`quit` and the timer
//! surface are safe from anywhere. Cross-thread calls wake the loop by
//! writing one byte to a wakeup pipe whose read end is the reactor's own
//! channel.

use std::cell::Cell;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::channel::Channel;
use crate::error::Result;
use crate::logger::{LogLevel, Logger, NoOpLogger};
use crate::poll::{new_backend, PollBackend, PollerKind};
use crate::timer::{TimerId, TimerQueue};
use crate::timestamp::Timestamp;

pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10_000;

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static REACTOR_IN_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub struct Reactor {
    owner: ThreadId,
    poller: Box<dyn PollBackend>,
    pending: Mutex<Vec<Task>>,
    looping: AtomicBool,
    quit: AtomicBool,
    handling_events: AtomicBool,
    draining_tasks: AtomicBool,
    wakeup_read: OwnedFd,
    wakeup_write: OwnedFd,
    wakeup_channel: Arc<Channel>,
    timers: TimerQueue,
    poll_return: Mutex<Timestamp>,
    logger: Arc<dyn Logger>,
}

impl Reactor {
    /// Reactor with the default backend and a no-op logger. Panics if this
    /// thread already constructed one.
    pub fn new() -> Result<Arc<Reactor>> {
        Self::with_config(PollerKind::default(), Arc::new(NoOpLogger))
    }

    pub fn with_config(kind: PollerKind, logger: Arc<dyn Logger>) -> Result<Arc<Reactor>> {
        REACTOR_IN_THREAD.with(|flag| {
            assert!(
                !flag.get(),
                "another reactor already exists on thread {:?}",
                thread::current().id()
            );
        });

        let (wakeup_read, wakeup_write) = wakeup_pipe()?;
        let poller = new_backend(kind)?;
        let read_fd = wakeup_read.as_raw_fd();
        REACTOR_IN_THREAD.with(|flag| flag.set(true));

        let reactor = Arc::new_cyclic(|weak| Reactor {
            owner: thread::current().id(),
            poller,
            pending: Mutex::new(Vec::new()),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            handling_events: AtomicBool::new(false),
            draining_tasks: AtomicBool::new(false),
            wakeup_read,
            wakeup_write,
            wakeup_channel: Channel::new(weak.clone(), read_fd),
            timers: TimerQueue::new(),
            poll_return: Mutex::new(Timestamp::now()),
            logger,
        });

        reactor
            .wakeup_channel
            .set_read_callback(Box::new(move |_| drain_wakeup(read_fd)));
        reactor.wakeup_channel.enable_reading();
        Ok(reactor)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "reactor owned by thread {:?} was operated from thread {:?}",
                self.owner,
                thread::current().id()
            );
        }
    }

    /// Run the event loop until `quit`. Must be called on the owner thread.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(
            !self.looping.swap(true, Ordering::SeqCst),
            "reactor is already running"
        );
        self.quit.store(false, Ordering::SeqCst);

        let mut ready: Vec<Arc<Channel>> = Vec::with_capacity(64);
        while !self.quit.load(Ordering::SeqCst) {
            ready.clear();
            let timeout = self
                .timers
                .next_timeout(Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS));
            match self.poller.poll(Some(timeout), &mut ready) {
                Ok(at) => {
                    *self.poll_return.lock().unwrap() = at;
                    self.handling_events.store(true, Ordering::SeqCst);
                    for channel in ready.drain(..) {
                        channel.handle_event(at);
                    }
                    self.handling_events.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    self.logger
                        .log(LogLevel::Error, &format!("reactor: poll failed: {e}"));
                }
            }
            self.timers.run_expired();
            self.drain_pending_tasks();
        }
        self.looping.store(false, Ordering::SeqCst);
    }

    /// Ask the loop to exit after the current iteration. Safe from any
    /// thread; connections in flight are not closed.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` now when called on the owner thread, otherwise enqueue it.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueue `task` for the next loop iteration.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.lock().unwrap().push(Box::new(task));
        // A task queued while draining would otherwise wait a full poll
        // timeout; the wakeup byte makes the next poll return promptly.
        if !self.is_in_loop_thread() || self.draining_tasks.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    pub fn run_at<F>(&self, when: Timestamp, task: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.timers.add(when.instant(), None, Box::new(task));
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
        id
    }

    pub fn run_after<F>(&self, delay: Duration, task: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Timestamp::now() + delay, task)
    }

    pub fn run_every<F>(&self, interval: Duration, task: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self
            .timers
            .add(Timestamp::now().instant() + interval, Some(interval), Box::new(task));
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
        id
    }

    pub fn cancel(&self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Timestamp of the most recent poll return.
    pub fn poll_return_time(&self) -> Timestamp {
        *self.poll_return.lock().unwrap()
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        debug_assert!(
            !self.handling_events.load(Ordering::SeqCst),
            "channel removed during event dispatch"
        );
        self.poller.remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.has_channel(channel)
    }

    fn drain_pending_tasks(&self) {
        self.draining_tasks.store(true, Ordering::SeqCst);
        // Swap the list out so task bodies run without holding the lock.
        let tasks = mem::take(&mut *self.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.draining_tasks.store(false, Ordering::SeqCst);
    }

    fn wakeup(&self) {
        let byte = [1u8];
        let n = unsafe {
            libc::write(
                self.wakeup_write.as_raw_fd(),
                byte.as_ptr() as *const libc::c_void,
                1,
            )
        };
        if n != 1 {
            let err = io::Error::last_os_error();
            // A full pipe already guarantees a pending wakeup.
            if err.kind() != io::ErrorKind::WouldBlock {
                panic!("reactor: wakeup write failed: {err}");
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        if self.is_in_loop_thread() {
            REACTOR_IN_THREAD.with(|flag| flag.set(false));
        }
    }
}

fn wakeup_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

fn drain_wakeup(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn spawn_reactor() -> (Arc<Reactor>, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let reactor = Reactor::new().unwrap();
            tx.send(reactor.clone()).unwrap();
            reactor.run();
        });
        (rx.recv().unwrap(), handle)
    }

    #[test]
    fn test_run_in_loop_on_owner_thread_is_synchronous() {
        let reactor = Reactor::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        reactor.run_in_loop(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_reactor_on_same_thread_panics() {
        let handle = thread::spawn(|| {
            let _first = Reactor::new().unwrap();
            let _second = Reactor::new().unwrap();
        });
        assert!(handle.join().is_err());
    }

    #[test]
    fn test_cross_thread_tasks_run_in_fifo_order() {
        let (reactor, handle) = spawn_reactor();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = mpsc::channel();

        for i in 0..10 {
            let o = order.clone();
            reactor.queue_in_loop(move || o.lock().unwrap().push(i));
        }
        let tx = done_tx.clone();
        reactor.queue_in_loop(move || tx.send(()).unwrap());

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());

        reactor.quit();
        handle.join().unwrap();
    }

    #[test]
    fn test_quit_from_other_thread_stops_loop() {
        let (reactor, handle) = spawn_reactor();
        reactor.quit();
        handle.join().unwrap();
    }

    #[test]
    fn test_run_after_fires_once() {
        let (reactor, handle) = spawn_reactor();
        let (tx, rx) = mpsc::channel();
        reactor.run_after(Duration::from_millis(20), move || {
            let _ = tx.send(Timestamp::now());
        });

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        reactor.quit();
        handle.join().unwrap();
    }

    #[test]
    fn test_run_every_fires_until_cancelled() {
        let (reactor, handle) = spawn_reactor();
        let (tx, rx) = mpsc::channel();
        let id = reactor.run_every(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        reactor.cancel(id);
        // Drain anything already in flight, then expect silence.
        while rx.recv_timeout(Duration::from_millis(100)).is_ok() {}

        reactor.quit();
        handle.join().unwrap();
    }

    #[test]
    fn test_channel_mutation_from_foreign_thread_panics() {
        let (reactor, handle) = spawn_reactor();
        let r = reactor.clone();
        let outcome = thread::spawn(move || {
            let channel = Channel::new(Arc::downgrade(&r), 0);
            channel.enable_reading();
        })
        .join();
        assert!(outcome.is_err());

        reactor.quit();
        handle.join().unwrap();
    }
}
