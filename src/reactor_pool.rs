//! Pool of reactor-per-thread workers.
//!
//! The listening reactor hands each accepted connection to one of `N` worker
//! reactors, chosen round-robin. With zero workers the base reactor serves
//! everything (single-threaded mode).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{Builder, JoinHandle};

use crate::logger::Logger;
use crate::poll::PollerKind;
use crate::reactor::Reactor;

/// Runs on each worker thread after its reactor exists, before the loop
/// starts.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<Reactor>) + Send + Sync>;

pub struct ReactorPool {
    base: Arc<Reactor>,
    name: String,
    started: AtomicBool,
    next: AtomicUsize,
    reactors: Mutex<Vec<Arc<Reactor>>>,
    workers: Mutex<Vec<Worker>>,
}

impl ReactorPool {
    pub fn new(base: Arc<Reactor>, name: &str) -> Self {
        ReactorPool {
            base,
            name: name.to_string(),
            started: AtomicBool::new(false),
            next: AtomicUsize::new(0),
            reactors: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `worker_count` reactor threads. Idempotent.
    pub fn start(
        &self,
        worker_count: usize,
        kind: PollerKind,
        logger: Arc<dyn Logger>,
        init: Option<ThreadInitCallback>,
    ) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut reactors = self.reactors.lock().unwrap();
        let mut workers = self.workers.lock().unwrap();
        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel();
            let init = init.clone();
            let logger = logger.clone();
            let thread = Builder::new()
                .name(format!("{}-reactor-{id}", self.name))
                .spawn(move || {
                    let reactor = Reactor::with_config(kind, logger)
                        .expect("failed to create worker reactor");
                    tx.send(reactor.clone()).unwrap();
                    if let Some(init) = init {
                        init(&reactor);
                    }
                    reactor.run();
                })
                .unwrap_or_else(|e| panic!("couldn't spawn reactor worker id={id}: {e}"));

            let reactor = rx
                .recv()
                .unwrap_or_else(|_| panic!("reactor worker id={id} died during startup"));
            reactors.push(reactor);
            workers.push(Worker {
                thread: Some(thread),
            });
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Next reactor, round-robin; the base reactor when the pool is empty.
    pub fn get_next_loop(&self) -> Arc<Reactor> {
        let reactors = self.reactors.lock().unwrap();
        if reactors.is_empty() {
            self.base.clone()
        } else {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % reactors.len();
            reactors[index].clone()
        }
    }

    pub fn worker_count(&self) -> usize {
        self.reactors.lock().unwrap().len()
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        for reactor in self.reactors.lock().unwrap().iter() {
            reactor.quit();
        }
        for worker in self.workers.lock().unwrap().iter_mut() {
            if let Some(thread) = worker.thread.take() {
                thread.join().unwrap();
            }
        }
    }
}

struct Worker {
    thread: Option<JoinHandle<()>>,
}
