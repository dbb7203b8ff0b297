//! Pool of worker loop threads with round-robin dispatch.

use crate::event_loop::LoopHandle;
use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};
use crate::poller::PollerKind;

/// Owns `N` worker loop threads and hands out their handles.
///
/// With zero workers every caller gets the base loop, so single-threaded
/// servers need no special casing.
pub struct EventLoopThreadPool {
    base_loop: LoopHandle,
    name: String,
    poller_kind: PollerKind,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
    next: usize,
    started: bool,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: LoopHandle, name: String, poller_kind: PollerKind) -> Self {
        EventLoopThreadPool {
            base_loop,
            name,
            poller_kind,
            threads: Vec::new(),
            loops: Vec::new(),
            next: 0,
            started: false,
        }
    }

    /// Spawn `thread_count` worker loops, running `init_callback` inside
    /// each new thread first. With zero workers the callback runs once on
    /// the base loop's behalf.
    pub fn start(&mut self, thread_count: usize, init_callback: Option<ThreadInitCallback>) {
        assert!(!self.started, "pool already started");

        for i in 0..thread_count {
            let mut thread = EventLoopThread::new(
                format!("{}-worker-{}", self.name, i),
                self.poller_kind,
                init_callback.clone(),
            );
            self.loops.push(thread.start_loop());
            self.threads.push(thread);
        }

        if thread_count == 0 {
            if let Some(callback) = init_callback {
                callback(&self.base_loop);
            }
        }
        self.started = true;
    }

    /// The next worker loop, round-robin; the base loop when the pool is
    /// empty.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let handle = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        handle
    }

    /// A stable loop for `hash`; the base loop when the pool is empty.
    pub fn get_loop_for_hash(&self, hash: usize) -> LoopHandle {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        self.loops[hash % self.loops.len()].clone()
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn worker_count(&self) -> usize {
        self.loops.len()
    }

    /// Quit and join every worker loop.
    pub fn stop(&mut self) {
        for thread in &mut self.threads {
            thread.stop_loop();
        }
    }
}
