//! A worker thread that owns one event loop.

use crate::event_loop::{EventLoop, LoopHandle};
use crate::poller::PollerKind;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Callback run inside a freshly-started loop thread before it begins
/// looping.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// Owns a dedicated thread whose sole job is to run one [`EventLoop`].
///
/// The loop is constructed on the worker thread's own stack; the spawning
/// thread receives a [`LoopHandle`] once the loop exists.
pub struct EventLoopThread {
    name: String,
    poller_kind: PollerKind,
    init_callback: Option<ThreadInitCallback>,
    handle: Option<LoopHandle>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: String, poller_kind: PollerKind, init_callback: Option<ThreadInitCallback>) -> Self {
        EventLoopThread {
            name,
            poller_kind,
            init_callback,
            handle: None,
            thread: None,
        }
    }

    /// Spawn the worker thread and block until its loop is constructed.
    ///
    /// # Panics
    /// Panics if the thread cannot be spawned or its loop cannot be
    /// created; worker startup failure is not recoverable.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "loop thread already started");

        let rendezvous = Arc::new((Mutex::new(None::<LoopHandle>), Condvar::new()));
        let thread_rendezvous = rendezvous.clone();
        let init_callback = self.init_callback.clone();
        let poller_kind = self.poller_kind;
        let name = self.name.clone();

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut event_loop = EventLoop::with_poller(poller_kind)
                    .unwrap_or_else(|e| panic!("{name}: failed to create event loop: {e}"));

                if let Some(callback) = init_callback {
                    callback(&event_loop.handle());
                }

                {
                    let (slot, ready) = &*thread_rendezvous;
                    *slot.lock() = Some(event_loop.handle());
                    ready.notify_one();
                }

                event_loop.run();
                debug!(thread = %thread::current().name().unwrap_or("?"), "loop thread finished");
            })
            .expect("failed to spawn loop thread");

        let (slot, ready) = &*rendezvous;
        let mut guard = slot.lock();
        while guard.is_none() {
            ready.wait(&mut guard);
        }
        let handle = guard.take().expect("loop handle missing after rendezvous");
        drop(guard);

        self.handle = Some(handle.clone());
        self.thread = Some(thread);
        handle
    }

    /// Ask the loop to quit and join the worker thread.
    pub fn stop_loop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// The loop handle, once started.
    pub fn handle(&self) -> Option<&LoopHandle> {
        self.handle.as_ref()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.stop_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_start_loop_returns_live_handle() {
        let mut worker = EventLoopThread::new("test-loop".into(), PollerKind::default(), None);
        let handle = worker.start_loop();
        assert!(!handle.is_in_loop_thread());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        handle.queue_in_loop(move || flag.store(true, Ordering::SeqCst));

        // Give the worker an iteration to drain.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(ran.load(Ordering::SeqCst));
        worker.stop_loop();
    }

    #[test]
    fn test_init_callback_runs_before_loop() {
        let inits = Arc::new(AtomicUsize::new(0));
        let counter = inits.clone();
        let init: ThreadInitCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut worker =
            EventLoopThread::new("init-loop".into(), PollerKind::default(), Some(init));
        worker.start_loop();
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        worker.stop_loop();
    }

    #[test]
    fn test_stop_loop_joins_thread() {
        let mut worker = EventLoopThread::new("stop-loop".into(), PollerKind::default(), None);
        worker.start_loop();
        worker.stop_loop();
        assert!(worker.thread.is_none());
    }
}
