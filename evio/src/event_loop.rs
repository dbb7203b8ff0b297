//! The per-thread reactor and its cross-thread handle.

use crate::channel::Channel;
use crate::poller::{new_poller, Poller, PollerKind};
use crate::timer::{next_sequence, Timer, TimerCallback, TimerId, TimerQueue, REPEAT_FOREVER};
use crate::timestamp::Timestamp;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace};

/// How long one poll may block; bounds task/timer latency even when no
/// wakeup arrives.
const POLL_TIMEOUT_MS: i32 = 10;

/// A closure queued to run on a loop's thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Work shipped to a loop from other threads. Everything that mutates
/// loop-owned state (timer queue included) crosses as a command so the loop
/// thread is the only mutator.
enum Command {
    Task(Task),
    AddTimer {
        when: Timestamp,
        interval: i64,
        repeat_count: i64,
        sequence: u64,
        callback: TimerCallback,
    },
    CancelTimer {
        id: TimerId,
        off: bool,
    },
    RemoveTimer {
        id: TimerId,
    },
}

/// State reachable from any thread.
struct LoopShared {
    commands: Sender<Command>,
    /// The loop's multiplexer. Locked only by the loop thread after
    /// startup; the mutex exists so handles are `Sync`, not for contention.
    poller: Mutex<Box<dyn Poller>>,
    wakeup_fd: RawFd,
    thread_id: ThreadId,
    quit: AtomicBool,
    /// True while the loop is draining its command queue; a producer on the
    /// loop thread must still wake the next iteration in that window.
    doing_tasks: AtomicBool,
}

/// One reactor, bound to the thread that constructed it.
///
/// Drives the poller, dispatches ready channels, fires timers, and drains
/// cross-thread commands until [`quit`](LoopHandle::quit).
pub struct EventLoop {
    shared: Arc<LoopShared>,
    commands: Receiver<Command>,
    timer_queue: TimerQueue,
    wakeup_channel: Channel,
    active_channels: Vec<Channel>,
    frame_functor: Option<Box<dyn FnMut()>>,
    poll_return_time: Timestamp,
    iteration: u64,
    looping: bool,
    event_handling: bool,
    /// fd of the channel currently dispatching, for diagnostics.
    current_active_fd: Option<RawFd>,
}

impl EventLoop {
    /// Create a loop owned by the calling thread, with the platform-default
    /// poller.
    pub fn new() -> io::Result<Self> {
        Self::with_poller(PollerKind::default())
    }

    /// Create a loop owned by the calling thread, with an explicit poller
    /// backend.
    pub fn with_poller(kind: PollerKind) -> io::Result<Self> {
        let poller = new_poller(kind)?;

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(LoopShared {
            commands: tx,
            poller: Mutex::new(poller),
            wakeup_fd,
            thread_id: thread::current().id(),
            quit: AtomicBool::new(false),
            doing_tasks: AtomicBool::new(false),
        });

        let handle = LoopHandle {
            shared: shared.clone(),
        };
        let wakeup_channel = Channel::new(handle, wakeup_fd);
        wakeup_channel.set_read_callback(move |_| drain_wakeup(wakeup_fd));
        wakeup_channel.enable_reading();

        Ok(EventLoop {
            shared,
            commands: rx,
            timer_queue: TimerQueue::new(),
            wakeup_channel,
            active_channels: Vec::new(),
            frame_functor: None,
            poll_return_time: Timestamp::invalid(),
            iteration: 0,
            looping: false,
            event_handling: false,
            current_active_fd: None,
        })
    }

    /// A clonable cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Timestamp sampled when the last poll returned; usually the arrival
    /// time of the data being dispatched.
    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time
    }

    /// Completed loop iterations.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// True while channel events are being dispatched.
    pub fn event_handling(&self) -> bool {
        self.event_handling
    }

    /// The fd whose channel is currently dispatching, if any.
    pub fn current_active_fd(&self) -> Option<RawFd> {
        self.current_active_fd
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        self.handle().assert_in_loop_thread();
    }

    /// Install a functor invoked once per iteration, after channel dispatch
    /// and before timers.
    pub fn set_frame_functor<F>(&mut self, functor: F)
    where
        F: FnMut() + 'static,
    {
        self.frame_functor = Some(Box::new(functor));
    }

    /// Drive the reactor until [`quit`](LoopHandle::quit) is observed.
    ///
    /// Must be called on the loop's owning thread.
    pub fn run(&mut self) {
        self.assert_in_loop_thread();
        assert!(!self.looping, "loop is already running");
        self.looping = true;
        self.shared.quit.store(false, Ordering::Release);
        debug!(thread = ?self.shared.thread_id, "event loop started");

        while !self.shared.quit.load(Ordering::Acquire) {
            self.active_channels.clear();
            self.poll_return_time = {
                let mut poller = self.shared.poller.lock();
                poller.poll(POLL_TIMEOUT_MS, &mut self.active_channels)
            };
            self.iteration += 1;

            self.event_handling = true;
            let active = std::mem::take(&mut self.active_channels);
            for channel in &active {
                self.current_active_fd = Some(channel.fd());
                channel.handle_event(self.poll_return_time);
            }
            self.current_active_fd = None;
            self.active_channels = active;
            self.event_handling = false;

            if let Some(functor) = self.frame_functor.as_mut() {
                functor();
            }

            self.timer_queue.do_timer();
            self.process_commands();
        }

        self.looping = false;
        debug!(thread = ?self.shared.thread_id, "event loop stopped");
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().run_in_loop(task);
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().queue_in_loop(task);
    }

    /// See [`LoopHandle::run_at`].
    pub fn run_at<F>(&self, when: Timestamp, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.handle().run_at(when, callback)
    }

    /// See [`LoopHandle::run_after`].
    pub fn run_after<F>(&self, delay_micros: i64, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.handle().run_after(delay_micros, callback)
    }

    /// See [`LoopHandle::run_every`].
    pub fn run_every<F>(&self, interval_micros: i64, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.handle().run_every(interval_micros, callback)
    }

    /// See [`LoopHandle::cancel`].
    pub fn cancel(&self, id: TimerId, off: bool) {
        self.handle().cancel(id, off);
    }

    /// See [`LoopHandle::remove`].
    pub fn remove(&self, id: TimerId) {
        self.handle().remove(id);
    }

    /// See [`LoopHandle::quit`].
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Execute the commands queued so far. Anything enqueued while this
    /// drain runs is left for the next iteration.
    fn process_commands(&mut self) {
        self.shared.doing_tasks.store(true, Ordering::Release);
        let pending = self.commands.len();
        for _ in 0..pending {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command),
                Err(_) => break,
            }
        }
        self.shared.doing_tasks.store(false, Ordering::Release);
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Task(task) => task(),
            Command::AddTimer {
                when,
                interval,
                repeat_count,
                sequence,
                callback,
            } => {
                trace!(sequence, "timer armed");
                self.timer_queue
                    .insert(Timer::new(callback, when, interval, repeat_count, sequence));
            }
            Command::CancelTimer { id, off } => self.timer_queue.cancel(id, off),
            Command::RemoveTimer { id } => self.timer_queue.remove(id),
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        unsafe {
            libc::close(self.shared.wakeup_fd);
        }
    }
}

/// Read the wakeup counter until the descriptor is drained.
fn drain_wakeup(fd: RawFd) {
    loop {
        let mut value: u64 = 0;
        let n = unsafe { libc::read(fd, &mut value as *mut u64 as *mut libc::c_void, 8) };
        if n != 8 {
            break;
        }
    }
}

/// A clonable, thread-safe handle to one [`EventLoop`].
///
/// Everything here may be called from any thread. Operations that must run
/// on the loop thread are queued and the loop is woken through its eventfd.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Abort if the caller is not on the loop thread. Guards every entry
    /// point that touches loop-owned state.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "called from {:?} but the loop is owned by {:?}",
            thread::current().id(),
            self.shared.thread_id
        );
    }

    /// Run `task` on the loop thread: immediately when already there,
    /// otherwise queued.
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

    /// Queue `task` for the loop's next command drain. Tasks run in FIFO
    /// order after the current dispatch completes; a task queued from
    /// inside the drain itself runs on the following iteration.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Command::Task(Box::new(task)));
    }

    /// Run `callback` once at `when`.
    pub fn run_at<F>(&self, when: Timestamp, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(when, 0, 1, Box::new(callback))
    }

    /// Run `callback` once after `delay_micros`.
    pub fn run_after<F>(&self, delay_micros: i64, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(Timestamp::now() + delay_micros, 0, 1, Box::new(callback))
    }

    /// Run `callback` every `interval_micros` until cancelled.
    pub fn run_every<F>(&self, interval_micros: i64, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(
            Timestamp::now() + interval_micros,
            interval_micros,
            REPEAT_FOREVER,
            Box::new(callback),
        )
    }

    /// Flag (`off = true`) or unflag a timer as cancelled.
    pub fn cancel(&self, id: TimerId, off: bool) {
        self.send(Command::CancelTimer { id, off });
    }

    /// Delete a timer outright.
    pub fn remove(&self, id: TimerId) {
        self.send(Command::RemoveTimer { id });
    }

    /// Ask the loop to stop after its current iteration, waking it if the
    /// caller is on another thread.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Register or re-register a channel with the loop's poller.
    /// Loop-thread only.
    pub fn update_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.shared.poller.lock().update_channel(channel)
    }

    /// Unregister a channel. Loop-thread only; interest must be none.
    pub fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.shared.poller.lock().remove_channel(channel)
    }

    /// Is this exact channel registered with the loop's poller?
    /// Loop-thread only.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.shared.poller.lock().has_channel(channel)
    }

    fn add_timer(
        &self,
        when: Timestamp,
        interval: i64,
        repeat_count: i64,
        callback: TimerCallback,
    ) -> TimerId {
        let sequence = next_sequence();
        self.send(Command::AddTimer {
            when,
            interval,
            repeat_count,
            sequence,
            callback,
        });
        TimerId::new(sequence)
    }

    fn send(&self, command: Command) {
        if self.shared.commands.send(command).is_err() {
            error!("loop command queue is closed");
            return;
        }
        // Off-thread producers always wake the loop; an on-thread producer
        // only needs to when the loop is inside its drain (so the command
        // is picked up next iteration without waiting out the poll).
        if !self.is_in_loop_thread() || self.shared.doing_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.shared.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(
                fd = self.shared.wakeup_fd,
                "wakeup write returned {n} instead of 8"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_run_in_loop_from_loop_thread_is_synchronous() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        event_loop
            .handle()
            .run_in_loop(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_queued_tasks_run_fifo() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            handle.queue_in_loop(move || order.lock().push(i));
        }
        let quit = handle.clone();
        handle.queue_in_loop(move || quit.quit());

        event_loop.run();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_task_queued_during_drain_runs_next_iteration() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let iterations = Arc::new(Mutex::new(Vec::new()));

        let outer_iterations = iterations.clone();
        let outer_handle = handle.clone();
        handle.queue_in_loop(move || {
            outer_iterations.lock().push("first");
            let inner_iterations = outer_iterations.clone();
            let quit = outer_handle.clone();
            // Queued while the drain is running: must not run in this drain.
            outer_handle.queue_in_loop(move || {
                inner_iterations.lock().push("second");
                quit.quit();
            });
            outer_iterations.lock().push("first-done");
        });

        event_loop.run();
        assert_eq!(*iterations.lock(), vec!["first", "first-done", "second"]);
    }

    #[test]
    fn test_cross_thread_queue_wakes_loop() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let ran = Arc::new(AtomicBool::new(false));

        let thread_handle = handle.clone();
        let flag = ran.clone();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let quit = thread_handle.clone();
            thread_handle.queue_in_loop(move || {
                flag.store(true, Ordering::SeqCst);
                quit.quit();
            });
        });

        event_loop.run();
        producer.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_timer_fires_and_loop_quits() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let fired = Arc::new(AtomicUsize::new(0));

        let count = fired.clone();
        let quit = handle.clone();
        handle.run_after(5_000, move || {
            count.fetch_add(1, Ordering::SeqCst);
            quit.quit();
        });

        event_loop.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_equal_expiry_timers_fire_in_registration_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        let when = Timestamp::now() + 10_000;

        for label in ["a", "b"] {
            let order = order.clone();
            handle.run_at(when, move || order.lock().push(label));
        }
        {
            let order = order.clone();
            let quit = handle.clone();
            handle.run_at(when + 1, move || {
                order.lock().push("c");
                quit.quit();
            });
        }

        event_loop.run();
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cancelled_repeating_timer_stops() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let fired = Arc::new(AtomicUsize::new(0));

        let count = fired.clone();
        let id = handle.run_every(5_000, move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        let cancel_handle = handle.clone();
        handle.run_after(26_000, move || cancel_handle.cancel(id, true));
        let quit = handle.clone();
        handle.run_after(80_000, move || quit.quit());

        event_loop.run();
        let total = fired.load(Ordering::SeqCst);
        assert!(total >= 1, "repeating timer never fired");
        assert!(total <= 6, "cancel did not stop the timer: {total} firings");
    }

    #[test]
    fn test_frame_functor_runs_every_iteration() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let frames = Arc::new(AtomicUsize::new(0));

        let count = frames.clone();
        event_loop.set_frame_functor(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        let quit = handle.clone();
        handle.run_after(25_000, move || quit.quit());

        event_loop.run();
        assert!(frames.load(Ordering::SeqCst) >= 2);
        assert_eq!(frames.load(Ordering::SeqCst) as u64, event_loop.iteration());
    }

    #[test]
    #[should_panic(expected = "owned by")]
    fn test_update_channel_off_thread_panics() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        thread::spawn(move || {
            let channel = Channel::new(handle.clone(), 0);
            handle.update_channel(&channel);
        })
        .join()
        .unwrap_or_else(|e| std::panic::resume_unwind(e));
    }
}
