//! Timers and the per-loop timer queue.

use crate::timestamp::Timestamp;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide timer sequence counter; never reused.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Allocate the next timer sequence number.
pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Fire forever (for repeating timers).
pub const REPEAT_FOREVER: i64 = -1;

/// Identifies one timer registration.
///
/// The sequence number is globally unique for the process lifetime, so a
/// stale id can never cancel a later timer that happens to occupy the same
/// queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

impl TimerId {
    pub(crate) fn new(sequence: u64) -> Self {
        TimerId { sequence }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

pub(crate) struct Timer {
    callback: TimerCallback,
    expiration: Timestamp,
    /// Repeat interval in microseconds; `0` means one-shot.
    interval: i64,
    /// Remaining firings; [`REPEAT_FOREVER`] means unbounded.
    repeat_count: i64,
    sequence: u64,
    canceled: bool,
}

impl Timer {
    pub(crate) fn new(
        callback: TimerCallback,
        expiration: Timestamp,
        interval: i64,
        repeat_count: i64,
        sequence: u64,
    ) -> Self {
        Timer {
            callback,
            expiration,
            interval,
            repeat_count,
            sequence,
            canceled: false,
        }
    }

    /// A zero interval with any repeat count would spin the loop; such
    /// timers are coerced to one-shot.
    fn is_one_shot(&self) -> bool {
        self.interval <= 0
    }

    /// Re-arm strictly periodically at `prev + interval`, skipping forward
    /// whole periods if the loop woke more than one period late.
    fn restart(&mut self, now: Timestamp) {
        self.expiration += self.interval;
        if self.expiration <= now {
            let periods = (now - self.expiration) / self.interval + 1;
            self.expiration += periods * self.interval;
        }
    }
}

/// Timers ordered by `(expiration, sequence)`, so equal-expiry timers fire
/// in registration order.
///
/// Owned by one loop and mutated only on its thread; cross-thread add and
/// cancel arrive as queued loop commands.
pub(crate) struct TimerQueue {
    timers: BTreeMap<(Timestamp, u64), Timer>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            timers: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, timer: Timer) {
        self.timers.insert((timer.expiration, timer.sequence), timer);
    }

    /// Flag or unflag a timer as cancelled. A cancelled timer is dropped
    /// from the set the next time its expiration is visited, without
    /// firing or re-arming.
    pub(crate) fn cancel(&mut self, id: TimerId, off: bool) {
        if let Some(timer) = self
            .timers
            .values_mut()
            .find(|t| t.sequence == id.sequence())
        {
            timer.canceled = off;
        }
    }

    /// Delete a timer outright.
    pub(crate) fn remove(&mut self, id: TimerId) {
        let key = self
            .timers
            .iter()
            .find(|(_, t)| t.sequence == id.sequence())
            .map(|(&k, _)| k);
        if let Some(key) = key {
            self.timers.remove(&key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }

    /// Fire every timer whose expiration is at or before now.
    ///
    /// Due timers are detached first and run outside the map, so a callback
    /// that schedules or cancels timers (which arrives as a loop command and
    /// is applied after this pass) never observes a half-walked queue.
    pub(crate) fn do_timer(&mut self) {
        let now = Timestamp::now();

        let mut due = Vec::new();
        while let Some((&key, _)) = self.timers.iter().next() {
            if key.0 > now {
                break;
            }
            due.push(self.timers.remove(&key).expect("due key vanished"));
        }

        for mut timer in due {
            if timer.canceled {
                continue;
            }
            (timer.callback)();
            if timer.repeat_count > 0 {
                timer.repeat_count -= 1;
            }
            if !timer.is_one_shot() && timer.repeat_count != 0 && !timer.canceled {
                timer.restart(now);
                self.insert(timer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_timer(
        counter: &Arc<AtomicUsize>,
        expiration: Timestamp,
        interval: i64,
        repeat: i64,
    ) -> Timer {
        let counter = counter.clone();
        Timer::new(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            expiration,
            interval,
            repeat,
            next_sequence(),
        )
    }

    #[test]
    fn test_past_timer_fires_on_next_pass() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        queue.insert(counting_timer(
            &fired,
            Timestamp::now() - 1_000_000,
            0,
            1,
        ));
        queue.do_timer();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_future_timer_does_not_fire_early() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        queue.insert(counting_timer(
            &fired,
            Timestamp::now() + 60_000_000,
            0,
            1,
        ));
        queue.do_timer();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_equal_expiry_fires_in_insertion_order() {
        let mut queue = TimerQueue::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let when = Timestamp::now() - 1_000;

        for label in ["a", "b", "c"] {
            let order = order.clone();
            queue.insert(Timer::new(
                Box::new(move || order.lock().push(label)),
                when,
                0,
                1,
                next_sequence(),
            ));
        }
        queue.do_timer();
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_repeating_timer_rearms_at_prev_plus_interval() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let start = Timestamp::now() - 10;
        queue.insert(counting_timer(&fired, start, 50_000_000, REPEAT_FOREVER));

        queue.do_timer();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
        let (&(next_expiry, _), _) = queue.timers.iter().next().unwrap();
        assert_eq!(next_expiry, start + 50_000_000);
    }

    #[test]
    fn test_late_wakeup_skips_missed_periods() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        // Five whole periods behind.
        let start = Timestamp::now() - 5_000;
        queue.insert(counting_timer(&fired, start, 1_000, REPEAT_FOREVER));

        queue.do_timer();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let (&(next_expiry, _), _) = queue.timers.iter().next().unwrap();
        assert!(next_expiry > Timestamp::now() - 1_000);
        // Still on the original period grid.
        assert_eq!((next_expiry - start) % 1_000, 0);
    }

    #[test]
    fn test_repeat_count_exhaustion_deletes_timer() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        queue.insert(counting_timer(&fired, Timestamp::now() - 10_000, 1, 2));

        queue.do_timer();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);

        // Second (and final) firing once it is due again.
        std::thread::sleep(std::time::Duration::from_millis(1));
        queue.do_timer();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_zero_interval_repeating_coerced_to_one_shot() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        queue.insert(counting_timer(
            &fired,
            Timestamp::now() - 10,
            0,
            REPEAT_FOREVER,
        ));

        queue.do_timer();
        queue.do_timer();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_cancelled_timer_dropped_without_firing() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = counting_timer(&fired, Timestamp::now() - 10, 1_000, REPEAT_FOREVER);
        let id = TimerId::new(timer.sequence);
        queue.insert(timer);

        queue.cancel(id, true);
        queue.do_timer();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Dropped from the set entirely, not re-armed.
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_cancel_can_be_undone_before_expiry() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = counting_timer(&fired, Timestamp::now() + 5_000, 0, 1);
        let id = TimerId::new(timer.sequence);
        queue.insert(timer);

        queue.cancel(id, true);
        queue.cancel(id, false);
        std::thread::sleep(std::time::Duration::from_millis(6));
        queue.do_timer();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_deletes_pending_timer() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = counting_timer(&fired, Timestamp::now() + 1_000_000, 0, 1);
        let id = TimerId::new(timer.sequence);
        queue.insert(timer);

        queue.remove(id);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_stale_id_is_harmless() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        queue.insert(counting_timer(&fired, Timestamp::now() + 1_000_000, 0, 1));

        queue.cancel(TimerId::new(u64::MAX), true);
        queue.remove(TimerId::new(u64::MAX));
        assert_eq!(queue.len(), 1);
    }
}
