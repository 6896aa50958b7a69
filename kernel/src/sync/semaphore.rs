//! A counting semaphore bounded by a maximum count.

use core::sync::atomic::{AtomicI64, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::arch;
use crate::constants::task::MAX_TASKS;
use crate::sched::{self, TaskId};

/// Invariant: `0 <= count <= max` between operations. The count dips
/// negative only transiently inside a failed decrement, which is undone
/// before the caller blocks.
pub struct Semaphore {
    count: AtomicI64,
    max: i64,
    waiters: ArrayQueue<TaskId>,
}

impl Semaphore {
    /// Panics on a configuration no semaphore can satisfy: a zero maximum
    /// or an initial count past it.
    pub fn new(initial: u32, max: u32) -> Self {
        if max == 0 || initial > max {
            panic!("semaphore: invalid configuration ({}/{})", initial, max);
        }
        Semaphore {
            count: AtomicI64::new(initial as i64),
            max: max as i64,
            waiters: ArrayQueue::new(MAX_TASKS),
        }
    }

    /// Takes one unit, blocking while none are available. A woken waiter
    /// loops back to re-decrement; several wake cycles may be needed under
    /// contention before its decrement lands.
    pub fn wait(&self) {
        loop {
            if self.try_wait() {
                return;
            }
            let me = sched::current_task();
            arch::without_interrupts(|| {
                sched::with_scheduler(|scheduler| scheduler.block(me));
                if self.waiters.push(me).is_err() {
                    sched::with_scheduler(|scheduler| scheduler.wake(me));
                }
            });
            sched::yield_now();
        }
    }

    /// Returns one unit and wakes the longest-blocked waiter. Signalling a
    /// full semaphore is diagnosed and dropped, keeping the bound intact.
    pub fn signal(&self) {
        if let Some(waiter) = self.post() {
            sched::unblock(waiter);
        }
    }

    /// Non-blocking take.
    pub fn try_wait(&self) -> bool {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        if prev > 0 {
            true
        } else {
            self.count.fetch_add(1, Ordering::AcqRel);
            false
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed).max(0) as u32
    }

    pub fn max(&self) -> u32 {
        self.max as u32
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    fn post(&self) -> Option<TaskId> {
        if self.count.load(Ordering::Acquire) >= self.max {
            log::warn!("semaphore: signal past the maximum count");
            return None;
        }
        self.count.fetch_add(1, Ordering::Release);
        self.waiters.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(index: usize) -> TaskId {
        TaskId::from_index(index)
    }

    #[test]
    #[should_panic(expected = "invalid configuration")]
    fn zero_maximum_is_fatal() {
        Semaphore::new(0, 0);
    }

    #[test]
    #[should_panic(expected = "invalid configuration")]
    fn initial_count_past_maximum_is_fatal() {
        Semaphore::new(3, 2);
    }

    #[test]
    fn count_stays_within_bounds() {
        let sem = Semaphore::new(2, 2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        assert_eq!(sem.count(), 0);

        let _ = sem.post();
        let _ = sem.post();
        assert_eq!(sem.count(), 2);
        // Signal past the maximum is dropped, not applied.
        assert_eq!(sem.post(), None);
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn failed_take_leaves_the_count_untouched() {
        let sem = Semaphore::new(1, 4);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        assert!(!sem.try_wait());
        assert_eq!(sem.count(), 0);

        let _ = sem.post();
        assert!(sem.try_wait());
    }

    #[test]
    fn signal_wakes_the_longest_blocked_waiter() {
        let sem = Semaphore::new(0, 1);
        sem.waiters.push(task(3)).unwrap();
        sem.waiters.push(task(5)).unwrap();

        assert_eq!(sem.post(), Some(task(3)));
        assert!(sem.try_wait());
        assert_eq!(sem.post(), Some(task(5)));
    }

    #[test]
    fn wake_is_not_tied_to_a_successful_take() {
        let sem = Semaphore::new(0, 1);
        sem.waiters.push(task(1)).unwrap();

        let woken = sem.post().unwrap();
        // Another task can consume the unit before the woken task runs;
        // the woken task's next decrement then fails and it blocks again.
        assert!(sem.try_wait());
        assert_eq!(woken, task(1));
        assert!(!sem.try_wait());
    }
}
