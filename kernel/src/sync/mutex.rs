//! A blocking mutex with FIFO wait-queue wakeups.
//!
//! This is a queued spin/block hybrid, not a pure sleeping lock. Unlock
//! wakes the queue head but does not transfer ownership; the woken task
//! retries the atomic acquire and can lose to a task that never blocked.
//! A waiter stuck behind fast re-lockers can therefore starve; that is the
//! documented wake semantics, not an accident.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::arch;
use crate::constants::task::MAX_TASKS;
use crate::sched::{self, TaskId};

const NO_OWNER: usize = usize::MAX;

pub struct Mutex {
    locked: AtomicBool,
    /// Owner task index, identity only. `NO_OWNER` when unlocked.
    owner: AtomicUsize,
    waiters: ArrayQueue<TaskId>,
}

impl Mutex {
    pub fn new() -> Self {
        Mutex {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            waiters: ArrayQueue::new(MAX_TASKS),
        }
    }

    /// Acquires the mutex, blocking the calling task while someone else
    /// holds it. A relock attempt by the current owner does not block; it
    /// spins until the state is untangled by an unlock elsewhere.
    pub fn lock(&self) {
        loop {
            let me = sched::current_task();
            if self.try_acquire(me) {
                return;
            }
            if self.owner.load(Ordering::Relaxed) == me.index() {
                core::hint::spin_loop();
                continue;
            }

            // Block and enqueue atomically with respect to the unlock
            // path, or the wakeup could slip between the two.
            arch::without_interrupts(|| {
                sched::with_scheduler(|scheduler| scheduler.block(me));
                if self.waiters.push(me).is_err() {
                    sched::with_scheduler(|scheduler| scheduler.wake(me));
                }
            });
            sched::yield_now();
        }
    }

    /// Releases the mutex and wakes the longest-blocked waiter, if any.
    /// Unlocking while not the owner is diagnosed and changes nothing.
    pub fn unlock(&self) {
        let me = sched::current_task();
        if let Some(waiter) = self.release_from(me) {
            sched::unblock(waiter);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn owner(&self) -> Option<TaskId> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            index => Some(TaskId::from_index(index)),
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    fn try_acquire(&self, task: TaskId) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(task.index(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Clears the lock when `task` owns it, returning the waiter to wake.
    fn release_from(&self, task: TaskId) -> Option<TaskId> {
        if !self.locked.load(Ordering::Relaxed) {
            log::warn!("mutex: unlock of an unlocked mutex");
            return None;
        }
        if self.owner.load(Ordering::Relaxed) != task.index() {
            log::warn!("mutex: unlock by non-owner task {}", task.index());
            return None;
        }

        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        self.waiters.pop()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(index: usize) -> TaskId {
        TaskId::from_index(index)
    }

    #[test]
    fn uncontended_acquire_records_the_owner() {
        let mutex = Mutex::new();
        assert!(mutex.try_acquire(task(0)));
        assert!(mutex.is_locked());
        assert_eq!(mutex.owner(), Some(task(0)));
    }

    #[test]
    fn held_mutex_rejects_a_second_acquire() {
        let mutex = Mutex::new();
        assert!(mutex.try_acquire(task(0)));
        assert!(!mutex.try_acquire(task(1)));
        // Never both owners: the loser observes someone else's claim.
        assert_eq!(mutex.owner(), Some(task(0)));
    }

    #[test]
    fn unlock_by_non_owner_changes_nothing() {
        let mutex = Mutex::new();
        assert!(mutex.try_acquire(task(0)));
        assert_eq!(mutex.release_from(task(1)), None);
        assert!(mutex.is_locked());
        assert_eq!(mutex.owner(), Some(task(0)));
    }

    #[test]
    fn unlock_of_an_unlocked_mutex_is_a_no_op() {
        let mutex = Mutex::new();
        assert_eq!(mutex.release_from(task(0)), None);
        assert!(!mutex.is_locked());
        assert_eq!(mutex.owner(), None);
    }

    #[test]
    fn waiters_wake_in_fifo_order() {
        let mutex = Mutex::new();
        assert!(mutex.try_acquire(task(0)));
        mutex.waiters.push(task(1)).unwrap();
        mutex.waiters.push(task(2)).unwrap();

        assert_eq!(mutex.release_from(task(0)), Some(task(1)));
        assert!(mutex.try_acquire(task(1)));
        assert_eq!(mutex.release_from(task(1)), Some(task(2)));
    }

    #[test]
    fn woken_waiter_races_rather_than_inheriting_ownership() {
        let mutex = Mutex::new();
        assert!(mutex.try_acquire(task(0)));
        mutex.waiters.push(task(1)).unwrap();

        let woken = mutex.release_from(task(0)).unwrap();
        assert_eq!(woken, task(1));
        // A task that never blocked can still win the race.
        assert!(mutex.try_acquire(task(2)));
        assert!(!mutex.try_acquire(woken));
    }
}
