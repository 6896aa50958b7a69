//! The tick-driven timer subsystem.
//!
//! One hardware tick source drives everything: a monotonic 32-bit counter,
//! free-standing software timers with closure callbacks, per-task sleep
//! timers, and preemption. The tick handler fires due callbacks with the
//! timer lock released, wakes expired sleepers, and then unconditionally
//! offers the CPU to the next READY task, so every hardware tick is a
//! preemption point.
//!
//! Durations are given in milliseconds and converted to ticks rounding up,
//! so a timer or sleep never fires earlier than asked. A duration past the
//! 32-bit tick horizon is a fatal configuration error, not a silent wrap.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch;
use crate::collections::{Handle, LinkedArena};
#[cfg(target_os = "none")]
use crate::constants::idt::TIMER_IRQ;
use crate::constants::timer::TICK_HZ;
use crate::sched;

pub type TimerCallback = Box<dyn FnMut() + Send>;

/// Handle to a free-standing timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(Handle);

/// The embedded per-task sleep timer. No callback and never heap-allocated;
/// each TCB owns one and rearms it across sleeps.
#[derive(Debug, Clone, Copy)]
pub struct SleepTimer {
    expiry: u32,
    armed: bool,
}

impl SleepTimer {
    pub const fn new() -> Self {
        SleepTimer {
            expiry: 0,
            armed: false,
        }
    }

    pub fn arm(&mut self, expiry: u32) {
        self.expiry = expiry;
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn expired(&self, now: u32) -> bool {
        self.armed && now >= self.expiry
    }
}

impl Default for SleepTimer {
    fn default() -> Self {
        Self::new()
    }
}

struct TimerEntry {
    expiry: u32,
    /// Reload delta for periodic timers, in ticks.
    interval: u32,
    periodic: bool,
    /// Taken while the callback runs so the tick handler can drop the
    /// timer lock; `None` marks an entry currently mid-dispatch.
    callback: Option<TimerCallback>,
}

/// Tick counter plus the free-standing timer list. The kernel keeps one
/// instance behind [`TIMER`]; tests build their own and tick it by hand.
pub struct SystemTimer {
    ticks: u32,
    timers: LinkedArena<TimerEntry>,
}

impl SystemTimer {
    pub const fn new() -> Self {
        SystemTimer {
            ticks: 0,
            timers: LinkedArena::new(),
        }
    }

    pub fn now(&self) -> u32 {
        self.ticks
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Registers a timer firing `duration_ms` from now. Fatal when the
    /// expiry would pass the 32-bit tick horizon.
    pub fn arm(
        &mut self,
        duration_ms: u64,
        periodic: bool,
        callback: TimerCallback,
    ) -> TimerId {
        let interval = ticks_for(duration_ms);
        let expiry = match self.ticks.checked_add(interval) {
            Some(expiry) => expiry,
            None => panic!("timer: {} ms exceeds the tick horizon", duration_ms),
        };

        let handle = self.timers.push_back(TimerEntry {
            expiry,
            interval,
            periodic,
            callback: Some(callback),
        });
        log::debug!(
            "timer: armed {} timer for tick {} ({} ms)",
            if periodic { "periodic" } else { "one-shot" },
            expiry,
            duration_ms
        );
        TimerId(handle)
    }

    /// Deactivates and removes a free-standing timer. Returns false when
    /// the id is stale, e.g. the timer already fired as a one-shot.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.remove(id.0).is_some()
    }

    /// Advances the counter and takes the callbacks of every due timer.
    /// The caller runs them unlocked and feeds them to
    /// [`finish_tick`](Self::finish_tick).
    pub fn begin_tick(&mut self) -> (u32, Vec<(Handle, TimerCallback)>) {
        self.ticks = match self.ticks.checked_add(1) {
            Some(ticks) => ticks,
            None => panic!("timer: tick counter overflow"),
        };
        let now = self.ticks;

        let mut due = Vec::new();
        for handle in self.timers.handles() {
            if let Some(entry) = self.timers.get_mut(handle) {
                if now >= entry.expiry {
                    if let Some(callback) = entry.callback.take() {
                        due.push((handle, callback));
                    }
                }
            }
        }
        (now, due)
    }

    /// Reinstates periodic timers (expiry clamped to the horizon rather
    /// than wrapping) and drops finished one-shots.
    pub fn finish_tick(&mut self, now: u32, finished: Vec<(Handle, TimerCallback)>) {
        for (handle, callback) in finished {
            let reschedule = match self.timers.get_mut(handle) {
                Some(entry) if entry.periodic => {
                    entry.expiry = now.saturating_add(entry.interval);
                    entry.callback = Some(callback);
                    true
                }
                _ => false,
            };
            if !reschedule {
                self.timers.remove(handle);
            }
        }
    }

    #[cfg(test)]
    fn set_now(&mut self, ticks: u32) {
        self.ticks = ticks;
    }

    #[cfg(test)]
    fn expiry_of(&self, id: TimerId) -> Option<u32> {
        self.timers.get(id.0).map(|entry| entry.expiry)
    }
}

impl Default for SystemTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds to ticks, rounding up so nothing fires early. Fatal when
/// the count does not fit the 32-bit tick horizon.
pub fn ticks_for(duration_ms: u64) -> u32 {
    let ticks = duration_ms
        .checked_mul(TICK_HZ as u64)
        .map(|raw| raw.div_ceil(1000))
        .and_then(|ticks| u32::try_from(ticks).ok());
    match ticks {
        Some(ticks) => ticks,
        None => panic!("timer: {} ms exceeds the tick horizon", duration_ms),
    }
}

pub static TIMER: Mutex<Option<SystemTimer>> = Mutex::new(None);

fn with_timer<F, R>(f: F) -> R
where
    F: FnOnce(&mut SystemTimer) -> R,
{
    arch::without_interrupts(|| {
        let mut guard = TIMER.lock();
        match &mut *guard {
            Some(timer) => f(timer),
            None => panic!("timer: used before init"),
        }
    })
}

/// Zeroes the counter and programs the hardware tick source at
/// [`TICK_HZ`]. Must run after the interrupt controller is remapped.
pub fn init() {
    *TIMER.lock() = Some(SystemTimer::new());
    #[cfg(target_os = "none")]
    {
        unsafe { arch::pit::set_frequency(TICK_HZ) };
        arch::pic::unmask_irq(TIMER_IRQ);
    }
    log::info!("timer: ticking at {} Hz", TICK_HZ);
}

pub fn now_ticks() -> u32 {
    with_timer(|timer| timer.now())
}

/// Registers a free-standing timer. Periodic timers refire every
/// `duration_ms` until the kernel halts; one-shots fire once and vanish.
pub fn start_timer<F>(duration_ms: u64, periodic: bool, callback: F) -> TimerId
where
    F: FnMut() + Send + 'static,
{
    with_timer(|timer| timer.arm(duration_ms, periodic, Box::new(callback)))
}

/// Deactivates a free-standing timer before it fires (again).
pub fn cancel_timer(id: TimerId) -> bool {
    with_timer(|timer| timer.cancel(id))
}

/// The per-tick driver, called from the timer interrupt handler after the
/// interrupt has been acknowledged.
pub fn on_tick() {
    let (now, mut due) = with_timer(|timer| timer.begin_tick());

    // Callbacks run with the timer lock released so they may arm timers
    // themselves.
    for (_, callback) in &mut due {
        callback();
    }
    with_timer(|timer| timer.finish_tick(now, due));

    sched::with_scheduler(|scheduler| scheduler.wake_expired_sleepers(now));
    sched::yield_now();
}

/// Blocks the calling task for at least `duration_ms`. The task returns to
/// READY at the first tick at or past the converted deadline, never before.
pub fn sleep(duration_ms: u64) {
    let delta = ticks_for(duration_ms);
    with_timer(|timer| {
        let expiry = match timer.now().checked_add(delta) {
            Some(expiry) => expiry,
            None => panic!("timer: {} ms exceeds the tick horizon", duration_ms),
        };
        sched::with_scheduler(|scheduler| scheduler.start_sleep(expiry));
    });
    sched::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn run_tick(timer: &mut SystemTimer) -> u32 {
        let (now, mut due) = timer.begin_tick();
        for (_, callback) in &mut due {
            callback();
        }
        timer.finish_tick(now, due);
        now
    }

    fn counted() -> (Arc<AtomicUsize>, TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (
            count,
            Box::new(move || {
                inner.fetch_add(1, Ordering::Relaxed);
            }),
        )
    }

    #[test]
    fn millisecond_conversion_rounds_up() {
        assert_eq!(ticks_for(0), 0);
        assert_eq!(ticks_for(1), 1);
        assert_eq!(ticks_for(10), 1);
        assert_eq!(ticks_for(15), 2);
        assert_eq!(ticks_for(50), 5);
        assert_eq!(ticks_for(1000), TICK_HZ);
    }

    #[test]
    #[should_panic(expected = "tick horizon")]
    fn oversized_duration_is_fatal() {
        ticks_for(u64::MAX / TICK_HZ as u64);
    }

    #[test]
    fn one_shot_fires_once_and_is_removed() {
        let mut timer = SystemTimer::new();
        let (count, callback) = counted();
        timer.arm(10, false, callback); // one tick out
        assert_eq!(timer.timer_count(), 1);

        run_tick(&mut timer);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(timer.timer_count(), 0);

        run_tick(&mut timer);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn timer_never_fires_before_its_deadline() {
        let mut timer = SystemTimer::new();
        let (count, callback) = counted();
        timer.arm(50, false, callback); // five ticks out

        for _ in 0..4 {
            run_tick(&mut timer);
            assert_eq!(count.load(Ordering::Relaxed), 0);
        }
        run_tick(&mut timer);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn periodic_timer_refires_on_its_interval() {
        let mut timer = SystemTimer::new();
        let (count, callback) = counted();
        timer.arm(20, true, callback); // every two ticks

        for _ in 0..6 {
            run_tick(&mut timer);
        }
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(timer.timer_count(), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut timer = SystemTimer::new();
        let (count, callback) = counted();
        let id = timer.arm(10, false, callback);

        assert!(timer.cancel(id));
        assert!(!timer.cancel(id));
        run_tick(&mut timer);
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(timer.timer_count(), 0);
    }

    #[test]
    fn timers_due_the_same_tick_all_fire() {
        let mut timer = SystemTimer::new();
        let (count_a, callback_a) = counted();
        let (count_b, callback_b) = counted();
        timer.arm(10, false, callback_a);
        timer.arm(10, false, callback_b);

        run_tick(&mut timer);
        assert_eq!(count_a.load(Ordering::Relaxed), 1);
        assert_eq!(count_b.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn periodic_reload_clamps_at_the_horizon() {
        let mut timer = SystemTimer::new();
        let (_, callback) = counted();
        // Interval over half the horizon so one reload would wrap.
        let id = timer.arm(30_000_000_000, true, callback);
        let expiry = timer.expiry_of(id).unwrap();

        timer.set_now(expiry - 1);
        run_tick(&mut timer);
        assert_eq!(timer.expiry_of(id), Some(u32::MAX));
    }

    #[test]
    #[should_panic(expected = "tick horizon")]
    fn arming_past_the_horizon_is_fatal() {
        let mut timer = SystemTimer::new();
        timer.set_now(u32::MAX - 1);
        let (_, callback) = counted();
        timer.arm(10_000, false, callback);
    }

    #[test]
    fn sleep_timer_expiry_is_inclusive() {
        let mut sleep = SleepTimer::new();
        sleep.arm(7);
        assert!(!sleep.expired(6));
        assert!(sleep.expired(7));
        assert!(sleep.expired(8));
        sleep.disarm();
        assert!(!sleep.expired(8));
    }
}
