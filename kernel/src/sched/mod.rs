//! The task scheduler.
//!
//! Tasks live in a circular ring in creation order and are picked
//! round-robin: scheduling scans from the current task's ring successor for
//! the first READY task, wrapping at most once. Nothing here ever forces the
//! caller off the CPU; when no other task is runnable the scan comes back
//! empty and the caller keeps going.
//!
//! Blocking primitives are all built the same way: mutate state, enqueue
//! somewhere, then call [`yield_now`]. The context switch inside
//! [`yield_now`] is the only suspension point in the kernel.

use alloc::boxed::Box;
use alloc::vec::Vec;

use arrayvec::ArrayString;
use spin::Mutex;

use crate::arch;
use crate::constants::memory::PAGE_SIZE;
use crate::constants::task::{MAX_TASKS, TASK_NAME_LEN, TASK_STACK_PAGES};
use crate::memory;
use crate::time::SleepTimer;

/// Stable task handle, the task's creation index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }

    pub(crate) fn from_index(index: usize) -> Self {
        TaskId(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// On the CPU. Exactly one task, except mid-switch.
    Running,
    /// Runnable, waiting its turn.
    Ready,
    /// Off the run queue until a wake event.
    Blocked,
}

/// Per-task state record. Never destroyed; there is no task exit.
pub struct Tcb {
    /// Stack pointer saved by the last switch away from this task.
    saved_sp: u64,
    /// Top of the task's stack allocation. Zero for the bootstrap task,
    /// which runs on the boot stack.
    stack_top: u64,
    state: TaskState,
    name: ArrayString<TASK_NAME_LEN>,
    sleep: SleepTimer,
    sleeping: bool,
    /// Ring successor, by task index.
    next: usize,
}

impl Tcb {
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stack_top(&self) -> u64 {
        self.stack_top
    }
}

/// All scheduler state. The kernel keeps one instance behind [`SCHEDULER`];
/// tests build their own.
pub struct Scheduler {
    /// Boxed so TCB addresses stay stable while the table grows; a switch
    /// in flight holds a raw pointer into the outgoing TCB.
    tasks: Vec<Box<Tcb>>,
    current: usize,
    tail: usize,
}

impl Scheduler {
    /// Adopts the currently executing code as the first task. Its context
    /// gets saved into the TCB at the first switch away from it.
    pub fn bootstrap(name: &str) -> Self {
        let mut scheduler = Scheduler {
            tasks: Vec::new(),
            current: 0,
            tail: 0,
        };
        scheduler.tasks.push(Box::new(Tcb {
            saved_sp: 0,
            stack_top: 0,
            state: TaskState::Running,
            name: truncate_name(name),
            sleep: SleepTimer::new(),
            sleeping: false,
            next: 0,
        }));
        log::info!("scheduler: bootstrapped with task {:?}", name);
        scheduler
    }

    /// Splices a new READY task into the ring right after the tail,
    /// advancing the tail, so round-robin order is creation order.
    ///
    /// Panics when the task table is full; the wait-queue capacity of every
    /// sync primitive is sized to [`MAX_TASKS`] and must never be exceeded.
    pub fn admit(&mut self, name: &str, saved_sp: u64, stack_top: u64) -> TaskId {
        if self.tasks.len() >= MAX_TASKS {
            panic!("scheduler: task limit ({}) reached", MAX_TASKS);
        }

        let index = self.tasks.len();
        let head = self.tasks[self.tail].next;
        self.tasks.push(Box::new(Tcb {
            saved_sp,
            stack_top,
            state: TaskState::Ready,
            name: truncate_name(name),
            sleep: SleepTimer::new(),
            sleeping: false,
            next: head,
        }));
        self.tasks[self.tail].next = index;
        self.tail = index;

        log::info!("scheduler: task {} ({:?}) admitted", index, name);
        TaskId(index)
    }

    pub fn current_task(&self) -> TaskId {
        TaskId(self.current)
    }

    pub fn task(&self, id: TaskId) -> &Tcb {
        &self.tasks[id.0]
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Picks the next READY task and rotates `current` onto it. Returns the
    /// outgoing saved-stack-pointer slot and the incoming stack pointer for
    /// the caller to feed to the context switch, or `None` when no other
    /// task is runnable.
    ///
    /// The outgoing task drops RUNNING to READY only if it still was
    /// RUNNING; a task that blocked itself before calling in keeps its
    /// BLOCKED state.
    pub fn prepare_switch(&mut self) -> Option<(*mut u64, u64)> {
        let next = self.select_next()?;

        let outgoing = self.current;
        if self.tasks[outgoing].state == TaskState::Running {
            self.tasks[outgoing].state = TaskState::Ready;
        }
        self.tasks[next].state = TaskState::Running;
        self.current = next;

        let from_sp = &mut self.tasks[outgoing].saved_sp as *mut u64;
        let to_sp = self.tasks[next].saved_sp;
        Some((from_sp, to_sp))
    }

    /// Transitions a BLOCKED task to READY. Any other state is left alone.
    pub fn wake(&mut self, id: TaskId) {
        let task = &mut self.tasks[id.0];
        if task.state == TaskState::Blocked {
            task.state = TaskState::Ready;
        }
    }

    /// Blocks a task; it stays off the ring scan until woken.
    pub fn block(&mut self, id: TaskId) {
        self.tasks[id.0].state = TaskState::Blocked;
    }

    /// Arms the current task's embedded sleep timer and blocks it. The
    /// timer is reused across sleeps, never reallocated.
    pub fn start_sleep(&mut self, expiry: u32) {
        let task = &mut self.tasks[self.current];
        task.sleep.arm(expiry);
        task.sleeping = true;
        task.state = TaskState::Blocked;
    }

    /// Wakes every task whose sleep expiry has passed. Returns how many
    /// woke, for the tick handler's diagnostics.
    pub fn wake_expired_sleepers(&mut self, now: u32) -> usize {
        let mut woken = 0;
        for task in &mut self.tasks {
            if task.sleeping && task.sleep.expired(now) {
                task.sleep.disarm();
                task.sleeping = false;
                task.state = TaskState::Ready;
                woken += 1;
            }
        }
        woken
    }

    /// First READY task at or after the current task's ring successor,
    /// wrapping at most once. `None` when the scan comes up empty, which
    /// includes the sole-task case.
    fn select_next(&self) -> Option<usize> {
        let mut candidate = self.tasks[self.current].next;
        for _ in 0..self.tasks.len() {
            if candidate != self.current && self.tasks[candidate].state == TaskState::Ready {
                return Some(candidate);
            }
            candidate = self.tasks[candidate].next;
        }
        None
    }
}

fn truncate_name(name: &str) -> ArrayString<TASK_NAME_LEN> {
    let mut label = ArrayString::new();
    for c in name.chars() {
        if label.try_push(c).is_err() {
            break;
        }
    }
    label
}

pub static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

pub fn with_scheduler<F, R>(f: F) -> R
where
    F: FnOnce(&mut Scheduler) -> R,
{
    arch::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        match &mut *guard {
            Some(scheduler) => f(scheduler),
            None => panic!("scheduler: used before init"),
        }
    })
}

/// Adopts the boot context as the first task. Must run once, after
/// [`crate::memory::init`].
pub fn init(name: &str) {
    let mut guard = SCHEDULER.lock();
    if guard.is_some() {
        panic!("scheduler: initialized twice");
    }
    *guard = Some(Scheduler::bootstrap(name));
}

/// Creates a task that starts at `entry` when first scheduled.
///
/// The stack comes from the page allocator; failure to get one is fatal,
/// since a task was promised that cannot exist.
pub fn spawn(entry: fn(), name: &str) -> TaskId {
    let stack_base = match memory::page_alloc(TASK_STACK_PAGES) {
        Some(base) => base,
        None => panic!("scheduler: no memory for task stack ({:?})", name),
    };
    let stack_top = (stack_base + TASK_STACK_PAGES * PAGE_SIZE) as u64;
    let saved_sp = unsafe { arch::prepare_task_stack(stack_top, entry) };

    with_scheduler(|scheduler| scheduler.admit(name, saved_sp, stack_top))
}

/// Gives up the CPU if another task is READY; otherwise keeps running.
///
/// Interrupts are disabled across the switch and re-enabled after it
/// returns, so a task always resumes with interrupts on no matter whether
/// it was switched away cooperatively or from the timer handler.
pub fn yield_now() {
    arch::disable_interrupts();
    let switch = with_scheduler(|scheduler| scheduler.prepare_switch());
    if let Some((from_sp, to_sp)) = switch {
        unsafe { arch::context_switch(from_sp, to_sp) };
    }
    arch::enable_interrupts();
}

pub fn current_task() -> TaskId {
    with_scheduler(|scheduler| scheduler.current_task())
}

/// Blocks the calling task and reports its id. The caller must follow up
/// with [`yield_now`] once it has published the id somewhere a waker will
/// find it.
pub fn block_current() -> TaskId {
    with_scheduler(|scheduler| {
        let id = scheduler.current_task();
        scheduler.block(id);
        id
    })
}

pub fn unblock(id: TaskId) {
    with_scheduler(|scheduler| scheduler.wake(id));
}
