//! Task configuration.

/// Pages of stack handed to every kernel task (16 KiB).
pub const TASK_STACK_PAGES: usize = 4;

/// Capacity of a task's display name; longer names are truncated.
pub const TASK_NAME_LEN: usize = 32;

/// Upper bound on concurrently live tasks, used to size the FIFO wait
/// queues of the sync primitives. Tasks are never destroyed, so this is
/// also a creation limit.
pub const MAX_TASKS: usize = 64;
