//! Memory-management constants.

/// Size of one physical page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Bits per bitmap word in the page allocator.
pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Marker written into every heap block header.
pub const HEAP_MAGIC: u32 = 0xDEAD_BEEF;

/// A split only happens when the remainder could hold a header plus this
/// many payload bytes; smaller tails are left as internal fragmentation.
pub const HEAP_SPLIT_MIN: usize = 16;

/// Size of the bootstrap arena backing the Rust global allocator.
pub const BOOTSTRAP_HEAP_SIZE: usize = 1024 * 1024; // 1 MB
