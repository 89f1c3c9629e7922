//! Device memory suballocation
//!
//! One raw `vk::DeviceMemory` allocation per primary block, subdivided by a
//! free-list allocator. Blocks are grouped by memory-type index, grow on
//! demand, and are never shrunk or relocated at runtime (no compaction).

mod free_list;
mod pool;

pub use free_list::{align_up, FreeListAllocator, Region};
pub use pool::{MemoryPool, SubMemory, MIN_BLOCK_SIZE};
