#[cfg(not(target_pointer_width = "64"))]
compile_error!("pagepool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocators
pub use memory::locked::LockedPoolAllocator;
pub use memory::pool_allocator::{
    PoolAllocator, PoolAllocatorConfig, PoolAllocatorStats, PoolInfo, PoolList,
};

// size classes
pub use memory::arena::PoolId;
pub use memory::size_class::{
    POOL_CHUNK_SIZE, POOL_THRESHOLD, SIZE_CLASS_COUNT, SizeClass, SizeClassTable,
};

// stats
pub use memory::stats::{Counter, MemoryStats};

// errors
pub use memory::pool_allocator::AllocError;
pub use memory::vm::VmError;
