use super::arena::PoolId;
use super::directory::{ADDRESS_SPACE, PoolDirectory};
use super::pool::{ListMembership, PoolLifecycle, pool_event};
use super::size_class::{POOL_THRESHOLD, SizeClass, SizeClassTable};
use super::vm::{PlatformVmOps, VmError, VmOps};
use std::ptr::NonNull;
use thiserror::Error;

/// Failure reported by [`PoolAllocator`].
///
/// No variant allocates, so errors can be built and dropped while the
/// allocator is serving as the global heap.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] VmError),
    #[error("pool table full ({capacity} records)")]
    PoolTableFull { capacity: u32 },
    #[error("address {0:#x} is outside the directory's coverage")]
    AddressOutOfRange(usize),
    #[error("alignment {0} is not zero or a power of two")]
    InvalidAlignment(usize),
    #[error("size {size} overflows when rounded to alignment {align}")]
    SizeOverflow { size: usize, align: usize },
    #[error("pointer {0:#x} is not owned by this allocator")]
    ForeignPointer(usize),
    #[error("invalid allocator config: {0}")]
    InvalidConfig(&'static str),
    #[error("releasing memory to the OS failed: {0}")]
    Release(#[source] VmError),
}

/// Construction parameters for [`PoolAllocator`]. Fixed for the allocator's
/// lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolAllocatorConfig {
    /// Directory granularity and rounding unit of every OS request.
    /// Power of two, at least 4096 and at most the OS page size.
    /// Default: 0 (ask the OS).
    pub page_size: usize,

    /// Span of address space covered by one directory shard. Must exceed
    /// and be a multiple of `page_size`, at most 2^48. Default: 4 GiB.
    pub address_limit: usize,

    /// Capacity of the pool record table. Every live pool and every live
    /// large allocation holds one record. Default: 2^20.
    pub max_pools: u32,

    /// Check every `free` for foreign pointers, misaligned pointers and
    /// double frees, and every reuse for writes after free. Panics on a
    /// violation. Default: on in debug builds.
    pub validate_frees: bool,

    /// Suppress lifecycle logging. Must be set when the allocator backs the
    /// global heap and the installed logger allocates.
    pub quiet: bool,
}

impl PoolAllocatorConfig {
    pub const DEFAULT_ADDRESS_LIMIT: usize = 1 << 32;
    pub const DEFAULT_MAX_POOLS: u32 = 1 << 20;

    const MIN_PAGE_SIZE: usize = 4096;
    const MAX_SLOTS_PER_SHARD: usize = 1 << 26;
    const MAX_SHARDS: usize = 1 << 24;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            page_size: 0,
            address_limit: Self::DEFAULT_ADDRESS_LIMIT,
            max_pools: Self::DEFAULT_MAX_POOLS,
            validate_frees: cfg!(debug_assertions),
            quiet: false,
        }
    }

    /// Fill in the OS page size and check every constraint.
    fn resolve(mut self) -> Result<Self, AllocError> {
        let os_page = PlatformVmOps::page_size();
        if self.page_size == 0 {
            self.page_size = os_page;
        }
        let page = self.page_size;
        if !page.is_power_of_two() || page < Self::MIN_PAGE_SIZE {
            return Err(AllocError::InvalidConfig(
                "page_size must be a power of two of at least 4096",
            ));
        }
        if page > os_page {
            return Err(AllocError::InvalidConfig(
                "page_size must not exceed the OS page size",
            ));
        }

        let limit = self.address_limit;
        if limit <= page || !limit.is_multiple_of(page) || limit > ADDRESS_SPACE {
            return Err(AllocError::InvalidConfig(
                "address_limit must be a multiple of page_size in (page_size, 2^48]",
            ));
        }
        if limit / page > Self::MAX_SLOTS_PER_SHARD {
            return Err(AllocError::InvalidConfig(
                "address_limit / page_size exceeds 2^26 directory slots",
            ));
        }
        if ADDRESS_SPACE.div_ceil(limit) > Self::MAX_SHARDS {
            return Err(AllocError::InvalidConfig(
                "address_limit too small: more than 2^24 directory shards",
            ));
        }

        if self.max_pools == 0 || self.max_pools > u32::MAX - 1 {
            return Err(AllocError::InvalidConfig(
                "max_pools must be in 1..=u32::MAX - 1",
            ));
        }
        Ok(self)
    }
}

impl Default for PoolAllocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Which per-class list to walk in [`PoolAllocator::pools`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolList {
    /// Pools with at least one free block.
    Available,
    /// Pools with every block handed out.
    Exhausted,
}

/// Snapshot of one pool, as returned by [`PoolAllocator::pools`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolInfo {
    pub id: PoolId,
    pub base: NonNull<u8>,
    pub byte_size: usize,
    pub block_size: usize,
    pub capacity: usize,
    pub used_blocks: usize,
}

impl PoolInfo {
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.capacity - self.used_blocks
    }
}

/// Per-instance counters. Unlike the crate-wide gauges in
/// [`stats`](super::stats) these are exact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolAllocatorStats {
    pub live_pools: usize,
    pub exhausted_pools: usize,
    pub large_allocations: usize,
    pub pool_bytes: usize,
    pub large_bytes: usize,
    pub pools_created: u64,
    pub pools_released: u64,
    /// Bytes mapped for the address directory.
    pub directory_bytes: usize,
    /// Bytes committed for pool records.
    pub metadata_bytes: usize,
}

/// Size-class pool allocator on OS virtual memory.
///
/// Requests up to [`POOL_THRESHOLD`] bytes are served from 64 KiB pools of
/// same-size blocks; larger ones get a dedicated OS mapping. `free` needs
/// only the pointer: a per-page directory maps every address back to its
/// owning pool.
///
/// Single-threaded. Wrap it in
/// [`LockedPoolAllocator`](super::locked::LockedPoolAllocator) for shared use.
pub struct PoolAllocator {
    config: PoolAllocatorConfig,
    classes: SizeClassTable,
    directory: PoolDirectory,
    pools: PoolLifecycle,
}

// Safety: PoolAllocator owns every mapping it references; nothing is shared
// with another instance.
unsafe impl Send for PoolAllocator {}

impl PoolAllocator {
    /// Create an allocator with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if reserving the pool record table fails.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(PoolAllocatorConfig::new())
    }

    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if `config` breaks a documented
    /// constraint, or `AllocError::OutOfMemory` if reserving the pool record
    /// table fails.
    pub fn with_config(config: PoolAllocatorConfig) -> Result<Self, AllocError> {
        let config = config.resolve()?;
        let pools = PoolLifecycle::new(
            config.page_size,
            config.max_pools,
            config.validate_frees,
            config.quiet,
        )?;
        pool_event!(
            config.quiet,
            debug,
            "pool allocator up: page {} bytes, shard span {:#x}, {} pool records",
            config.page_size,
            config.address_limit,
            config.max_pools
        );
        Ok(Self {
            config,
            classes: SizeClassTable::new(),
            directory: PoolDirectory::new(config.page_size, config.address_limit),
            pools,
        })
    }

    /// The resolved configuration (`page_size` is never 0 here).
    #[must_use]
    pub fn config(&self) -> &PoolAllocatorConfig {
        &self.config
    }

    /// Allocate `size` bytes aligned to `alignment` (0 means no requirement).
    ///
    /// Returns `Ok(None)` for a zero-byte request.
    ///
    /// # Errors
    ///
    /// - `InvalidAlignment` if `alignment` is neither 0 nor a power of two.
    /// - `SizeOverflow` if rounding `size` up to `alignment` overflows.
    /// - `OutOfMemory`, `PoolTableFull` or `AddressOutOfRange` if a new pool
    ///   or large mapping cannot be set up.
    pub fn malloc(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }
        if size == 0 {
            return Ok(None);
        }
        let align = alignment.max(1);
        let size = size
            .checked_next_multiple_of(align)
            .ok_or(AllocError::SizeOverflow { size, align })?;

        if size <= POOL_THRESHOLD
            && align <= self.config.page_size
            && let Some(class) = self.classes.class_for_aligned(size, align)
        {
            return self.pools.acquire_block(&mut self.directory, class).map(Some);
        }
        self.pools
            .alloc_large(&mut self.directory, size, align)
            .map(Some)
    }

    /// Return `ptr` to the allocator. Null is a no-op.
    ///
    /// A pointer the allocator does not own is ignored, or panics when
    /// `validate_frees` is on.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator's
    /// `malloc`/`realloc`, not freed since. With `validate_frees` on, most
    /// violations panic instead of corrupting state.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::Release` if the OS refuses to take back a pool or
    /// large mapping. The allocator's own state is already consistent when
    /// that happens; only the mapping leaks.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), AllocError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        let Some(id) = self.directory.lookup(ptr.as_ptr() as usize) else {
            assert!(
                !self.pools.validates(),
                "free of {ptr:p}: pointer not owned by this allocator"
            );
            return Ok(());
        };
        // Safety: forwarded to the caller.
        unsafe { self.pools.release(&mut self.directory, id, ptr) }
    }

    /// Resize the allocation at `ptr` to `new_size` bytes aligned to
    /// `alignment`, moving it if it does not fit in place.
    ///
    /// Null behaves as `malloc`. A `new_size` of 0 frees `ptr` and returns
    /// `Ok(None)`. If the new allocation fails the original is left
    /// untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free).
    ///
    /// # Errors
    ///
    /// Everything `malloc` can return, plus `ForeignPointer` if `ptr` is not
    /// owned by this allocator.
    pub unsafe fn realloc(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        alignment: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(old) = NonNull::new(ptr) else {
            return self.malloc(new_size, alignment);
        };
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }
        if new_size == 0 {
            // Safety: forwarded to the caller.
            unsafe { self.free(ptr)? };
            return Ok(None);
        }
        let usable = self
            .usable_size(ptr)
            .ok_or(AllocError::ForeignPointer(ptr as usize))?;

        let aligned = (ptr as usize).is_multiple_of(alignment.max(1));
        if new_size <= usable && aligned {
            return Ok(Some(old));
        }

        let Some(new) = self.malloc(new_size, alignment)? else {
            unreachable!("malloc of a non-zero size returned null");
        };
        // Safety: both regions are live, distinct, and at least
        // min(usable, new_size) bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), usable.min(new_size));
            self.free(ptr)?;
        }
        Ok(Some(new))
    }

    /// Bytes that may be used starting at `ptr`: the block size for pooled
    /// pointers, the distance to the end of the mapping for large ones.
    #[must_use]
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        let ptr = NonNull::new(ptr.cast_mut())?;
        let id = self.directory.lookup(ptr.as_ptr() as usize)?;
        Some(self.pools.meta(id).usable_from(ptr))
    }

    /// Whether `ptr` falls inside a live pool or large allocation.
    #[must_use]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.directory.lookup(ptr as usize).is_some()
    }

    #[must_use]
    pub fn stats(&self) -> PoolAllocatorStats {
        let counts = self.pools.counts();
        PoolAllocatorStats {
            live_pools: counts.live_pools,
            exhausted_pools: counts.exhausted_pools,
            large_allocations: counts.large_allocations,
            pool_bytes: counts.pool_bytes,
            large_bytes: counts.large_bytes,
            pools_created: counts.pools_created,
            pools_released: counts.pools_released,
            directory_bytes: self.directory.mapped_bytes(),
            metadata_bytes: self.pools.metadata_bytes(),
        }
    }

    /// Pools of `class` on the chosen list, in the order they will be used.
    pub fn pools(&self, class: SizeClass, list: PoolList) -> impl Iterator<Item = PoolInfo> + '_ {
        let list = match list {
            PoolList::Available => ListMembership::Available,
            PoolList::Exhausted => ListMembership::Exhausted,
        };
        self.pools.pools(class, list).map(move |(id, meta)| PoolInfo {
            id,
            base: meta.base,
            byte_size: meta.byte_size,
            block_size: class.block_size(),
            capacity: class.blocks_per_pool(),
            used_blocks: meta.used_blocks as usize,
        })
    }

    /// Size class a `malloc(size, alignment)` would be served from, or `None`
    /// if it would go to the large path.
    #[must_use]
    pub fn class_for(&self, size: usize, alignment: usize) -> Option<SizeClass> {
        let align = alignment.max(1);
        let size = size.checked_next_multiple_of(align)?;
        if align > self.config.page_size {
            return None;
        }
        self.classes.class_for_aligned(size, align)
    }
}
