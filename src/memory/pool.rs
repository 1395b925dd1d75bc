//! Pool records and the lifecycle that moves pools between the per-class
//! available and exhausted lists.
//!
//! A pool hands out blocks from two sources. The untouched run is the tail
//! of the pool that has never been handed out; it is consumed from the
//! highest address down by decrementing a counter, so a fresh pool costs no
//! list construction. Freed blocks go onto an intrusive LIFO list threaded
//! through the blocks themselves. The untouched run is always drained first.

use super::arena::{PoolArena, PoolId};
use super::directory::PoolDirectory;
use super::pool_allocator::AllocError;
use super::size_class::{SIZE_CLASS_COUNT, SizeClass};
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use std::ptr::NonNull;

/// Written at offset 8 of every recycled block of 16 bytes or more while
/// free validation is on. Checked on reuse (use after free) and on free
/// (double free).
const FREE_CANARY: u64 = 0xDEAD_F4EE_B10C_CA7E;

macro_rules! pool_event {
    ($quiet:expr, $level:ident, $($arg:tt)+) => {
        if !$quiet {
            log::$level!(target: "pagepool", $($arg)+);
        }
    };
}
pub(crate) use pool_event;

/// Header overlaid on a recycled block.
#[repr(C)]
pub(crate) struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

/// Where the next block of a pool comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockSource {
    UntouchedRun { remaining: u32 },
    RecycledList { head: NonNull<FreeBlock> },
    BothEmpty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FreeBlocks {
    untouched: u32,
    recycled: Option<NonNull<FreeBlock>>,
}

impl FreeBlocks {
    fn fresh(blocks: u32) -> Self {
        Self {
            untouched: blocks,
            recycled: None,
        }
    }

    #[inline]
    pub fn source(&self) -> BlockSource {
        if self.untouched > 0 {
            BlockSource::UntouchedRun {
                remaining: self.untouched,
            }
        } else if let Some(head) = self.recycled {
            BlockSource::RecycledList { head }
        } else {
            BlockSource::BothEmpty
        }
    }

    #[inline]
    pub fn untouched(&self) -> u32 {
        self.untouched
    }

    /// Push `block` onto the recycled list.
    ///
    /// # Safety
    /// `block` must be a free block of at least 8 bytes (16 with `canary`)
    /// belonging to this pool.
    unsafe fn push(&mut self, block: NonNull<u8>, canary: bool) {
        let node = block.cast::<FreeBlock>();
        // Safety: the caller guarantees the block is free and large enough.
        unsafe {
            node.write(FreeBlock {
                next: self.recycled,
            });
            if canary {
                block.add(8).cast::<u64>().write(FREE_CANARY);
            }
        }
        self.recycled = Some(node);
    }

    /// Pop `head`, the most recently recycled block.
    ///
    /// # Safety
    /// `head` must be the current list head, and the list must be made of
    /// blocks pushed by [`push`].
    unsafe fn pop(&mut self, head: NonNull<FreeBlock>, canary: bool) -> NonNull<u8> {
        debug_assert_eq!(self.recycled, Some(head));
        let block = head.cast::<u8>();
        if canary {
            // Safety: the block was pushed with a canary at offset 8.
            let slot = unsafe { block.add(8).cast::<u64>() };
            // Safety: as above.
            let seen = unsafe { slot.read() };
            assert!(
                seen == FREE_CANARY,
                "PoolAllocator corruption: free block {block:p} was written after free (canary 0x{seen:016x})",
            );
            // Safety: as above.
            unsafe { slot.write(0) };
        }
        // Safety: head is a pushed FreeBlock.
        self.recycled = unsafe { head.read().next };
        block
    }

    fn contains(&self, block: NonNull<u8>) -> bool {
        let mut cursor = self.recycled;
        while let Some(node) = cursor {
            if node.cast::<u8>() == block {
                return true;
            }
            // Safety: every node on the list is a pushed FreeBlock.
            cursor = unsafe { node.read().next };
        }
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PoolKind {
    Sized { class: SizeClass },
    /// Direct OS allocation. `region` is the mapping base; the record's
    /// `base` is the (possibly aligned-up) pointer handed to the caller.
    Large { region: NonNull<u8> },
    Vacant,
}

/// Which per-class list a pool is threaded on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ListMembership {
    Available,
    Exhausted,
    Unlinked,
}

/// One pool or large allocation.
#[derive(Clone, Copy, Debug)]
#[repr(align(64))]
pub(crate) struct PoolMeta {
    pub kind: PoolKind,
    pub base: NonNull<u8>,
    /// Bytes mapped from the OS for this record.
    pub byte_size: usize,
    pub used_blocks: u32,
    pub free: FreeBlocks,
    pub list: ListMembership,
    pub next: Option<PoolId>,
    pub prev: Option<PoolId>,
}

impl PoolMeta {
    pub fn sized(class: SizeClass, base: NonNull<u8>, byte_size: usize) -> Self {
        Self {
            kind: PoolKind::Sized { class },
            base,
            byte_size,
            used_blocks: 0,
            free: FreeBlocks::fresh(class.blocks_per_pool() as u32),
            list: ListMembership::Unlinked,
            next: None,
            prev: None,
        }
    }

    pub fn large(region: NonNull<u8>, user: NonNull<u8>, byte_size: usize) -> Self {
        Self {
            kind: PoolKind::Large { region },
            base: user,
            byte_size,
            used_blocks: 1,
            free: FreeBlocks::fresh(0),
            list: ListMembership::Unlinked,
            next: None,
            prev: None,
        }
    }

    /// A cleared record. `next` chains it into the arena's vacant list.
    pub fn vacant(next: Option<PoolId>) -> Self {
        Self {
            kind: PoolKind::Vacant,
            base: NonNull::dangling(),
            byte_size: 0,
            used_blocks: 0,
            free: FreeBlocks::fresh(0),
            list: ListMembership::Unlinked,
            next,
            prev: None,
        }
    }

    #[inline]
    pub fn is_vacant(&self) -> bool {
        self.kind == PoolKind::Vacant
    }

    #[inline]
    pub fn size_class(&self) -> Option<SizeClass> {
        match self.kind {
            PoolKind::Sized { class } => Some(class),
            _ => None,
        }
    }

    /// Base of the OS mapping backing this record.
    #[inline]
    pub fn region(&self) -> NonNull<u8> {
        match self.kind {
            PoolKind::Large { region } => region,
            _ => self.base,
        }
    }

    /// Bytes usable from `ptr` to the end of its block or allocation.
    pub fn usable_from(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        match self.kind {
            PoolKind::Sized { class } => {
                let bs = class.block_size();
                bs - (addr - self.base.as_ptr() as usize) % bs
            }
            PoolKind::Large { region } => region.as_ptr() as usize + self.byte_size - addr,
            PoolKind::Vacant => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ClassLists {
    available: Option<PoolId>,
    exhausted: Option<PoolId>,
}

/// Running totals kept by [`PoolLifecycle`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct LifecycleCounts {
    pub live_pools: usize,
    pub exhausted_pools: usize,
    pub large_allocations: usize,
    pub pool_bytes: usize,
    pub large_bytes: usize,
    pub pools_created: u64,
    pub pools_released: u64,
}

/// Creates pools on demand, hands out and takes back blocks, and releases
/// pools to the OS the moment their last block comes back.
///
/// The directory is passed in rather than owned so that the facade can also
/// query it for `free`.
pub(crate) struct PoolLifecycle {
    arena: PoolArena,
    lists: [ClassLists; SIZE_CLASS_COUNT],
    page_size: usize,
    validate: bool,
    quiet: bool,
    counts: LifecycleCounts,
}

impl PoolLifecycle {
    pub fn new(
        page_size: usize,
        max_pools: u32,
        validate: bool,
        quiet: bool,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            arena: PoolArena::new(max_pools)?,
            lists: [ClassLists::default(); SIZE_CLASS_COUNT],
            page_size,
            validate,
            quiet,
            counts: LifecycleCounts::default(),
        })
    }

    #[inline]
    pub fn meta(&self, id: PoolId) -> &PoolMeta {
        self.arena.get(id)
    }

    #[inline]
    pub fn counts(&self) -> LifecycleCounts {
        self.counts
    }

    #[inline]
    pub fn metadata_bytes(&self) -> usize {
        self.arena.committed_bytes()
    }

    #[inline]
    pub fn validates(&self) -> bool {
        self.validate
    }

    /// Pools of `class` on the given list, head first.
    pub fn pools(
        &self,
        class: SizeClass,
        list: ListMembership,
    ) -> impl Iterator<Item = (PoolId, &PoolMeta)> + '_ {
        let lists = self.lists[class.index()];
        let head = match list {
            ListMembership::Available => lists.available,
            ListMembership::Exhausted => lists.exhausted,
            ListMembership::Unlinked => None,
        };
        std::iter::successors(head, move |&id| self.arena.get(id).next)
            .map(move |id| (id, self.arena.get(id)))
    }

    fn head_mut(&mut self, class: SizeClass, list: ListMembership) -> Option<&mut Option<PoolId>> {
        let lists = &mut self.lists[class.index()];
        match list {
            ListMembership::Available => Some(&mut lists.available),
            ListMembership::Exhausted => Some(&mut lists.exhausted),
            ListMembership::Unlinked => None,
        }
    }

    fn push_front(&mut self, id: PoolId, class: SizeClass, list: ListMembership) {
        let Some(head) = self.head_mut(class, list) else {
            return;
        };
        let old = head.replace(id);
        if let Some(old) = old {
            self.arena.get_mut(old).prev = Some(id);
        }
        let meta = self.arena.get_mut(id);
        meta.next = old;
        meta.prev = None;
        meta.list = list;
        if list == ListMembership::Exhausted {
            self.counts.exhausted_pools += 1;
        }
    }

    fn unlink(&mut self, id: PoolId) {
        let meta = *self.arena.get(id);
        let Some(class) = meta.size_class() else {
            return;
        };
        match meta.prev {
            Some(prev) => self.arena.get_mut(prev).next = meta.next,
            None => {
                if let Some(head) = self.head_mut(class, meta.list) {
                    *head = meta.next;
                }
            }
        }
        if let Some(next) = meta.next {
            self.arena.get_mut(next).prev = meta.prev;
        }
        if meta.list == ListMembership::Exhausted {
            self.counts.exhausted_pools -= 1;
        }
        let meta = self.arena.get_mut(id);
        meta.next = None;
        meta.prev = None;
        meta.list = ListMembership::Unlinked;
    }

    /// Map a fresh pool for `class` and put it at the head of the class's
    /// available list.
    pub fn acquire_pool(
        &mut self,
        directory: &mut PoolDirectory,
        class: SizeClass,
    ) -> Result<PoolId, AllocError> {
        let bytes = class.pool_bytes(self.page_size);
        // Safety: FFI call to map memory.
        let base = match unsafe { PlatformVmOps::map(bytes) } {
            Ok(base) => base,
            Err(e) => {
                pool_event!(
                    self.quiet,
                    warn,
                    "mapping a {bytes}-byte pool for {}-byte blocks failed: {e}",
                    class.block_size()
                );
                return Err(e.into());
            }
        };

        let id = match self.arena.insert(PoolMeta::sized(class, base, bytes)) {
            Ok(id) => id,
            Err(e) => {
                // Safety: base was mapped above with `bytes`.
                drop(unsafe { PlatformVmOps::release(base, bytes) });
                return Err(e);
            }
        };
        if let Err(e) = directory.assign(base.as_ptr() as usize, bytes, id) {
            self.arena.vacate(id);
            // Safety: base was mapped above with `bytes`.
            drop(unsafe { PlatformVmOps::release(base, bytes) });
            return Err(e);
        }

        stats::on_map(&stats::POOL_COMMITTED, bytes);
        self.counts.live_pools += 1;
        self.counts.pool_bytes += bytes;
        self.counts.pools_created += 1;
        self.push_front(id, class, ListMembership::Available);
        pool_event!(
            self.quiet,
            debug,
            "created pool {id:?} at {base:p}: {} x {}-byte blocks in {bytes} bytes",
            class.blocks_per_pool(),
            class.block_size()
        );
        Ok(id)
    }

    /// Hand out one block of `class`, creating a pool if none has room.
    pub fn acquire_block(
        &mut self,
        directory: &mut PoolDirectory,
        class: SizeClass,
    ) -> Result<NonNull<u8>, AllocError> {
        let id = match self.lists[class.index()].available {
            Some(id) => id,
            None => self.acquire_pool(directory, class)?,
        };

        let canary = self.validate && class.block_size() >= 16;
        let meta = self.arena.get_mut(id);
        let block = match meta.free.source() {
            BlockSource::UntouchedRun { remaining } => {
                meta.free.untouched = remaining - 1;
                let offset = (remaining as usize - 1) * class.block_size();
                // Safety: offset lies within the pool's block area.
                unsafe { meta.base.add(offset) }
            }
            // Safety: the list holds blocks pushed by `release_block`.
            BlockSource::RecycledList { head } => unsafe { meta.free.pop(head, canary) },
            BlockSource::BothEmpty => unreachable!("pool {id:?} on the available list has no free block"),
        };
        meta.used_blocks += 1;

        if meta.free.source() == BlockSource::BothEmpty {
            self.unlink(id);
            self.push_front(id, class, ListMembership::Exhausted);
            pool_event!(self.quiet, trace, "pool {id:?} exhausted");
        }
        Ok(block)
    }

    /// Serve a request above the pooling threshold straight from the OS.
    pub fn alloc_large(
        &mut self,
        directory: &mut PoolDirectory,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let overflow = AllocError::SizeOverflow { size, align };
        let padding = if align > self.page_size { align } else { 0 };
        let Some(bytes) = size
            .checked_next_multiple_of(self.page_size)
            .and_then(|bytes| bytes.checked_add(padding))
        else {
            return Err(overflow);
        };

        // Safety: FFI call to map memory.
        let region = match unsafe { PlatformVmOps::map(bytes) } {
            Ok(region) => region,
            Err(e) => {
                pool_event!(self.quiet, warn, "mapping a {bytes}-byte large allocation failed: {e}");
                return Err(e.into());
            }
        };
        let addr = region.as_ptr() as usize;
        // Safety: the aligned-up address stays within the padding mapped above.
        let user = unsafe { region.add(addr.next_multiple_of(align.max(1)) - addr) };

        let id = match self.arena.insert(PoolMeta::large(region, user, bytes)) {
            Ok(id) => id,
            Err(e) => {
                // Safety: region was mapped above with `bytes`.
                drop(unsafe { PlatformVmOps::release(region, bytes) });
                return Err(e);
            }
        };
        if let Err(e) = directory.assign(addr, bytes, id) {
            self.arena.vacate(id);
            // Safety: region was mapped above with `bytes`.
            drop(unsafe { PlatformVmOps::release(region, bytes) });
            return Err(e);
        }

        stats::on_map(&stats::LARGE_ALLOC_COMMITTED, bytes);
        self.counts.large_allocations += 1;
        self.counts.large_bytes += bytes;
        pool_event!(
            self.quiet,
            debug,
            "large allocation {id:?} at {user:p}: {size} bytes requested, {bytes} mapped"
        );
        Ok(user)
    }

    /// Take back `ptr`, which the directory resolved to `id`.
    ///
    /// # Safety
    /// Unless free validation is on, `ptr` must be a live pointer returned by
    /// this lifecycle and `id` its owner.
    pub unsafe fn release(
        &mut self,
        directory: &mut PoolDirectory,
        id: PoolId,
        ptr: NonNull<u8>,
    ) -> Result<(), AllocError> {
        let meta = *self.arena.get(id);
        match meta.kind {
            PoolKind::Sized { class } => {
                if self.validate {
                    self.check_block_free(id, &meta, class, ptr);
                }
                // Safety: forwarded to the caller.
                unsafe { self.release_block(directory, id, class, ptr) }
            }
            PoolKind::Large { region } => {
                if ptr != meta.base {
                    assert!(
                        !self.validate,
                        "free of {ptr:p}: interior pointer of large allocation at {:p}",
                        meta.base
                    );
                    return Ok(());
                }
                self.release_large(directory, id, region, meta.byte_size)
            }
            PoolKind::Vacant => {
                assert!(!self.validate, "free of {ptr:p}: directory points at a vacant record");
                Ok(())
            }
        }
    }

    fn check_block_free(&self, id: PoolId, meta: &PoolMeta, class: SizeClass, ptr: NonNull<u8>) {
        let bs = class.block_size();
        let offset = ptr.as_ptr() as usize - meta.base.as_ptr() as usize;
        assert!(
            offset.is_multiple_of(bs) && offset / bs < class.blocks_per_pool(),
            "free of {ptr:p}: not a block boundary of pool {id:?} at {:p} ({bs}-byte blocks)",
            meta.base
        );
        assert!(
            offset / bs >= meta.free.untouched() as usize,
            "free of {ptr:p}: block of pool {id:?} was never allocated"
        );
        let suspect = if bs >= 16 {
            // Safety: ptr is a block boundary inside a mapped pool.
            unsafe { ptr.add(8).cast::<u64>().read() == FREE_CANARY }
        } else {
            true
        };
        assert!(
            !(suspect && meta.free.contains(ptr)),
            "double free of {ptr:p} in pool {id:?}"
        );
    }

    unsafe fn release_block(
        &mut self,
        directory: &mut PoolDirectory,
        id: PoolId,
        class: SizeClass,
        ptr: NonNull<u8>,
    ) -> Result<(), AllocError> {
        let canary = self.validate && class.block_size() >= 16;
        let meta = self.arena.get_mut(id);
        debug_assert!(meta.used_blocks > 0, "pool {id:?} has no used blocks");
        meta.used_blocks -= 1;
        if meta.used_blocks == 0 {
            return self.release_pool(directory, id);
        }

        // Safety: ptr is a block of this pool that the caller is done with.
        unsafe { meta.free.push(ptr, canary) };
        if meta.list == ListMembership::Exhausted {
            self.unlink(id);
            self.push_front(id, class, ListMembership::Available);
            pool_event!(self.quiet, trace, "pool {id:?} available again");
        }
        Ok(())
    }

    fn release_pool(&mut self, directory: &mut PoolDirectory, id: PoolId) -> Result<(), AllocError> {
        self.unlink(id);
        let meta = *self.arena.get(id);
        directory.clear(meta.base.as_ptr() as usize, meta.byte_size);
        self.arena.vacate(id);

        stats::on_unmap(&stats::POOL_COMMITTED, meta.byte_size);
        self.counts.live_pools -= 1;
        self.counts.pool_bytes -= meta.byte_size;
        self.counts.pools_released += 1;
        pool_event!(self.quiet, debug, "released pool {id:?} at {:p}", meta.base);

        // Safety: the pool was mapped with byte_size and nothing refers to it.
        unsafe { PlatformVmOps::release(meta.base, meta.byte_size) }.map_err(|e| {
            pool_event!(self.quiet, warn, "releasing pool at {:p} failed: {e}", meta.base);
            AllocError::Release(e)
        })
    }

    fn release_large(
        &mut self,
        directory: &mut PoolDirectory,
        id: PoolId,
        region: NonNull<u8>,
        bytes: usize,
    ) -> Result<(), AllocError> {
        directory.clear(region.as_ptr() as usize, bytes);
        self.arena.vacate(id);

        stats::on_unmap(&stats::LARGE_ALLOC_COMMITTED, bytes);
        self.counts.large_allocations -= 1;
        self.counts.large_bytes -= bytes;
        pool_event!(self.quiet, debug, "released large allocation {id:?} ({bytes} bytes)");

        // Safety: the region was mapped with `bytes` and nothing refers to it.
        unsafe { PlatformVmOps::release(region, bytes) }.map_err(|e| {
            pool_event!(self.quiet, warn, "releasing large allocation at {region:p} failed: {e}");
            AllocError::Release(e)
        })
    }
}

impl Drop for PoolLifecycle {
    fn drop(&mut self) {
        for (_, meta) in self.arena.iter_live() {
            let counter: &stats::Counter = match meta.kind {
                PoolKind::Sized { .. } => &stats::POOL_COMMITTED,
                _ => &stats::LARGE_ALLOC_COMMITTED,
            };
            // Safety: every live record owns its mapping exclusively.
            drop(unsafe { PlatformVmOps::release(meta.region(), meta.byte_size) });
            stats::on_unmap(counter, meta.byte_size);
        }
    }
}
