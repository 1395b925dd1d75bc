//! Address-keyed lookup from any pointer to the pool record that owns it.
//!
//! A two-level sparse page table. The outer table has one entry per
//! `address_limit`-sized shard of the 48-bit address space; each shard is a
//! dense array with one slot per page. Both levels are mapped from the OS on
//! first touch and stay mapped until the directory is dropped, so a lookup is
//! two loads with no hashing, collisions or resizing.
//!
//! Every page of a pool or large allocation stores the owner's id directly,
//! so an interior pointer resolves without scanning neighbouring slots.

use super::arena::PoolId;
use super::pool_allocator::AllocError;
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use std::ptr::NonNull;

/// Span of user address space the directory can describe.
pub const ADDRESS_SPACE: usize = 1 << 48;

type Slot = Option<PoolId>;
type Shard = Option<NonNull<Slot>>;

pub(crate) struct PoolDirectory {
    /// Lazily mapped array of `shard_count` shard pointers.
    shards: Option<NonNull<Shard>>,
    shard_count: usize,
    slots_per_shard: usize,
    address_limit: usize,
    page_shift: u32,
    table_bytes: usize,
    shard_bytes: usize,
    shards_mapped: usize,
}

// Safety: PoolDirectory owns every mapping it points to.
unsafe impl Send for PoolDirectory {}

impl PoolDirectory {
    /// `page_size` must be a power of two and `address_limit` a multiple of
    /// it; both are checked by the allocator config before this runs.
    pub fn new(page_size: usize, address_limit: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(address_limit > page_size && address_limit.is_multiple_of(page_size));

        let os_page = PlatformVmOps::page_size();
        let shard_count = ADDRESS_SPACE.div_ceil(address_limit);
        let slots_per_shard = address_limit / page_size;
        Self {
            shards: None,
            shard_count,
            slots_per_shard,
            address_limit,
            page_shift: page_size.trailing_zeros(),
            table_bytes: (shard_count * size_of::<Shard>()).next_multiple_of(os_page),
            shard_bytes: (slots_per_shard * size_of::<Slot>()).next_multiple_of(os_page),
            shards_mapped: 0,
        }
    }

    #[inline]
    fn split(&self, addr: usize) -> (usize, usize) {
        (
            addr / self.address_limit,
            (addr % self.address_limit) >> self.page_shift,
        )
    }

    /// Bytes of OS memory currently mapped for the directory itself.
    pub fn mapped_bytes(&self) -> usize {
        if self.shards.is_none() {
            return 0;
        }
        self.table_bytes + self.shards_mapped * self.shard_bytes
    }

    /// Slot for the page containing `addr`, mapping the outer table and the
    /// shard on first use.
    pub fn record_for(&mut self, addr: usize) -> Result<&mut Slot, AllocError> {
        let (outer, inner) = self.split(addr);
        if outer >= self.shard_count {
            return Err(AllocError::AddressOutOfRange(addr));
        }

        let table = match self.shards {
            Some(table) => table,
            None => {
                // Safety: FFI call to map memory.
                let table = unsafe { PlatformVmOps::map(self.table_bytes)? }.cast::<Shard>();
                stats::on_map(&stats::METADATA_COMMITTED, self.table_bytes);
                self.shards = Some(table);
                table
            }
        };

        // Safety: outer < shard_count and the table is mapped zero-filled,
        // which reads as `None` for every entry.
        let entry = unsafe { table.add(outer).as_mut() };
        let shard = match *entry {
            Some(shard) => shard,
            None => {
                // Safety: FFI call to map memory.
                let shard = unsafe { PlatformVmOps::map(self.shard_bytes)? }.cast::<Slot>();
                stats::on_map(&stats::METADATA_COMMITTED, self.shard_bytes);
                *entry = Some(shard);
                self.shards_mapped += 1;
                shard
            }
        };

        debug_assert!(inner < self.slots_per_shard);
        // Safety: inner < slots_per_shard, and &mut self guarantees the slot
        // is not aliased.
        Ok(unsafe { shard.add(inner).as_mut() })
    }

    /// Slot for `addr` if its shard is already mapped. Never allocates.
    fn existing_slot(&self, addr: usize) -> Option<NonNull<Slot>> {
        let (outer, inner) = self.split(addr);
        if outer >= self.shard_count {
            return None;
        }
        let table = self.shards?;
        // Safety: outer < shard_count.
        let shard = unsafe { *table.add(outer).as_ptr() }?;
        debug_assert!(inner < self.slots_per_shard);
        // Safety: inner < slots_per_shard.
        Some(unsafe { shard.add(inner) })
    }

    /// Owner of the page containing `addr`, or `None` if no live pool or
    /// large allocation covers it.
    #[inline]
    pub fn lookup(&self, addr: usize) -> Option<PoolId> {
        // Safety: the slot lies in a mapped shard.
        self.existing_slot(addr).and_then(|slot| unsafe { *slot.as_ptr() })
    }

    /// Point every page of `[base, base + len)` at `id`.
    ///
    /// On failure the pages already stamped are cleared again, leaving the
    /// directory as it was.
    pub fn assign(&mut self, base: usize, len: usize, id: PoolId) -> Result<(), AllocError> {
        let page = 1usize << self.page_shift;
        let mut addr = base;
        while addr < base + len {
            match self.record_for(addr) {
                Ok(slot) => *slot = Some(id),
                Err(e) => {
                    self.clear(base, addr - base);
                    return Err(e);
                }
            }
            addr += page;
        }
        Ok(())
    }

    /// Forget the owner of every page of `[base, base + len)`. The shards
    /// stay mapped for the next pool placed at these addresses.
    pub fn clear(&mut self, base: usize, len: usize) {
        let page = 1usize << self.page_shift;
        let mut addr = base;
        while addr < base + len {
            if let Some(slot) = self.existing_slot(addr) {
                // Safety: &mut self guarantees exclusive access to the slot.
                unsafe { slot.write(None) };
            }
            addr += page;
        }
    }
}

impl Drop for PoolDirectory {
    fn drop(&mut self) {
        let Some(table) = self.shards else {
            return;
        };
        for outer in 0..self.shard_count {
            // Safety: outer < shard_count.
            if let Some(shard) = unsafe { *table.add(outer).as_ptr() } {
                // Safety: every shard was mapped with shard_bytes.
                drop(unsafe { PlatformVmOps::release(shard.cast::<u8>(), self.shard_bytes) });
                stats::on_unmap(&stats::METADATA_COMMITTED, self.shard_bytes);
            }
        }
        // Safety: the table was mapped with table_bytes.
        drop(unsafe { PlatformVmOps::release(table.cast::<u8>(), self.table_bytes) });
        stats::on_unmap(&stats::METADATA_COMMITTED, self.table_bytes);
    }
}
