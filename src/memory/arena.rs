use super::pool::PoolMeta;
use super::pool_allocator::AllocError;
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use std::num::NonZeroU32;
use std::ptr::NonNull;

/// Stable handle to one pool record.
///
/// Stored as `index + 1` so that `Option<PoolId>` is four bytes and an
/// all-zero directory slot reads as `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PoolId(NonZeroU32);

impl PoolId {
    #[inline]
    pub(crate) fn from_index(index: u32) -> Self {
        // index < capacity <= u32::MAX - 1, so index + 1 cannot wrap to zero.
        Self(NonZeroU32::MIN.saturating_add(index))
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

/// Fixed-capacity table of [`PoolMeta`] records backed by one VM reservation.
///
/// The whole table is reserved up front so records never move; pages are
/// committed one at a time as the high-water mark grows. Vacated records are
/// chained through their `next` link and reused before the table grows.
pub(crate) struct PoolArena {
    base: NonNull<PoolMeta>,
    reserved: usize,
    committed: usize,
    page_size: usize,
    capacity: u32,
    /// High-water mark: records `0..len` have been initialised.
    len: u32,
    vacant: Option<PoolId>,
}

// Safety: PoolArena owns its reservation and is safe to send between threads.
unsafe impl Send for PoolArena {}

impl PoolArena {
    pub fn new(capacity: u32) -> Result<Self, AllocError> {
        if capacity == 0 {
            return Err(AllocError::InvalidConfig("max_pools must be non-zero"));
        }
        let page_size = PlatformVmOps::page_size();
        let reserved = (capacity as usize)
            .checked_mul(size_of::<PoolMeta>())
            .map(|bytes| bytes.next_multiple_of(page_size))
            .ok_or(AllocError::InvalidConfig("max_pools overflows the address space"))?;

        // Safety: FFI call to reserve memory.
        let ptr = unsafe { PlatformVmOps::reserve(reserved)? };
        stats::TOTAL_RESERVED.add(reserved);

        Ok(Self {
            base: ptr.cast::<PoolMeta>(),
            reserved,
            committed: 0,
            page_size,
            capacity,
            len: 0,
            vacant: None,
        })
    }

    /// Bytes of the table backed by physical memory.
    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.committed
    }

    pub fn insert(&mut self, meta: PoolMeta) -> Result<PoolId, AllocError> {
        if let Some(id) = self.vacant {
            self.vacant = self.get(id).next;
            *self.get_mut(id) = meta;
            return Ok(id);
        }

        if self.len == self.capacity {
            return Err(AllocError::PoolTableFull {
                capacity: self.capacity,
            });
        }

        let needed = (self.len as usize + 1) * size_of::<PoolMeta>();
        if needed > self.committed {
            // Safety: committed < needed <= reserved, so the page lies inside
            // the reservation.
            let page = unsafe { self.base.cast::<u8>().add(self.committed) };
            // Safety: FFI call to commit memory.
            unsafe { PlatformVmOps::commit(page, self.page_size)? };
            self.committed += self.page_size;
            stats::TOTAL_COMMITTED.add(self.page_size);
            stats::METADATA_COMMITTED.add(self.page_size);
        }

        let id = PoolId::from_index(self.len);
        // Safety: the record lies in committed memory and has never been
        // initialised, so write without dropping the old value.
        unsafe { self.base.add(id.index()).write(meta) };
        self.len += 1;
        Ok(id)
    }

    #[inline]
    pub fn get(&self, id: PoolId) -> &PoolMeta {
        assert!(id.index() < self.len as usize, "stale pool id {id:?}");
        // Safety: index < len, so the record is committed and initialised.
        unsafe { self.base.add(id.index()).as_ref() }
    }

    #[inline]
    pub fn get_mut(&mut self, id: PoolId) -> &mut PoolMeta {
        assert!(id.index() < self.len as usize, "stale pool id {id:?}");
        // Safety: index < len, and &mut self guarantees exclusive access.
        unsafe { self.base.add(id.index()).as_mut() }
    }

    /// Return a record to the free chain. The id may be handed out again by
    /// the next [`insert`](Self::insert).
    pub fn vacate(&mut self, id: PoolId) {
        let next = self.vacant;
        let slot = self.get_mut(id);
        debug_assert!(!slot.is_vacant(), "pool record {id:?} vacated twice");
        *slot = PoolMeta::vacant(next);
        self.vacant = Some(id);
    }

    /// Every record that currently describes a pool or large allocation.
    pub fn iter_live(&self) -> impl Iterator<Item = (PoolId, &PoolMeta)> + '_ {
        (0..self.len)
            .map(PoolId::from_index)
            .map(|id| (id, self.get(id)))
            .filter(|(_, meta)| !meta.is_vacant())
    }
}

impl Drop for PoolArena {
    fn drop(&mut self) {
        // Safety: base/reserved describe the reservation made in `new`.
        drop(unsafe { PlatformVmOps::release(self.base.cast::<u8>(), self.reserved) });
        stats::TOTAL_RESERVED.sub(self.reserved);
        stats::TOTAL_COMMITTED.sub(self.committed);
        stats::METADATA_COMMITTED.sub(self.committed);
    }
}
