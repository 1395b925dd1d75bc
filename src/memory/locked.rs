use super::pool_allocator::{AllocError, PoolAllocator, PoolAllocatorConfig};
use crate::sync::Mutex;
use std::alloc::{GlobalAlloc, Layout};
use std::ptr::null_mut;

/// A [`PoolAllocator`] behind one mutex, usable from many threads and as
/// `#[global_allocator]`.
///
/// The inner allocator is built on first use, so a `static` needs no
/// runtime initialisation:
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: pagepool::LockedPoolAllocator = pagepool::LockedPoolAllocator::new();
/// ```
pub struct LockedPoolAllocator {
    inner: Mutex<Option<PoolAllocator>>,
    config: PoolAllocatorConfig,
}

impl LockedPoolAllocator {
    /// Configuration used by [`new`](Self::new): logging off, and free
    /// validation off because a validation panic formats its message
    /// through the global heap while the lock is held.
    pub const GLOBAL_CONFIG: PoolAllocatorConfig = PoolAllocatorConfig {
        validate_frees: false,
        quiet: true,
        ..PoolAllocatorConfig::new()
    };

    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self::with_config(Self::GLOBAL_CONFIG)
    }

    /// Use `config` for the lazily built allocator. Keep `quiet` set when
    /// this backs the global heap.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn with_config(config: PoolAllocatorConfig) -> Self {
        Self {
            inner: Mutex::new(None),
            config,
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self::with_config(Self::GLOBAL_CONFIG)
    }

    #[cfg(loom)]
    pub fn with_config(config: PoolAllocatorConfig) -> Self {
        Self {
            inner: Mutex::new(None),
            config,
        }
    }

    /// Run `f` with exclusive access to the allocator, building it first if
    /// this is the first call.
    ///
    /// A panic inside an earlier call does not wedge the allocator: the
    /// poisoned lock is taken over as is.
    ///
    /// # Errors
    ///
    /// Returns the construction error if the allocator could not be built.
    pub fn lock<R>(&self, f: impl FnOnce(&mut PoolAllocator) -> R) -> Result<R, AllocError> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(PoolAllocator::with_config(self.config)?);
        }
        match guard.as_mut() {
            Some(allocator) => Ok(f(allocator)),
            None => unreachable!("allocator built above"),
        }
    }

    /// Whether the inner allocator has been built yet.
    pub fn is_initialized(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }
}

#[cfg(not(loom))]
impl Default for LockedPoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: every method serialises through the mutex; `alloc` returns either
// null or a block of at least `layout.size()` bytes aligned to
// `layout.align()`, and `dealloc` only accepts pointers this allocator owns.
unsafe impl GlobalAlloc for LockedPoolAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self
            .lock(|a| a.malloc(layout.size(), layout.align()))
            .and_then(std::convert::identity)
        {
            Ok(Some(ptr)) => ptr.as_ptr(),
            _ => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Safety: the caller passes a pointer returned by `alloc`.
        drop(self.lock(|a| unsafe { a.free(ptr) }));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Safety: the caller passes a pointer returned by `alloc`.
        match self
            .lock(|a| unsafe { a.realloc(ptr, new_size, layout.align()) })
            .and_then(std::convert::identity)
        {
            Ok(Some(ptr)) => ptr.as_ptr(),
            _ => null_mut(),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::{Arc, thread};

    #[test]
    fn test_lazy_initialisation() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let locked = LockedPoolAllocator::new();
        assert!(!locked.is_initialized());
        let live = locked.lock(|a| a.stats().live_pools).unwrap();
        assert_eq!(live, 0);
        assert!(locked.is_initialized());
    }

    #[test]
    fn test_const_static() {
        static LOCKED: LockedPoolAllocator = LockedPoolAllocator::new();
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let layout = Layout::from_size_align(24, 8).unwrap();
        // Safety: layout is non-zero; the pointer is freed with the same layout.
        unsafe {
            let p = LOCKED.alloc(layout);
            assert!(!p.is_null());
            LOCKED.dealloc(p, layout);
        }
    }

    #[test]
    fn test_bad_config_surfaces_on_first_use() {
        let locked = LockedPoolAllocator::with_config(PoolAllocatorConfig {
            max_pools: 0,
            ..LockedPoolAllocator::GLOBAL_CONFIG
        });
        assert!(matches!(locked.lock(|_| ()), Err(AllocError::InvalidConfig(_))));
        // GlobalAlloc reports the failure as null.
        let layout = Layout::from_size_align(16, 8).unwrap();
        // Safety: layout is non-zero.
        assert!(unsafe { locked.alloc(layout) }.is_null());
    }

    #[test]
    fn test_global_alloc_contract() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let locked = LockedPoolAllocator::new();
        for (size, align) in [(1, 1), (24, 8), (100, 64), (4000, 4096), (50_000, 16), (64, 1 << 16)] {
            let layout = Layout::from_size_align(size, align).unwrap();
            // Safety: layout is non-zero; the pointer is freed with the same layout.
            unsafe {
                let p = locked.alloc(layout);
                assert!(!p.is_null(), "alloc failed for {layout:?}");
                assert!((p as usize).is_multiple_of(align), "{p:p} not aligned for {layout:?}");
                std::ptr::write_bytes(p, 0xAB, size);
                locked.dealloc(p, layout);
            }
        }
        let stats = locked.lock(|a| a.stats()).unwrap();
        assert_eq!(stats.live_pools, 0);
        assert_eq!(stats.large_allocations, 0);
    }

    #[test]
    fn test_global_realloc_preserves_contents() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let locked = LockedPoolAllocator::new();
        let layout = Layout::from_size_align(16, 8).unwrap();
        // Safety: every pointer passed back came from `locked`.
        unsafe {
            let p = locked.alloc(layout);
            std::ptr::copy_nonoverlapping(b"sixteen bytes!!!".as_ptr(), p, 16);
            let q = locked.realloc(p, layout, 40_000);
            assert!(!q.is_null());
            assert_eq!(std::slice::from_raw_parts(q, 16), b"sixteen bytes!!!");
            locked.dealloc(q, Layout::from_size_align(40_000, 8).unwrap());
        }
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let locked = Arc::new(LockedPoolAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let locked = Arc::clone(&locked);
                thread::spawn(move || {
                    let layout = Layout::from_size_align(16 + t * 40, 8).unwrap();
                    let mut held = Vec::with_capacity(500);
                    for i in 0..500 {
                        // Safety: layout is non-zero.
                        let p = unsafe { locked.alloc(layout) };
                        assert!(!p.is_null());
                        // Safety: p is valid for layout.size() bytes.
                        unsafe { p.write(i as u8) };
                        held.push(p);
                    }
                    for (i, p) in held.into_iter().enumerate() {
                        // Safety: p came from alloc with this layout.
                        unsafe {
                            assert_eq!(*p, i as u8);
                            locked.dealloc(p, layout);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = locked.lock(|a| a.stats()).unwrap();
        assert_eq!(stats.live_pools, 0);
        assert_eq!(stats.pools_created, stats.pools_released);
    }

    #[test]
    fn test_survives_poisoned_lock() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let locked = Arc::new(LockedPoolAllocator::new());
        let clone = Arc::clone(&locked);
        let result = thread::spawn(move || {
            let _: Result<(), _> = clone.lock(|_| panic!("boom"));
        })
        .join();
        assert!(result.is_err());
        let live = locked.lock(|a| a.stats().live_pools).unwrap();
        assert_eq!(live, 0);
    }
}
