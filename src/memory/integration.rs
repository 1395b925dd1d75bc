#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::pool_allocator::{PoolAllocator, PoolAllocatorConfig, PoolList};
    use crate::memory::size_class::{POOL_THRESHOLD, SizeClass, SizeClassTable};
    use crate::memory::stats::MemoryStats;
    use crate::sync::thread;
    use std::collections::HashSet;
    use std::ptr::NonNull;

    fn scenario_allocator() -> PoolAllocator {
        PoolAllocator::with_config(PoolAllocatorConfig {
            page_size: 4096,
            address_limit: 1 << 32,
            validate_frees: true,
            quiet: true,
            ..PoolAllocatorConfig::new()
        })
        .unwrap()
    }

    fn malloc16(a: &mut PoolAllocator) -> NonNull<u8> {
        a.malloc(16, 0).unwrap().unwrap()
    }

    #[test]
    fn test_integration_4096_small_blocks_release_then_recreate() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut a = scenario_allocator();

        let ptrs: Vec<_> = (0..4096).map(|_| malloc16(&mut a)).collect();
        let unique: HashSet<_> = ptrs.iter().copied().collect();
        assert_eq!(unique.len(), 4096, "two live allocations alias");
        // 4096 x 16 bytes is exactly one pool, now exhausted.
        assert_eq!(a.stats().pools_created, 1);
        assert_eq!(a.stats().exhausted_pools, 1);

        for p in ptrs.iter().rev() {
            // Safety: p came from malloc.
            unsafe { a.free(p.as_ptr()).unwrap() };
        }
        // The last free emptied the pool and gave it back to the OS.
        assert_eq!(a.stats().live_pools, 0);
        assert_eq!(a.stats().pools_released, 1);
        assert!(ptrs.iter().all(|p| !a.owns(p.as_ptr())));

        let again = malloc16(&mut a);
        assert_eq!(a.stats().pools_created, 2);
        assert_eq!(a.stats().live_pools, 1);
        // Safety: again came from malloc.
        unsafe { a.free(again.as_ptr()).unwrap() };
    }

    #[test]
    fn test_integration_4096_small_blocks_recycled_lifo() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut a = scenario_allocator();

        // One long-lived block keeps the first pool from being released.
        let anchor = malloc16(&mut a);
        let ptrs: Vec<_> = (0..4096).map(|_| malloc16(&mut a)).collect();
        let unique: HashSet<_> = ptrs.iter().copied().chain([anchor]).collect();
        assert_eq!(unique.len(), 4097, "two live allocations alias");
        assert_eq!(a.stats().pools_created, 2);

        for p in ptrs.iter().rev() {
            // Safety: p came from malloc.
            unsafe { a.free(p.as_ptr()).unwrap() };
        }
        let created = a.stats().pools_created;
        assert_eq!(a.stats().live_pools, 1);

        // LIFO recycling: the block freed last comes back first.
        let reused = malloc16(&mut a);
        assert_eq!(reused, ptrs[0]);
        assert_eq!(a.stats().pools_created, created, "a new pool was created");

        // Safety: both came from malloc.
        unsafe {
            a.free(reused.as_ptr()).unwrap();
            a.free(anchor.as_ptr()).unwrap();
        }
        assert_eq!(a.stats().live_pools, 0);
    }

    #[test]
    fn test_integration_every_class_fills_spills_and_drains() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut a = scenario_allocator();
        for class in SizeClass::all() {
            let size = class.block_size();
            let n = class.blocks_per_pool() + 1;
            let ptrs: Vec<_> = (0..n).map(|_| a.malloc(size, 0).unwrap().unwrap()).collect();
            assert_eq!(a.pools(class, PoolList::Exhausted).count(), 1, "class {size}");
            assert_eq!(a.pools(class, PoolList::Available).count(), 1, "class {size}");
            for p in &ptrs {
                assert_eq!(a.usable_size(p.as_ptr()), Some(size));
            }
            for p in ptrs {
                // Safety: p came from malloc.
                unsafe { a.free(p.as_ptr()).unwrap() };
            }
            assert_eq!(a.pools(class, PoolList::Exhausted).count(), 0);
            assert_eq!(a.pools(class, PoolList::Available).count(), 0);
        }
        let stats = a.stats();
        assert_eq!(stats.live_pools, 0);
        assert_eq!(stats.pools_created, 2 * SizeClass::all().count() as u64);
        assert_eq!(stats.pools_created, stats.pools_released);
    }

    #[test]
    fn test_integration_independent_instances() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut a = scenario_allocator();
        let mut b = scenario_allocator();

        let pa = a.malloc(64, 0).unwrap().unwrap();
        let pb = b.malloc(64, 0).unwrap().unwrap();
        assert_ne!(pa, pb);
        assert!(a.owns(pa.as_ptr()) && !a.owns(pb.as_ptr()));
        assert!(b.owns(pb.as_ptr()) && !b.owns(pa.as_ptr()));

        // Safety: each pointer goes back to its own allocator.
        unsafe {
            a.free(pa.as_ptr()).unwrap();
            b.free(pb.as_ptr()).unwrap();
        }
    }

    #[test]
    fn test_integration_instance_per_thread() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let handles: Vec<_> = (0..4)
            .map(|t: usize| {
                thread::spawn(move || {
                    let mut a = scenario_allocator();
                    let table = SizeClassTable::new();
                    let mut live = Vec::new();
                    for i in 0..2000 {
                        let size = 1 + (i * 37 + t * 101) % (POOL_THRESHOLD + 5000);
                        let p = a.malloc(size, 0).unwrap().unwrap();
                        // Safety: p is valid for size bytes.
                        unsafe { p.as_ptr().write(i as u8) };
                        let expected = table.class_for(size).map_or(size, SizeClass::block_size);
                        assert!(a.usable_size(p.as_ptr()).unwrap() >= expected);
                        live.push((p, i as u8));
                        if i % 3 == 0 {
                            let (q, tag) = live.swap_remove(live.len() / 2);
                            // Safety: q is live and came from malloc.
                            unsafe {
                                assert_eq!(*q.as_ptr(), tag);
                                a.free(q.as_ptr()).unwrap();
                            }
                        }
                    }
                    for (p, tag) in live {
                        // Safety: as above.
                        unsafe {
                            assert_eq!(*p.as_ptr(), tag);
                            a.free(p.as_ptr()).unwrap();
                        }
                    }
                    a.stats()
                })
            })
            .collect();
        for h in handles {
            let stats = h.join().unwrap();
            assert_eq!(stats.live_pools, 0);
            assert_eq!(stats.large_allocations, 0);
        }
    }

    #[test]
    fn test_integration_global_counters_balance() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = MemoryStats::snapshot();
        {
            let mut a = scenario_allocator();
            let mut live = Vec::new();
            for size in [8, 16, 100, 1000, 10_000, POOL_THRESHOLD, POOL_THRESHOLD + 1, 1 << 22] {
                live.push(a.malloc(size, 0).unwrap().unwrap());
            }
            let during = MemoryStats::snapshot();
            let stats = a.stats();
            assert_eq!(during.pool_committed - before.pool_committed, stats.pool_bytes);
            assert_eq!(
                during.large_alloc_committed - before.large_alloc_committed,
                stats.large_bytes
            );
            assert_eq!(
                during.metadata_committed - before.metadata_committed,
                stats.directory_bytes + stats.metadata_bytes
            );

            // Free half; the rest is reclaimed by Drop.
            for p in live.drain(..4) {
                // Safety: p came from malloc.
                unsafe { a.free(p.as_ptr()).unwrap() };
            }
        }
        assert_eq!(MemoryStats::snapshot(), before);
    }
}
