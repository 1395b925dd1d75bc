/// Bytes reserved from the OS for one pool before rounding to whole blocks.
pub const POOL_CHUNK_SIZE: usize = 65536;

/// Largest request served from a pool. Anything bigger goes straight to the OS.
pub const POOL_THRESHOLD: usize = POOL_CHUNK_SIZE / 2;

pub const SIZE_CLASS_COUNT: usize = 42;

// 42 block sizes, 8B..32KB. Every entry is a multiple of 8 so a free block
// can always hold the recycled-list link.
pub(crate) const SIZE_CLASSES: [usize; SIZE_CLASS_COUNT] = [
    8, 16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 288, 320, 384, 448, 512, 576, 640,
    704, 768, 896, 1024, 1168, 1360, 1632, 2048, 2336, 2720, 3264, 4096, 4672, 5456, 6544, 8192,
    9360, 10912, 13104, 16384, 21840, 32768,
];

/// O(1) size-to-class lookup. Index by the byte count itself; entry is the
/// class index. Entry 0 is unused (zero-byte requests never reach a pool).
static SIZE_CLASS_LUT: [u8; POOL_THRESHOLD + 1] = build_size_class_lut();

const fn build_size_class_lut() -> [u8; POOL_THRESHOLD + 1] {
    let mut table = [0u8; POOL_THRESHOLD + 1];
    let mut size = 1;
    let mut class = 0;
    while size <= POOL_THRESHOLD {
        while SIZE_CLASSES[class] < size {
            class += 1;
        }
        table[size] = class as u8;
        size += 1;
    }
    table
}

/// One entry of the block-size table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SizeClass {
    index: u8,
}

impl SizeClass {
    /// Class by table position.
    ///
    /// # Panics
    ///
    /// Panics if `index >= SIZE_CLASS_COUNT`.
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        assert!(index < SIZE_CLASS_COUNT, "size class index {index} out of range");
        Self { index: index as u8 }
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    #[must_use]
    pub fn block_size(self) -> usize {
        SIZE_CLASSES[self.index as usize]
    }

    /// Blocks carved from one pool chunk. The remainder of the chunk is the
    /// fragmentation cost of this class.
    #[inline]
    #[must_use]
    pub fn blocks_per_pool(self) -> usize {
        POOL_CHUNK_SIZE / self.block_size()
    }

    /// Bytes requested from the OS for one pool of this class.
    #[inline]
    #[must_use]
    pub fn pool_bytes(self, page_size: usize) -> usize {
        (self.blocks_per_pool() * self.block_size()).next_multiple_of(page_size)
    }

    pub fn all() -> impl Iterator<Item = SizeClass> {
        (0..SIZE_CLASS_COUNT).map(Self::from_index)
    }
}

/// Maps request sizes to size classes.
///
/// The direct-mapped table behind it is built once, at compile time, by a
/// linear scan over [`SIZE_CLASSES`]; the handle itself is free to copy.
#[derive(Clone, Copy, Debug, Default)]
pub struct SizeClassTable;

impl SizeClassTable {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Smallest class whose block size is at least `size`.
    ///
    /// Returns `None` for `0` and for anything above [`POOL_THRESHOLD`].
    #[inline]
    #[must_use]
    pub fn class_for(&self, size: usize) -> Option<SizeClass> {
        if size == 0 || size > POOL_THRESHOLD {
            return None;
        }
        Some(SizeClass {
            index: SIZE_CLASS_LUT[size],
        })
    }

    /// Like [`class_for`](Self::class_for), but bumped up to the first class
    /// whose block size is also a multiple of `align`, so that every block of
    /// the pool lands on an `align` boundary (pool bases are page-aligned).
    /// `align` of 0 or 1 means no constraint.
    #[inline]
    #[must_use]
    pub fn class_for_aligned(&self, size: usize, align: usize) -> Option<SizeClass> {
        let start = self.class_for(size)?.index();
        if align <= 1 {
            return Some(SizeClass::from_index(start));
        }
        (start..SIZE_CLASS_COUNT)
            .find(|&idx| SIZE_CLASSES[idx].is_multiple_of(align))
            .map(SizeClass::from_index)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_table_shape() {
        assert_eq!(SIZE_CLASSES.len(), 42);
        assert_eq!(SIZE_CLASSES[0], 8);
        assert_eq!(SIZE_CLASSES[SIZE_CLASS_COUNT - 1], POOL_THRESHOLD);
        for w in SIZE_CLASSES.windows(2) {
            assert!(w[0] < w[1], "size classes not ascending: {w:?}");
        }
        for &bs in &SIZE_CLASSES {
            assert!(bs.is_multiple_of(8), "block size {bs} cannot hold a free link");
        }
    }

    #[test]
    fn test_class_for_boundaries() {
        let table = SizeClassTable::new();
        assert_eq!(table.class_for(0), None);
        assert_eq!(table.class_for(1).unwrap().block_size(), 8);
        assert_eq!(table.class_for(8).unwrap().block_size(), 8);
        assert_eq!(table.class_for(9).unwrap().block_size(), 16);
        assert_eq!(table.class_for(1025).unwrap().block_size(), 1168);
        assert_eq!(table.class_for(21841).unwrap().block_size(), 32768);
        assert_eq!(table.class_for(POOL_THRESHOLD).unwrap().block_size(), POOL_THRESHOLD);
        assert_eq!(table.class_for(POOL_THRESHOLD + 1), None);
    }

    #[test]
    fn test_every_class_hits_itself() {
        let table = SizeClassTable::new();
        for class in SizeClass::all() {
            assert_eq!(table.class_for(class.block_size()), Some(class));
        }
    }

    #[test]
    fn test_class_for_aligned_bumps_to_multiple() {
        let table = SizeClassTable::new();
        // 1152 = 18 * 64 lands on 1168, which is not 64-aligned.
        assert_eq!(table.class_for(1152).unwrap().block_size(), 1168);
        let class = table.class_for_aligned(1152, 64).unwrap();
        assert_eq!(class.block_size(), 2048);

        assert_eq!(table.class_for_aligned(128, 64).unwrap().block_size(), 128);
        assert_eq!(table.class_for_aligned(24, 0).unwrap().block_size(), 32);
        assert_eq!(table.class_for_aligned(24, 1).unwrap().block_size(), 32);
        // Nothing in the table is a multiple of 65536.
        assert_eq!(table.class_for_aligned(16, 65536), None);
    }

    #[test]
    fn test_blocks_per_pool_and_pool_bytes() {
        let table = SizeClassTable::new();
        let c16 = table.class_for(16).unwrap();
        assert_eq!(c16.blocks_per_pool(), 4096);
        assert_eq!(c16.pool_bytes(4096), 65536);

        let c21840 = table.class_for(21840).unwrap();
        assert_eq!(c21840.blocks_per_pool(), 3);
        // 65520 bytes of blocks round up to 16 pages.
        assert_eq!(c21840.pool_bytes(4096), 65536);

        let c32k = table.class_for(POOL_THRESHOLD).unwrap();
        assert_eq!(c32k.blocks_per_pool(), 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_from_index_out_of_range() {
        let _ = SizeClass::from_index(SIZE_CLASS_COUNT);
    }

    proptest! {
        #[test]
        fn prop_class_for_is_minimal(size in 1usize..=POOL_THRESHOLD) {
            let class = SizeClassTable::new().class_for(size).unwrap();
            prop_assert!(class.block_size() >= size);
            if class.index() > 0 {
                prop_assert!(SIZE_CLASSES[class.index() - 1] < size);
            }
        }

        #[test]
        fn prop_class_for_aligned_honours_alignment(
            size in 1usize..=POOL_THRESHOLD,
            shift in 0u32..16,
        ) {
            let align = 1usize << shift;
            if let Some(class) = SizeClassTable::new().class_for_aligned(size, align) {
                prop_assert!(class.block_size() >= size);
                prop_assert!(class.block_size().is_multiple_of(align));
            }
        }
    }
}
