//! First-fit free-list suballocator
//!
//! Pure bookkeeping for one primary device-memory block: a sorted list of
//! free `(offset, size)` regions, first-fit allocation with alignment
//! padding kept on the free list, and adjacent-hole coalescing on free.

/// A suballocated region within one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Byte offset within the block
    pub offset: u64,
    /// Byte size of the allocation
    pub size: u64,
}

/// Free-list allocator over a fixed-size region.
///
/// Alignment must be a power of two; zero-size requests are rejected.
/// The backing region never shrinks or relocates.
pub struct FreeListAllocator {
    size: u64,
    free_regions: Vec<(u64, u64)>,
    used: u64,
}

impl FreeListAllocator {
    /// Create an allocator covering `size` bytes, all initially free.
    pub fn new(size: u64) -> Self {
        Self { size, free_regions: vec![(0, size)], used: 0 }
    }

    /// Allocate `size` bytes at a multiple of `alignment`, first-fit.
    ///
    /// Returns `None` when no free region can hold the request (or the
    /// request is malformed); the caller grows the pool with a new block.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<Region> {
        if size == 0 || !alignment.is_power_of_two() {
            return None;
        }

        for i in 0..self.free_regions.len() {
            let (offset, region_size) = self.free_regions[i];
            let aligned_offset = align_up(offset, alignment);
            let padding = aligned_offset - offset;

            if region_size >= padding + size {
                if padding > 0 {
                    // The alignment gap stays on the free list.
                    self.free_regions[i] = (offset, padding);
                    let remaining = region_size - padding - size;
                    if remaining > 0 {
                        self.free_regions.push((aligned_offset + size, remaining));
                        self.free_regions.sort_unstable_by_key(|&(o, _)| o);
                    }
                } else {
                    let remaining = region_size - size;
                    if remaining > 0 {
                        self.free_regions[i] = (aligned_offset + size, remaining);
                    } else {
                        self.free_regions.remove(i);
                    }
                }

                self.used += size;
                return Some(Region { offset: aligned_offset, size });
            }
        }

        None
    }

    /// Return a region to the free list, merging adjacent holes.
    pub fn free(&mut self, region: Region) {
        debug_assert!(region.offset + region.size <= self.size);
        self.used -= region.size;
        self.free_regions.push((region.offset, region.size));
        self.free_regions.sort_unstable_by_key(|&(o, _)| o);
        self.merge_free_regions();
    }

    fn merge_free_regions(&mut self) {
        let mut i = 0;
        while i + 1 < self.free_regions.len() {
            let (offset_a, size_a) = self.free_regions[i];
            let (offset_b, size_b) = self.free_regions[i + 1];
            if offset_a + size_a == offset_b {
                self.free_regions[i] = (offset_a, size_a + size_b);
                self.free_regions.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Total bytes covered by this allocator.
    pub fn capacity(&self) -> u64 {
        self.size
    }

    /// Whether nothing is allocated.
    pub fn is_unused(&self) -> bool {
        self.used == 0
    }
}

/// Round `offset` up to the next multiple of `alignment` (a power of two).
pub fn align_up(offset: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_respect_alignment() {
        let mut alloc = FreeListAllocator::new(4096);
        for &alignment in &[1u64, 4, 16, 64, 256] {
            let region = alloc.allocate(17, alignment).unwrap();
            assert_eq!(region.offset % alignment, 0);
        }
    }

    #[test]
    fn zero_size_and_bad_alignment_rejected() {
        let mut alloc = FreeListAllocator::new(1024);
        assert!(alloc.allocate(0, 16).is_none());
        assert!(alloc.allocate(64, 3).is_none());
        assert!(alloc.allocate(64, 0).is_none());
    }

    #[test]
    fn live_allocations_never_overlap() {
        let mut alloc = FreeListAllocator::new(1 << 16);
        let mut live: Vec<Region> = Vec::new();

        // Interleaved reserve/free sequence with awkward sizes.
        for round in 0..8u64 {
            for i in 0..16u64 {
                let size = 48 + 31 * ((i + round) % 5);
                if let Some(r) = alloc.allocate(size, 1 << (i % 7)) {
                    live.push(r);
                }
            }
            // Free every third allocation.
            let to_free: Vec<Region> =
                live.iter().enumerate().filter(|(i, _)| i % 3 == 0).map(|(_, r)| *r).collect();
            live.retain(|r| !to_free.contains(r));
            for r in to_free {
                alloc.free(r);
            }

            let mut sorted = live.clone();
            sorted.sort_by_key(|r| r.offset);
            for pair in sorted.windows(2) {
                assert!(
                    pair[0].offset + pair[0].size <= pair[1].offset,
                    "overlap between {:?} and {:?}",
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn free_then_reallocate_reuses_hole() {
        let mut alloc = FreeListAllocator::new(1024);
        let a = alloc.allocate(256, 16).unwrap();
        let _b = alloc.allocate(256, 16).unwrap();
        alloc.free(a);

        // An identical request must land in the freed hole, not grow usage
        // past what the first layout needed.
        let c = alloc.allocate(256, 16).unwrap();
        assert_eq!(c.offset, a.offset);
        assert_eq!(alloc.used(), 512);
    }

    #[test]
    fn coalescing_restores_full_region() {
        let mut alloc = FreeListAllocator::new(1024);
        let a = alloc.allocate(300, 4).unwrap();
        let b = alloc.allocate(300, 4).unwrap();
        let c = alloc.allocate(300, 4).unwrap();
        alloc.free(b);
        alloc.free(a);
        alloc.free(c);
        assert!(alloc.is_unused());
        // After coalescing the whole block is one hole again.
        let whole = alloc.allocate(1024, 1).unwrap();
        assert_eq!(whole, Region { offset: 0, size: 1024 });
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut alloc = FreeListAllocator::new(128);
        assert!(alloc.allocate(128, 1).is_some());
        assert!(alloc.allocate(1, 1).is_none());
    }
}
