//! Extent allocation for logical volume groups
//!
//! The allocator works on the sorted, non-overlapping list of extents in
//! use across a group's address space. A zero-length sentinel at the end
//! of the space terminates the list so every gap has a following extent.

use std::ops::Range;
use volset_common::{Error, Result};

/// A contiguous byte range
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Extent {
    /// Start offset in bytes
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl Extent {
    /// Create a new extent
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Get the end offset (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// End offset, or `None` when it does not fit in `u64`
    #[must_use]
    pub const fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    /// Check if an offset falls inside this extent
    #[must_use]
    pub const fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }

    /// Check if another extent lies entirely inside this one
    #[must_use]
    pub const fn covers(&self, other: &Self) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    /// Check if this extent overlaps with another
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Try to merge with an adjacent extent
    #[must_use]
    pub const fn try_merge(&self, other: &Self) -> Option<Self> {
        if self.end() == other.offset {
            Some(Self::new(self.offset, self.length + other.length))
        } else if other.end() == self.offset {
            Some(Self::new(other.offset, self.length + other.length))
        } else {
            None
        }
    }
}

/// Total bytes covered by a list of extents
#[must_use]
pub fn total_length(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.length).sum()
}

/// Append an extent, merging it into the last one when contiguous
pub fn push_merged(extents: &mut Vec<Extent>, extent: Extent) {
    if let Some(last) = extents.last_mut()
        && last.end() == extent.offset
    {
        last.length += extent.length;
        return;
    }
    extents.push(extent);
}

/// Shorten a volume's extent list to `new_size` bytes.
///
/// Returns the ranges that were cut off, in volume order.
pub fn truncate_released(extents: &mut Vec<Extent>, new_size: u64) -> Vec<Extent> {
    let mut kept = 0u64;
    let mut cut_at = extents.len();
    let mut released = Vec::new();

    for (i, extent) in extents.iter_mut().enumerate() {
        if kept + extent.length <= new_size {
            kept += extent.length;
            continue;
        }
        let keep = new_size - kept;
        if keep > 0 {
            released.push(Extent::new(extent.offset + keep, extent.length - keep));
            extent.length = keep;
            cut_at = i + 1;
        } else {
            cut_at = i;
        }
        break;
    }

    released.extend(extents.drain(cut_at..).filter(|e| e.length > 0));
    released
}

/// Shorten a volume's extent list to `new_size` bytes, returning the new
/// extent count
pub fn truncate(extents: &mut Vec<Extent>, new_size: u64) -> usize {
    truncate_released(extents, new_size);
    extents.len()
}

/// Allocator over a group's used-extent list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtentAllocator {
    /// Used extents, sorted, ending with the sentinel
    used: Vec<Extent>,
}

impl ExtentAllocator {
    /// Create an allocator for an empty space of `end` bytes
    #[must_use]
    pub fn new(end: u64) -> Self {
        Self {
            used: vec![Extent::new(end, 0)],
        }
    }

    /// Create an allocator from extents already in use.
    ///
    /// The extents may arrive in any order; adjacent ones are coalesced.
    pub fn with_used(mut used: Vec<Extent>, end: u64) -> Result<Self> {
        used.retain(|e| e.length > 0);
        used.sort_unstable();

        let mut coalesced: Vec<Extent> = Vec::with_capacity(used.len() + 1);
        for extent in used {
            let Some(extent_end) = extent.checked_end() else {
                return Err(Error::format(format!(
                    "extent {}+{} overflows the address space",
                    extent.offset, extent.length
                )));
            };
            if extent_end > end {
                return Err(Error::format(format!(
                    "extent {}+{} beyond group end {}",
                    extent.offset, extent.length, end
                )));
            }
            if let Some(last) = coalesced.last_mut() {
                if last.overlaps(&extent) {
                    return Err(Error::format(format!(
                        "extent {}+{} overlaps {}+{}",
                        extent.offset, extent.length, last.offset, last.length
                    )));
                }
                if let Some(merged) = last.try_merge(&extent) {
                    *last = merged;
                    continue;
                }
            }
            coalesced.push(extent);
        }
        coalesced.push(Extent::new(end, 0));
        Ok(Self { used: coalesced })
    }

    /// End of the address space
    #[must_use]
    pub fn end(&self) -> u64 {
        self.used.last().map_or(0, |s| s.offset)
    }

    /// Used extents, without the sentinel
    #[must_use]
    pub fn used(&self) -> &[Extent] {
        &self.used[..self.used.len() - 1]
    }

    /// Free ranges inside a window
    #[must_use]
    pub fn free_extents_in(&self, window: Range<u64>) -> Vec<Extent> {
        let mut free = Vec::new();
        let mut prev_end = 0;
        for next in &self.used {
            let start = prev_end.max(window.start);
            let end = next.offset.min(window.end);
            if end > start {
                free.push(Extent::new(start, end - start));
            }
            prev_end = next.end();
        }
        free
    }

    /// Free ranges across the whole space
    #[must_use]
    pub fn free_extents(&self) -> Vec<Extent> {
        self.free_extents_in(0..self.end())
    }

    /// Free bytes across the whole space
    #[must_use]
    pub fn free_space(&self) -> u64 {
        total_length(&self.free_extents())
    }

    /// Extend the address space, for example when a member joins
    pub fn grow_end(&mut self, new_end: u64) {
        if let Some(sentinel) = self.used.last_mut()
            && new_end > sentinel.offset
        {
            sentinel.offset = new_end;
        }
    }

    /// Allocate `size` bytes anywhere in the space
    pub fn allocate(&mut self, size: u64) -> Result<Vec<Extent>> {
        let end = self.end();
        self.allocate_in(size, 0..end)
    }

    /// Allocate `size` bytes inside a window.
    ///
    /// Each round takes the first gap that satisfies the remainder, or
    /// the largest gap when none does, so a request may come back split
    /// across several extents. Nothing is modified when the window lacks
    /// the space.
    pub fn allocate_in(&mut self, size: u64, window: Range<u64>) -> Result<Vec<Extent>> {
        if size == 0 {
            return Err(Error::invalid_argument("allocation size must be non-zero"));
        }
        let available = total_length(&self.free_extents_in(window.clone()));
        if available < size {
            return Err(Error::InsufficientSpace {
                required: size,
                available,
            });
        }

        let mut remaining = size;
        let mut allocated = Vec::new();
        while remaining > 0 {
            let (index, start, gap) = self
                .pick_gap(remaining, &window)
                .ok_or_else(|| Error::internal("free space vanished during allocation"))?;
            let extent = Extent::new(start, gap.min(remaining));
            self.absorb(index, extent);
            allocated.push(extent);
            remaining -= extent.length;
        }
        Ok(allocated)
    }

    /// Find a gap as (index of the following used extent, start, length)
    fn pick_gap(&self, wanted: u64, window: &Range<u64>) -> Option<(usize, u64, u64)> {
        let mut largest: Option<(usize, u64, u64)> = None;
        let mut prev_end = 0;
        for (i, next) in self.used.iter().enumerate() {
            let start = prev_end.max(window.start);
            let end = next.offset.min(window.end);
            if end > start {
                let gap = end - start;
                if gap >= wanted {
                    return Some((i, start, gap));
                }
                if largest.is_none_or(|(_, _, best)| gap > best) {
                    largest = Some((i, start, gap));
                }
            }
            prev_end = next.end();
        }
        largest
    }

    /// Record a new allocation placed in the gap before `used[index]`
    fn absorb(&mut self, index: usize, extent: Extent) {
        let at = if index > 0 && self.used[index - 1].end() == extent.offset {
            self.used[index - 1].length += extent.length;
            index - 1
        } else {
            self.used.insert(index, extent);
            index
        };
        self.merge_forward(at);
    }

    /// Merge `used[at]` with its successor when they touch, sentinel excluded
    fn merge_forward(&mut self, at: usize) {
        let sentinel = self.used.len() - 1;
        if at + 1 < sentinel && self.used[at].end() == self.used[at + 1].offset {
            self.used[at].length += self.used[at + 1].length;
            self.used.remove(at + 1);
        }
    }

    /// Grow a volume in place by extending its last extent into the free
    /// space directly after it.
    ///
    /// Returns the volume's new size, which may fall short of `new_size`.
    pub fn grow_last_extent(&mut self, extents: &mut [Extent], new_size: u64) -> u64 {
        let current = total_length(extents);
        let Some(last) = extents.last_mut() else {
            return current;
        };
        if new_size <= current || last.length == 0 {
            return current;
        }

        let tail = last.end() - 1;
        let index = self.used.partition_point(|e| e.offset <= tail);
        if index == 0 {
            return current;
        }
        let holder = index - 1;
        // the last extent must end exactly where its used range ends
        if !self.used[holder].contains(tail) || self.used[holder].end() != last.end() {
            return current;
        }

        let gap = self.used[holder + 1].offset - self.used[holder].end();
        let grow = gap.min(new_size - current);
        if grow == 0 {
            return current;
        }
        self.used[holder].length += grow;
        last.length += grow;
        self.merge_forward(holder);
        current + grow
    }

    /// Return an extent to the free space
    pub fn release(&mut self, extent: Extent) -> Result<()> {
        if extent.length == 0 {
            return Ok(());
        }
        let index = self.used.partition_point(|e| e.offset <= extent.offset);
        let holder = index
            .checked_sub(1)
            .filter(|&h| h + 1 < self.used.len() && self.used[h].covers(&extent))
            .ok_or_else(|| {
                Error::internal(format!(
                    "released extent {}+{} is not in use",
                    extent.offset, extent.length
                ))
            })?;

        let used = self.used[holder];
        let left = Extent::new(used.offset, extent.offset - used.offset);
        let right = Extent::new(extent.end(), used.end() - extent.end());
        let pieces: Vec<Extent> = [left, right].into_iter().filter(|e| e.length > 0).collect();
        self.used.splice(holder..=holder, pieces);
        Ok(())
    }

    /// Release every extent in a list
    pub fn release_all(&mut self, extents: &[Extent]) -> Result<()> {
        extents.iter().try_for_each(|e| self.release(*e))
    }

    /// Mark a range as used, as when the group reserves a hole
    pub fn reserve(&mut self, extent: Extent) -> Result<()> {
        if extent.length == 0 {
            return Ok(());
        }
        let free = self.free_extents_in(extent.offset..extent.end());
        if total_length(&free) != extent.length {
            return Err(Error::internal(format!(
                "reserved extent {}+{} overlaps used space",
                extent.offset, extent.length
            )));
        }
        let index = self.used.partition_point(|e| e.offset < extent.offset);
        self.absorb(index, extent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn used(alloc: &ExtentAllocator) -> Vec<(u64, u64)> {
        alloc.used().iter().map(|e| (e.offset, e.length)).collect()
    }

    #[test]
    fn test_extent_operations() {
        let a = Extent::new(10, 10);
        let b = Extent::new(20, 5);
        assert_eq!(a.end(), 20);
        assert!(a.contains(19));
        assert!(!a.contains(20));
        assert!(!a.overlaps(&b));
        assert_eq!(a.try_merge(&b), Some(Extent::new(10, 15)));
        assert_eq!(b.try_merge(&a), Some(Extent::new(10, 15)));
        assert!(a.covers(&Extent::new(12, 8)));
    }

    #[test]
    fn test_allocate_grows_predecessor() {
        let mut alloc = ExtentAllocator::with_used(vec![Extent::new(0, 100)], 1000).unwrap();
        let got = alloc.allocate(50).unwrap();
        assert_eq!(got, vec![Extent::new(100, 50)]);
        assert_eq!(used(&alloc), vec![(0, 150)]);
    }

    #[test]
    fn test_allocate_splits_across_gaps() {
        let mut alloc =
            ExtentAllocator::with_used(vec![Extent::new(0, 10), Extent::new(20, 10)], 40)
                .unwrap();
        let got = alloc.allocate(15).unwrap();
        assert_eq!(got, vec![Extent::new(10, 10), Extent::new(30, 5)]);
        assert_eq!(used(&alloc), vec![(0, 35)]);
    }

    #[test]
    fn test_allocate_insufficient_space_is_atomic() {
        let mut alloc = ExtentAllocator::with_used(vec![Extent::new(0, 90)], 100).unwrap();
        let before = alloc.clone();
        let err = alloc.allocate(11).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientSpace {
                required: 11,
                available: 10
            }
        ));
        assert_eq!(alloc, before);
        assert!(alloc.allocate(0).is_err());
    }

    #[test]
    fn test_allocate_at_start_of_space() {
        let mut alloc = ExtentAllocator::with_used(vec![Extent::new(50, 50)], 200).unwrap();
        assert_eq!(alloc.allocate(20).unwrap(), vec![Extent::new(0, 20)]);
        assert_eq!(used(&alloc), vec![(0, 20), (50, 50)]);
        assert_eq!(alloc.allocate(30).unwrap(), vec![Extent::new(20, 30)]);
        assert_eq!(used(&alloc), vec![(0, 100)]);
    }

    #[test]
    fn test_allocate_in_window() {
        let mut alloc = ExtentAllocator::new(1000);
        let got = alloc.allocate_in(100, 500..1000).unwrap();
        assert_eq!(got, vec![Extent::new(500, 100)]);
        assert_eq!(used(&alloc), vec![(500, 100)]);
        assert!(matches!(
            alloc.allocate_in(100, 950..1000),
            Err(Error::InsufficientSpace { available: 50, .. })
        ));
    }

    #[test]
    fn test_largest_gap_first_wins_ties() {
        let mut alloc = ExtentAllocator::with_used(
            vec![Extent::new(5, 5), Extent::new(20, 5), Extent::new(35, 5)],
            40,
        )
        .unwrap();
        // gaps: 0..5, 10..20, 25..35 (two tied at 10)
        let got = alloc.allocate(12).unwrap();
        assert_eq!(got, vec![Extent::new(10, 10), Extent::new(0, 2)]);
    }

    #[test]
    fn test_grow_last_extent() {
        let mut alloc = ExtentAllocator::with_used(
            vec![Extent::new(0, 100), Extent::new(150, 50)],
            1000,
        )
        .unwrap();
        let mut volume = vec![Extent::new(50, 50)];
        assert_eq!(alloc.grow_last_extent(&mut volume, 80), 80);
        assert_eq!(volume, vec![Extent::new(50, 80)]);
        assert_eq!(used(&alloc), vec![(0, 130), (150, 50)]);

        // growth stops at the next used extent and merges with it
        assert_eq!(alloc.grow_last_extent(&mut volume, 500), 100);
        assert_eq!(volume, vec![Extent::new(50, 100)]);
        assert_eq!(used(&alloc), vec![(0, 200)]);

        // nothing free after the extent any more
        assert_eq!(alloc.grow_last_extent(&mut volume, 500), 100);
    }

    #[test]
    fn test_grow_last_extent_not_at_used_end() {
        let mut alloc = ExtentAllocator::with_used(vec![Extent::new(0, 100)], 1000).unwrap();
        let mut volume = vec![Extent::new(0, 50)];
        assert_eq!(alloc.grow_last_extent(&mut volume, 70), 50);
        let mut empty: Vec<Extent> = Vec::new();
        assert_eq!(alloc.grow_last_extent(&mut empty, 70), 0);
    }

    #[test]
    fn test_truncate() {
        let mut extents = vec![Extent::new(0, 10), Extent::new(20, 10), Extent::new(40, 10)];
        let released = truncate_released(&mut extents, 15);
        assert_eq!(extents, vec![Extent::new(0, 10), Extent::new(20, 5)]);
        assert_eq!(released, vec![Extent::new(25, 5), Extent::new(40, 10)]);

        let mut extents = vec![Extent::new(0, 10), Extent::new(20, 10)];
        assert_eq!(truncate(&mut extents, 10), 1);
        assert_eq!(truncate(&mut extents, 100), 1);
        assert_eq!(truncate(&mut extents, 0), 0);
    }

    #[test]
    fn test_release_splits_used_extent() {
        let mut alloc = ExtentAllocator::with_used(vec![Extent::new(0, 100)], 1000).unwrap();
        alloc.release(Extent::new(40, 20)).unwrap();
        assert_eq!(used(&alloc), vec![(0, 40), (60, 40)]);
        alloc.release(Extent::new(0, 40)).unwrap();
        assert_eq!(used(&alloc), vec![(60, 40)]);
        assert!(alloc.release(Extent::new(0, 10)).is_err());
        assert_eq!(alloc.free_space(), 960);
    }

    #[test]
    fn test_reserve_and_grow_end() {
        let mut alloc = ExtentAllocator::new(100);
        alloc.reserve(Extent::new(90, 10)).unwrap();
        assert!(alloc.reserve(Extent::new(85, 10)).is_err());
        alloc.grow_end(200);
        assert_eq!(alloc.end(), 200);
        assert_eq!(alloc.free_space(), 190);
        assert_eq!(
            alloc.free_extents(),
            vec![Extent::new(0, 90), Extent::new(100, 100)]
        );
    }

    #[test]
    fn test_with_used_rejects_overlap() {
        assert!(
            ExtentAllocator::with_used(vec![Extent::new(0, 20), Extent::new(10, 20)], 100)
                .is_err()
        );
        assert!(ExtentAllocator::with_used(vec![Extent::new(90, 20)], 100).is_err());
        assert!(matches!(
            ExtentAllocator::with_used(vec![Extent::new(u64::MAX - 1, 10)], 100),
            Err(Error::Format(_))
        ));
        let alloc =
            ExtentAllocator::with_used(vec![Extent::new(10, 10), Extent::new(0, 10)], 100)
                .unwrap();
        assert_eq!(used(&alloc), vec![(0, 20)]);
    }

    #[test]
    fn test_random_allocations_keep_list_consistent() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let end = 1 << 20;
        let mut alloc = ExtentAllocator::new(end);
        let mut live: Vec<Vec<Extent>> = Vec::new();

        for _ in 0..500 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..8192);
                let before = alloc.free_space();
                match alloc.allocate(size) {
                    Ok(extents) => {
                        assert_eq!(total_length(&extents), size);
                        assert_eq!(alloc.free_space(), before - size);
                        live.push(extents);
                    }
                    Err(Error::InsufficientSpace { available, .. }) => {
                        assert_eq!(available, before);
                        assert!(before < size);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                alloc.release_all(&victim).unwrap();
            }

            let list = alloc.used();
            for pair in list.windows(2) {
                assert!(pair[0].end() < pair[1].offset, "used list not coalesced");
            }
            let allocated: u64 = live.iter().map(|v| total_length(v)).sum();
            assert_eq!(total_length(list), allocated);
            assert!(list.last().is_none_or(|e| e.end() <= end));
        }
    }
}
