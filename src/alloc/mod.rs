//! Best-fit block allocator used to place IMG entries within the content
//! stream, and to compute the final gap-free layout on save.
//!
//! Grounded on `CFileSystem.img.internal.h`'s free-block-list allocator
//! (see `original_source/`), reworked into a self-contained `BTreeMap`-based
//! structure in the style of the crate's other in-memory index structures
//! ([`crate::vfs`]'s name/order indices).

use std::collections::BTreeMap;

use tracing::trace;

/// One allocated span, in block units (not bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: u64,
    pub blocks: u64,
}

impl Span {
    pub fn end(&self) -> u64 {
        self.offset + self.blocks
    }
}

/// Tracks which block ranges of a content stream are occupied, supporting
/// both best-fit placement of new spans and fixed-position placement (used
/// when loading an archive and honoring the offsets already on disk).
#[derive(Debug, Default)]
pub struct BlockAllocator {
    /// offset -> blocks, kept sorted by offset for fast neighbor lookups.
    occupied: BTreeMap<u64, u64>,
}

impl BlockAllocator {
    pub fn new() -> Self {
        Self {
            occupied: BTreeMap::new(),
        }
    }

    /// Total blocks spanned from block 0 to the end of the last occupied
    /// span; this is what callers write as the archive's total block count.
    pub fn span_size(&self) -> u64 {
        self.occupied
            .iter()
            .map(|(&off, &len)| off + len)
            .max()
            .unwrap_or(0)
    }

    /// Finds the smallest free gap that fits `blocks`, preferring the
    /// leftmost (lowest-offset) fit of equal size: a best-fit policy with a
    /// deterministic tie-break, so re-running allocation against the same
    /// occupancy set always yields the same placement.
    pub fn find_space(&mut self, blocks: u64) -> u64 {
        let mut best: Option<(u64, u64)> = None; // (gap_size, gap_start)
        let mut cursor = 0u64;
        for (&offset, &len) in self.occupied.iter() {
            if offset > cursor {
                let gap = offset - cursor;
                if gap >= blocks && best.map(|(g, _)| gap < g).unwrap_or(true) {
                    best = Some((gap, cursor));
                }
            }
            cursor = cursor.max(offset + len);
        }
        let placement = match best {
            Some((_, start)) => start,
            None => cursor,
        };
        self.occupied.insert(placement, blocks);
        trace!(placement, blocks, "block allocator: best-fit placement");
        placement
    }

    /// Reserves an exact offset, used when reconstructing the allocator
    /// state from an on-disk layout at load time. Returns `false` (and
    /// does not reserve) if the requested range overlaps an existing one;
    /// callers should treat that as corruption or re-place the entry via
    /// [`BlockAllocator::find_space`] instead.
    pub fn obtain_space_at(&mut self, offset: u64, blocks: u64) -> bool {
        if blocks == 0 {
            return true;
        }
        let end = offset + blocks;
        for (&existing_off, &existing_len) in self.occupied.range(..end) {
            let existing_end = existing_off + existing_len;
            if existing_off < end && offset < existing_end {
                return false;
            }
        }
        self.occupied.insert(offset, blocks);
        trace!(offset, blocks, "block allocator: fixed placement");
        true
    }

    pub fn put_block(&mut self, offset: u64, blocks: u64) {
        self.occupied.insert(offset, blocks);
    }

    pub fn remove_block(&mut self, offset: u64) {
        self.occupied.remove(&offset);
    }

    /// Changes the recorded size of an already-placed span without moving
    /// it; used after an in-place entry grows/shrinks but still fits
    /// without colliding with its neighbors (checked by the caller via
    /// [`BlockAllocator::space_available_at`]).
    pub fn set_block_size(&mut self, offset: u64, blocks: u64) {
        self.occupied.insert(offset, blocks);
    }

    /// Whether `blocks` additional blocks can be appended in place after
    /// `offset`'s current span without overlapping the next neighbor.
    pub fn space_available_at(&self, offset: u64, needed_blocks: u64) -> bool {
        if !self.occupied.contains_key(&offset) {
            return false;
        }
        let new_end = offset + needed_blocks;
        match self.occupied.range(offset + 1..).next() {
            Some((&next_off, _)) => new_end <= next_off,
            None => true,
        }
    }

    pub fn clear(&mut self) {
        self.occupied.clear();
    }

    pub fn spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.occupied.iter().map(|(&offset, &blocks)| Span { offset, blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit_prefers_smallest_gap() {
        let mut a = BlockAllocator::new();
        assert_eq!(a.find_space(10), 0);
        assert_eq!(a.find_space(10), 10);
        a.remove_block(0);
        // gap [0,10) now free alongside the tail; requesting 5 should use
        // the gap rather than extend the tail.
        assert_eq!(a.find_space(5), 0);
        assert_eq!(a.span_size(), 20);
    }

    #[test]
    fn fixed_placement_detects_overlap() {
        let mut a = BlockAllocator::new();
        assert!(a.obtain_space_at(100, 10));
        assert!(!a.obtain_space_at(105, 10));
        assert!(a.obtain_space_at(110, 10));
    }
}
