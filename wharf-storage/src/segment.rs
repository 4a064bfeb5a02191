// Copyright 2025 wharf Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The segment pool: bookkeeping for one mmap'd extent treated as a
//! self-managed heap.
//!
//! Segments tile the mapped chunks of the extent with no gaps or overlaps.
//! A segment is either handed out (in the used set) or free (in exactly one
//! size-class bucket); address-adjacent free segments are always merged, so
//! freeing touches at most one neighbor on each side.
//!
//! Records live in an arena addressed by stable [`SegmentId`] indices. The
//! order index is keyed by backing-file offset; coalescing additionally
//! requires virtual-address adjacency, since separately mapped chunks need
//! not be contiguous in memory.

use std::collections::{BTreeMap, HashSet, VecDeque};

use wharf_common::bits;

/// Stable index of a segment record within its pool.
pub(crate) type SegmentId = usize;

/// Number of size-class buckets; the last one is the unbounded catch-all.
pub(crate) const NBUCKET: usize = 32;

#[derive(Debug)]
struct Segment {
    /// Virtual address of the first byte.
    addr: usize,
    /// Backing-file offset of the first byte.
    offset: u64,
    len: usize,
    allocated: bool,
    /// The free bucket holding this segment, when free.
    bucket: Option<usize>,
}

/// A copied-out view of one segment's placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentView {
    pub addr: usize,
    pub offset: u64,
    pub len: usize,
}

#[derive(Debug)]
pub(crate) struct SegmentPool {
    page_size: usize,
    /// Arena of records; `None` slots are recycled through `spare`.
    slots: Vec<Option<Segment>>,
    spare: Vec<SegmentId>,
    /// All segments of the extent in ascending offset order.
    order: BTreeMap<u64, SegmentId>,
    /// Size-class free lists, most recently freed first.
    buckets: Vec<VecDeque<SegmentId>>,
    used: HashSet<SegmentId>,
    /// Total bytes under management, the sum of all segment lengths.
    capacity: usize,
}

impl SegmentPool {
    pub(crate) fn new(page_size: usize) -> Self {
        assert!(bits::is_pow2(page_size));
        Self {
            page_size,
            slots: Vec::new(),
            spare: Vec::new(),
            order: BTreeMap::new(),
            buckets: (0..NBUCKET).map(|_| VecDeque::new()).collect(),
            used: HashSet::new(),
            capacity: 0,
        }
    }

    /// Insert a freshly mapped chunk as an allocated segment, then free it
    /// so it coalesces with whatever chunks it abuts.
    pub(crate) fn insert_chunk(&mut self, addr: usize, offset: u64, len: usize) {
        assert!(len > 0);
        assert!(bits::is_aligned(self.page_size, len));
        assert!(bits::is_aligned(self.page_size as u64, offset));

        let id = self.new_record(Segment {
            addr,
            offset,
            len,
            allocated: true,
            bucket: None,
        });
        let clash = self.order.insert(offset, id);
        assert!(clash.is_none(), "chunk overlaps existing segment at offset {offset}");
        self.used.insert(id);
        self.capacity += len;
        self.free(id);
    }

    /// Take a segment of exactly `len` bytes, splitting a larger free
    /// segment from the front if no exact-size one exists.
    ///
    /// `len` must be a positive page multiple. `None` means exhaustion; the
    /// caller decides whether to drive eviction and retry.
    pub(crate) fn allocate(&mut self, len: usize) -> Option<SegmentId> {
        assert!(len > 0);
        assert!(bits::is_aligned(self.page_size, len));

        let start = self.bucket_index(len);
        let mut candidate = None;
        for b in start..NBUCKET {
            candidate = if b < NBUCKET - 1 {
                // Every segment in an exact-class bucket is big enough.
                self.buckets[b].front().copied()
            } else {
                // The catch-all holds mixed sizes, first fit in recency order.
                self.buckets[b].iter().copied().find(|&id| self.slot(id).len >= len)
            };
            if candidate.is_some() {
                break;
            }
        }
        let id = candidate?;
        self.unlink_free(id);

        let view = self.view(id);
        if view.len == len {
            self.slot_mut(id).allocated = true;
            self.used.insert(id);
            tracing::trace!("[segment pool]: allocate {id} len {len} exact");
            return Some(id);
        }

        // Split from the front: the first `len` bytes become the allocated
        // segment, the remainder stays free and is re-bucketed by its new
        // length.
        let front = self.new_record(Segment {
            addr: view.addr,
            offset: view.offset,
            len,
            allocated: true,
            bucket: None,
        });
        {
            let rest = self.slot_mut(id);
            rest.addr += len;
            rest.offset += len as u64;
            rest.len -= len;
        }
        let replaced = self.order.insert(view.offset, front);
        debug_assert_eq!(replaced, Some(id));
        let clash = self.order.insert(view.offset + len as u64, id);
        debug_assert!(clash.is_none());
        self.push_free(id);
        self.used.insert(front);
        tracing::trace!("[segment pool]: allocate {front} len {len} split from {id}");
        Some(front)
    }

    /// Return a segment to the free lists, merging with any free
    /// address-adjacent neighbor.
    ///
    /// The returned id names the surviving record (the predecessor absorbs
    /// this segment when merging backwards).
    pub(crate) fn free(&mut self, id: SegmentId) -> SegmentId {
        let removed = self.used.remove(&id);
        assert!(removed, "freeing segment {id} that is not in use");
        assert!(self.slot(id).allocated);
        self.slot_mut(id).allocated = false;

        let mut id = id;
        let view = self.view(id);

        // Merge the successor into this segment.
        if let Some((&succ_offset, &succ)) = self.order.range(view.offset + 1..).next() {
            let s = self.slot(succ);
            if !s.allocated && s.addr == view.addr + view.len && s.offset == view.offset + view.len as u64 {
                let grow = s.len;
                self.unlink_free(succ);
                self.order.remove(&succ_offset);
                self.slot_mut(id).len += grow;
                self.recycle(succ);
                tracing::trace!("[segment pool]: merged {succ} forward into {id}");
            }
        }

        // Merge this segment into its predecessor.
        let view = self.view(id);
        if let Some((_, &pred)) = self.order.range(..view.offset).next_back() {
            let p = self.slot(pred);
            if !p.allocated && view.addr == p.addr + p.len && view.offset == p.offset + p.len as u64 {
                self.unlink_free(pred);
                self.order.remove(&view.offset);
                self.slot_mut(pred).len += view.len;
                self.recycle(id);
                tracing::trace!("[segment pool]: merged {id} backward into {pred}");
                id = pred;
            }
        }

        self.push_free(id);
        id
    }

    /// Shrink an allocated segment to `len` bytes, releasing the tail.
    ///
    /// The tail is split off after the segment and freed through the normal
    /// path so it coalesces with whatever follows it.
    pub(crate) fn trim(&mut self, id: SegmentId, len: usize) {
        assert!(len > 0);
        assert!(bits::is_aligned(self.page_size, len));
        assert!(self.used.contains(&id), "trimming segment {id} that is not in use");
        let view = self.view(id);
        assert!(len < view.len, "trim must shrink: {len} >= {}", view.len);

        let tail = self.new_record(Segment {
            addr: view.addr + len,
            offset: view.offset + len as u64,
            len: view.len - len,
            allocated: true,
            bucket: None,
        });
        self.slot_mut(id).len = len;
        let clash = self.order.insert(view.offset + len as u64, tail);
        debug_assert!(clash.is_none());
        self.used.insert(tail);
        tracing::trace!("[segment pool]: trim {id} to {len}, tail {tail}");
        self.free(tail);
    }

    pub(crate) fn view(&self, id: SegmentId) -> SegmentView {
        let seg = self.slot(id);
        SegmentView {
            addr: seg.addr,
            offset: seg.offset,
            len: seg.len,
        }
    }

    /// Number of live segment records.
    pub(crate) fn segments(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn bucket_index(&self, len: usize) -> usize {
        (len / self.page_size).min(NBUCKET - 1)
    }

    fn slot(&self, id: SegmentId) -> &Segment {
        self.slots[id].as_ref().expect("stale segment id")
    }

    fn slot_mut(&mut self, id: SegmentId) -> &mut Segment {
        self.slots[id].as_mut().expect("stale segment id")
    }

    fn new_record(&mut self, seg: Segment) -> SegmentId {
        match self.spare.pop() {
            Some(id) => {
                self.slots[id] = Some(seg);
                id
            }
            None => {
                self.slots.push(Some(seg));
                self.slots.len() - 1
            }
        }
    }

    fn recycle(&mut self, id: SegmentId) {
        self.slots[id] = None;
        self.spare.push(id);
    }

    fn push_free(&mut self, id: SegmentId) {
        let seg = self.slot(id);
        debug_assert!(!seg.allocated);
        debug_assert!(seg.bucket.is_none());
        let b = self.bucket_index(seg.len);
        self.slot_mut(id).bucket = Some(b);
        // Most recently freed first, so reuse favors the warm end of the
        // working set.
        self.buckets[b].push_front(id);
    }

    fn unlink_free(&mut self, id: SegmentId) {
        let b = self.slot_mut(id).bucket.take().expect("segment not in a free bucket");
        let pos = self.buckets[b]
            .iter()
            .position(|&x| x == id)
            .expect("segment missing from its bucket");
        self.buckets[b].remove(pos);
    }
}
