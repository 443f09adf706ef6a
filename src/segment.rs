//! Segment descriptors and the paging decision.
//!
//! The table is the single source of truth for which parts of a linear
//! memory are materialized in RAM. Descriptors are cheap; the backing
//! buffers are allocated only on first touch and may later be evicted to
//! secondary storage by [`evict_cold`](SegmentTable::evict_cold).

use log::{info, warn};

use crate::paging::Pager;
use crate::trap::{Result, Trap};

/// EWMA smoothing factor for `usage_frequency`.
const FREQUENCY_ALPHA: f32 = 0.3;

/// One fixed-size block of backing storage.
///
/// Invariants: `is_paged` implies `data.is_none()`; when present, `data`
/// is exactly `segment_size` bytes.
#[derive(Debug, Default)]
pub struct Segment {
    data: Option<Box<[u8]>>,
    /// Content currently lives only in secondary storage.
    pub is_paged: bool,
    /// A page file exists for this segment (possibly stale).
    pub has_page: bool,
    /// Dirty since the last page-out.
    pub is_modified: bool,
    pub access_count: u32,
    /// Logical timestamp of the last touch.
    pub last_access: u64,
    /// Exponentially-weighted moving average of `access_count`.
    pub usage_frequency: f32,
}

impl Segment {
    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }

    fn reset(&mut self) {
        *self = Segment::default();
    }
}

/// Descriptor array plus usage statistics for one memory instance.
#[derive(Debug)]
pub struct SegmentTable {
    segments: Vec<Segment>,
    segment_size: usize,
    /// Logical clock backing `last_access`.
    clock: u64,
    /// Treat every access as a modification. Matches the conservative
    /// behaviour needed when reads hand out writable views.
    pub dirty_on_access: bool,
    pub page_faults: u32,
    pub page_writes: u32,
    pub avg_frequency: f32,
    pub hot_segments: u32,
}

impl SegmentTable {
    pub fn new(segment_size: usize) -> Self {
        SegmentTable {
            segments: Vec::new(),
            segment_size,
            clock: 0,
            dirty_on_access: true,
            page_faults: 0,
            page_writes: 0,
            avg_frequency: 0.0,
            hot_segments: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment(&self, index: usize) -> &Segment {
        &self.segments[index]
    }

    pub fn segment_mut(&mut self, index: usize) -> &mut Segment {
        &mut self.segments[index]
    }

    /// Grow the descriptor array to hold at least `count` entries. New
    /// descriptors start unallocated. On failure the table is unchanged.
    pub fn ensure_capacity(&mut self, count: usize) -> Result<()> {
        if count <= self.segments.len() {
            return Ok(());
        }
        self.segments
            .try_reserve(count - self.segments.len())
            .map_err(|_| Trap::AllocationFailed("segment descriptor array"))?;
        self.segments.resize_with(count, Segment::default);
        Ok(())
    }

    /// Allocate the backing buffer for one segment, zero-filled. A no-op
    /// for an already-allocated segment.
    pub fn allocate(&mut self, index: usize) -> Result<()> {
        let size = self.segment_size;
        let seg = &mut self.segments[index];
        if seg.data.is_some() {
            return Ok(());
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| Trap::AllocationFailed("segment buffer"))?;
        buf.resize(size, 0);
        seg.data = Some(buf.into_boxed_slice());
        Ok(())
    }

    /// Make a segment resident: fault it back in if paged out, allocate
    /// it if it was never touched. A page-in failure is a hard error.
    pub fn materialize(
        &mut self,
        index: usize,
        pager: &mut Option<Box<dyn Pager>>,
    ) -> Result<()> {
        if self.segments[index].is_paged {
            self.allocate(index)?;
            let seg = &mut self.segments[index];
            let buf = seg
                .data
                .as_deref_mut()
                .ok_or(Trap::AllocationFailed("segment buffer"))?;
            let pager = pager.as_mut().ok_or(Trap::PageInFailed(index as u32))?;
            if let Err(err) = pager.page_in(index as u32, buf) {
                warn!("page-in of segment {index} failed: {err}");
                self.segments[index].data = None;
                self.page_faults += 1;
                return Err(Trap::PageInFailed(index as u32));
            }
            let seg = &mut self.segments[index];
            seg.is_paged = false;
            seg.is_modified = false;
            Ok(())
        } else {
            self.allocate(index)
        }
    }

    /// Record an access: bump the EWMA, restart the per-window counter,
    /// stamp the logical clock.
    pub fn touch(&mut self, index: usize) {
        self.clock += 1;
        let clock = self.clock;
        let seg = &mut self.segments[index];
        seg.usage_frequency = FREQUENCY_ALPHA * seg.access_count as f32
            + (1.0 - FREQUENCY_ALPHA) * seg.usage_frequency;
        seg.access_count = 1;
        seg.last_access = clock;
        if self.dirty_on_access {
            seg.is_modified = true;
        }
    }

    pub fn mark_modified(&mut self, index: usize) {
        self.segments[index].is_modified = true;
    }

    /// Reset a segment to its untouched state, dropping its buffer and
    /// any persisted page.
    pub fn deallocate(&mut self, index: usize, pager: &mut Option<Box<dyn Pager>>) {
        if self.segments[index].has_page {
            if let Some(p) = pager.as_mut() {
                p.discard(index as u32);
            }
        }
        self.segments[index].reset();
    }

    /// Deallocate and compact: every later descriptor shifts down one
    /// index. O(n); callers must not hold indices across this.
    pub fn remove(&mut self, index: usize, pager: &mut Option<Box<dyn Pager>>) {
        self.deallocate(index, pager);
        self.segments.remove(index);
    }

    /// Paging policy: when available memory drops below a quarter of
    /// `capacity`, evict segments colder than the running average, except
    /// `hot`, the segment just touched. Page-out failures are soft.
    pub fn evict_cold(
        &mut self,
        hot: usize,
        capacity: usize,
        pager: &mut Option<Box<dyn Pager>>,
    ) {
        let Some(pager) = pager.as_mut() else {
            return;
        };
        let low_water = capacity / 4;

        let mut total_frequency = 0.0f32;
        self.hot_segments = 0;

        for index in 0..self.segments.len() {
            let freq = self.segments[index].usage_frequency;
            total_frequency += freq;
            if freq > self.avg_frequency {
                self.hot_segments += 1;
            }

            // The just-touched segment is never an eviction candidate.
            if index == hot {
                continue;
            }

            if pager.available_memory() >= low_water {
                continue;
            }

            let seg = &self.segments[index];
            if seg.is_allocated() && !seg.is_paged && seg.usage_frequency < self.avg_frequency {
                let data = self.segments[index].data.take().unwrap_or_default();
                match pager.page_out(index as u32, &data) {
                    Ok(()) => {
                        let seg = &mut self.segments[index];
                        seg.is_paged = true;
                        seg.has_page = true;
                        seg.is_modified = false;
                        self.page_writes += 1;
                        info!("evicted cold segment {index}");
                    }
                    Err(err) => {
                        // Soft failure: keep the segment resident.
                        self.segments[index].data = Some(data);
                        self.page_faults += 1;
                        warn!("page-out of segment {index} failed: {err}");
                    }
                }
            }
        }

        if !self.segments.is_empty() {
            self.avg_frequency = total_frequency / self.segments.len() as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: usize) -> SegmentTable {
        let mut t = SegmentTable::new(64);
        t.ensure_capacity(n).unwrap();
        t
    }

    #[test]
    fn allocate_is_idempotent() {
        let mut t = table(2);
        t.allocate(0).unwrap();
        let first = t.segment(0).bytes().unwrap().as_ptr();
        t.allocate(0).unwrap();
        assert_eq!(t.segment(0).bytes().unwrap().as_ptr(), first);
        assert!(!t.segment(1).is_allocated());
    }

    #[test]
    fn allocate_zero_fills() {
        let mut t = table(1);
        t.allocate(0).unwrap();
        assert!(t.segment(0).bytes().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn touch_updates_ewma() {
        let mut t = table(1);
        t.segment_mut(0).access_count = 10;
        t.touch(0);
        let seg = t.segment(0);
        assert!((seg.usage_frequency - 3.0).abs() < 1e-6);
        assert_eq!(seg.access_count, 1);
        assert_eq!(seg.last_access, 1);
        assert!(seg.is_modified);
    }

    #[test]
    fn remove_compacts() {
        let mut t = table(3);
        t.segment_mut(2).access_count = 99;
        t.remove(1, &mut None);
        assert_eq!(t.len(), 2);
        assert_eq!(t.segment(1).access_count, 99);
    }

    #[test]
    fn ensure_capacity_never_shrinks() {
        let mut t = table(4);
        t.ensure_capacity(2).unwrap();
        assert_eq!(t.len(), 4);
    }
}
