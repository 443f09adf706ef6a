//! Segmented linear memory.
//!
//! A `SegmentedMemory` presents the flat, growable byte space WebAssembly
//! expects while backing it with non-contiguous fixed-size segments that
//! are allocated on first touch. The same type also backs the operand-slot
//! arena, which is how frame entry gets its lazy stack allocation.
//!
//! Every byte range is reached through [`access`](SegmentedMemory::access),
//! the single choke point that bounds-checks, materializes segments and
//! drives the paging policy. A scalar access that straddles a segment
//! boundary is split into per-segment copies by the bulk helpers; `access`
//! itself only ever hands out a view into one segment.

use crate::paging::Pager;
use crate::segment::SegmentTable;
use crate::trap::{Result, Trap};

/// WebAssembly page size.
pub const WASM_PAGE_SIZE: usize = 65_536;

pub struct SegmentedMemory {
    segment_size: usize,
    /// Logical size in bytes; grows only.
    total_size: usize,
    num_pages: usize,
    max_pages: Option<usize>,
    table: SegmentTable,
    pager: Option<Box<dyn Pager>>,
    /// Physical capacity the eviction low-water mark is computed from.
    capacity: usize,
}

impl SegmentedMemory {
    /// A linear memory of `initial_pages` WebAssembly pages.
    pub fn new(segment_size: usize, initial_pages: usize, max_pages: Option<usize>) -> Result<Self> {
        let mut mem = SegmentedMemory {
            segment_size,
            total_size: 0,
            num_pages: 0,
            max_pages,
            table: SegmentTable::new(segment_size),
            pager: None,
            capacity: 0,
        };
        mem.grow(initial_pages)?;
        Ok(mem)
    }

    /// A fixed-size arena (used for the operand-slot stack). Not page
    /// granular and never grown.
    pub fn with_byte_size(segment_size: usize, bytes: usize) -> Result<Self> {
        let mut mem = SegmentedMemory {
            segment_size,
            total_size: bytes,
            num_pages: 0,
            max_pages: None,
            table: SegmentTable::new(segment_size),
            pager: None,
            capacity: 0,
        };
        mem.table.ensure_capacity(bytes.div_ceil(segment_size))?;
        Ok(mem)
    }

    /// Install a paging backend. `capacity` is the physical-memory figure
    /// the quarter-capacity low-water mark is derived from.
    pub fn set_pager(&mut self, pager: Box<dyn Pager>, capacity: usize) {
        self.pager = Some(pager);
        self.capacity = capacity;
    }

    pub fn size(&self) -> usize {
        self.total_size
    }

    pub fn pages(&self) -> usize {
        self.num_pages
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn num_segments(&self) -> usize {
        self.table.len()
    }

    pub fn table(&self) -> &SegmentTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut SegmentTable {
        &mut self.table
    }

    /// Grow by `delta` pages, returning the previous page count. On
    /// failure nothing changes; the `MemGrow` instruction maps the error
    /// to the wasm-visible `-1`.
    pub fn grow(&mut self, delta: usize) -> Result<usize> {
        let old_pages = self.num_pages;
        if delta == 0 {
            return Ok(old_pages);
        }
        let new_pages = old_pages + delta;
        if let Some(max) = self.max_pages {
            if new_pages > max {
                return Err(Trap::AllocationFailed("memory page limit"));
            }
        }
        let new_total = new_pages
            .checked_mul(WASM_PAGE_SIZE)
            .ok_or(Trap::AllocationFailed("memory size overflow"))?;

        // Only the descriptor array grows here; segment buffers stay lazy.
        self.table.ensure_capacity(new_total.div_ceil(self.segment_size))?;

        self.num_pages = new_pages;
        self.total_size = new_total;
        Ok(old_pages)
    }

    /// The single choke point for reaching linear memory.
    ///
    /// Bounds-checks `offset..offset+len` against the logical size,
    /// materializes every segment the range covers (page-in or allocate;
    /// a failure anywhere aborts the whole access), records the accesses
    /// and runs the eviction policy. The returned view starts at `offset`
    /// but is truncated at the end of the first segment; callers needing
    /// the full range iterate, as the bulk helpers below do.
    pub fn access(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.total_size)
            .ok_or(Trap::OutOfBounds {
                offset: offset as u64,
                len: len as u64,
                size: self.total_size as u64,
            })?;

        if len == 0 {
            return Ok(&mut []);
        }

        let first = offset / self.segment_size;
        let last = (end - 1) / self.segment_size;

        for index in first..=last {
            self.table.materialize(index, &mut self.pager)?;
        }
        for index in first..=last {
            self.table.touch(index);
        }
        if self.pager.is_some() {
            self.table.evict_cold(first, self.capacity, &mut self.pager);
        }

        let seg_off = offset % self.segment_size;
        let take = len.min(self.segment_size - seg_off);
        let bytes = self
            .table
            .segment_mut(first)
            .bytes_mut()
            .ok_or(Trap::AllocationFailed("segment buffer"))?;
        Ok(&mut bytes[seg_off..seg_off + take])
    }

    // ── Bulk operations (segment-splitting) ──────────────────────────────

    pub fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let chunk = self.access(offset + pos, buf.len() - pos)?;
            let n = chunk.len();
            buf[pos..pos + n].copy_from_slice(chunk);
            pos += n;
        }
        Ok(())
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < data.len() {
            let chunk = self.access(offset + pos, data.len() - pos)?;
            let n = chunk.len();
            chunk.copy_from_slice(&data[pos..pos + n]);
            pos += n;
        }
        Ok(())
    }

    pub fn fill(&mut self, offset: usize, byte: u8, len: usize) -> Result<()> {
        let mut pos = 0;
        while pos < len {
            let chunk = self.access(offset + pos, len - pos)?;
            let n = chunk.len();
            chunk.fill(byte);
            pos += n;
        }
        Ok(())
    }

    /// Overlapping-safe copy within this memory (`memory.copy`).
    pub fn copy_within(&mut self, dst: usize, src: usize, len: usize) -> Result<()> {
        if len == 0 {
            // Still validate both ends.
            self.access(src, 0)?;
            self.access(dst, 0)?;
            return Ok(());
        }
        let mut tmp = Vec::new();
        tmp.try_reserve_exact(len)
            .map_err(|_| Trap::AllocationFailed("copy buffer"))?;
        tmp.resize(len, 0);
        self.read(src, &mut tmp)?;
        self.write(dst, &tmp)
    }

    // ── Typed accessors (little-endian) ──────────────────────────────────

    pub fn read_u8(&mut self, offset: usize) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(offset, &mut b)?;
        Ok(b[0])
    }

    pub fn read_u16(&mut self, offset: usize) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read(offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32(&mut self, offset: usize) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64(&mut self, offset: usize) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read(offset, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_f32(&mut self, offset: usize) -> Result<f32> {
        self.read_u32(offset).map(f32::from_bits)
    }

    pub fn read_f64(&mut self, offset: usize) -> Result<f64> {
        self.read_u64(offset).map(f64::from_bits)
    }

    pub fn write_u8(&mut self, offset: usize, val: u8) -> Result<()> {
        self.write(offset, &[val])
    }

    pub fn write_u16(&mut self, offset: usize, val: u16) -> Result<()> {
        self.write(offset, &val.to_le_bytes())
    }

    pub fn write_u32(&mut self, offset: usize, val: u32) -> Result<()> {
        self.write(offset, &val.to_le_bytes())
    }

    pub fn write_u64(&mut self, offset: usize, val: u64) -> Result<()> {
        self.write(offset, &val.to_le_bytes())
    }

    pub fn write_f32(&mut self, offset: usize, val: f32) -> Result<()> {
        self.write_u32(offset, val.to_bits())
    }

    pub fn write_f64(&mut self, offset: usize, val: f64) -> Result<()> {
        self.write_u64(offset, val.to_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> SegmentedMemory {
        SegmentedMemory::new(4096, 1, None).unwrap()
    }

    #[test]
    fn bounds_depend_on_logical_size_only() {
        let mut m = mem();
        // Nothing is physically backed yet, but the whole page is valid.
        assert!(m.access(WASM_PAGE_SIZE - 8, 8).is_ok());
        assert!(m.access(WASM_PAGE_SIZE - 8, 9).is_err());
        assert!(m.access(WASM_PAGE_SIZE, 1).is_err());
        assert!(m.access(usize::MAX, 2).is_err());
    }

    #[test]
    fn lazy_allocation_is_idempotent() {
        let mut m = mem();
        assert!(!m.table().segment(2).is_allocated());
        m.write_u32(2 * 4096 + 4, 0xDEAD_BEEF).unwrap();
        assert!(m.table().segment(2).is_allocated());
        let ptr = m.table().segment(2).bytes().unwrap().as_ptr();

        assert_eq!(m.read_u32(2 * 4096 + 4).unwrap(), 0xDEAD_BEEF);
        assert_eq!(m.table().segment(2).bytes().unwrap().as_ptr(), ptr);
    }

    #[test]
    fn untouched_segments_stay_unallocated() {
        let mut m = mem();
        m.write_u8(0, 1).unwrap();
        for i in 1..m.num_segments() {
            assert!(!m.table().segment(i).is_allocated(), "segment {i}");
        }
    }

    #[test]
    fn growth_is_monotonic() {
        let mut m = mem();
        assert_eq!(m.grow(0).unwrap(), 1);
        assert_eq!(m.size(), WASM_PAGE_SIZE);
        assert_eq!(m.grow(2).unwrap(), 1);
        assert_eq!(m.size(), 3 * WASM_PAGE_SIZE);
        assert_eq!(m.pages(), 3);
    }

    #[test]
    fn grow_respects_max_pages() {
        let mut m = SegmentedMemory::new(4096, 1, Some(2)).unwrap();
        assert!(m.grow(5).is_err());
        // Failed growth leaves everything unchanged.
        assert_eq!(m.pages(), 1);
        assert_eq!(m.size(), WASM_PAGE_SIZE);
    }

    #[test]
    fn write_after_grow_touches_only_its_segment() {
        let mut m = mem();
        m.grow(1).unwrap();
        m.write_u8(70_000, 0x5A).unwrap();
        assert_eq!(m.read_u8(70_000).unwrap(), 0x5A);
        assert!(m.table().segment(17).is_allocated());
        for i in 0..17 {
            assert!(!m.table().segment(i).is_allocated(), "segment {i}");
        }
    }

    #[test]
    fn scalar_access_straddles_segment_boundary() {
        let mut m = mem();
        let offset = 4096 - 2; // u32 spans segments 0 and 1
        m.write_u32(offset, 0x0102_0304).unwrap();
        assert_eq!(m.read_u32(offset).unwrap(), 0x0102_0304);
        assert!(m.table().segment(0).is_allocated());
        assert!(m.table().segment(1).is_allocated());
        // The raw view stops at the segment edge.
        assert_eq!(m.access(offset, 4).unwrap().len(), 2);
    }

    #[test]
    fn fill_crosses_segments() {
        let mut m = mem();
        m.fill(4000, 0xEE, 200).unwrap();
        for off in [4000, 4095, 4096, 4199] {
            assert_eq!(m.read_u8(off).unwrap(), 0xEE);
        }
        assert_eq!(m.read_u8(4200).unwrap(), 0);
    }

    #[test]
    fn copy_within_handles_overlap() {
        let mut m = mem();
        let data: Vec<u8> = (0..100).collect();
        m.write(10, &data).unwrap();
        m.copy_within(50, 10, 100).unwrap();
        let mut out = vec![0u8; 100];
        m.read(50, &mut out).unwrap();
        assert_eq!(out, data);
    }
}
