//! # FreeLUT Physical Page Allocator
//!
//! O(1)-hot-path frame allocator over a flat physical address space. Two
//! structures carry all state:
//!
//! - the [frame bitmap](crate::bitmap::FrameBitmap) (1 = free, 0 = taken),
//! - a doubly-linked list of **free runs** whose headers live inside the
//!   free frames themselves, anchored by the 255
//!   [size buckets](crate::lut).
//!
//! A run `[first, last]` stores `+len` at `first` and, for multi-frame runs,
//! `-len` at `last`, so "given any endpoint frame, find the run start" is a
//! single read. Empty buckets skip forward: bucket `b` always points at the
//! first run of the lowest non-empty bucket ≥ `b`, which keeps every lookup
//! at one head-dereference plus at most one short chain walk.
//!
//! The allocator's own footprint (state header, bitmap words, canonical
//! memory map) is reserved at the **top** of the largest usable region, so
//! the low frames stay available to callers from the first allocation on.
//!
//! All physical memory is reached through a [`PhysMapper`]; the allocator
//! itself never dereferences a physical address directly.

use crate::bitmap::FrameBitmap;
use crate::lut;
use crate::memory_map::{
    self, LOW_RESERVED, MemoryMapSource, NULL_GUARD_REGION, Region, RegionKind, TRAMPOLINE_REGION,
};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};
use kernel_vmem::{FrameSource, PhysMapper};
use log::debug;

/// Snapshot of the allocator's counters.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct PmmStats {
    /// Base of the allocator's reserved footprint.
    pub address: PhysicalAddress,
    /// Frames consumed by the allocator itself.
    pub footprint_pages: u64,
    /// End of the last usable-now region.
    pub last_usable_addr: PhysicalAddress,
    /// End of the last region of any kind.
    pub last_phys_addr: PhysicalAddress,
    /// Frames currently handed out to callers.
    pub pages_taken: u64,
    /// Frames currently free.
    pub pages_free: u64,
    /// Allocation attempts (including failed ones).
    pub alloc_calls: u64,
    /// Effective free calls (no-op frees are not counted).
    pub free_calls: u64,
}

/// Header written in-place into the endpoint frames of a free run.
///
/// `count` is `+len` at the first frame and `-len` at the last frame of
/// multi-frame runs. `prev`/`next` are physical addresses of neighboring run
/// headers in the global list (0 = none; frame 0 is never free).
#[repr(C)]
struct RunHeader {
    count: i64,
    prev: u64,
    next: u64,
}

/// In-place allocator state at the base of the reserved footprint.
#[repr(C)]
struct StateHeader {
    stats: PmmStats,
    /// Canonical memory map storage (inside the footprint).
    map_base: u64,
    map_len: u64,
    bitmap: FrameBitmap,
    /// Last run header in the global list.
    tail: u64,
    /// Bucket heads; bucket `b` points at the first run with bucket ≥ `b`.
    buckets: [u64; lut::BUCKET_COUNT],
}

/// Opaque handle to an initialized allocator (the driver layer passes this
/// through its vtable).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PmmHandle(pub(crate) PhysicalAddress);

/// The FreeLUT physical page allocator.
///
/// Single-mutator: the caller serializes all `&mut self` operations (the
/// [global facade](crate::global) wraps this in the kernel-wide lock).
pub struct FreeLutPmm<'m, M: PhysMapper> {
    state: PhysicalAddress,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> FreeLutPmm<'m, M> {
    /// Initialize the allocator from the boot memory map.
    ///
    /// Reserves the footprint (state header + bitmap covering everything up
    /// to the last usable address + canonical map) at the top of the largest
    /// usable region, seeds the free list with every remaining usable
    /// fragment, and commits the canonical map with the null-guard and
    /// trampoline entries added.
    ///
    /// # Panics
    /// - If the map is unsorted, unaligned, truncates mid-iteration, or
    ///   does not declare the low three pages as usable RAM starting at
    ///   physical zero (see [`memory_map::validate`]).
    /// - If no usable region can host the footprint (out of memory this
    ///   early is unrecoverable).
    #[allow(clippy::too_many_lines)]
    pub fn init(mapper: &'m M, source: &dyn MemoryMapSource) -> Self {
        if let Err(e) = memory_map::validate(source) {
            panic!("invalid boot memory map: {e}");
        }
        let len = source.len();

        let mut last_phys = 0u64;
        let mut last_usable = 0u64;
        for i in 0..len {
            let region = Self::entry(source, i);
            last_phys = region.end().as_u64();
            if region.kind.is_usable_now() {
                last_usable = region.end().as_u64();
            }
        }
        let usable_frames = last_usable >> Size4K::SHIFT;

        let header_bytes = size_of::<StateHeader>() as u64;
        let bitmap_bytes = FrameBitmap::bytes_for(usable_frames);
        let map_bytes = (len as u64 + 3) * size_of::<Region>() as u64;
        let required = (header_bytes + bitmap_bytes + map_bytes + (Size4K::SIZE - 1))
            & !(Size4K::SIZE - 1);

        // Largest usable region, with the low guard pages withdrawn.
        let mut host: Option<(usize, Region)> = None;
        for i in 0..len {
            let Some(region) = Self::usable_clamped(source, i) else {
                continue;
            };
            if host.is_none_or(|(_, h)| region.size > h.size) {
                host = Some((i, region));
            }
        }
        let Some((host_index, host)) = host.filter(|(_, h)| h.size >= required) else {
            panic!(
                "cannot place physical allocator footprint of {} pages",
                required >> Size4K::SHIFT
            );
        };

        let base = PhysicalAddress::new(host.end().as_u64() - required);
        let bitmap_base = base + header_bytes;
        let map_base = bitmap_base + bitmap_bytes;

        // SAFETY: the footprint range was just carved out of a usable region.
        let hdr = unsafe { mapper.phys_to_mut::<StateHeader>(base) };
        *hdr = StateHeader {
            stats: PmmStats {
                address: base,
                footprint_pages: required >> Size4K::SHIFT,
                last_usable_addr: PhysicalAddress::new(last_usable),
                last_phys_addr: PhysicalAddress::new(last_phys),
                pages_taken: 0,
                pages_free: 0,
                alloc_calls: 0,
                free_calls: 0,
            },
            map_base: map_base.as_u64(),
            map_len: 0,
            bitmap: FrameBitmap::new(bitmap_base, usable_frames),
            tail: 0,
            buckets: [0; lut::BUCKET_COUNT],
        };
        hdr.bitmap.clear_all(mapper);

        let pmm = Self {
            state: base,
            mapper,
        };

        // Seed the free list; the regular coalescing path builds the runs.
        for i in 0..len {
            let Some(mut region) = Self::usable_clamped(source, i) else {
                continue;
            };
            if i == host_index {
                region.size = base.as_u64() - region.start.as_u64();
            }
            if region.size == 0 {
                continue;
            }
            pmm.release_frames(region.start.frame_index(), region.frames());
        }

        // Commit the canonical, sanitized map.
        pmm.push_map_entry(NULL_GUARD_REGION);
        pmm.push_map_entry(TRAMPOLINE_REGION);
        for i in 0..len {
            let mut region = Self::entry(source, i);
            if region.kind == RegionKind::Usable {
                if let Some(clamped) = Self::usable_clamped(source, i) {
                    region = clamped;
                } else {
                    continue;
                }
                region.kind = RegionKind::Taken;
            }
            if i == host_index {
                region.size = base.as_u64() - region.start.as_u64();
                if region.size != 0 {
                    pmm.push_map_entry(region);
                }
                pmm.push_map_entry(Region {
                    start: base,
                    size: required,
                    kind: RegionKind::Pmm,
                });
                continue;
            }
            if region.size != 0 {
                pmm.push_map_entry(region);
            }
        }

        debug!(
            "physical allocator: {} pages free, footprint {} pages at {}",
            pmm.hdr().stats.pages_free,
            required >> Size4K::SHIFT,
            base
        );
        pmm
    }

    /// Rebuild a handle produced by [`handle`](Self::handle).
    ///
    /// # Safety
    /// `handle` must come from an allocator initialized through the same
    /// physical mapping.
    #[inline]
    #[must_use]
    pub const unsafe fn from_handle(mapper: &'m M, handle: PmmHandle) -> Self {
        Self {
            state: handle.0,
            mapper,
        }
    }

    /// Opaque handle for the driver layer.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> PmmHandle {
        PmmHandle(self.state)
    }

    /// Allocate `count` contiguous frames, aligned to `2^align_bits` bytes,
    /// with the allocation ending at or below `below`.
    ///
    /// `align_bits` is clamped to ≥ 12; pass [`PhysicalAddress::MAX`] for an
    /// unbounded allocation. Returns the physical base of the first frame,
    /// or `None` when no run satisfies the request.
    pub fn alloc(
        &mut self,
        count: u64,
        align_bits: u8,
        below: PhysicalAddress,
    ) -> Option<PhysicalAddress> {
        if count == 0 || below.is_zero() {
            return None;
        }
        let align_bits = align_bits.max(12);
        self.hdr().stats.alloc_calls += 1;

        let align_frames = 1u64 << (align_bits - 12);
        let pad = align_frames - 1;

        let header = if below == PhysicalAddress::MAX {
            self.take_first_fit(count + pad)
        } else {
            self.take_first_fit_below(count + pad, below)
        };
        let header = header.or_else(|| {
            // A padded fit failed; scan for a run whose interior happens to
            // hold an aligned window of the exact size.
            if align_bits > 12 {
                self.take_first_aligned_fit(count, align_bits, below)
            } else {
                None
            }
        })?;

        let run_len = self.run(header).count as u64;
        let header_frame = header.frame_index();
        let last_run_frame = header_frame + run_len - 1;
        let first_frame = (header_frame + pad) & !pad;
        let last_frame = first_frame + count - 1;

        let hdr = self.hdr();
        hdr.bitmap.set_range(self.mapper, first_frame, last_frame, false);
        if header_frame != first_frame {
            self.write_run(header_frame, first_frame - 1);
            self.insert_run(header);
        }
        if last_frame != last_run_frame {
            self.write_run(last_frame + 1, last_run_frame);
            self.insert_run(PhysicalAddress::from_frame_index(last_frame + 1));
        }
        hdr.stats.pages_free -= count;
        hdr.stats.pages_taken += count;
        Some(PhysicalAddress::from_frame_index(first_frame))
    }

    /// Return `count` frames starting at `base` to the free list, merging
    /// with adjacent free runs.
    ///
    /// Freeing a null base or zero frames is a no-op, as is freeing a range
    /// whose first frame is already free. A partially-free tail truncates
    /// the range at the first free bit (free is idempotent).
    ///
    /// # Panics
    /// If `base` is not page-aligned.
    pub fn free(&mut self, base: PhysicalAddress, count: u64) {
        if base.is_zero() || count == 0 {
            return;
        }
        assert!(
            base.is_aligned::<Size4K>(),
            "free of unaligned physical address {base}"
        );

        let first = base.frame_index();
        let hdr = self.hdr();
        debug_assert!(first + count <= hdr.bitmap.frames());
        let last = first + count - 1;

        let free_bits = hdr.bitmap.count_free_in(self.mapper, first, last);
        if free_bits == count || hdr.bitmap.get(self.mapper, first) {
            return;
        }
        // Idempotent free: ignore everything past the first already-free bit.
        let count = match hdr.bitmap.first_free_in(self.mapper, first, last) {
            Some(frame) => frame - first,
            None => count,
        };

        hdr.stats.free_calls += 1;
        hdr.stats.pages_taken -= count;
        self.release_frames(first, count);
    }

    /// Convert every reclaimable region into free frames and pass-merge the
    /// canonical map.
    pub fn reclaim(&mut self) {
        let hdr = self.hdr();
        let map = self.map_storage();
        for region in &mut *map {
            if !region.kind.is_usable_now() {
                continue;
            }
            let (first, frames) = (region.start.frame_index(), region.frames());
            region.kind = RegionKind::Taken;
            self.release_frames(first, frames);
        }

        // Coalesce adjacent same-kind entries in place.
        let mut moved = 0usize;
        let mut prev = 0usize;
        for i in 1..map.len() {
            let entry = map[i];
            if entry.kind == map[prev].kind && entry.start == map[prev].end() {
                map[prev].size += entry.size;
                moved += 1;
            } else {
                map[i - moved] = entry;
                prev = i - moved;
            }
        }
        hdr.map_len -= moved as u64;
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> PmmStats {
        self.hdr().stats
    }

    /// Borrowed view of the canonical memory map.
    #[must_use]
    pub fn map(&self) -> &'m [Region] {
        let hdr = self.hdr();
        // SAFETY: the map storage lives inside the reserved footprint and
        // holds `map_len` entries written by this allocator.
        unsafe {
            let first = self
                .mapper
                .phys_to_mut::<Region>(PhysicalAddress::new(hdr.map_base));
            core::slice::from_raw_parts(&raw const *first, hdr.map_len as usize)
        }
    }

    // ---- memory map plumbing -------------------------------------------

    fn entry(source: &dyn MemoryMapSource, index: usize) -> Region {
        let Some(region) = source.entry(index) else {
            panic!("memory map callback failed at entry {index}");
        };
        region
    }

    /// Usable region `index` with the low guard pages withdrawn; `None` for
    /// non-usable entries and entries fully below the guard pages.
    fn usable_clamped(source: &dyn MemoryMapSource, index: usize) -> Option<Region> {
        let mut region = Self::entry(source, index);
        if region.kind != RegionKind::Usable {
            return None;
        }
        if region.start.as_u64() < LOW_RESERVED {
            let withdraw = LOW_RESERVED - region.start.as_u64();
            if region.size <= withdraw {
                return None;
            }
            region.start = PhysicalAddress::new(LOW_RESERVED);
            region.size -= withdraw;
        }
        Some(region)
    }

    fn push_map_entry(&self, region: Region) {
        let hdr = self.hdr();
        let slot = hdr.map_base + hdr.map_len * size_of::<Region>() as u64;
        // SAFETY: the slot lies inside the map storage sized for the boot
        // map plus the three synthesized entries.
        unsafe {
            *self.mapper.phys_to_mut::<Region>(PhysicalAddress::new(slot)) = region;
        }
        hdr.map_len += 1;
    }

    fn map_storage(&self) -> &'m mut [Region] {
        let hdr = self.hdr();
        // SAFETY: as in `map`, but the canonical map is mutated in place
        // (reclaim rewrites kinds and pass-merges).
        unsafe {
            let first = self
                .mapper
                .phys_to_mut::<Region>(PhysicalAddress::new(hdr.map_base));
            core::slice::from_raw_parts_mut(&raw mut *first, hdr.map_len as usize)
        }
    }

    // ---- in-place state access -----------------------------------------

    fn hdr(&self) -> &'m mut StateHeader {
        // SAFETY: `state` is the base of the reserved footprint.
        unsafe { self.mapper.phys_to_mut::<StateHeader>(self.state) }
    }

    fn run(&self, at: PhysicalAddress) -> &'m mut RunHeader {
        debug_assert!(at.is_aligned::<Size4K>());
        // SAFETY: run headers are only ever read/written inside frames the
        // bitmap marks free; those frames belong to the allocator.
        unsafe { self.mapper.phys_to_mut::<RunHeader>(at) }
    }

    /// Start-of-run for a header that may be a tail (`-len`) endpoint.
    fn run_start(&self, at: PhysicalAddress) -> PhysicalAddress {
        let count = self.run(at).count;
        if count >= 0 {
            at
        } else {
            PhysicalAddress::from_frame_index(at.frame_index() + (count + 1) as u64)
        }
    }

    /// Write the `+len` / `-len` endpoint headers for the run
    /// `[first, last]`.
    fn write_run(&self, first: u64, last: u64) {
        let count = (last - first + 1) as i64;
        let head = self.run(PhysicalAddress::from_frame_index(first));
        head.count = count;
        head.prev = 0;
        head.next = 0;
        if first != last {
            let tail = self.run(PhysicalAddress::from_frame_index(last));
            tail.count = -count;
            tail.prev = 0;
            tail.next = 0;
        }
    }

    // ---- free-run list (bucket discipline) -----------------------------

    /// Splice the run whose header sits at `at` into the bucket lists.
    fn insert_run(&self, at: PhysicalAddress) {
        let count = self.run(at).count as u64;
        let index = lut::floor_index(count) as usize;
        let hdr = self.hdr();

        let head = hdr.buckets[index];
        if head != 0 {
            // Splice before the bucket head and re-aim every lower bucket
            // that skip-forwarded to it.
            let other = self.run(PhysicalAddress::new(head));
            if other.prev != 0 {
                self.run(PhysicalAddress::new(other.prev)).next = at.as_u64();
            }
            let this = self.run(at);
            this.next = head;
            this.prev = other.prev;
            other.prev = at.as_u64();
            let mut i = index;
            loop {
                if hdr.buckets[i] != head {
                    break;
                }
                hdr.buckets[i] = at.as_u64();
                if i == 0 {
                    break;
                }
                i -= 1;
            }
            return;
        }

        // No run with bucket ≥ index exists: aim the empty buckets at this
        // run and append it at the global tail.
        let mut i = index;
        loop {
            if hdr.buckets[i] != 0 {
                break;
            }
            hdr.buckets[i] = at.as_u64();
            if i == 0 {
                break;
            }
            i -= 1;
        }
        if hdr.tail != 0 {
            self.run(PhysicalAddress::new(hdr.tail)).next = at.as_u64();
        }
        let this = self.run(at);
        this.prev = hdr.tail;
        this.next = 0;
        hdr.tail = at.as_u64();
    }

    /// Unlink the run whose header sits at `at` from the bucket lists.
    fn erase_run(&self, at: PhysicalAddress) {
        let count = self.run(at).count as u64;
        let index = lut::floor_index(count) as usize;
        let hdr = self.hdr();
        let (prev, next) = {
            let this = self.run(at);
            (this.prev, this.next)
        };

        if hdr.tail == at.as_u64() {
            hdr.tail = prev;
        }
        let mut i = index;
        loop {
            if hdr.buckets[i] != at.as_u64() {
                break;
            }
            hdr.buckets[i] = next;
            if i == 0 {
                break;
            }
            i -= 1;
        }
        if prev != 0 {
            self.run(PhysicalAddress::new(prev)).next = next;
        }
        if next != 0 {
            self.run(PhysicalAddress::new(next)).prev = prev;
        }
        let this = self.run(at);
        this.prev = 0;
        this.next = 0;
    }

    /// Pop the first run that can hold `count` frames.
    fn take_first_fit(&self, count: u64) -> Option<PhysicalAddress> {
        let hdr = self.hdr();
        if count == 1 {
            // Bucket 0 fast path: any run fits a single frame.
            let head = hdr.buckets[0];
            if head == 0 {
                return None;
            }
            let head = PhysicalAddress::new(head);
            self.erase_run(head);
            return Some(head);
        }

        let bucket = lut::ceil_index(count);
        let head = hdr.buckets[bucket as usize];
        if head != 0 && lut::value(bucket) >= count {
            // Every run filed at `bucket` or above fits; the head is it.
            let head = PhysicalAddress::new(head);
            self.erase_run(head);
            return Some(head);
        }

        // Either the head bucket is drained or `count` sits in an
        // exact-boundary hole; the previous bucket's chain still holds runs
        // that fit. Walk it (sorted into the bucket, so only short-enough
        // runs precede) up through whatever larger runs follow.
        let mut cur = hdr.buckets[bucket as usize - 1];
        while cur != 0 {
            let at = PhysicalAddress::new(cur);
            let run = self.run(at);
            if run.count as u64 >= count {
                self.erase_run(at);
                return Some(at);
            }
            cur = run.next;
        }
        None
    }

    /// Pop the first run holding `count` frames that end at or below
    /// `below`.
    fn take_first_fit_below(&self, count: u64, below: PhysicalAddress) -> Option<PhysicalAddress> {
        let limit = below.as_u64().checked_sub(count << Size4K::SHIFT)?;
        let hdr = self.hdr();
        // Start one bucket early: exact-boundary sizes also fit in runs the
        // previous bucket holds.
        let bucket = if count == 1 {
            0
        } else {
            lut::ceil_index(count) - 1
        };
        let mut cur = hdr.buckets[bucket as usize];
        while cur != 0 {
            let at = PhysicalAddress::new(cur);
            let run = self.run(at);
            if (count == 1 || run.count as u64 >= count) && cur <= limit {
                self.erase_run(at);
                return Some(at);
            }
            cur = run.next;
        }
        None
    }

    /// Pop the first run that contains an aligned `count`-frame window.
    fn take_first_aligned_fit(
        &self,
        count: u64,
        align_bits: u8,
        below: PhysicalAddress,
    ) -> Option<PhysicalAddress> {
        let mask = (1u64 << align_bits) - 1;
        let hdr = self.hdr();
        let mut cur = hdr.buckets[lut::floor_index(count) as usize];
        while cur != 0 {
            let at = PhysicalAddress::new(cur);
            let run = self.run(at);
            let aligned = (cur + mask) & !mask;
            let need = aligned + (count << Size4K::SHIFT);
            if need <= cur + ((run.count as u64) << Size4K::SHIFT)
                && (below == PhysicalAddress::MAX || need <= below.as_u64())
            {
                self.erase_run(at);
                return Some(at);
            }
            cur = run.next;
        }
        None
    }

    /// Mark `[first, first+count)` free and merge with adjacent runs.
    ///
    /// Shared by `free`, init seeding, and reclaim; adjusts `pages_free`
    /// only (callers account `pages_taken`).
    fn release_frames(&self, first: u64, count: u64) {
        let hdr = self.hdr();
        let last = first + count - 1;
        hdr.stats.pages_free += count;
        hdr.bitmap.set_range(self.mapper, first, last, true);

        let mut bottom = first;
        let mut total = count;
        if first > 0 && hdr.bitmap.get(self.mapper, first - 1) {
            let start = self.run_start(PhysicalAddress::from_frame_index(first - 1));
            bottom = start.frame_index();
            total += self.run(start).count as u64;
            self.erase_run(start);
        }
        if last + 1 < hdr.bitmap.frames() && hdr.bitmap.get(self.mapper, last + 1) {
            let start = PhysicalAddress::from_frame_index(last + 1);
            total += self.run(start).count as u64;
            self.erase_run(start);
        }
        self.write_run(bottom, bottom + total - 1);
        self.insert_run(PhysicalAddress::from_frame_index(bottom));
    }
}

impl<M: PhysMapper> FrameSource for FreeLutPmm<'_, M> {
    fn alloc_frames(&mut self, count: u64) -> Option<PhysicalAddress> {
        self.alloc(count, 12, PhysicalAddress::MAX)
    }

    fn free_frames(&mut self, base: PhysicalAddress, count: u64) {
        self.free(base, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestPhys;

    /// Map with a single usable region `[0, end)`; init withdraws the
    /// guard pages, so frames become allocatable from 0x3000 up.
    fn usable_map(end: u64) -> [Region; 1] {
        [Region::new(0, end, RegionKind::Usable)]
    }

    fn fixture(frames: usize, map: &[Region]) -> (TestPhys, PhysicalAddress) {
        let phys = TestPhys::with_frames(frames);
        let pmm = FreeLutPmm::init(&phys, &map);
        let state = pmm.handle().0;
        (phys, state)
    }

    fn pmm<'m>(phys: &'m TestPhys, state: PhysicalAddress) -> FreeLutPmm<'m, TestPhys> {
        unsafe { FreeLutPmm::from_handle(phys, PmmHandle(state)) }
    }

    #[test]
    fn footprint_reserved_at_top() {
        let (phys, state) = fixture(256, &usable_map(0x10_0000));
        let p = pmm(&phys, state);
        let stats = p.stats();
        // One footprint page at the top of the region.
        assert_eq!(stats.footprint_pages, 1);
        assert_eq!(stats.address.as_u64(), 0xFF000);
        assert_eq!(stats.last_usable_addr.as_u64(), 0x10_0000);
        assert_eq!(stats.last_phys_addr.as_u64(), 0x10_0000);
        assert_eq!(stats.pages_free, 252);
        assert_eq!(stats.pages_taken, 0);
    }

    #[test]
    fn two_allocation_fit_and_refit_after_free() {
        let (phys, state) = fixture(256, &usable_map(0x10_0000));
        let mut p = pmm(&phys, state);

        let a = p.alloc(4, 12, PhysicalAddress::MAX).unwrap();
        assert_eq!(a.as_u64(), 0x3000);
        let b = p.alloc(4, 12, PhysicalAddress::MAX).unwrap();
        assert_eq!(b.as_u64(), 0x7000);

        p.free(a, 4);
        p.free(b, 4);
        // The two blocks coalesced with each other (and the tail run), so
        // the doubled request fits at the original base again.
        let c = p.alloc(8, 12, PhysicalAddress::MAX).unwrap();
        assert_eq!(c.as_u64(), 0x3000);
    }

    #[test]
    fn aligned_allocation_two_mebibyte() {
        let (phys, state) = fixture(1024, &usable_map(0x40_0000));
        let mut p = pmm(&phys, state);
        let a = p.alloc(1, 21, PhysicalAddress::MAX).unwrap();
        // First 2 MiB-aligned frame at or above 0x3000.
        assert_eq!(a.as_u64(), 0x20_0000);
        // Both split residuals stayed allocatable.
        let low = p.alloc(1, 12, PhysicalAddress::new(0x5000)).unwrap();
        assert_eq!(low.as_u64(), 0x3000);
        let high = p.alloc(1, 12, PhysicalAddress::MAX).unwrap();
        assert!(high.as_u64() != a.as_u64() && high.as_u64() != low.as_u64());
        assert_eq!(p.stats().pages_taken, 3);
    }

    #[test]
    fn conservation_and_exact_restore() {
        let (phys, state) = fixture(256, &usable_map(0x10_0000));
        let mut p = pmm(&phys, state);
        let before = p.stats();

        let a = p.alloc(5, 12, PhysicalAddress::MAX).unwrap();
        let b = p.alloc(1, 12, PhysicalAddress::MAX).unwrap();
        let mid = p.stats();
        assert_eq!(mid.pages_free + mid.pages_taken, before.pages_free);
        assert_eq!(mid.pages_taken, 6);

        p.free(a, 5);
        p.free(b, 1);
        let after = p.stats();
        assert_eq!(after.pages_free, before.pages_free);
        assert_eq!(after.pages_taken, 0);
        assert_eq!(after.alloc_calls, before.alloc_calls + 2);
        assert_eq!(after.free_calls, before.free_calls + 2);

        // Full coalescence: the entire free space is one run again.
        let whole = p.alloc(after.pages_free, 12, PhysicalAddress::MAX).unwrap();
        assert_eq!(whole.as_u64(), 0x3000);
    }

    #[test]
    fn allocations_are_disjoint() {
        let (phys, state) = fixture(256, &usable_map(0x10_0000));
        let mut p = pmm(&phys, state);
        let mut blocks = Vec::new();
        for _ in 0..16 {
            blocks.push((p.alloc(3, 12, PhysicalAddress::MAX).unwrap(), 3u64));
        }
        for (i, (a, an)) in blocks.iter().enumerate() {
            for (b, bn) in blocks.iter().skip(i + 1) {
                let (a0, a1) = (a.as_u64(), a.as_u64() + an * 4096);
                let (b0, b1) = (b.as_u64(), b.as_u64() + bn * 4096);
                assert!(a1 <= b0 || b1 <= a0, "overlap: {a0:#x} vs {b0:#x}");
            }
        }
    }

    #[test]
    fn free_is_idempotent() {
        let (phys, state) = fixture(256, &usable_map(0x10_0000));
        let mut p = pmm(&phys, state);
        let a = p.alloc(4, 12, PhysicalAddress::MAX).unwrap();
        p.free(a, 4);
        let snapshot = p.stats();
        // Double free: first frame already free, whole call is a no-op.
        p.free(a, 4);
        let after = p.stats();
        assert_eq!(after.pages_free, snapshot.pages_free);
        assert_eq!(after.pages_taken, snapshot.pages_taken);
        assert_eq!(after.free_calls, snapshot.free_calls);
    }

    #[test]
    fn partial_free_truncates_at_first_free_bit() {
        let (phys, state) = fixture(256, &usable_map(0x10_0000));
        let mut p = pmm(&phys, state);
        let a = p.alloc(8, 12, PhysicalAddress::MAX).unwrap();
        // Free the middle, then "free" a span that runs into it: only the
        // leading still-taken frames are released.
        p.free(a + 4 * 4096, 2);
        let before = p.stats();
        p.free(a, 8);
        let after = p.stats();
        assert_eq!(after.pages_free, before.pages_free + 4);
        assert_eq!(after.pages_taken, before.pages_taken - 4);
        // The last two frames are still taken.
        p.free(a + 6 * 4096, 2);
        assert_eq!(p.stats().pages_taken, 0);
    }

    #[test]
    fn refit_merges_across_split_residual() {
        let (phys, state) = fixture(256, &usable_map(0x10_0000));
        let mut p = pmm(&phys, state);
        // Leave a 2-frame residual behind an aligned split, then free the
        // neighbors and verify the pieces merge without losing a run.
        let a = p.alloc(2, 12, PhysicalAddress::MAX).unwrap(); // 0x3000..0x5000
        let b = p.alloc(4, 14, PhysicalAddress::MAX).unwrap(); // aligned to 16 KiB
        assert_eq!(b.as_u64(), 0x8000);
        p.free(a, 2);
        p.free(b, 4);
        let free = p.stats().pages_free;
        let whole = p.alloc(free, 12, PhysicalAddress::MAX).unwrap();
        assert_eq!(whole.as_u64(), 0x3000);
    }

    #[test]
    fn single_frame_fast_path_drains_bucket_zero() {
        let phys = TestPhys::with_frames(16);
        // Tiny map: exactly one allocatable frame after the guard pages and
        // the footprint.
        let map = [Region::new(0, 0x5000, RegionKind::Usable)];
        let p = FreeLutPmm::init(&phys, &map.as_slice());
        let state = p.handle().0;
        let mut p = pmm(&phys, state);
        assert_eq!(p.stats().pages_free, 1);
        let a = p.alloc(1, 12, PhysicalAddress::MAX).unwrap();
        assert_eq!(a.as_u64(), 0x3000);
        assert!(p.alloc(1, 12, PhysicalAddress::MAX).is_none());
    }

    #[test]
    fn exact_fit_needs_contiguity() {
        let (phys, state) = fixture(256, &usable_map(0x10_0000));
        let mut p = pmm(&phys, state);
        let free = p.stats().pages_free;
        // Punch a hole so `free` frames exist but not contiguously.
        let hole = p.alloc(1, 13, PhysicalAddress::MAX).unwrap();
        assert!(p.alloc(free, 12, PhysicalAddress::MAX).is_none());
        p.free(hole, 1);
        assert!(p.alloc(free, 12, PhysicalAddress::MAX).is_some());
    }

    #[test]
    fn alloc_zero_and_oom() {
        let (phys, state) = fixture(256, &usable_map(0x10_0000));
        let mut p = pmm(&phys, state);
        assert!(p.alloc(0, 12, PhysicalAddress::MAX).is_none());
        assert!(p.alloc(1 << 20, 12, PhysicalAddress::MAX).is_none());
        // Failed attempts still count as calls.
        assert_eq!(p.stats().alloc_calls, 1);
    }

    #[test]
    fn alloc_below_respects_bound() {
        let (phys, state) = fixture(256, &usable_map(0x10_0000));
        let mut p = pmm(&phys, state);
        let a = p.alloc(2, 12, PhysicalAddress::new(0x8000)).unwrap();
        assert!(a.as_u64() + 2 * 4096 <= 0x8000);
        assert!(p.alloc(2, 12, PhysicalAddress::new(0x1000)).is_none());
    }

    #[test]
    fn canonical_map_and_reclaim() {
        let phys = TestPhys::with_frames(64);
        let map = [
            Region::new(0, 0x10000, RegionKind::Usable),
            Region::new(0x10000, 0x10000, RegionKind::Reclaimable),
            Region::new(0x20000, 0x10000, RegionKind::Usable),
        ];
        let p = FreeLutPmm::init(&phys, &map.as_slice());
        let state = p.handle().0;
        let mut p = pmm(&phys, state);

        let entries = p.map();
        assert_eq!(entries[0].kind, RegionKind::NullGuard);
        assert_eq!(entries[1].kind, RegionKind::Trampoline);
        assert_eq!(entries[2], Region::new(0x3000, 0xD000, RegionKind::Taken));
        assert_eq!(
            entries[3],
            Region::new(0x10000, 0x10000, RegionKind::Reclaimable)
        );
        assert_eq!(entries[4].kind, RegionKind::Taken);
        assert_eq!(entries[5].kind, RegionKind::Pmm);
        assert_eq!(entries[5].end().as_u64(), 0x30000);

        let before = p.stats();
        p.reclaim();
        let after = p.stats();
        assert_eq!(after.pages_free, before.pages_free + 16);

        // Reclaimed frames coalesced with both neighbors: everything from
        // 0x3000 up to the footprint is one run now.
        let a = p.alloc(after.pages_free, 12, PhysicalAddress::MAX).unwrap();
        assert_eq!(a.as_u64(), 0x3000);

        // Pass-merge collapsed the taken spans around the reclaimed one.
        let entries = p.map();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2].kind, RegionKind::Taken);
        assert_eq!(entries[2].start.as_u64(), 0x3000);
        assert_eq!(entries[3].kind, RegionKind::Pmm);
    }

    #[test]
    #[should_panic(expected = "invalid boot memory map")]
    fn init_panics_on_unsorted_map() {
        let phys = TestPhys::with_frames(64);
        let map = [
            Region::new(0, 0x4000, RegionKind::Usable),
            Region::new(0x10000, 0x4000, RegionKind::Usable),
            Region::new(0x8000, 0x4000, RegionKind::Usable),
        ];
        let _ = FreeLutPmm::init(&phys, &map.as_slice());
    }

    #[test]
    #[should_panic(expected = "invalid boot memory map")]
    fn init_panics_on_claimed_low_pages() {
        let phys = TestPhys::with_frames(64);
        let map = [
            Region::new(0x1000, 0x2000, RegionKind::Kernel),
            Region::new(0x3000, 0x20000, RegionKind::Usable),
        ];
        let _ = FreeLutPmm::init(&phys, &map.as_slice());
    }

    #[test]
    #[should_panic(expected = "cannot place physical allocator footprint")]
    fn init_panics_without_room_for_footprint() {
        let phys = TestPhys::with_frames(16);
        // Nothing left once the guard pages are withdrawn.
        let map = [Region::new(0, 0x3000, RegionKind::Usable)];
        let _ = FreeLutPmm::init(&phys, &map.as_slice());
    }
}
