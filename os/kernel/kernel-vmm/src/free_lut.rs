//! # FreeLUT Virtual Address-Space Allocator
//!
//! Manages one multi-level address space by maintaining **two** parallel
//! trees: the architectural page tables the MMU walks, and a shadow
//! [range table](crate::range_table) of the same shape tagging every slot
//! as free / sub-table / mapped / reserved / lazily-committed / on-disk.
//!
//! Free virtual ranges are [descriptors](crate::slab::RangeDescriptor) in
//! slab pages, filed into the same 255 size buckets as the physical
//! allocator's free runs ([`kernel_pmm::lut`]); every `Free` slot in the
//! range table points back at the descriptor covering it, which is what
//! makes pinned allocation (`alloc_at`) and merge-on-free O(depth) instead
//! of O(list length).
//!
//! Every frame the allocator consumes (table pairs, slab pages, committed
//! mappings) flows through one [`FrameSource`], so physical accounting
//! stays in the physical allocator.
//!
//! Single-mutator per address space: callers serialize all `&mut self`
//! operations.

use crate::flags::{AllocFlags, SizeClass};
use crate::range_table::{RangeEntry, RangeKind, RangeTable};
use crate::slab::{RangeDescriptor, SlabPage};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use kernel_pmm::lut;
use kernel_vmem::{
    FrameSource, PageEntry, PageKind, PageTable, PagingCaps, PhysMapper, Protect, table_index,
};
use log::warn;

/// Snapshot of the allocator's counters.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct VmmStats {
    /// Frames consumed internally (state, tables, slab pages).
    pub footprint_pages: u64,
    /// Virtual pages currently allocated.
    pub pages_allocated: u64,
    /// Pages with a committed physical frame.
    pub pages_mapped: u64,
    /// Pages whose content lives on secondary storage.
    pub pages_mapped_to_disk: u64,
    /// Allocation attempts (including failed ones).
    pub alloc_calls: u64,
    /// Effective free calls.
    pub free_calls: u64,
    /// Protection changes.
    pub protect_calls: u64,
    /// `map` / `map_linear` calls.
    pub map_calls: u64,
}

/// In-place allocator state (first page of the three-frame creation block).
#[repr(C)]
struct StateHeader {
    stats: VmmStats,
    /// Page-table depth.
    levels: u8,
    /// 1 GiB leaves available.
    use_1gib: bool,
    /// Root architectural page table.
    pt_root: u64,
    /// Root range table.
    rt_root: u64,
    /// Slab pages with free descriptor slots.
    free_slabs: u64,
    /// Fully-used slab pages.
    full_slabs: u64,
    /// Last descriptor in the global bucket-ordered list.
    tail: u64,
    /// Bucket heads; bucket `b` points at the first descriptor with
    /// bucket ≥ `b`.
    buckets: [u64; lut::BUCKET_COUNT],
}

/// Opaque handle to one address space (the driver layer passes this through
/// its vtable).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VmmHandle(pub(crate) PhysicalAddress);

/// The FreeLUT virtual address-space allocator.
pub struct FreeLutVmm<'m, M: PhysMapper> {
    state: PhysicalAddress,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> FreeLutVmm<'m, M> {
    /// Create a fresh address space.
    ///
    /// Allocates three frames (state + root page table + root range table),
    /// sizes the translatable range from `caps`, and files one free
    /// descriptor covering pages `[1, 2^(9·levels) − 2]` — the lowest and
    /// highest page stay out as guards.
    ///
    /// Returns `None` when the frame source cannot supply the three
    /// creation frames.
    pub fn create(
        mapper: &'m M,
        frames: &mut dyn FrameSource,
        caps: PagingCaps,
    ) -> Option<Self> {
        let block = frames.alloc_frames(3)?;
        let pt_root = block + Size4K::SIZE;
        let rt_root = block + 2 * Size4K::SIZE;

        // SAFETY: the three frames were just allocated for this state.
        unsafe {
            *mapper.phys_to_mut::<PageTable>(pt_root) = PageTable::zeroed();
            *mapper.phys_to_mut::<RangeTable>(rt_root) = RangeTable::zeroed();
            *mapper.phys_to_mut::<StateHeader>(block) = StateHeader {
                stats: VmmStats {
                    footprint_pages: 3,
                    pages_allocated: 0,
                    pages_mapped: 0,
                    pages_mapped_to_disk: 0,
                    alloc_calls: 0,
                    free_calls: 0,
                    protect_calls: 0,
                    map_calls: 0,
                },
                levels: caps.levels,
                use_1gib: caps.huge_1gib,
                pt_root: pt_root.as_u64(),
                rt_root: rt_root.as_u64(),
                free_slabs: 0,
                full_slabs: 0,
                tail: 0,
                buckets: [0; lut::BUCKET_COUNT],
            };
        }

        let vmm = Self {
            state: block,
            mapper,
        };
        let total = caps.total_pages();
        let seed = vmm.new_range(frames, 1, total - 2);
        vmm.mark_free_range(frames, seed);
        Some(vmm)
    }

    /// Rebuild a handle produced by [`handle`](Self::handle).
    ///
    /// # Safety
    /// `handle` must come from an address space created through the same
    /// physical mapping.
    #[inline]
    #[must_use]
    pub const unsafe fn from_handle(mapper: &'m M, handle: VmmHandle) -> Self {
        Self {
            state: handle.0,
            mapper,
        }
    }

    /// Opaque handle for the driver layer.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> VmmHandle {
        VmmHandle(self.state)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> VmmStats {
        self.hdr().stats
    }

    /// Root page table plus the paging shape, for handing to the
    /// architectural activation contract.
    #[must_use]
    pub fn root_table(&self) -> (PhysicalAddress, PagingCaps) {
        let hdr = self.hdr();
        (
            PhysicalAddress::new(hdr.pt_root),
            PagingCaps::new(hdr.levels, hdr.use_1gib),
        )
    }

    /// Install this address space's root table.
    ///
    /// # Safety
    /// See [`kernel_vmem::activate`]; additionally, every mapping the
    /// currently executing code relies on must exist in this space.
    pub unsafe fn activate(&self) {
        let (root, caps) = self.root_table();
        unsafe { kernel_vmem::activate(root, caps) }
    }

    /// Allocate `count` pages aligned to `2^align_bits` bytes.
    ///
    /// The alignment is raised to the minimum the requested page size
    /// implies; 1 GiB requests degrade to 2 MiB when unsupported. All slots
    /// are parked reserved (or lazily-committed with the auto-commit flag).
    /// Returns the virtual base, or `None` when no free range fits.
    pub fn alloc(
        &mut self,
        frames: &mut dyn FrameSource,
        count: u64,
        align_bits: u8,
        flags: AllocFlags,
    ) -> Option<VirtualAddress> {
        if count == 0 {
            return None;
        }
        let flags = self.degrade(flags);
        let align_bits = align_bits.max(flags.size().min_align_bits()).max(12);
        self.hdr().stats.alloc_calls += 1;

        let align_pages = 1u64 << (align_bits - 12);
        let pad = align_pages - 1;
        let desc_at = self
            .first_fit(count + pad)
            .or_else(|| self.first_aligned_fit(count, align_bits))?;

        let (range_first, range_count) = {
            let desc = self.desc(desc_at);
            (desc.start, desc.count)
        };
        let range_last = range_first + range_count - 1;
        let first = (range_first + pad) & !pad;
        let last = first + count - 1;

        self.erase_range(frames, desc_at);
        self.fill_used(frames, first, last, flags);
        if range_first != first {
            let head = self.new_range(frames, range_first, first - 1);
            self.mark_free_range(frames, head);
        }
        if last != range_last {
            let tail = self.new_range(frames, last + 1, range_last);
            self.mark_free_range(frames, tail);
        }
        self.hdr().stats.pages_allocated += count;
        Some(VirtualAddress::from_page_index(first))
    }

    /// Allocate `count` pages pinned at `vaddr`.
    ///
    /// Fails unless the whole target range lies within one free run.
    pub fn alloc_at(
        &mut self,
        frames: &mut dyn FrameSource,
        vaddr: VirtualAddress,
        count: u64,
        flags: AllocFlags,
    ) -> Option<VirtualAddress> {
        if count == 0 {
            return None;
        }
        let flags = self.degrade(flags);
        self.hdr().stats.alloc_calls += 1;

        let first = vaddr.page_index();
        let desc_at = self.free_range_at(first, count)?;
        let (range_first, range_count) = {
            let desc = self.desc(desc_at);
            (desc.start, desc.count)
        };
        let range_last = range_first + range_count - 1;
        let last = first + count - 1;

        self.erase_range(frames, desc_at);
        self.fill_used(frames, first, last, flags);
        if range_first != first {
            let head = self.new_range(frames, range_first, first - 1);
            self.mark_free_range(frames, head);
        }
        if last != range_last {
            let tail = self.new_range(frames, last + 1, range_last);
            self.mark_free_range(frames, tail);
        }
        self.hdr().stats.pages_allocated += count;
        Some(VirtualAddress::from_page_index(first))
    }

    /// Free `count` pages at `vaddr`: committed frames go back to the frame
    /// source, sub-trees under fully-covered slots are demolished, and the
    /// range merges with free neighbors into one descriptor.
    ///
    /// A no-op when any slot in the range is already free.
    pub fn free(&mut self, frames: &mut dyn FrameSource, vaddr: VirtualAddress, count: u64) {
        if vaddr.is_zero() || count == 0 {
            return;
        }
        let first = vaddr.page_index();
        if self.range_has_free(first, first + count - 1) {
            return;
        }
        {
            let hdr = self.hdr();
            hdr.stats.free_calls += 1;
            hdr.stats.pages_allocated -= count;
        }

        let mut bottom = first;
        let mut total = count;
        if first > 0
            && let Some(below) = self.free_range_at(first - 1, 1)
        {
            let desc = self.desc(below);
            bottom = desc.start;
            total += desc.count;
            self.erase_range(frames, below);
        }
        if let Some(above) = self.free_range_at(first + count, 1) {
            total += self.desc(above).count;
            self.erase_range(frames, above);
        }
        let merged = self.new_range(frames, bottom, bottom + total - 1);
        self.mark_free_range(frames, merged);
    }

    /// Rewrite the protection bits of every slot the range spans.
    ///
    /// Recurses through sub-tables and stops at leaves of any granularity;
    /// only the writable / no-execute bits change, never the address bits
    /// or the range tag.
    pub fn protect(&mut self, vaddr: VirtualAddress, count: u64, protect: Protect) {
        if count == 0 {
            return;
        }
        let hdr = self.hdr();
        hdr.stats.protect_calls += 1;
        let first = vaddr.page_index();
        self.protect_rec(
            PhysicalAddress::new(hdr.pt_root),
            PhysicalAddress::new(hdr.rt_root),
            first,
            first + count - 1,
            protect,
            hdr.levels - 1,
        );
    }

    /// Set the physical address of the single slot containing `vaddr`.
    ///
    /// Reserved, lazily-committed, and on-disk slots become mapped; an
    /// already-mapped slot just gets its address replaced.
    pub fn map(&mut self, vaddr: VirtualAddress, paddr: PhysicalAddress) {
        self.hdr().stats.map_calls += 1;
        self.map_single(vaddr.page_index(), paddr);
    }

    /// Map `count` pages starting at `vaddr` to physically contiguous
    /// memory starting at `paddr`; the physical address advances by each
    /// slot's size.
    pub fn map_linear(&mut self, vaddr: VirtualAddress, paddr: PhysicalAddress, count: u64) {
        if count == 0 {
            return;
        }
        let hdr = self.hdr();
        hdr.stats.map_calls += 1;
        let first = vaddr.page_index();
        self.map_linear_rec(
            PhysicalAddress::new(hdr.pt_root),
            PhysicalAddress::new(hdr.rt_root),
            first,
            first + count - 1,
            paddr.as_u64(),
            hdr.levels - 1,
        );
    }

    /// Physical address `vaddr` translates to, if its slot is mapped at any
    /// level. In-page offsets are preserved for every leaf granularity.
    #[must_use]
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let hdr = self.hdr();
        let page = vaddr.page_index();
        let mut pt = PhysicalAddress::new(hdr.pt_root);
        let mut rt = PhysicalAddress::new(hdr.rt_root);
        for level in (0..hdr.levels).rev() {
            let i = table_index(page, level);
            let entry = self.range_table(rt).get(i);
            match entry.kind() {
                RangeKind::SubTable => {
                    pt = self.page_table(pt).get(i).next_table();
                    rt = entry.child();
                }
                RangeKind::Mapped => {
                    let kind = PageKind::for_level(level)?;
                    let base = self.page_table(pt).get(i).leaf_base(kind);
                    let offset = vaddr.as_u64() & ((Size4K::SIZE << (9 * level)) - 1);
                    return Some(base + offset);
                }
                _ => return None,
            }
        }
        None
    }

    /// Tear the whole address space down: every sub-table, every committed
    /// frame, every slab page, and the state itself go back to `frames`.
    pub fn destroy(self, frames: &mut dyn FrameSource) {
        let hdr = self.hdr();
        self.demolish(
            frames,
            PhysicalAddress::new(hdr.pt_root),
            PhysicalAddress::new(hdr.rt_root),
            hdr.levels - 1,
        );

        let mut cur = hdr.free_slabs;
        while cur != 0 {
            let next = self.slab(PhysicalAddress::new(cur)).next;
            frames.free_frames(PhysicalAddress::new(cur), 1);
            cur = next;
        }
        let mut cur = hdr.full_slabs;
        while cur != 0 {
            let next = self.slab(PhysicalAddress::new(cur)).next;
            frames.free_frames(PhysicalAddress::new(cur), 1);
            cur = next;
        }
        frames.free_frames(self.state, 1);
    }

    // ---- in-place state access -----------------------------------------

    fn hdr(&self) -> &'m mut StateHeader {
        // SAFETY: `state` is the first page of the creation block.
        unsafe { self.mapper.phys_to_mut::<StateHeader>(self.state) }
    }

    fn desc(&self, at: PhysicalAddress) -> &'m mut RangeDescriptor {
        // SAFETY: descriptor addresses always come from slab slots.
        unsafe { self.mapper.phys_to_mut::<RangeDescriptor>(at) }
    }

    fn slab(&self, page: PhysicalAddress) -> &'m mut SlabPage {
        // SAFETY: slab pages are frames this allocator obtained for
        // descriptor storage.
        unsafe { self.mapper.phys_to_mut::<SlabPage>(page) }
    }

    fn page_table(&self, page: PhysicalAddress) -> &'m mut PageTable {
        // SAFETY: page-table pages are frames this allocator obtained for
        // the architectural tree.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page) }
    }

    fn range_table(&self, page: PhysicalAddress) -> &'m mut RangeTable {
        // SAFETY: as above, for the shadow tree.
        unsafe { self.mapper.phys_to_mut::<RangeTable>(page) }
    }

    fn degrade(&self, flags: AllocFlags) -> AllocFlags {
        if flags.size() == SizeClass::Page1G && !self.hdr().use_1gib {
            flags.with_size(SizeClass::Page2M)
        } else {
            flags
        }
    }

    // ---- descriptor slab -----------------------------------------------

    /// Take a descriptor slot, growing the slab by one frame if no page has
    /// a free slot.
    ///
    /// # Panics
    /// On frame exhaustion; descriptor storage cannot be unwound mid-way.
    fn alloc_descriptor(&self, frames: &mut dyn FrameSource) -> PhysicalAddress {
        let hdr = self.hdr();
        if hdr.free_slabs == 0 {
            let Some(page) = frames.alloc_frames(1) else {
                panic!("out of physical frames for range descriptors");
            };
            self.slab(page).reset();
            hdr.free_slabs = page.as_u64();
            hdr.stats.footprint_pages += 1;
        }

        let page = PhysicalAddress::new(hdr.free_slabs);
        let slab = self.slab(page);
        let Some(slot) = slab.first_free_slot() else {
            panic!("slab page on the free chain has no free slot");
        };
        slab.take_slot(slot);

        if slab.is_full() {
            // Move from the free chain onto the full chain.
            hdr.free_slabs = slab.next;
            if slab.next != 0 {
                self.slab(PhysicalAddress::new(slab.next)).prev = 0;
            }
            slab.prev = 0;
            slab.next = hdr.full_slabs;
            if hdr.full_slabs != 0 {
                self.slab(PhysicalAddress::new(hdr.full_slabs)).prev = page.as_u64();
            }
            hdr.full_slabs = page.as_u64();
        }
        SlabPage::slot_address(page, slot)
    }

    /// Release a descriptor slot; an empty slab page goes back to the frame
    /// source.
    fn free_descriptor(&self, frames: &mut dyn FrameSource, at: PhysicalAddress) {
        let hdr = self.hdr();
        let (page, slot) = SlabPage::locate(at);
        let slab = self.slab(page);
        slab.release_slot(slot);

        // Unlink from whichever chain holds it.
        if hdr.free_slabs == page.as_u64() {
            hdr.free_slabs = slab.next;
        } else if hdr.full_slabs == page.as_u64() {
            hdr.full_slabs = slab.next;
        }
        if slab.prev != 0 {
            self.slab(PhysicalAddress::new(slab.prev)).next = slab.next;
        }
        if slab.next != 0 {
            self.slab(PhysicalAddress::new(slab.next)).prev = slab.prev;
        }
        slab.prev = 0;
        slab.next = 0;

        if slab.is_empty() {
            frames.free_frames(page, 1);
            hdr.stats.footprint_pages -= 1;
        } else {
            slab.next = hdr.free_slabs;
            if hdr.free_slabs != 0 {
                self.slab(PhysicalAddress::new(hdr.free_slabs)).prev = page.as_u64();
            }
            hdr.free_slabs = page.as_u64();
        }
    }

    // ---- free-range list (bucket discipline) ---------------------------

    /// Allocate and file a descriptor for `[first, last]`.
    fn new_range(&self, frames: &mut dyn FrameSource, first: u64, last: u64) -> PhysicalAddress {
        let at = self.alloc_descriptor(frames);
        {
            let desc = self.desc(at);
            desc.start = first;
            desc.count = 1 + last - first;
            desc.prev = 0;
            desc.next = 0;
        }
        self.insert_descriptor(at);
        at
    }

    /// Unfile and release the descriptor at `at`.
    fn erase_range(&self, frames: &mut dyn FrameSource, at: PhysicalAddress) {
        self.unlink_descriptor(at);
        self.free_descriptor(frames, at);
    }

    fn insert_descriptor(&self, at: PhysicalAddress) {
        let count = self.desc(at).count;
        let index = lut::floor_index(count) as usize;
        let hdr = self.hdr();

        let head = hdr.buckets[index];
        if head != 0 {
            // Splice before the bucket head and re-aim every lower bucket
            // that skip-forwarded to it.
            let other = self.desc(PhysicalAddress::new(head));
            if other.prev != 0 {
                self.desc(PhysicalAddress::new(other.prev)).next = at.as_u64();
            }
            let this = self.desc(at);
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

        // No descriptor with bucket ≥ index exists: aim the empty buckets
        // at this one and append it at the global tail.
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
            self.desc(PhysicalAddress::new(hdr.tail)).next = at.as_u64();
        }
        let this = self.desc(at);
        this.prev = hdr.tail;
        this.next = 0;
        hdr.tail = at.as_u64();
    }

    fn unlink_descriptor(&self, at: PhysicalAddress) {
        let (count, prev, next) = {
            let desc = self.desc(at);
            (desc.count, desc.prev, desc.next)
        };
        let index = lut::floor_index(count) as usize;
        let hdr = self.hdr();

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
            self.desc(PhysicalAddress::new(prev)).next = next;
        }
        if next != 0 {
            self.desc(PhysicalAddress::new(next)).prev = prev;
        }
        let this = self.desc(at);
        this.prev = 0;
        this.next = 0;
    }

    /// First descriptor that can hold `count` pages (peek only).
    fn first_fit(&self, count: u64) -> Option<PhysicalAddress> {
        let hdr = self.hdr();
        if count == 1 {
            let head = hdr.buckets[0];
            return (head != 0).then(|| PhysicalAddress::new(head));
        }
        let bucket = lut::ceil_index(count);
        let head = hdr.buckets[bucket as usize];
        if head != 0 && lut::value(bucket) >= count {
            return Some(PhysicalAddress::new(head));
        }
        // Either the head bucket is drained or `count` sits in an
        // exact-boundary hole; the previous bucket's chain still holds runs
        // that fit.
        let mut cur = hdr.buckets[bucket as usize - 1];
        while cur != 0 {
            let desc = self.desc(PhysicalAddress::new(cur));
            if desc.count >= count {
                return Some(PhysicalAddress::new(cur));
            }
            cur = desc.next;
        }
        None
    }

    /// First descriptor containing an aligned `count`-page window (peek
    /// only).
    fn first_aligned_fit(&self, count: u64, align_bits: u8) -> Option<PhysicalAddress> {
        let mask = (1u64 << (align_bits - 12)) - 1;
        let hdr = self.hdr();
        let mut cur = hdr.buckets[lut::floor_index(count) as usize];
        while cur != 0 {
            let desc = self.desc(PhysicalAddress::new(cur));
            let aligned = (desc.start + mask) & !mask;
            if aligned + count <= desc.start + desc.count {
                return Some(PhysicalAddress::new(cur));
            }
            cur = desc.next;
        }
        None
    }

    /// The descriptor whose run contains `[page, page + count)`, found by
    /// walking the range table (peek only).
    fn free_range_at(&self, page: u64, count: u64) -> Option<PhysicalAddress> {
        let hdr = self.hdr();
        let mut rt = PhysicalAddress::new(hdr.rt_root);
        for level in (0..hdr.levels).rev() {
            let entry = self.range_table(rt).get(table_index(page, level));
            match entry.kind() {
                RangeKind::Free => {
                    let at = entry.descriptor();
                    if at.is_zero() {
                        return None;
                    }
                    let desc = self.desc(at);
                    return (desc.start <= page && page + count <= desc.start + desc.count)
                        .then_some(at);
                }
                RangeKind::SubTable => rt = entry.child(),
                _ => return None,
            }
        }
        None
    }

    /// Whether any slot in `[first, last]` is tagged free.
    fn range_has_free(&self, first: u64, last: u64) -> bool {
        let hdr = self.hdr();
        self.has_free_rec(
            PhysicalAddress::new(hdr.rt_root),
            first,
            last,
            hdr.levels - 1,
        )
    }

    fn has_free_rec(&self, rt_pa: PhysicalAddress, first: u64, last: u64, level: u8) -> bool {
        let shift = 9 * u32::from(level);
        let span_mask = (1u64 << shift) - 1;
        let rt = self.range_table(rt_pa);
        for i in table_index(first, level)..=table_index(last, level) {
            let slot_first = (i as u64) << shift;
            let entry = rt.get(i);
            match entry.kind() {
                RangeKind::Free => return true,
                RangeKind::SubTable => {
                    let sub_first = if first > slot_first {
                        first - slot_first
                    } else {
                        0
                    };
                    let sub_last = if last < slot_first + span_mask {
                        last - slot_first
                    } else {
                        span_mask
                    };
                    if self.has_free_rec(entry.child(), sub_first, sub_last, level - 1) {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    // ---- used-range fill (allocation descent) --------------------------

    fn fill_used(
        &self,
        frames: &mut dyn FrameSource,
        first: u64,
        last: u64,
        flags: AllocFlags,
    ) {
        let hdr = self.hdr();
        self.fill_used_rec(
            frames,
            PhysicalAddress::new(hdr.pt_root),
            PhysicalAddress::new(hdr.rt_root),
            first,
            last,
            flags,
            hdr.levels - 1,
        );
    }

    fn fill_used_rec(
        &self,
        frames: &mut dyn FrameSource,
        pt_pa: PhysicalAddress,
        rt_pa: PhysicalAddress,
        first: u64,
        last: u64,
        flags: AllocFlags,
        level: u8,
    ) {
        let shift = 9 * u32::from(level);
        let span_mask = (1u64 << shift) - 1;
        let pt = self.page_table(pt_pa);
        let rt = self.range_table(rt_pa);
        let first_entry = table_index(first, level);
        let last_entry = table_index(last, level);

        if level == flags.size().min_level() {
            let kind = flags.size().kind();
            let arch = PageEntry::reserved_leaf(kind, flags.protect());
            let tag = if flags.auto_commit() {
                RangeEntry::auto_commit()
            } else {
                RangeEntry::unmapped()
            };
            for i in first_entry..=last_entry {
                pt.set(i, arch);
                rt.set(i, tag);
            }
            return;
        }

        for i in first_entry..=last_entry {
            let slot_first = (i as u64) << shift;
            let entry = rt.get(i);
            let (child_pt, child_rt) = match entry.kind() {
                RangeKind::Free => {
                    let (child_pt, child_rt) = self.alloc_table_pair(frames);
                    pt.set(i, PageEntry::table(child_pt));
                    rt.set(i, RangeEntry::sub_table(child_rt));
                    (child_pt, child_rt)
                }
                RangeKind::SubTable => (pt.get(i).next_table(), entry.child()),
                _ => continue,
            };
            let sub_first = if first > slot_first {
                first - slot_first
            } else {
                0
            };
            let sub_last = if last < slot_first + span_mask {
                last - slot_first
            } else {
                span_mask
            };
            self.fill_used_rec(frames, child_pt, child_rt, sub_first, sub_last, flags, level - 1);
        }
    }

    /// Allocate and zero one page-table/range-table pair, preferring a
    /// single contiguous 2-frame allocation.
    ///
    /// # Panics
    /// On frame exhaustion; half-built table chains cannot be unwound.
    fn alloc_table_pair(&self, frames: &mut dyn FrameSource) -> (PhysicalAddress, PhysicalAddress) {
        let (pt, rt) = if let Some(pair) = frames.alloc_frames(2) {
            (pair, pair + Size4K::SIZE)
        } else {
            match (frames.alloc_frames(1), frames.alloc_frames(1)) {
                (Some(pt), Some(rt)) => (pt, rt),
                _ => panic!("out of physical frames while growing page tables"),
            }
        };
        *self.page_table(pt) = PageTable::zeroed();
        *self.range_table(rt) = RangeTable::zeroed();
        self.hdr().stats.footprint_pages += 2;
        (pt, rt)
    }

    // ---- free-range fill (release descent) -----------------------------

    /// Rewrite every slot covered by the descriptor at `desc_at` to point
    /// at it, demolishing whatever the slots held.
    fn mark_free_range(&self, frames: &mut dyn FrameSource, desc_at: PhysicalAddress) {
        let (first, last) = {
            let desc = self.desc(desc_at);
            (desc.start, desc.start + desc.count - 1)
        };
        let hdr = self.hdr();
        self.mark_free_rec(
            frames,
            PhysicalAddress::new(hdr.pt_root),
            PhysicalAddress::new(hdr.rt_root),
            first,
            last,
            desc_at,
            hdr.levels - 1,
        );
    }

    fn mark_free_rec(
        &self,
        frames: &mut dyn FrameSource,
        pt_pa: PhysicalAddress,
        rt_pa: PhysicalAddress,
        first: u64,
        last: u64,
        desc_at: PhysicalAddress,
        level: u8,
    ) {
        let shift = 9 * u32::from(level);
        let span_mask = (1u64 << shift) - 1;
        let pt = self.page_table(pt_pa);
        let rt = self.range_table(rt_pa);

        for i in table_index(first, level)..=table_index(last, level) {
            let slot_first = (i as u64) << shift;
            let slot_last = slot_first + span_mask;
            let entry = rt.get(i);

            if first <= slot_first && last >= slot_last {
                // Fully covered: dispose of the slot's content and claim it.
                match entry.kind() {
                    RangeKind::SubTable => {
                        self.demolish(frames, pt.get(i).next_table(), entry.child(), level - 1);
                    }
                    RangeKind::Mapped => self.free_mapped(frames, pt.get(i), level),
                    RangeKind::PagedToDisk => self.drop_disk_mapping(level),
                    RangeKind::Free | RangeKind::Unmapped | RangeKind::AutoCommit
                    | RangeKind::Reserved => {}
                }
                pt.set(i, PageEntry::zero());
                rt.set(i, RangeEntry::free(desc_at));
                continue;
            }

            // Partial boundary slot (only possible above the leaf level).
            match entry.kind() {
                RangeKind::SubTable => {
                    let sub_first = if first > slot_first {
                        first - slot_first
                    } else {
                        0
                    };
                    let sub_last = if last < slot_last {
                        last - slot_first
                    } else {
                        span_mask
                    };
                    self.mark_free_rec(
                        frames,
                        pt.get(i).next_table(),
                        entry.child(),
                        sub_first,
                        sub_last,
                        desc_at,
                        level - 1,
                    );
                }
                RangeKind::Mapped => {
                    self.free_mapped(frames, pt.get(i), level);
                    pt.set(i, PageEntry::zero());
                    rt.set(i, RangeEntry::free(desc_at));
                }
                RangeKind::PagedToDisk => {
                    self.drop_disk_mapping(level);
                    pt.set(i, PageEntry::zero());
                    rt.set(i, RangeEntry::free(desc_at));
                }
                RangeKind::Free | RangeKind::Unmapped | RangeKind::AutoCommit
                | RangeKind::Reserved => {
                    pt.set(i, PageEntry::zero());
                    rt.set(i, RangeEntry::free(desc_at));
                }
            }
        }
    }

    /// Free an entire table pair and everything below it.
    fn demolish(
        &self,
        frames: &mut dyn FrameSource,
        pt_pa: PhysicalAddress,
        rt_pa: PhysicalAddress,
        level: u8,
    ) {
        let pt = self.page_table(pt_pa);
        let rt = self.range_table(rt_pa);
        for i in 0..512 {
            let entry = rt.get(i);
            match entry.kind() {
                RangeKind::SubTable => {
                    self.demolish(frames, pt.get(i).next_table(), entry.child(), level - 1);
                }
                RangeKind::Mapped => self.free_mapped(frames, pt.get(i), level),
                RangeKind::PagedToDisk => self.drop_disk_mapping(level),
                _ => {}
            }
        }
        frames.free_frames(pt_pa, 1);
        frames.free_frames(rt_pa, 1);
        self.hdr().stats.footprint_pages -= 2;
    }

    /// Return a mapped leaf's backing frames.
    fn free_mapped(&self, frames: &mut dyn FrameSource, arch: PageEntry, level: u8) {
        let Some(kind) = PageKind::for_level(level) else {
            warn!("mapped range at unexpected level {level}");
            return;
        };
        frames.free_frames(arch.leaf_base(kind), kind.frames());
        self.hdr().stats.pages_mapped -= kind.frames();
    }

    /// Account for dropping an on-disk mapping. Actual store reclamation is
    /// the pager's business.
    fn drop_disk_mapping(&self, level: u8) {
        let Some(kind) = PageKind::for_level(level) else {
            warn!("on-disk range at unexpected level {level}");
            return;
        };
        self.hdr().stats.pages_mapped_to_disk -= kind.frames();
    }

    // ---- mapping and protection walks ----------------------------------

    fn map_single(&self, page: u64, paddr: PhysicalAddress) -> bool {
        let hdr = self.hdr();
        let mut pt = PhysicalAddress::new(hdr.pt_root);
        let mut rt = PhysicalAddress::new(hdr.rt_root);
        for level in (0..hdr.levels).rev() {
            let i = table_index(page, level);
            let entry = self.range_table(rt).get(i);
            match entry.kind() {
                RangeKind::SubTable => {
                    pt = self.page_table(pt).get(i).next_table();
                    rt = entry.child();
                }
                RangeKind::Mapped => {
                    let Some(kind) = PageKind::for_level(level) else {
                        warn!("mapped range at unexpected level {level}");
                        return false;
                    };
                    let table = self.page_table(pt);
                    table.set(i, table.get(i).with_leaf_base(kind, paddr));
                    return true;
                }
                RangeKind::Unmapped | RangeKind::AutoCommit | RangeKind::PagedToDisk => {
                    let Some(kind) = PageKind::for_level(level) else {
                        warn!("reserved range at unexpected level {level}");
                        return false;
                    };
                    if kind == PageKind::Page1G && !hdr.use_1gib {
                        warn!("1 GiB slot without 1 GiB support");
                        return false;
                    }
                    if entry.kind() == RangeKind::PagedToDisk {
                        hdr.stats.pages_mapped_to_disk -= kind.frames();
                    }
                    let table = self.page_table(pt);
                    table.set(
                        i,
                        table
                            .get(i)
                            .with_leaf_base(kind, paddr)
                            .with_present(true),
                    );
                    self.range_table(rt).set(i, RangeEntry::mapped());
                    hdr.stats.pages_mapped += kind.frames();
                    return true;
                }
                RangeKind::Free | RangeKind::Reserved => return false,
            }
        }
        false
    }

    fn map_linear_rec(
        &self,
        pt_pa: PhysicalAddress,
        rt_pa: PhysicalAddress,
        first: u64,
        last: u64,
        phys: u64,
        level: u8,
    ) {
        let hdr = self.hdr();
        let shift = 9 * u32::from(level);
        let span_mask = (1u64 << shift) - 1;
        let pt = self.page_table(pt_pa);
        let rt = self.range_table(rt_pa);

        for i in table_index(first, level)..=table_index(last, level) {
            let slot_first = (i as u64) << shift;
            // Physical base a leaf at this slot must carry to stay linear;
            // wrapping keeps the (ill-formed) partially-covered-leaf case
            // consistent with the two's-complement offset.
            let slot_phys = phys.wrapping_add(slot_first.wrapping_sub(first) << Size4K::SHIFT);
            let entry = rt.get(i);
            match entry.kind() {
                RangeKind::SubTable => {
                    let sub_first = if first > slot_first {
                        first - slot_first
                    } else {
                        0
                    };
                    let sub_last = if last < slot_first + span_mask {
                        last - slot_first
                    } else {
                        span_mask
                    };
                    let sub_phys = phys + ((slot_first + sub_first - first) << Size4K::SHIFT);
                    self.map_linear_rec(
                        pt.get(i).next_table(),
                        entry.child(),
                        sub_first,
                        sub_last,
                        sub_phys,
                        level - 1,
                    );
                }
                RangeKind::Mapped => {
                    let Some(kind) = PageKind::for_level(level) else {
                        warn!("mapped range at unexpected level {level}");
                        continue;
                    };
                    pt.set(
                        i,
                        pt.get(i).with_leaf_base(kind, PhysicalAddress::new(slot_phys)),
                    );
                }
                RangeKind::Unmapped | RangeKind::AutoCommit | RangeKind::PagedToDisk => {
                    let Some(kind) = PageKind::for_level(level) else {
                        warn!("reserved range at unexpected level {level}");
                        continue;
                    };
                    if kind == PageKind::Page1G && !hdr.use_1gib {
                        warn!("1 GiB slot without 1 GiB support");
                        continue;
                    }
                    if entry.kind() == RangeKind::PagedToDisk {
                        hdr.stats.pages_mapped_to_disk -= kind.frames();
                    }
                    pt.set(
                        i,
                        pt.get(i)
                            .with_leaf_base(kind, PhysicalAddress::new(slot_phys))
                            .with_present(true),
                    );
                    rt.set(i, RangeEntry::mapped());
                    hdr.stats.pages_mapped += kind.frames();
                }
                RangeKind::Free | RangeKind::Reserved => {}
            }
        }
    }

    fn protect_rec(
        &self,
        pt_pa: PhysicalAddress,
        rt_pa: PhysicalAddress,
        first: u64,
        last: u64,
        protect: Protect,
        level: u8,
    ) {
        let shift = 9 * u32::from(level);
        let span_mask = (1u64 << shift) - 1;
        let pt = self.page_table(pt_pa);
        let rt = self.range_table(rt_pa);

        for i in table_index(first, level)..=table_index(last, level) {
            let slot_first = (i as u64) << shift;
            let entry = rt.get(i);
            match entry.kind() {
                RangeKind::SubTable => {
                    let sub_first = if first > slot_first {
                        first - slot_first
                    } else {
                        0
                    };
                    let sub_last = if last < slot_first + span_mask {
                        last - slot_first
                    } else {
                        span_mask
                    };
                    self.protect_rec(
                        pt.get(i).next_table(),
                        entry.child(),
                        sub_first,
                        sub_last,
                        protect,
                        level - 1,
                    );
                }
                RangeKind::Mapped
                | RangeKind::Unmapped
                | RangeKind::AutoCommit
                | RangeKind::PagedToDisk => {
                    pt.set(i, pt.get(i).with_protect(protect));
                }
                RangeKind::Free | RangeKind::Reserved => {}
            }
        }
    }
}
