//! # Frame Bitmap
//!
//! One bit per physical 4 KiB frame: **1 = free, 0 = taken**. The words live
//! in the allocator's reserved footprint and are reached through the
//! [`PhysMapper`], so the same code runs against real physical memory in the
//! kernel and against a buffer in tests.
//!
//! Range operations treat the head and tail words with bit masks and fill
//! the interior with whole-word stores.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// Location and extent of the frame bitmap.
///
/// Plain data; lives inside the allocator's in-memory state header.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct FrameBitmap {
    /// First bitmap word.
    base: PhysicalAddress,
    /// Number of tracked frames (= valid bits).
    frames: u64,
}

impl FrameBitmap {
    /// Bitmap covering `frames` frames, with its words stored at `base`.
    #[inline]
    #[must_use]
    pub const fn new(base: PhysicalAddress, frames: u64) -> Self {
        Self { base, frames }
    }

    /// Number of tracked frames.
    #[inline]
    #[must_use]
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    /// Bytes required to track `frames` frames (whole words).
    #[inline]
    #[must_use]
    pub const fn bytes_for(frames: u64) -> u64 {
        frames.div_ceil(64) * 8
    }

    fn word<'a, M: PhysMapper>(&self, mapper: &M, index: u64) -> &'a mut u64 {
        debug_assert!(index < self.frames.div_ceil(64));
        // SAFETY: the word lies inside the reserved bitmap footprint.
        unsafe { mapper.phys_to_mut::<u64>(self.base + index * 8) }
    }

    /// Clear the whole bitmap (all frames taken).
    pub fn clear_all<M: PhysMapper>(&self, mapper: &M) {
        for i in 0..self.frames.div_ceil(64) {
            *self.word(mapper, i) = 0;
        }
    }

    /// Whether `frame` is free.
    #[must_use]
    pub fn get<M: PhysMapper>(&self, mapper: &M, frame: u64) -> bool {
        (*self.word(mapper, frame >> 6) >> (frame & 63)) & 1 != 0
    }

    /// Mark a single frame free (`true`) or taken (`false`).
    pub fn set<M: PhysMapper>(&self, mapper: &M, frame: u64, free: bool) {
        let word = self.word(mapper, frame >> 6);
        let bit = 1u64 << (frame & 63);
        if free {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }

    /// Mark every frame in `[first, last]` free (`true`) or taken (`false`).
    pub fn set_range<M: PhysMapper>(&self, mapper: &M, first: u64, last: u64, free: bool) {
        debug_assert!(first <= last && last < self.frames);
        let first_index = first >> 6;
        let last_index = last >> 6;
        let low_mask = !0u64 << (first & 63);
        let high_mask = !0u64 >> (63 - (last & 63));

        if first_index == last_index {
            let word = self.word(mapper, first_index);
            let mask = low_mask & high_mask;
            if free {
                *word |= mask;
            } else {
                *word &= !mask;
            }
            return;
        }

        {
            let head = self.word(mapper, first_index);
            if free {
                *head |= low_mask;
            } else {
                *head &= !low_mask;
            }
        }
        {
            let tail = self.word(mapper, last_index);
            if free {
                *tail |= high_mask;
            } else {
                *tail &= !high_mask;
            }
        }
        for i in first_index + 1..last_index {
            *self.word(mapper, i) = if free { !0 } else { 0 };
        }
    }

    /// Number of **free** frames in `[first, last]`.
    #[must_use]
    pub fn count_free_in<M: PhysMapper>(&self, mapper: &M, first: u64, last: u64) -> u64 {
        debug_assert!(first <= last && last < self.frames);
        let first_index = first >> 6;
        let last_index = last >> 6;
        let low_mask = !0u64 << (first & 63);
        let high_mask = !0u64 >> (63 - (last & 63));

        if first_index == last_index {
            return u64::from((*self.word(mapper, first_index) & low_mask & high_mask).count_ones());
        }

        let mut count = u64::from((*self.word(mapper, first_index) & low_mask).count_ones())
            + u64::from((*self.word(mapper, last_index) & high_mask).count_ones());
        for i in first_index + 1..last_index {
            count += u64::from(self.word(mapper, i).count_ones());
        }
        count
    }

    /// Lowest **free** frame in `[first, last]`, if any.
    #[must_use]
    pub fn first_free_in<M: PhysMapper>(&self, mapper: &M, first: u64, last: u64) -> Option<u64> {
        debug_assert!(first <= last && last < self.frames);
        let first_index = first >> 6;
        let last_index = last >> 6;
        let low_mask = !0u64 << (first & 63);
        let high_mask = !0u64 >> (63 - (last & 63));

        for i in first_index..=last_index {
            let mut bits = *self.word(mapper, i);
            if i == first_index {
                bits &= low_mask;
            }
            if i == last_index {
                bits &= high_mask;
            }
            if bits != 0 {
                return Some(i * 64 + u64::from(bits.trailing_zeros()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestPhys;

    fn bitmap(frames: u64) -> (TestPhys, FrameBitmap) {
        let phys = TestPhys::with_frames(4);
        let bm = FrameBitmap::new(PhysicalAddress::zero(), frames);
        bm.clear_all(&phys);
        (phys, bm)
    }

    #[test]
    fn single_bits() {
        let (phys, bm) = bitmap(300);
        assert!(!bm.get(&phys, 5));
        bm.set(&phys, 5, true);
        assert!(bm.get(&phys, 5));
        assert!(!bm.get(&phys, 4));
        assert!(!bm.get(&phys, 6));
        bm.set(&phys, 5, false);
        assert!(!bm.get(&phys, 5));
    }

    #[test]
    fn range_within_one_word() {
        let (phys, bm) = bitmap(300);
        bm.set_range(&phys, 3, 9, true);
        for f in 0..16 {
            assert_eq!(bm.get(&phys, f), (3..=9).contains(&f), "frame {f}");
        }
        bm.set_range(&phys, 4, 8, false);
        assert!(bm.get(&phys, 3));
        assert!(bm.get(&phys, 9));
        assert_eq!(bm.count_free_in(&phys, 0, 15), 2);
    }

    #[test]
    fn range_across_words() {
        let (phys, bm) = bitmap(300);
        bm.set_range(&phys, 60, 200, true);
        assert!(!bm.get(&phys, 59));
        assert!(bm.get(&phys, 60));
        assert!(bm.get(&phys, 64));
        assert!(bm.get(&phys, 128));
        assert!(bm.get(&phys, 200));
        assert!(!bm.get(&phys, 201));
        assert_eq!(bm.count_free_in(&phys, 0, 299), 141);
    }

    #[test]
    fn popcount_and_first_free() {
        let (phys, bm) = bitmap(300);
        assert_eq!(bm.count_free_in(&phys, 0, 299), 0);
        assert_eq!(bm.first_free_in(&phys, 0, 299), None);

        bm.set(&phys, 70, true);
        bm.set(&phys, 130, true);
        assert_eq!(bm.count_free_in(&phys, 0, 299), 2);
        assert_eq!(bm.first_free_in(&phys, 0, 299), Some(70));
        assert_eq!(bm.first_free_in(&phys, 71, 299), Some(130));
        assert_eq!(bm.first_free_in(&phys, 71, 129), None);
        assert_eq!(bm.count_free_in(&phys, 70, 70), 1);
    }
}
