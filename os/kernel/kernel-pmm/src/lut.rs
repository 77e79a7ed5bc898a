//! # Size-Index Look-Up Table
//!
//! Maps a free-run length (in pages) to one of 255 size buckets. The mapping
//! is identity for runs up to 192 pages and power-of-two beyond, so short
//! runs get exact-fit buckets while the long tail stays compact.
//!
//! Three pure O(1) functions; no state. Both allocators anchor their
//! free-run lists on these buckets:
//!
//! - insertion uses [`floor_index`] (the bucket whose span contains the
//!   exact length),
//! - allocation uses [`ceil_index`] (the smallest bucket whose runs can
//!   satisfy the request, modulo the exact-boundary holes the take paths
//!   walk over).

/// Number of size buckets.
pub const BUCKET_COUNT: usize = 255;

/// Smallest run length (in pages) filed under bucket `index`.
///
/// `value(b) = b + 1` for `b < 192`, else `2^(b-191) + 192`.
#[inline]
#[must_use]
pub const fn value(index: u8) -> u64 {
    if index < 192 {
        index as u64 + 1
    } else {
        (1u64 << (index - 191)) + 192
    }
}

/// Largest bucket `b` with `value(b) <= count`: where a run of exactly
/// `count` pages is filed.
///
/// `count` must be at least 1 (runs are never empty).
#[inline]
#[must_use]
pub const fn floor_index(count: u64) -> u8 {
    debug_assert!(count >= 1);
    if count <= 192 {
        (count - 1) as u8
    } else {
        (254 - (count - 192).leading_zeros()) as u8
    }
}

/// Bucket to start an allocation search for `count` pages at.
///
/// For most sizes this is the smallest bucket whose every run fits `count`.
/// On the exact power-of-two boundaries it lands one bucket lower
/// (`value(ceil_index(count)) < count`); the take paths detect this and walk
/// the bucket chain for the first run that fits. The `clz` is full-width:
/// `clz(0) = 64`, which is what produces `ceil_index(193) = 191`.
///
/// `count` must be at least 1.
#[inline]
#[must_use]
pub const fn ceil_index(count: u64) -> u8 {
    debug_assert!(count >= 1);
    if count <= 192 {
        (count - 1) as u8
    } else {
        // Saturate at the top bucket; the take paths re-check run lengths,
        // so oversized requests simply walk its chain.
        let index = 255 - (count - 193).leading_zeros();
        if index > 254 { 254 } else { index as u8 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_span() {
        assert_eq!(value(0), 1);
        assert_eq!(value(1), 2);
        assert_eq!(value(191), 192);
        assert_eq!(floor_index(1), 0);
        assert_eq!(ceil_index(1), 0);
        assert_eq!(floor_index(192), 191);
    }

    #[test]
    fn boundary_table() {
        // The seed values around the identity/power-of-two seam.
        assert_eq!(floor_index(192), 191);
        assert_eq!(floor_index(193), 191);
        assert_eq!(floor_index(194), 192);
        assert_eq!(ceil_index(193), 191);
        assert_eq!(ceil_index(194), 192);
        assert_eq!(value(192), 194);
        assert_eq!(value(193), 196);
    }

    #[test]
    fn top_bucket_is_reachable() {
        assert_eq!(value(254), (1 << 63) + 192);
        assert_eq!(floor_index(u64::MAX), 254);
        assert_eq!(ceil_index(u64::MAX), 254);
    }

    #[test]
    fn floor_brackets_every_count() {
        // value(floor(n)) <= n < value(floor(n)+1) for all n >= 1.
        let mut n = 1u64;
        while n < 1 << 40 {
            let b = floor_index(n);
            assert!(value(b) <= n, "value({b}) > {n}");
            if b < 254 {
                assert!(n < value(b + 1), "{n} >= value({})", b + 1);
            }
            // Dense near the seam, exponential beyond.
            n = if n < 1024 { n + 1 } else { n + n / 3 };
        }
    }

    #[test]
    fn ceil_never_exceeds_floor() {
        let mut n = 1u64;
        while n < 1 << 40 {
            assert!(ceil_index(n) <= floor_index(n));
            // A run popped from a bucket above ceil always fits.
            let c = ceil_index(n);
            if c < 254 {
                assert!(value(c + 1) >= n);
            }
            n = if n < 1024 { n + 1 } else { n + n / 3 };
        }
    }
}
