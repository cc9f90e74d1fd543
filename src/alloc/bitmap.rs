//! Per-slab allocation bitmaps.
//!
//! Each slab carries two parallel bitmaps after its data area, one bit per
//! granule in each: the *used* bit marks granules belonging to allocated
//! chunks, and the *head* bit marks the first granule of every chunk,
//! allocated or free. Together they encode two bits per granule, which is
//! what lets the allocator find chunk boundaries when coalescing.
//!
//! ```text
//! slab: [ data area | used bitmap | head bitmap | waste ]
//!          8N bytes     N/8 bytes     N/8 bytes
//! ```

use crate::disk::mapping::Mapping;
use crate::{GRANULE, SLAB_SIZE};

// ============================================================================
// Slab Geometry
// ============================================================================

/// Bits per bitmap word.
pub const BITS_PER_WORD: u64 = 64;

/// Granules in one slab's data area.
pub const SLAB_GRANULES: u64 = 126_976;

/// Bytes in one slab's data area.
pub const SLAB_DATA_BYTES: u64 = SLAB_GRANULES * GRANULE;

/// Bytes in each of the two per-slab bitmaps.
pub const SLAB_BITMAP_BYTES: u64 = SLAB_GRANULES / 8;

/// Words in each per-slab bitmap.
pub const BITMAP_WORDS: u64 = SLAB_GRANULES / BITS_PER_WORD;

/// Offset of the used bitmap within a slab.
pub const USED_BITMAP_OFF: u64 = SLAB_DATA_BYTES;

/// Offset of the head bitmap within a slab.
pub const HEAD_BITMAP_OFF: u64 = SLAB_DATA_BYTES + SLAB_BITMAP_BYTES;

// The data area and both bitmaps must fit in a slab, with the granule
// count a whole number of bitmap words.
static_assertions::const_assert!(
    SLAB_DATA_BYTES + 2 * SLAB_BITMAP_BYTES <= SLAB_SIZE
);
static_assertions::const_assert_eq!(SLAB_GRANULES % BITS_PER_WORD, 0);

// ============================================================================
// Address Conversion
// ============================================================================

/// Base offset of the slab containing `off`.
#[inline]
pub fn slab_of(off: u64) -> u64 {
    off & !(SLAB_SIZE - 1)
}

/// Split an absolute chunk offset into (slab base, granule index).
#[inline]
pub fn granule_of(off: u64) -> (u64, u64) {
    let slab = slab_of(off);
    let rel = off - slab;
    debug_assert!(rel < SLAB_DATA_BYTES);
    debug_assert_eq!(rel % GRANULE, 0);
    (slab, rel / GRANULE)
}

/// Absolute offset of a granule within a slab.
#[inline]
pub fn offset_of(slab: u64, granule: u64) -> u64 {
    slab + granule * GRANULE
}

// ============================================================================
// Bit Operations
// ============================================================================

#[inline]
fn word_off(bitmap_base: u64, granule: u64) -> u64 {
    bitmap_base + (granule / BITS_PER_WORD) * 8
}

#[inline]
fn bit_of(granule: u64) -> u64 {
    1u64 << (granule % BITS_PER_WORD)
}

fn test_bit(map: &Mapping, base: u64, granule: u64) -> bool {
    debug_assert!(granule < SLAB_GRANULES);
    map.u64_at(word_off(base, granule)) & bit_of(granule) != 0
}

fn change_bit(map: &mut Mapping, base: u64, granule: u64, set: bool) {
    debug_assert!(granule < SLAB_GRANULES);
    let off = word_off(base, granule);
    let word = map.u64_at(off);
    let word = if set { word | bit_of(granule) } else { word & !bit_of(granule) };
    map.set_u64(off, word);
}

fn change_range(map: &mut Mapping, base: u64, start: u64, count: u64, set: bool) {
    debug_assert!(start + count <= SLAB_GRANULES);
    let mut granule = start;
    let mut remaining = count;
    while remaining > 0 {
        let in_word = granule % BITS_PER_WORD;
        let span = (BITS_PER_WORD - in_word).min(remaining);
        let mask = if span == BITS_PER_WORD {
            u64::MAX
        } else {
            ((1u64 << span) - 1) << in_word
        };
        let off = word_off(base, granule);
        let word = map.u64_at(off);
        map.set_u64(off, if set { word | mask } else { word & !mask });
        granule += span;
        remaining -= span;
    }
}

// ============================================================================
// Used Bitmap
// ============================================================================

/// Whether the granule belongs to an allocated chunk.
#[inline]
pub fn is_used(map: &Mapping, slab: u64, granule: u64) -> bool {
    test_bit(map, slab + USED_BITMAP_OFF, granule)
}

/// Mark a granule range allocated.
pub fn set_used_range(map: &mut Mapping, slab: u64, start: u64, count: u64) {
    change_range(map, slab + USED_BITMAP_OFF, start, count, true);
}

/// Mark a granule range free.
pub fn clear_used_range(map: &mut Mapping, slab: u64, start: u64, count: u64) {
    change_range(map, slab + USED_BITMAP_OFF, start, count, false);
}

/// Count free granules in a slab.
pub fn count_free(map: &Mapping, slab: u64) -> u64 {
    let base = slab + USED_BITMAP_OFF;
    (0..BITMAP_WORDS)
        .map(|w| map.u64_at(base + w * 8).count_zeros() as u64)
        .sum()
}

// ============================================================================
// Head Bitmap
// ============================================================================

/// Whether the granule starts a chunk.
#[inline]
pub fn is_head(map: &Mapping, slab: u64, granule: u64) -> bool {
    test_bit(map, slab + HEAD_BITMAP_OFF, granule)
}

/// Mark a granule as a chunk start.
#[inline]
pub fn set_head(map: &mut Mapping, slab: u64, granule: u64) {
    change_bit(map, slab + HEAD_BITMAP_OFF, granule, true);
}

/// Clear a chunk-start mark.
#[inline]
pub fn clear_head(map: &mut Mapping, slab: u64, granule: u64) {
    change_bit(map, slab + HEAD_BITMAP_OFF, granule, false);
}

/// Start of the chunk containing `granule`: the nearest head bit at or
/// below it. Every slab's first chunk starts at granule 0, so the scan
/// always terminates; a missing head means the bitmap is corrupt.
pub fn head_at_or_before(map: &Mapping, slab: u64, granule: u64) -> u64 {
    let base = slab + HEAD_BITMAP_OFF;
    let mut w = granule / BITS_PER_WORD;
    let in_word = granule % BITS_PER_WORD;
    let mut mask = if in_word == BITS_PER_WORD - 1 {
        u64::MAX
    } else {
        (1u64 << (in_word + 1)) - 1
    };
    loop {
        let bits = map.u64_at(base + w * 8) & mask;
        if bits != 0 {
            return w * BITS_PER_WORD + (BITS_PER_WORD - 1 - bits.leading_zeros() as u64);
        }
        if w == 0 {
            panic!("allocator bitmap corrupt: no chunk head below granule {granule}");
        }
        w -= 1;
        mask = u64::MAX;
    }
}

/// First chunk boundary strictly after `granule`, or [`SLAB_GRANULES`] if
/// the chunk runs to the end of the data area.
pub fn next_head_after(map: &Mapping, slab: u64, granule: u64) -> u64 {
    let base = slab + HEAD_BITMAP_OFF;
    let start = granule + 1;
    let mut w = start / BITS_PER_WORD;
    let mut mask = !((1u64 << (start % BITS_PER_WORD)) - 1);
    while w < BITMAP_WORDS {
        let bits = map.u64_at(base + w * 8) & mask;
        if bits != 0 {
            return w * BITS_PER_WORD + bits.trailing_zeros() as u64;
        }
        w += 1;
        mask = u64::MAX;
    }
    SLAB_GRANULES
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::mapping::Mapping;

    fn test_map() -> (tempfile::TempDir, Mapping) {
        let dir = tempfile::tempdir().unwrap();
        let map = Mapping::create(&dir.path().join("bm.dgs"), SLAB_SIZE).unwrap();
        (dir, map)
    }

    #[test]
    fn test_geometry() {
        assert_eq!(SLAB_DATA_BYTES, 1_015_808);
        assert_eq!(SLAB_BITMAP_BYTES, 15_872);
        // 1 KiB of tail waste per slab.
        assert_eq!(SLAB_SIZE - SLAB_DATA_BYTES - 2 * SLAB_BITMAP_BYTES, 1024);
    }

    #[test]
    fn test_address_conversion() {
        assert_eq!(slab_of(0), 0);
        assert_eq!(slab_of(SLAB_SIZE + 8), SLAB_SIZE);
        assert_eq!(granule_of(SLAB_SIZE + 16), (SLAB_SIZE, 2));
        assert_eq!(offset_of(SLAB_SIZE, 2), SLAB_SIZE + 16);
    }

    #[test]
    fn test_used_bits() {
        let (_dir, mut map) = test_map();

        assert!(!is_used(&map, 0, 100));
        set_used_range(&mut map, 0, 100, 30);
        assert!(!is_used(&map, 0, 99));
        assert!(is_used(&map, 0, 100));
        assert!(is_used(&map, 0, 129));
        assert!(!is_used(&map, 0, 130));

        clear_used_range(&mut map, 0, 110, 10);
        assert!(is_used(&map, 0, 109));
        assert!(!is_used(&map, 0, 110));
        assert!(!is_used(&map, 0, 119));
        assert!(is_used(&map, 0, 120));
    }

    #[test]
    fn test_range_across_words() {
        let (_dir, mut map) = test_map();

        set_used_range(&mut map, 0, 60, 70);
        for g in 60..130 {
            assert!(is_used(&map, 0, g), "granule {g}");
        }
        assert!(!is_used(&map, 0, 59));
        assert!(!is_used(&map, 0, 130));
        assert_eq!(count_free(&map, 0), SLAB_GRANULES - 70);
    }

    #[test]
    fn test_head_scans() {
        let (_dir, mut map) = test_map();

        set_head(&mut map, 0, 0);
        set_head(&mut map, 0, 154);
        set_head(&mut map, 0, 500);

        assert_eq!(head_at_or_before(&map, 0, 0), 0);
        assert_eq!(head_at_or_before(&map, 0, 153), 0);
        assert_eq!(head_at_or_before(&map, 0, 154), 154);
        assert_eq!(head_at_or_before(&map, 0, 499), 154);

        assert_eq!(next_head_after(&map, 0, 0), 154);
        assert_eq!(next_head_after(&map, 0, 154), 500);
        assert_eq!(next_head_after(&map, 0, 500), SLAB_GRANULES);

        clear_head(&mut map, 0, 500);
        assert_eq!(next_head_after(&map, 0, 154), SLAB_GRANULES);
    }
}
