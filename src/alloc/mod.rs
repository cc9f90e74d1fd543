//! Slab allocator over the mapped file.
//!
//! The mapped region is a sequence of fixed-size slabs. Within a slab,
//! variable-size chunks aligned to the allocation granule are carved out
//! of the data area and tracked by the per-slab bitmaps; released chunks
//! are kept in the size-classed free-chunk table for reuse. Chunks never
//! cross slab boundaries, so one slab's data area is the single-chunk
//! ceiling.
//!
//! Allocation is best-fit-by-class: the request is rounded to a size
//! class whose every member is large enough, the first non-empty class at
//! or above it supplies its head chunk, and any residual of at least the
//! minimum chunk size is split off and reinserted. Freeing coalesces with
//! free neighbours on both sides before reinserting.

pub mod bitmap;
pub mod freelist;

use crate::core::error::{DgsError, DgsResult};
use crate::disk::header::{self, HEADER_SIZE};
use crate::disk::mapping::Mapping;
use crate::{GRANULE, MAX_SIZE, SLAB_SIZE};

use bitmap::{SLAB_DATA_BYTES, SLAB_GRANULES};
use freelist::CHUNK_TABLE_SIZE;

// ============================================================================
// Constants
// ============================================================================

/// Smallest chunk, free or allocated: one free-list node.
pub const MIN_CHUNK: u64 = freelist::FREE_CHUNK_BYTES;

/// Largest single chunk: one slab's entire data area.
pub const MAX_CHUNK_SIZE: u64 = SLAB_DATA_BYTES;

/// Granules occupied by the header chunk at the start of slab 0.
pub const HEADER_GRANULES: u64 = HEADER_SIZE / GRANULE;

/// Classes holding exactly 2..=64 granules; everything above is geometric.
const EXACT_CLASSES: usize = 63;

static_assertions::const_assert_eq!(MIN_CHUNK, 2 * GRANULE);

// ============================================================================
// Size Classes
// ============================================================================

/// Round a request up to a whole number of granules, at least one
/// free-list node.
#[inline]
pub fn round_up(n: u64) -> u64 {
    n.max(MIN_CHUNK).div_ceil(GRANULE) * GRANULE
}

/// Size class a freed chunk of `len` bytes belongs to.
///
/// Monotonically non-decreasing, and floors: a chunk sits in the highest
/// class whose members it can fully cover.
pub fn free_chunk_id(len: u64) -> usize {
    debug_assert!(len >= MIN_CHUNK);
    let m = len / GRANULE;
    if m <= 64 {
        (m - 2) as usize
    } else {
        EXACT_CLASSES + ((m - 1) / 64).ilog2() as usize
    }
}

/// Lowest class from which *any* chunk satisfies a request of `size`
/// bytes. May return [`CHUNK_TABLE_SIZE`], meaning no class can guarantee
/// a fit and the request must be served from a fresh slab's maximal
/// chunk. Together with [`free_chunk_id`] this maintains
/// `free_chunk_id(n) < alloc_chunk_id(n + 1)`, so a chunk freed after an
/// allocation of `n` bytes can never be handed back for a larger request.
pub fn alloc_chunk_id(size: u64) -> usize {
    let m = round_up(size) / GRANULE;
    if m <= 64 {
        (m - 2) as usize
    } else {
        let q = (m - 1).div_ceil(64);
        EXACT_CLASSES + q.next_power_of_two().ilog2() as usize
    }
}

/// Measured length of the chunk starting at `off`, from the head bitmap.
fn chunk_len(map: &Mapping, off: u64) -> u64 {
    let (slab, g) = bitmap::granule_of(off);
    debug_assert!(bitmap::is_head(map, slab, g));
    (bitmap::next_head_after(map, slab, g) - g) * GRANULE
}

// ============================================================================
// Slab Formatting
// ============================================================================

/// Format the slabs of a freshly created file: the header chunk is marked
/// allocated at the start of slab 0 and every remaining byte of data area
/// becomes free chunks on the table.
pub fn init_slabs(map: &mut Mapping) {
    freelist::init_table(map);

    bitmap::set_head(map, 0, 0);
    bitmap::set_used_range(map, 0, 0, HEADER_GRANULES);

    let (_, g) = bitmap::granule_of(HEADER_SIZE);
    bitmap::set_head(map, 0, g);
    freelist::push(
        map,
        free_chunk_id(SLAB_DATA_BYTES - HEADER_SIZE),
        HEADER_SIZE,
    );

    let mut base = SLAB_SIZE;
    while base < map.len() {
        format_slab(map, base);
        base += SLAB_SIZE;
    }
}

/// Turn a zero-filled slab into one maximal free chunk.
fn format_slab(map: &mut Mapping, base: u64) {
    bitmap::set_head(map, base, 0);
    freelist::push(map, free_chunk_id(MAX_CHUNK_SIZE), base);
}

/// Extend the file by `slabs` slabs; returns the base of the first new
/// one. File extension zero-fills, so the new bitmaps start clear.
pub fn grow_slabs(map: &mut Mapping, slabs: u64) -> DgsResult<u64> {
    let base = map.len();
    map.grow(slabs * SLAB_SIZE)?;
    header::set_size(map, map.len());
    for i in 0..slabs {
        format_slab(map, base + i * SLAB_SIZE);
    }
    log::debug!("database grown to {} bytes", map.len());
    Ok(base)
}

// ============================================================================
// Allocation
// ============================================================================

/// Allocate a chunk of at least `size` bytes; returns its offset.
pub fn malloc(map: &mut Mapping, size: u64) -> DgsResult<u64> {
    let need = round_up(size);
    if need > MAX_CHUNK_SIZE {
        // No amount of growth yields a single chunk this large.
        return Err(if size >= MAX_SIZE {
            DgsError::TooLarge
        } else {
            DgsError::Alloc { size }
        });
    }

    // A class of CHUNK_TABLE_SIZE means no list can guarantee a fit; the
    // pop comes up empty and the request is served from a fresh slab.
    let class = alloc_chunk_id(size);
    let chunk = match freelist::pop_at_or_above(map, class) {
        Some(c) => c,
        None => {
            let base = grow_slabs(map, 1)?;
            freelist::unlink(map, base);
            base
        }
    };

    let len = chunk_len(map, chunk);
    debug_assert!(len >= need);
    let (slab, g) = bitmap::granule_of(chunk);

    // Split off the residual if it is big enough to stand alone.
    let take = if len - need >= MIN_CHUNK {
        let tail = chunk + need;
        let (_, tg) = bitmap::granule_of(tail);
        bitmap::set_head(map, slab, tg);
        freelist::push(map, free_chunk_id(len - need), tail);
        need
    } else {
        len
    };

    bitmap::set_used_range(map, slab, g, take / GRANULE);
    Ok(chunk)
}

/// Release the chunk at `off` that was allocated for `size` bytes.
///
/// Coalesces with free neighbours in the same slab and reinserts the
/// result. Panics if the bitmaps disagree with the request; continuing
/// past an inconsistent bitmap would corrupt the file.
pub fn free(map: &mut Mapping, off: u64, size: u64) {
    let need = round_up(size);
    let (slab, g) = bitmap::granule_of(off);
    if !bitmap::is_head(map, slab, g) || !bitmap::is_used(map, slab, g) {
        panic!("allocator bitmap corrupt: bad free at {off:#x}");
    }
    let len = chunk_len(map, off);
    // The chunk may exceed the rounded request by less than one node when
    // the allocator declined to split a tiny residual.
    if len < need || len - need >= MIN_CHUNK {
        panic!(
            "allocator bitmap corrupt: chunk at {off:#x} is {len} bytes, freed as {need}"
        );
    }

    bitmap::clear_used_range(map, slab, g, len / GRANULE);
    let mut start = g;
    let mut end = g + len / GRANULE;

    // Coalesce with a free predecessor.
    if start > 0 && !bitmap::is_used(map, slab, start - 1) {
        let p = bitmap::head_at_or_before(map, slab, start - 1);
        freelist::unlink(map, bitmap::offset_of(slab, p));
        bitmap::clear_head(map, slab, start);
        start = p;
    }

    // Coalesce with a free successor.
    if end < SLAB_GRANULES && !bitmap::is_used(map, slab, end) {
        if !bitmap::is_head(map, slab, end) {
            panic!("allocator bitmap corrupt: headless free chunk at granule {end}");
        }
        let next_end = bitmap::next_head_after(map, slab, end);
        freelist::unlink(map, bitmap::offset_of(slab, end));
        bitmap::clear_head(map, slab, end);
        end = next_end;
    }

    freelist::push(
        map,
        free_chunk_id((end - start) * GRANULE),
        bitmap::offset_of(slab, start),
    );
}

// ============================================================================
// Accounting
// ============================================================================

/// Audit the free-chunk table: walk every class list (verifying link
/// reciprocity and bounds), check each member against its class, and
/// return `(chunk count, total free bytes)`.
pub fn free_space(map: &Mapping) -> (u64, u64) {
    let mut chunks = 0u64;
    let mut bytes = 0u64;
    for class in 0..CHUNK_TABLE_SIZE {
        freelist::walk(map, class, |c| {
            let len = chunk_len(map, c);
            if free_chunk_id(len) != class {
                panic!("free chunk at {c:#x} of {len} bytes filed under class {class}");
            }
            chunks += 1;
            bytes += len;
        });
    }
    (chunks, bytes)
}

// ============================================================================
// Tests
// ============================================================================
