//! The free-chunk table: segregated lists of released chunks.
//!
//! One cyclic doubly-linked list per size class. The list sentinels are
//! embedded in the header so they have a fixed, mappable address before
//! any slab exists; an empty class's sentinel links to itself. Free
//! chunks store their `prev`/`next` offsets in the first two granules of
//! their own payload, which is why no chunk may be smaller than one
//! [`FreeChunk`] node.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::disk::header::{CHUNK_TABLE_OFF, HEADER_SIZE};
use crate::disk::mapping::Mapping;

// ============================================================================
// Constants
// ============================================================================

/// Number of size-class lists: exact classes for 2..=64 granules plus the
/// geometric classes up to one full slab data area.
pub const CHUNK_TABLE_SIZE: usize = 74;

/// On-disk size of one free-list node (and of each embedded sentinel).
pub const FREE_CHUNK_BYTES: u64 = 16;

/// Link node stored at the start of every free chunk.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct FreeChunk {
    /// Offset of the previous chunk (or sentinel) on the cycle.
    pub prev: u64,
    /// Offset of the next chunk (or sentinel) on the cycle.
    pub next: u64,
}

const_assert_eq!(std::mem::size_of::<FreeChunk>() as u64, FREE_CHUNK_BYTES);

/// Read the link node stored at `off`.
#[inline]
pub fn node(map: &Mapping, off: u64) -> FreeChunk {
    bytemuck::pod_read_unaligned(map.bytes(off, FREE_CHUNK_BYTES))
}

/// Offset of a class's sentinel inside the header.
#[inline]
pub fn sentinel_off(class: usize) -> u64 {
    debug_assert!(class < CHUNK_TABLE_SIZE);
    CHUNK_TABLE_OFF + class as u64 * FREE_CHUNK_BYTES
}

#[inline]
fn prev_of(map: &Mapping, off: u64) -> u64 {
    map.u64_at(off)
}

#[inline]
fn next_of(map: &Mapping, off: u64) -> u64 {
    map.u64_at(off + 8)
}

// ============================================================================
// List Operations
// ============================================================================

/// Self-link every sentinel (all classes empty).
pub fn init_table(map: &mut Mapping) {
    for class in 0..CHUNK_TABLE_SIZE {
        let s = sentinel_off(class);
        map.set_u64(s, s);
        map.set_u64(s + 8, s);
    }
}

/// Insert a chunk at the head of its class list.
pub fn push(map: &mut Mapping, class: usize, chunk: u64) {
    let s = sentinel_off(class);
    let first = next_of(map, s);
    map.set_u64(chunk, s);
    map.set_u64(chunk + 8, first);
    map.set_u64(first, chunk);
    map.set_u64(s + 8, chunk);
}

/// Remove a chunk from whatever list it is on.
///
/// Panics if the neighbours do not link back: a corrupt table cannot be
/// used safely, and continuing would damage the file further.
pub fn unlink(map: &mut Mapping, chunk: u64) {
    let FreeChunk { prev, next } = node(map, chunk);
    if next_of(map, prev) != chunk || prev_of(map, next) != chunk {
        panic!("free-chunk table corrupt near {chunk:#x}");
    }
    map.set_u64(prev + 8, next);
    map.set_u64(next, prev);
}

/// Pop the head of the first non-empty list at `class` or above.
pub fn pop_at_or_above(map: &mut Mapping, class: usize) -> Option<u64> {
    for c in class..CHUNK_TABLE_SIZE {
        let s = sentinel_off(c);
        let first = next_of(map, s);
        if first != s {
            unlink(map, first);
            return Some(first);
        }
    }
    None
}

/// Walk one class list, calling `f` for each chunk on it.
///
/// Verifies the cycle as it goes: every link must be reciprocal and every
/// chunk address must lie inside the data region. Used by the allocator's
/// accounting and by tests.
pub fn walk(map: &Mapping, class: usize, mut f: impl FnMut(u64)) {
    let s = sentinel_off(class);
    let mut cur = s;
    let mut steps: u64 = 0;
    loop {
        let next = next_of(map, cur);
        if prev_of(map, next) != cur {
            panic!("free-chunk table corrupt near {cur:#x}");
        }
        if next == s {
            return;
        }
        if next < HEADER_SIZE || next >= map.len() {
            panic!("free-chunk table entry {next:#x} out of bounds");
        }
        f(next);
        steps += 1;
        if steps > map.len() / FREE_CHUNK_BYTES {
            panic!("free-chunk table cycle broken for class {class}");
        }
        cur = next;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::header;
    use crate::SLAB_SIZE;

    fn test_map() -> (tempfile::TempDir, Mapping) {
        let dir = tempfile::tempdir().unwrap();
        let mut map =
            Mapping::create(&dir.path().join("fl.dgs"), SLAB_SIZE).unwrap();
        header::write_initial(&mut map);
        init_table(&mut map);
        (dir, map)
    }

    fn collect(map: &Mapping, class: usize) -> Vec<u64> {
        let mut out = Vec::new();
        walk(map, class, |c| out.push(c));
        out
    }

    #[test]
    fn test_empty_table() {
        let (_dir, map) = test_map();
        for class in 0..CHUNK_TABLE_SIZE {
            assert!(collect(&map, class).is_empty());
        }
    }

    #[test]
    fn test_push_pop() {
        let (_dir, mut map) = test_map();

        let a = HEADER_SIZE;
        let b = HEADER_SIZE + 64;
        push(&mut map, 3, a);
        push(&mut map, 3, b);

        // Most recently pushed chunk is at the head.
        assert_eq!(collect(&map, 3), vec![b, a]);

        assert_eq!(pop_at_or_above(&mut map, 3), Some(b));
        assert_eq!(collect(&map, 3), vec![a]);
        assert_eq!(pop_at_or_above(&mut map, 3), Some(a));
        assert_eq!(pop_at_or_above(&mut map, 3), None);
    }

    #[test]
    fn test_pop_searches_upward() {
        let (_dir, mut map) = test_map();

        let a = HEADER_SIZE;
        push(&mut map, 10, a);

        assert_eq!(pop_at_or_above(&mut map, 4), Some(a));
        assert_eq!(pop_at_or_above(&mut map, 0), None);
    }

    #[test]
    fn test_unlink_middle() {
        let (_dir, mut map) = test_map();

        let a = HEADER_SIZE;
        let b = HEADER_SIZE + 64;
        let c = HEADER_SIZE + 128;
        push(&mut map, 0, a);
        push(&mut map, 0, b);
        push(&mut map, 0, c);

        unlink(&mut map, b);
        assert_eq!(collect(&map, 0), vec![c, a]);
    }
}
