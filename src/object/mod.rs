//! Typed on-disk objects.
//!
//! Four shapes share one envelope: a chunk whose first byte is the type
//! discriminator, mirrored by the low two bits of every handle that
//! refers to it. Creation allocates the exact payload plus that one byte
//! (rounded to the granule), stamps the discriminator, and fills every
//! field; deletion hands the chunk straight back to the allocator.
//!
//! ```text
//! Data     [disc][length u64][bytes...]
//! Trie     [disc][slot 0..16 u64]
//! KVPair   [disc][key handle][value handle]
//! Element  [disc][key 20B][pointer1][pointer2]
//! ```
//!
//! A handle whose tag disagrees with the stamped discriminator is
//! corruption; all accessors panic on it rather than read on.

use crate::alloc;
use crate::core::error::DgsResult;
use crate::core::types::{Handle, Key, ObjectKind};
use crate::disk::mapping::Mapping;
use crate::KEY_LEN;

// ============================================================================
// Layout
// ============================================================================

/// Slots per trie node.
pub const TRIE_SLOTS: usize = 16;

/// Bytes preceding a Data object's payload (discriminator + length).
const DATA_HEADER: u64 = 9;

/// Element payload: discriminator, key, two pointers.
const ELEMENT_BYTES: u64 = 1 + KEY_LEN as u64 + 16;

/// KVPair payload: discriminator, two handles.
const KVPAIR_BYTES: u64 = 17;

/// Trie payload: discriminator, sixteen slots.
const TRIE_BYTES: u64 = 1 + 8 * TRIE_SLOTS as u64;

const ELEM_KEY_OFF: u64 = 1;
const ELEM_DATA_OFF: u64 = 1 + KEY_LEN as u64;
const ELEM_BACKREF_OFF: u64 = ELEM_DATA_OFF + 8;

const KV_KEY_OFF: u64 = 1;
const KV_VALUE_OFF: u64 = 9;

#[inline]
fn stamp(map: &mut Mapping, off: u64, kind: ObjectKind) {
    map.set_u8(off, kind as u8);
}

/// Verify that a handle's tag and the stamped discriminator agree on
/// `kind`. A mismatch means the handle or the file is corrupt.
fn check(map: &Mapping, h: Handle, kind: ObjectKind) {
    if h.is_null() || h.kind() != kind || map.u8_at(h.offset()) != kind as u8 {
        panic!("object type mismatch: {h:?} is not {kind:?}");
    }
}

/// Kind of the object a handle refers to, after verifying the stamp.
pub fn kind_of(map: &Mapping, h: Handle) -> ObjectKind {
    check(map, h, h.kind());
    h.kind()
}

// ============================================================================
// Data
// ============================================================================

/// Store an immutable blob; returns its Data handle.
pub fn data_create(map: &mut Mapping, bytes: &[u8]) -> DgsResult<Handle> {
    let off = alloc::malloc(map, DATA_HEADER + bytes.len() as u64)?;
    stamp(map, off, ObjectKind::Data);
    map.set_u64(off + 1, bytes.len() as u64);
    map.bytes_mut(off + DATA_HEADER, bytes.len() as u64)
        .copy_from_slice(bytes);
    Ok(Handle::tagged(off, ObjectKind::Data))
}

/// Length of a blob in bytes.
pub fn data_len(map: &Mapping, h: Handle) -> u64 {
    check(map, h, ObjectKind::Data);
    map.u64_at(h.offset() + 1)
}

/// Borrow a blob's payload.
pub fn data_bytes(map: &Mapping, h: Handle) -> &[u8] {
    let len = data_len(map, h);
    map.bytes(h.offset() + DATA_HEADER, len)
}

/// Release a blob. The handle must not be used afterwards.
pub fn data_delete(map: &mut Mapping, h: Handle) {
    let len = data_len(map, h);
    alloc::free(map, h.offset(), DATA_HEADER + len);
}

// ============================================================================
// Element
// ============================================================================

/// Store a content-addressed node: its key, a payload pointer (Data for
/// blobs, Trie for records), and its back-reference trie.
pub fn element_create(
    map: &mut Mapping,
    key: &Key,
    data: Handle,
    backref: Handle,
) -> DgsResult<Handle> {
    let off = alloc::malloc(map, ELEMENT_BYTES)?;
    stamp(map, off, ObjectKind::Element);
    map.bytes_mut(off + ELEM_KEY_OFF, KEY_LEN as u64)
        .copy_from_slice(key.as_bytes());
    map.set_u64(off + ELEM_DATA_OFF, data.raw());
    map.set_u64(off + ELEM_BACKREF_OFF, backref.raw());
    Ok(Handle::tagged(off, ObjectKind::Element))
}

/// The element's 160-bit content key.
pub fn element_key(map: &Mapping, h: Handle) -> Key {
    check(map, h, ObjectKind::Element);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(map.bytes(h.offset() + ELEM_KEY_OFF, KEY_LEN as u64));
    Key(key)
}

/// The element's payload pointer.
pub fn element_data(map: &Mapping, h: Handle) -> Handle {
    check(map, h, ObjectKind::Element);
    Handle::from_raw(map.u64_at(h.offset() + ELEM_DATA_OFF))
}

/// The element's back-reference trie.
pub fn element_backref(map: &Mapping, h: Handle) -> Handle {
    check(map, h, ObjectKind::Element);
    Handle::from_raw(map.u64_at(h.offset() + ELEM_BACKREF_OFF))
}

/// Release an element node only; referenced objects are untouched.
pub fn element_delete(map: &mut Mapping, h: Handle) {
    check(map, h, ObjectKind::Element);
    alloc::free(map, h.offset(), ELEMENT_BYTES);
}

// ============================================================================
// KVPair
// ============================================================================

/// Store a key/value edge. `key` must refer to an Element; the pair is
/// indexed under that element's content key.
pub fn kvpair_create(
    map: &mut Mapping,
    key: Handle,
    value: Handle,
) -> DgsResult<Handle> {
    check(map, key, ObjectKind::Element);
    let off = alloc::malloc(map, KVPAIR_BYTES)?;
    stamp(map, off, ObjectKind::KvPair);
    map.set_u64(off + KV_KEY_OFF, key.raw());
    map.set_u64(off + KV_VALUE_OFF, value.raw());
    Ok(Handle::tagged(off, ObjectKind::KvPair))
}

/// The element whose key indexes this pair.
pub fn kvpair_key(map: &Mapping, h: Handle) -> Handle {
    check(map, h, ObjectKind::KvPair);
    Handle::from_raw(map.u64_at(h.offset() + KV_KEY_OFF))
}

/// The pair's value handle.
pub fn kvpair_value(map: &Mapping, h: Handle) -> Handle {
    check(map, h, ObjectKind::KvPair);
    Handle::from_raw(map.u64_at(h.offset() + KV_VALUE_OFF))
}

/// Release the pair only; the key element and value are untouched.
pub fn kvpair_delete(map: &mut Mapping, h: Handle) {
    check(map, h, ObjectKind::KvPair);
    alloc::free(map, h.offset(), KVPAIR_BYTES);
}

// ============================================================================
// Trie Nodes
// ============================================================================

/// Allocate a trie node with all slots null.
pub fn trie_node_create(map: &mut Mapping) -> DgsResult<Handle> {
    let off = alloc::malloc(map, TRIE_BYTES)?;
    stamp(map, off, ObjectKind::Trie);
    // Reused chunks carry stale bytes; every slot must be cleared.
    map.bytes_mut(off + 1, 8 * TRIE_SLOTS as u64).fill(0);
    Ok(Handle::tagged(off, ObjectKind::Trie))
}

/// Read one child slot.
pub fn trie_slot(map: &Mapping, h: Handle, idx: usize) -> Handle {
    debug_assert!(idx < TRIE_SLOTS);
    check(map, h, ObjectKind::Trie);
    Handle::from_raw(map.u64_at(h.offset() + 1 + 8 * idx as u64))
}

/// Write one child slot.
pub fn trie_set_slot(map: &mut Mapping, h: Handle, idx: usize, child: Handle) {
    debug_assert!(idx < TRIE_SLOTS);
    check(map, h, ObjectKind::Trie);
    map.set_u64(h.offset() + 1 + 8 * idx as u64, child.raw());
}

/// Release a single trie node without touching its children.
pub fn trie_node_delete(map: &mut Mapping, h: Handle) {
    check(map, h, ObjectKind::Trie);
    alloc::free(map, h.offset(), TRIE_BYTES);
}

// ============================================================================
// Key Extraction
// ============================================================================

/// The 20-byte key a trie leaf is placed under: an element's own key, or
/// for a pair the key of the element it points at. The two leaf shapes
/// are interchangeable to the trie.
pub fn obtain_key(map: &Mapping, leaf: Handle) -> Key {
    match leaf.kind() {
        ObjectKind::Element => element_key(map, leaf),
        ObjectKind::KvPair => element_key(map, kvpair_key(map, leaf)),
        kind => panic!("object type mismatch: {kind:?} has no key"),
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

    fn scaffold() -> (tempfile::TempDir, Mapping) {
        let dir = tempfile::tempdir().unwrap();
        let mut map =
            Mapping::create(&dir.path().join("obj.dgs"), SLAB_SIZE).unwrap();
        header::write_initial(&mut map);
        alloc::init_slabs(&mut map);
        (dir, map)
    }

    fn key(bytes: &[u8; KEY_LEN]) -> Key {
        Key(*bytes)
    }

    #[test]
    fn test_data() {
        let (_dir, mut map) = scaffold();
        let before = alloc::free_space(&map);

        let payload = b"This is a test";
        let h = data_create(&mut map, payload).unwrap();
        assert_eq!(h.kind(), ObjectKind::Data);
        assert_eq!(data_len(&map, h), payload.len() as u64);
        assert_eq!(data_bytes(&map, h), payload);

        data_delete(&mut map, h);
        assert_eq!(alloc::free_space(&map), before);
    }

    #[test]
    fn test_empty_data() {
        let (_dir, mut map) = scaffold();

        let h = data_create(&mut map, b"").unwrap();
        assert_eq!(data_len(&map, h), 0);
        assert!(data_bytes(&map, h).is_empty());
        data_delete(&mut map, h);
    }

    #[test]
    fn test_element() {
        let (_dir, mut map) = scaffold();
        let k = key(b"0123456789012345678\0");

        let el = element_create(
            &mut map,
            &k,
            Handle::from_raw(1000),
            Handle::from_raw(1337),
        )
        .unwrap();
        assert_eq!(el.kind(), ObjectKind::Element);
        assert_eq!(element_data(&map, el).raw(), 1000);
        assert_eq!(element_backref(&map, el).raw(), 1337);
        assert_eq!(element_key(&map, el), k);
        assert_eq!(obtain_key(&map, el), k);

        element_delete(&mut map, el);
    }

    #[test]
    fn test_kvpair() {
        let (_dir, mut map) = scaffold();
        let k = key(b"0123456789012345678\0");

        let el = element_create(
            &mut map,
            &k,
            Handle::from_raw(4),
            Handle::from_raw(8),
        )
        .unwrap();
        let kv = kvpair_create(&mut map, el, Handle::from_raw(40)).unwrap();
        assert_eq!(kv.kind(), ObjectKind::KvPair);
        assert_eq!(kvpair_key(&map, kv), el);
        assert_eq!(kvpair_value(&map, kv).raw(), 40);
        assert_eq!(obtain_key(&map, kv), k);

        // Deleting the pair leaves the key element intact.
        kvpair_delete(&mut map, kv);
        assert_eq!(element_data(&map, el).raw(), 4);
        assert_eq!(element_backref(&map, el).raw(), 8);
        element_delete(&mut map, el);
    }

    #[test]
    fn test_trie_node() {
        let (_dir, mut map) = scaffold();

        let t = trie_node_create(&mut map).unwrap();
        assert_eq!(t.kind(), ObjectKind::Trie);
        for idx in 0..TRIE_SLOTS {
            assert!(trie_slot(&map, t, idx).is_null());
        }

        let child = Handle::tagged(0x4000, ObjectKind::Element);
        trie_set_slot(&mut map, t, 5, child);
        assert_eq!(trie_slot(&map, t, 5), child);
        assert!(trie_slot(&map, t, 4).is_null());

        trie_node_delete(&mut map, t);
    }

    #[test]
    fn test_node_reuse_is_clean() {
        let (_dir, mut map) = scaffold();

        // A freed node's chunk carries stale free-list words; a trie
        // allocated on top of it must still start empty.
        let t1 = trie_node_create(&mut map).unwrap();
        trie_set_slot(&mut map, t1, 0, Handle::tagged(0x4000, ObjectKind::Element));
        trie_node_delete(&mut map, t1);

        let t2 = trie_node_create(&mut map).unwrap();
        assert_eq!(t2, t1);
        for idx in 0..TRIE_SLOTS {
            assert!(trie_slot(&map, t2, idx).is_null());
        }
        trie_node_delete(&mut map, t2);
    }
}
