//! 16-way radix trie over 160-bit keys.
//!
//! Interior nodes fan out on one key nibble per level; leaves are Element
//! or KVPair handles, which the trie treats interchangeably through
//! [`object::obtain_key`]. Node depth is implied by the path from the
//! root and never stored.
//!
//! Two leaves sharing a nibble prefix force a chain of interior nodes
//! down to their first differing nibble; removal undoes such chains by
//! lifting a sole surviving leaf back toward the root, so interior nodes
//! always hold at least two live descendants.

use crate::core::error::DgsResult;
use crate::core::types::{Handle, Key, ObjectKind};
use crate::disk::mapping::Mapping;
use crate::object::{self, TRIE_SLOTS};
use crate::KEY_NIBBLES;

/// Allocate an empty trie.
pub fn create(map: &mut Mapping) -> DgsResult<Handle> {
    object::trie_node_create(map)
}

/// Insert a leaf under its own key.
///
/// Returns `Ok(true)` on insertion and `Ok(false)` when a leaf with the
/// same key is already present (the trie is left untouched and the caller
/// keeps ownership of `leaf`). On allocation failure every interior node
/// created along the way is released before the error is returned.
pub fn insert(map: &mut Mapping, root: Handle, leaf: Handle) -> DgsResult<bool> {
    let key = object::obtain_key(map, leaf);
    let mut node = root;
    let mut depth = 0;

    loop {
        let idx = key.nibble(depth);
        let slot = object::trie_slot(map, node, idx);

        if slot.is_null() {
            object::trie_set_slot(map, node, idx, leaf);
            return Ok(true);
        }
        if slot.kind() == ObjectKind::Trie {
            node = slot;
            depth += 1;
            continue;
        }

        // Occupied by a leaf: equal keys dedup, unequal keys grow a chain
        // of interior nodes down to the first differing nibble.
        let other = object::obtain_key(map, slot);
        if other == key {
            return Ok(false);
        }
        let mut fork = depth + 1;
        while key.nibble(fork) == other.nibble(fork) {
            fork += 1;
        }

        let links = fork - depth;
        let mut chain = [Handle::NULL; KEY_NIBBLES];
        for i in 0..links {
            match object::trie_node_create(map) {
                Ok(t) => chain[i] = t,
                Err(e) => {
                    for t in chain[..i].iter().rev() {
                        object::trie_node_delete(map, *t);
                    }
                    return Err(e);
                }
            }
        }

        let deepest = chain[links - 1];
        object::trie_set_slot(map, deepest, key.nibble(fork), leaf);
        object::trie_set_slot(map, deepest, other.nibble(fork), slot);
        for i in 0..links - 1 {
            object::trie_set_slot(
                map,
                chain[i],
                key.nibble(depth + 1 + i),
                chain[i + 1],
            );
        }
        object::trie_set_slot(map, node, idx, chain[0]);
        return Ok(true);
    }
}

/// Look up the leaf stored under `key`, if any.
pub fn find(map: &Mapping, root: Handle, key: &Key) -> Option<Handle> {
    let mut node = root;
    let mut depth = 0;
    loop {
        let slot = object::trie_slot(map, node, key.nibble(depth));
        if slot.is_null() {
            return None;
        }
        if slot.kind() == ObjectKind::Trie {
            node = slot;
            depth += 1;
            continue;
        }
        return (object::obtain_key(map, slot) == *key).then_some(slot);
    }
}

/// Remove and free the leaf stored under `key`.
///
/// Returns `true` if a leaf was removed. Interior nodes left with a
/// single leaf child and no subtries are collapsed away; the root node
/// itself is never freed.
pub fn remove(map: &mut Mapping, root: Handle, key: &Key) -> bool {
    let mut path = [(Handle::NULL, 0usize); KEY_NIBBLES];
    let mut node = root;
    let mut depth = 0;

    loop {
        let idx = key.nibble(depth);
        let slot = object::trie_slot(map, node, idx);
        if slot.is_null() {
            return false;
        }
        if slot.kind() == ObjectKind::Trie {
            path[depth] = (node, idx);
            node = slot;
            depth += 1;
            continue;
        }
        if object::obtain_key(map, slot) != *key {
            return false;
        }
        free_leaf(map, slot);
        object::trie_set_slot(map, node, idx, Handle::NULL);
        break;
    }

    // Collapse: lift a sole surviving leaf into the parent, repeatedly.
    while depth > 0 {
        let mut survivor = Handle::NULL;
        let mut children = 0;
        let mut has_subtrie = false;
        for idx in 0..TRIE_SLOTS {
            let child = object::trie_slot(map, node, idx);
            if !child.is_null() {
                children += 1;
                survivor = child;
                has_subtrie |= child.kind() == ObjectKind::Trie;
            }
        }
        if children != 1 || has_subtrie {
            break;
        }
        let (parent, idx) = path[depth - 1];
        object::trie_set_slot(map, parent, idx, survivor);
        object::trie_node_delete(map, node);
        node = parent;
        depth -= 1;
    }
    true
}

/// Recursively delete a trie: every subtrie and leaf in postorder, then
/// the node itself. Elements referenced by KVPair leaves are untouched.
pub fn delete(map: &mut Mapping, trie: Handle) {
    for idx in 0..TRIE_SLOTS {
        let child = object::trie_slot(map, trie, idx);
        if child.is_null() {
            continue;
        }
        if child.kind() == ObjectKind::Trie {
            delete(map, child);
        } else {
            free_leaf(map, child);
        }
    }
    object::trie_node_delete(map, trie);
}

/// Append every leaf of the trie to `out`, depth-first.
pub fn collect_leaves(map: &Mapping, trie: Handle, out: &mut Vec<Handle>) {
    for idx in 0..TRIE_SLOTS {
        let child = object::trie_slot(map, trie, idx);
        if child.is_null() {
            continue;
        }
        if child.kind() == ObjectKind::Trie {
            collect_leaves(map, child, out);
        } else {
            out.push(child);
        }
    }
}

fn free_leaf(map: &mut Mapping, leaf: Handle) {
    match leaf.kind() {
        ObjectKind::Element => object::element_delete(map, leaf),
        ObjectKind::KvPair => object::kvpair_delete(map, leaf),
        kind => panic!("object type mismatch: {kind:?} cannot be a trie leaf"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc;
    use crate::disk::header;
    use crate::{KEY_LEN, SLAB_SIZE};

    // The trailing NUL brings each literal to the full key width.
    const K1: &[u8; KEY_LEN] = b"0123456789012345678\0";
    const K2: &[u8; KEY_LEN] = b"0123056789012345678\0";
    const K3: &[u8; KEY_LEN] = b"0123456789012345670\0";
    const K4: &[u8; KEY_LEN] = b"1123456789012345670\0";

    fn scaffold() -> (tempfile::TempDir, Mapping) {
        let dir = tempfile::tempdir().unwrap();
        let mut map =
            Mapping::create(&dir.path().join("trie.dgs"), SLAB_SIZE).unwrap();
        header::write_initial(&mut map);
        alloc::init_slabs(&mut map);
        (dir, map)
    }

    fn element(map: &mut Mapping, key: &[u8; KEY_LEN], p1: u64, p2: u64) -> Handle {
        object::element_create(
            map,
            &Key(*key),
            Handle::from_raw(p1),
            Handle::from_raw(p2),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_trie() {
        let (_dir, mut map) = scaffold();
        let before = alloc::free_space(&map);

        let t = create(&mut map).unwrap();
        assert_eq!(find(&map, t, &Key(*K1)), None);
        delete(&mut map, t);
        assert_eq!(alloc::free_space(&map), before);
    }

    #[test]
    fn test_insert_find_remove() {
        let (_dir, mut map) = scaffold();
        let before = alloc::free_space(&map);
        let t = create(&mut map).unwrap();

        let el1 = element(&mut map, K1, 1, 2);
        let el2 = element(&mut map, K2, 3, 4);
        let el3 = element(&mut map, K1, 5, 6);

        assert_eq!(insert(&mut map, t, el1).unwrap(), true);
        assert_eq!(insert(&mut map, t, el2).unwrap(), true);
        // Same key again: duplicate, no mutation, caller keeps el3.
        assert_eq!(insert(&mut map, t, el3).unwrap(), false);
        object::element_delete(&mut map, el3);

        assert_eq!(find(&map, t, &Key(*K1)), Some(el1));
        assert_eq!(find(&map, t, &Key(*K2)), Some(el2));
        assert_eq!(find(&map, t, &Key(*K3)), None); // key mismatch on leaf
        assert_eq!(find(&map, t, &Key(*K4)), None); // empty slot

        assert!(remove(&mut map, t, &Key(*K1)));
        assert!(!remove(&mut map, t, &Key(*K1)));
        assert!(!remove(&mut map, t, &Key(*K3)));
        assert!(!remove(&mut map, t, &Key(*K4)));

        assert_eq!(find(&map, t, &Key(*K1)), None);
        let el2_again = find(&map, t, &Key(*K2)).unwrap();
        assert_eq!(object::element_data(&map, el2_again).raw(), 3);
        assert_eq!(object::element_backref(&map, el2_again).raw(), 4);

        assert!(remove(&mut map, t, &Key(*K2)));
        assert_eq!(find(&map, t, &Key(*K2)), None);

        delete(&mut map, t);
        assert_eq!(alloc::free_space(&map), before);
    }

    #[test]
    fn test_kvpair_leaf() {
        let (_dir, mut map) = scaffold();
        let t = create(&mut map).unwrap();

        let el = element(&mut map, K1, 1, 2);
        let kv = object::kvpair_create(&mut map, el, Handle::from_raw(3)).unwrap();

        assert_eq!(insert(&mut map, t, kv).unwrap(), true);
        // An element with the same key is a duplicate of the pair.
        assert_eq!(insert(&mut map, t, el).unwrap(), false);
        assert_eq!(find(&map, t, &Key(*K1)), Some(kv));

        // Removing frees the pair but not the element it pointed at.
        assert!(remove(&mut map, t, &Key(*K1)));
        assert_eq!(object::element_data(&map, el).raw(), 1);
        assert_eq!(object::element_backref(&map, el).raw(), 2);

        object::element_delete(&mut map, el);
        delete(&mut map, t);
    }

    #[test]
    fn test_deep_fork_and_collapse() {
        let (_dir, mut map) = scaffold();
        let before = alloc::free_space(&map);
        let t = create(&mut map).unwrap();

        // K1 and K3 first differ deep in the key (byte 18), so inserting
        // both builds a long chain of interior nodes.
        let el1 = element(&mut map, K1, 1, 2);
        let el3 = element(&mut map, K3, 3, 4);
        assert!(insert(&mut map, t, el1).unwrap());
        assert!(insert(&mut map, t, el3).unwrap());
        assert_eq!(find(&map, t, &Key(*K1)), Some(el1));
        assert_eq!(find(&map, t, &Key(*K3)), Some(el3));

        // Removing one end must collapse the whole chain back into the
        // root, freeing every interior node.
        let mid = alloc::free_space(&map);
        assert!(remove(&mut map, t, &Key(*K3)));
        assert_eq!(find(&map, t, &Key(*K1)), Some(el1));
        let after = alloc::free_space(&map);
        assert!(after.1 > mid.1);

        assert!(remove(&mut map, t, &Key(*K1)));
        delete(&mut map, t);
        assert_eq!(alloc::free_space(&map), before);
    }

    #[test]
    fn test_recursive_delete() {
        let (_dir, mut map) = scaffold();
        let before = alloc::free_space(&map);

        let t = create(&mut map).unwrap();
        for (key, p1) in [(K1, 0u64), (K2, 1), (K3, 2), (K4, 3)] {
            let el = element(&mut map, key, p1, 2);
            assert!(insert(&mut map, t, el).unwrap());
        }
        let dup = element(&mut map, K1, 9, 9);
        assert!(!insert(&mut map, t, dup).unwrap());
        object::element_delete(&mut map, dup);

        delete(&mut map, t);
        assert_eq!(alloc::free_space(&map), before);
    }
}
