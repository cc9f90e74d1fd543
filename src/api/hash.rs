//! Content digests.
//!
//! Blobs hash to the SHA-1 of their bytes. Records hash to the SHA-1 of
//! their canonical serialization: the 20-byte keys of each (field, value)
//! element pair laid out as 40-byte records, sorted lexicographically so
//! that entry order cannot affect the digest. The record digest is then
//! inverted bitwise, which keeps the two digest families disjoint: no
//! blob can collide with a record.

use sha1::{Digest, Sha1};

use crate::core::types::{Handle, Key};
use crate::disk::mapping::Mapping;
use crate::object;
use crate::KEY_LEN;

/// Digest of an opaque blob.
pub fn data_digest(bytes: &[u8]) -> Key {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    Key(hasher.finalize().into())
}

/// Digest of a record given its (field, value) element pairs.
pub fn record_digest(map: &Mapping, entries: &[(Handle, Handle)]) -> Key {
    let mut pairs: Vec<[u8; 2 * KEY_LEN]> = entries
        .iter()
        .map(|(field, value)| {
            let mut pair = [0u8; 2 * KEY_LEN];
            pair[..KEY_LEN]
                .copy_from_slice(object::obtain_key(map, *field).as_bytes());
            pair[KEY_LEN..]
                .copy_from_slice(object::obtain_key(map, *value).as_bytes());
            pair
        })
        .collect();
    pairs.sort_unstable();

    let mut hasher = Sha1::new();
    for pair in &pairs {
        hasher.update(pair);
    }
    let mut digest: [u8; KEY_LEN] = hasher.finalize().into();
    for byte in &mut digest {
        *byte = !*byte;
    }
    Key(digest)
}
