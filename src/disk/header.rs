//! Database header structure and validation.
//!
//! The header sits at file offset 0 inside a pre-allocated chunk of slab
//! 0's data area. It records the file geometry, the root trie handle, and
//! embeds the free-chunk table sentinels so every free list has a fixed,
//! mappable anchor before any slab exists.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::alloc::freelist::{CHUNK_TABLE_SIZE, FREE_CHUNK_BYTES};
use crate::core::error::{DgsError, DgsResult};
use crate::core::types::{Handle, ObjectKind};
use crate::disk::mapping::Mapping;
use crate::{DGS_MAGIC, FORMAT_VERSION, GRANULE, KEY_LEN, MAX_SIZE, SLAB_SIZE};

// ============================================================================
// Layout
// ============================================================================

/// Byte offset of the `size` field.
pub const SIZE_OFF: u64 = 32;

/// Byte offset of the root trie handle field.
pub const ROOT_OFF: u64 = 40;

/// Byte offset of the embedded free-chunk table sentinels.
pub const CHUNK_TABLE_OFF: u64 = 48;

/// Total header size, including the sentinels. Granule-aligned.
pub const HEADER_SIZE: u64 =
    CHUNK_TABLE_OFF + CHUNK_TABLE_SIZE as u64 * FREE_CHUNK_BYTES;

/// Fixed offset of the root trie payload: the first chunk handed out
/// after the header when a database is created.
pub const ROOT_OFFSET: u64 = HEADER_SIZE;

const_assert_eq!(HEADER_SIZE % GRANULE, 0);

/// Fixed header fields, as stored at offset 0.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Header {
    /// Magic number ("DAGSTOR1"); doubles as the endianness marker.
    pub magic: u64,
    /// On-disk format version.
    pub version: u32,
    /// Allocation granule in bytes.
    pub granule: u32,
    /// Content key width in bytes.
    pub key_len: u32,
    /// Reserved, written as zero.
    pub _reserved: u32,
    /// Slab size in bytes.
    pub slab_size: u64,
    /// Current total file size in bytes.
    pub size: u64,
    /// Tagged handle of the root trie.
    pub root: u64,
}

const_assert_eq!(std::mem::size_of::<Header>() as u64, CHUNK_TABLE_OFF);

// ============================================================================
// Access
// ============================================================================

/// Read the fixed header fields.
pub fn read(map: &Mapping) -> Header {
    bytemuck::pod_read_unaligned(map.bytes(0, CHUNK_TABLE_OFF))
}

/// Stamp a fresh header into a newly created file. The root handle is
/// written separately once the root trie has been allocated.
pub fn write_initial(map: &mut Mapping) {
    let header = Header {
        magic: DGS_MAGIC,
        version: FORMAT_VERSION,
        granule: GRANULE as u32,
        key_len: KEY_LEN as u32,
        _reserved: 0,
        slab_size: SLAB_SIZE,
        size: map.len(),
        root: 0,
    };
    map.bytes_mut(0, CHUNK_TABLE_OFF)
        .copy_from_slice(bytemuck::bytes_of(&header));
}

/// Validate an existing header against this build's geometry.
pub fn validate(map: &Mapping) -> DgsResult<()> {
    let len = map.len();
    if len < SLAB_SIZE || len % SLAB_SIZE != 0 {
        return Err(DgsError::invalid_db("file size is not a slab multiple"));
    }
    if len > MAX_SIZE {
        return Err(DgsError::invalid_db("file exceeds the maximum size"));
    }

    let header = read(map);
    if header.magic != DGS_MAGIC {
        return Err(DgsError::invalid_db(
            "bad magic (not a dagstore file, or foreign endianness)",
        ));
    }
    if header.version != FORMAT_VERSION {
        return Err(DgsError::invalid_db(format!(
            "unsupported format version {}",
            header.version
        )));
    }
    if header.granule != GRANULE as u32 {
        return Err(DgsError::invalid_db("granule size mismatch"));
    }
    if header.key_len != KEY_LEN as u32 {
        return Err(DgsError::invalid_db("key width mismatch"));
    }
    if header.slab_size != SLAB_SIZE {
        return Err(DgsError::invalid_db("slab size mismatch"));
    }
    if header.size != len {
        return Err(DgsError::invalid_db("recorded size disagrees with file"));
    }

    let root = Handle::from_raw(header.root);
    if root.kind() != ObjectKind::Trie || root.offset() != ROOT_OFFSET {
        return Err(DgsError::invalid_db("root trie handle is malformed"));
    }
    if map.u8_at(ROOT_OFFSET) != ObjectKind::Trie as u8 {
        return Err(DgsError::invalid_db("root trie is not a trie object"));
    }
    Ok(())
}

/// Current total size recorded in the header.
#[inline]
pub fn size(map: &Mapping) -> u64 {
    map.u64_at(SIZE_OFF)
}

/// Update the recorded total size after growth.
#[inline]
pub fn set_size(map: &mut Mapping, size: u64) {
    map.set_u64(SIZE_OFF, size);
}

/// Root trie handle.
#[inline]
pub fn root(map: &Mapping) -> Handle {
    Handle::from_raw(map.u64_at(ROOT_OFF))
}

/// Store the root trie handle.
#[inline]
pub fn set_root(map: &mut Mapping, root: Handle) {
    map.set_u64(ROOT_OFF, root.raw());
}

// ============================================================================
// Tests
// ============================================================================
