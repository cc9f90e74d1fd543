//! # Dagstore - Embeddable Content-Addressed Structured Database
//!
//! Dagstore is a single-file database in which every stored value is
//! identified by the cryptographic digest of its canonical serialization.
//! Identical values deduplicate automatically; records reference other
//! values by digest, so the store as a whole forms a directed acyclic
//! graph of content-addressed nodes.
//!
//! ## Key Features
//!
//! - **Single file**: the whole store is one memory-mapped regular file
//! - **Content addressing**: blobs and records are keyed by SHA-1 digest
//! - **Automatic dedup**: writing the same value twice yields the same handle
//! - **Persistent allocator**: all allocator state lives in the file itself
//! - **Typed handles**: every reference carries its object type in-band
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      Database API                          │
//! │   write_data / find_data / write_record / find_record      │
//! ├────────────────────────────────────────────────────────────┤
//! │                 Hash Router (SHA-1, dedup)                 │
//! ├────────────────────────────────────────────────────────────┤
//! │                      Radix Trie                            │
//! │        16-way nibble fan-out over 160-bit keys             │
//! ├────────────────────────────────────────────────────────────┤
//! │                  Typed Object Layer                        │
//! │           Data · Element · KVPair · Trie                   │
//! ├────────────────────────────────────────────────────────────┤
//! │                   Slab Allocator                           │
//! │   per-slab bitmaps · size-classed free-chunk table         │
//! ├────────────────────────────────────────────────────────────┤
//! │                 File/Mapping Manager                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Format
//!
//! ```text
//! Offset 0:        Header (magic, geometry, root handle,
//!                  free-chunk table sentinels)
//! Slab 0:          [data area][used bitmap][head bitmap]
//! Slab 1..n:       same layout, 1 MiB each
//! ```
//!
//! The header occupies a pre-allocated chunk at the start of slab 0's data
//! area, so the file begins with the magic bytes while slabs stay uniform
//! power-of-two regions. All references are 64-bit file offsets whose low
//! two bits carry the object type; the mapping base address never leaks
//! into persistent state.
//!
//! Multi-byte integers are stored in host byte order. The magic number is
//! compared as a native integer, so a file written on a machine of the
//! other endianness is rejected at open.

pub mod core;
pub mod disk;
pub mod alloc;
pub mod object;
pub mod trie;
pub mod api;

// Re-exports for convenience
pub use crate::api::{Database, OpenOptions, Stats};
pub use crate::core::error::{DgsError, DgsResult, ErrorCode};
pub use crate::core::types::{Handle, Key, ObjectKind};

/// Magic number: "DAGSTOR1" read as a host-endian integer.
pub const DGS_MAGIC: u64 = u64::from_ne_bytes(*b"DAGSTOR1");

/// On-disk format version. Version 1 uses SHA-1 content digests; a store
/// built with a different 160-bit digest must bump this.
pub const FORMAT_VERSION: u32 = 1;

/// Allocation granule in bytes. Every chunk offset and size is a multiple
/// of this, which keeps the low bits of handles free for the type tag.
pub const GRANULE: u64 = 8;

/// Content key width in bytes (160-bit digests).
pub const KEY_LEN: usize = 20;

/// Nibbles per key; one trie level consumes one nibble.
pub const KEY_NIBBLES: usize = KEY_LEN * 2;

/// Slab size: the unit of file growth.
pub const SLAB_SIZE: u64 = 1 << 20;

/// Maximum database file size (1 TiB).
pub const MAX_SIZE: u64 = 1 << 40;
