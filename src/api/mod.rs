//! Public database surface.
//!
//! [`Database`] brackets the lifetime of the mapping and routes all
//! content-addressed operations: hashing, dedup lookup through the root
//! trie, and all-or-nothing writes. The lower-level object and trie
//! operations are re-exposed as methods for advanced use; everything
//! speaks handles, never pointers.

pub mod hash;

use std::path::Path;

use crate::core::error::{DgsError, DgsResult};
use crate::core::types::{Handle, Key, ObjectKind};
use crate::disk::header;
use crate::disk::mapping::Mapping;
use crate::{alloc, object, trie};
use crate::{MAX_SIZE, SLAB_SIZE};

// ============================================================================
// Open Options
// ============================================================================

/// Options for opening or creating a database file.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    create: bool,
    size: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { create: true, size: SLAB_SIZE }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a missing file should be created (default `true`).
    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    /// Initial size hint for a newly created database, rounded up to
    /// whole slabs (default one slab). Ignored when the file exists.
    pub fn size(&mut self, size: u64) -> &mut Self {
        self.size = size;
        self
    }

    /// Open the database at `path`, creating it if allowed.
    pub fn open(&self, path: impl AsRef<Path>) -> DgsResult<Database> {
        let path = path.as_ref();
        if path.exists() {
            let map = Mapping::open(path)?;
            header::validate(&map)?;
            log::info!(
                "opened database {} ({} bytes)",
                path.display(),
                map.len()
            );
            return Ok(Database { map });
        }
        if !self.create {
            return Err(DgsError::invalid_db("database does not exist"));
        }

        let len = self.size.div_ceil(SLAB_SIZE).max(1) * SLAB_SIZE;
        if len > MAX_SIZE {
            return Err(DgsError::TooLarge);
        }
        let mut map = Mapping::create(path, len)?;
        header::write_initial(&mut map);
        alloc::init_slabs(&mut map);

        // The first allocation lands right after the header, which is
        // where the fixed root offset expects it.
        let root = trie::create(&mut map)?;
        debug_assert_eq!(root.offset(), header::ROOT_OFFSET);
        header::set_root(&mut map, root);
        map.flush().map_err(|e| {
            DgsError::invalid_db(format!("cannot flush new database: {e}"))
        })?;
        log::info!("created database {} ({len} bytes)", path.display());
        Ok(Database { map })
    }
}

// ============================================================================
// Database
// ============================================================================

/// Allocator usage summary.
#[derive(Clone, Copy, Debug)]
pub struct Stats {
    /// Total file size in bytes.
    pub size: u64,
    /// Number of slabs.
    pub slabs: u64,
    /// Bytes sitting on the free-chunk table.
    pub free_bytes: u64,
    /// Chunks sitting on the free-chunk table.
    pub free_chunks: u64,
}

/// An open dagstore database.
///
/// Exactly one `Database` may be attached to a file at a time; the file
/// is held under an exclusive advisory lock until the value is dropped.
#[derive(Debug)]
pub struct Database {
    map: Mapping,
}

impl Database {
    /// Open (or create) the database at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> DgsResult<Self> {
        OpenOptions::new().open(path)
    }

    /// Flush and detach. Dropping the value has the same effect, minus
    /// the chance to observe a flush failure.
    pub fn close(self) -> DgsResult<()> {
        self.map.flush()
    }

    /// Flush the mapping to disk.
    pub fn sync(&self) -> DgsResult<()> {
        self.map.flush()
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.map.len()
    }

    /// Audit the allocator and summarize usage.
    pub fn stats(&self) -> Stats {
        let (free_chunks, free_bytes) = alloc::free_space(&self.map);
        Stats {
            size: self.map.len(),
            slabs: self.map.len() / SLAB_SIZE,
            free_bytes,
            free_chunks,
        }
    }

    /// Handle of the root trie.
    pub fn root(&self) -> Handle {
        header::root(&self.map)
    }

    // ------------------------------------------------------------------
    // Content-addressed operations
    // ------------------------------------------------------------------

    /// Look up a blob by content. Returns its Element if present.
    pub fn find_data(&self, bytes: &[u8]) -> Option<Handle> {
        trie::find(&self.map, self.root(), &hash::data_digest(bytes))
    }

    /// Store a blob, deduplicating by content.
    ///
    /// Returns the existing Element when the same bytes were stored
    /// before; otherwise creates the Data object, an empty back-reference
    /// trie, and the Element, and indexes it under the root trie. On
    /// failure all partial allocations are released.
    pub fn write_data(&mut self, bytes: &[u8]) -> DgsResult<Handle> {
        let key = hash::data_digest(bytes);
        let root = self.root();
        if let Some(existing) = trie::find(&self.map, root, &key) {
            return Ok(existing);
        }

        let data = object::data_create(&mut self.map, bytes)?;
        let backref = match trie::create(&mut self.map) {
            Ok(t) => t,
            Err(e) => {
                object::data_delete(&mut self.map, data);
                return Err(e);
            }
        };
        let element =
            match object::element_create(&mut self.map, &key, data, backref) {
                Ok(el) => el,
                Err(e) => {
                    trie::delete(&mut self.map, backref);
                    object::data_delete(&mut self.map, data);
                    return Err(e);
                }
            };
        match trie::insert(&mut self.map, root, element) {
            Ok(inserted) => {
                debug_assert!(inserted);
                Ok(element)
            }
            Err(e) => {
                object::element_delete(&mut self.map, element);
                trie::delete(&mut self.map, backref);
                object::data_delete(&mut self.map, data);
                Err(e)
            }
        }
    }

    /// Look up a record by its (field, value) element pairs.
    pub fn find_record(&self, entries: &[(Handle, Handle)]) -> Option<Handle> {
        let key = hash::record_digest(&self.map, entries);
        trie::find(&self.map, self.root(), &key)
    }

    /// Store a record, deduplicating by its canonical digest.
    ///
    /// The record's internal trie receives one KVPair per entry. Entry
    /// order does not matter; a duplicated field keeps its first value.
    /// On failure all partial allocations are released.
    pub fn write_record(
        &mut self,
        entries: &[(Handle, Handle)],
    ) -> DgsResult<Handle> {
        let key = hash::record_digest(&self.map, entries);
        let root = self.root();
        if let Some(existing) = trie::find(&self.map, root, &key) {
            return Ok(existing);
        }

        let fields = trie::create(&mut self.map)?;
        for (field, value) in entries {
            let pair = match object::kvpair_create(&mut self.map, *field, *value)
            {
                Ok(kv) => kv,
                Err(e) => {
                    trie::delete(&mut self.map, fields);
                    return Err(e);
                }
            };
            match trie::insert(&mut self.map, fields, pair) {
                Ok(true) => {}
                Ok(false) => object::kvpair_delete(&mut self.map, pair),
                Err(e) => {
                    object::kvpair_delete(&mut self.map, pair);
                    trie::delete(&mut self.map, fields);
                    return Err(e);
                }
            }
        }

        let backref = match trie::create(&mut self.map) {
            Ok(t) => t,
            Err(e) => {
                trie::delete(&mut self.map, fields);
                return Err(e);
            }
        };
        let element =
            match object::element_create(&mut self.map, &key, fields, backref) {
                Ok(el) => el,
                Err(e) => {
                    trie::delete(&mut self.map, backref);
                    trie::delete(&mut self.map, fields);
                    return Err(e);
                }
            };
        match trie::insert(&mut self.map, root, element) {
            Ok(inserted) => {
                debug_assert!(inserted);
                Ok(element)
            }
            Err(e) => {
                object::element_delete(&mut self.map, element);
                trie::delete(&mut self.map, backref);
                trie::delete(&mut self.map, fields);
                Err(e)
            }
        }
    }

    /// The (field, value) pairs of a stored record, or `None` when the
    /// element holds a blob.
    pub fn record_fields(
        &self,
        record: Handle,
    ) -> Option<Vec<(Handle, Handle)>> {
        let payload = object::element_data(&self.map, record);
        if payload.kind() != ObjectKind::Trie {
            return None;
        }
        let mut leaves = Vec::new();
        trie::collect_leaves(&self.map, payload, &mut leaves);
        Some(
            leaves
                .into_iter()
                .map(|kv| {
                    (
                        object::kvpair_key(&self.map, kv),
                        object::kvpair_value(&self.map, kv),
                    )
                })
                .collect(),
        )
    }

    // ------------------------------------------------------------------
    // Lower-level operations
    // ------------------------------------------------------------------

    /// Kind of the object behind a handle, verifying its stamp.
    pub fn kind_of(&self, h: Handle) -> ObjectKind {
        object::kind_of(&self.map, h)
    }

    pub fn data_create(&mut self, bytes: &[u8]) -> DgsResult<Handle> {
        object::data_create(&mut self.map, bytes)
    }

    pub fn data_len(&self, h: Handle) -> u64 {
        object::data_len(&self.map, h)
    }

    pub fn data_bytes(&self, h: Handle) -> &[u8] {
        object::data_bytes(&self.map, h)
    }

    pub fn data_delete(&mut self, h: Handle) {
        object::data_delete(&mut self.map, h)
    }

    pub fn element_create(
        &mut self,
        key: &Key,
        data: Handle,
        backref: Handle,
    ) -> DgsResult<Handle> {
        object::element_create(&mut self.map, key, data, backref)
    }

    pub fn element_key(&self, h: Handle) -> Key {
        object::element_key(&self.map, h)
    }

    pub fn element_data(&self, h: Handle) -> Handle {
        object::element_data(&self.map, h)
    }

    pub fn element_backref(&self, h: Handle) -> Handle {
        object::element_backref(&self.map, h)
    }

    pub fn element_delete(&mut self, h: Handle) {
        object::element_delete(&mut self.map, h)
    }

    pub fn kvpair_create(
        &mut self,
        key: Handle,
        value: Handle,
    ) -> DgsResult<Handle> {
        object::kvpair_create(&mut self.map, key, value)
    }

    pub fn kvpair_key(&self, h: Handle) -> Handle {
        object::kvpair_key(&self.map, h)
    }

    pub fn kvpair_value(&self, h: Handle) -> Handle {
        object::kvpair_value(&self.map, h)
    }

    pub fn kvpair_delete(&mut self, h: Handle) {
        object::kvpair_delete(&mut self.map, h)
    }

    pub fn trie_create(&mut self) -> DgsResult<Handle> {
        trie::create(&mut self.map)
    }

    pub fn trie_insert(&mut self, root: Handle, leaf: Handle) -> DgsResult<bool> {
        trie::insert(&mut self.map, root, leaf)
    }

    pub fn trie_find(&self, root: Handle, key: &Key) -> Option<Handle> {
        trie::find(&self.map, root, key)
    }

    pub fn trie_remove(&mut self, root: Handle, key: &Key) -> bool {
        trie::remove(&mut self.map, root, key)
    }

    pub fn trie_delete(&mut self, h: Handle) {
        trie::delete(&mut self.map, h)
    }
}

// ============================================================================
// Tests
// ============================================================================
