//! File and memory-mapping lifecycle.
//!
//! [`Mapping`] owns the backing file, its exclusive advisory lock, and the
//! writable memory map. Everything above this layer addresses the file
//! through byte offsets; pointers derived from the map never outlive a
//! single operation, because growth replaces the mapping.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs4::fs_std::FileExt;
use memmap2::{MmapMut, MmapOptions};

use crate::core::error::{DgsError, DgsResult};
use crate::MAX_SIZE;

/// Owner of the backing file and its memory map.
#[derive(Debug)]
pub struct Mapping {
    file: File,
    map: MmapMut,
}

impl Mapping {
    /// Create a new database file of `len` bytes and map it.
    ///
    /// Fails if the path already exists. All open-time failures are
    /// reported as `InvalidDb`.
    pub fn create(path: &Path, len: u64) -> DgsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                DgsError::invalid_db(format!("cannot create database: {e}"))
            })?;
        lock(&file)?;
        file.set_len(len).map_err(|e| {
            DgsError::invalid_db(format!("cannot size database: {e}"))
        })?;
        let map = map_file(&file, len)?;
        Ok(Mapping { file, map })
    }

    /// Open and map an existing database file.
    pub fn open(path: &Path) -> DgsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                DgsError::invalid_db(format!("cannot open database: {e}"))
            })?;
        let meta = file.metadata().map_err(|e| {
            DgsError::invalid_db(format!("cannot stat database: {e}"))
        })?;
        if !meta.is_file() {
            return Err(DgsError::invalid_db("not a regular file"));
        }
        lock(&file)?;
        let map = map_file(&file, meta.len())?;
        Ok(Mapping { file, map })
    }

    /// Current mapped length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    /// Borrow `len` bytes starting at `off`.
    ///
    /// Offsets outside the mapping indicate a corrupt handle and panic.
    #[inline]
    pub fn bytes(&self, off: u64, len: u64) -> &[u8] {
        &self.map[off as usize..(off + len) as usize]
    }

    /// Mutably borrow `len` bytes starting at `off`.
    #[inline]
    pub fn bytes_mut(&mut self, off: u64, len: u64) -> &mut [u8] {
        &mut self.map[off as usize..(off + len) as usize]
    }

    #[inline]
    pub fn u8_at(&self, off: u64) -> u8 {
        self.map[off as usize]
    }

    #[inline]
    pub fn set_u8(&mut self, off: u64, value: u8) {
        self.map[off as usize] = value;
    }

    #[inline]
    pub fn u64_at(&self, off: u64) -> u64 {
        u64::from_ne_bytes(self.bytes(off, 8).try_into().unwrap())
    }

    #[inline]
    pub fn set_u64(&mut self, off: u64, value: u64) {
        self.bytes_mut(off, 8).copy_from_slice(&value.to_ne_bytes());
    }

    /// Extend the file by `by` bytes and remap.
    ///
    /// The new region is zero-filled by the filesystem. Fails with
    /// `TooLarge` when the result would exceed [`MAX_SIZE`].
    pub fn grow(&mut self, by: u64) -> DgsResult<()> {
        let new_len = self.len() + by;
        if new_len > MAX_SIZE {
            return Err(DgsError::TooLarge);
        }
        self.file.set_len(new_len)?;
        self.map = map_file(&self.file, new_len)?;
        Ok(())
    }

    /// Flush the mapping to disk.
    pub fn flush(&self) -> DgsResult<()> {
        self.map.flush()?;
        Ok(())
    }
}

fn lock(file: &File) -> DgsResult<()> {
    file.try_lock_exclusive().map_err(|e| {
        DgsError::invalid_db(format!("database is locked: {e}"))
    })?;
    Ok(())
}

fn map_file(file: &File, len: u64) -> DgsResult<MmapMut> {
    // Safety: the file is held under an exclusive advisory lock for the
    // lifetime of the mapping, and all access goes through bounds-checked
    // slices of the map.
    let map = unsafe { MmapOptions::new().len(len as usize).map_mut(file) }
        .map_err(|e| DgsError::invalid_db(format!("cannot map database: {e}")))?;
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SLAB_SIZE;

    #[test]
    fn test_create_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.dgs");

        let mut map = Mapping::create(&path, SLAB_SIZE).unwrap();
        assert_eq!(map.len(), SLAB_SIZE);
        map.set_u64(64, 0xdead_beef);
        map.set_u8(100, 7);
        map.flush().unwrap();
        drop(map);

        let map = Mapping::open(&path).unwrap();
        assert_eq!(map.len(), SLAB_SIZE);
        assert_eq!(map.u64_at(64), 0xdead_beef);
        assert_eq!(map.u8_at(100), 7);
    }

    #[test]
    fn test_open_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Mapping::open(dir.path()).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidDb);
    }

    #[test]
    fn test_grow_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.dgs");

        let mut map = Mapping::create(&path, SLAB_SIZE).unwrap();
        map.grow(SLAB_SIZE).unwrap();
        assert_eq!(map.len(), 2 * SLAB_SIZE);
        assert_eq!(map.u64_at(SLAB_SIZE + 8), 0);
    }

    #[test]
    fn test_grow_past_cap_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cap.dgs");

        let mut map = Mapping::create(&path, SLAB_SIZE).unwrap();
        let err = map.grow(MAX_SIZE).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::TooLarge);
    }
}
