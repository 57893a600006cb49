/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! The page allocator grows paged files in fixed-size units and keeps a
//! memory map over their full extent.
//!
//! A [`PagedFile`] backs the record store, the string heap, and the join
//! areas. It knows nothing about the logical structure written inside the
//! pages; its only responsibilities are (a) extending the underlying file by
//! whole pages and (b) keeping a valid mapping over the current extent.
//! Growth remaps rather than relying on an anonymous-overcommit window,
//! since a safe-Rust implementation has no portable way to reserve address
//! space ahead of a file's committed size.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use tracing::debug;

use crate::constants::PAGE_SIZE;
use crate::error::{Error, Result};

enum Mapping {
    /// No pages allocated yet; nothing to map.
    Empty,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// A file grown and addressed in units of [`PAGE_SIZE`].
pub struct PagedFile {
    path: PathBuf,
    file: File,
    readonly: bool,
    page_count: u32,
    mapping: Mapping,
}

impl PagedFile {
    /// Open (creating if absent) a paged file at `path`. An existing file
    /// whose size is not a whole number of pages is rejected with
    /// [`Error::CorruptLayout`].
    pub fn open(path: impl AsRef<Path>, readonly: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(!readonly)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len % PAGE_SIZE != 0 {
            return Err(Error::CorruptLayout(format!(
                "{:?}: size {} is not a multiple of page size {}",
                path, len, PAGE_SIZE
            )));
        }
        let page_count = (len / PAGE_SIZE) as u32;

        let mut paged = Self {
            path,
            file,
            readonly,
            page_count: 0,
            mapping: Mapping::Empty,
        };
        if page_count > 0 {
            paged.remap(page_count)?;
        }
        Ok(paged)
    }

    /// Number of pages currently allocated.
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Total mapped capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.page_count as u64 * PAGE_SIZE
    }

    /// Grow the file by `n` pages, remapping it, and return the index of
    /// the first newly allocated page.
    pub fn allocate_pages(&mut self, n: u32) -> Result<u32> {
        if self.readonly {
            return Err(Error::Readonly);
        }
        let first = self.page_count;
        let new_count = self.page_count + n;
        self.file.set_len(new_count as u64 * PAGE_SIZE)?;
        self.remap(new_count)?;
        debug!(path = ?self.path, first_page = first, pages = n, "allocated pages");
        Ok(first)
    }

    /// Ensure at least `bytes` are mapped, growing by whole pages as
    /// needed. Returns the page index of the first page allocated by this
    /// call, or `None` if capacity was already sufficient.
    pub fn ensure_capacity(&mut self, bytes: u64) -> Result<Option<u32>> {
        if bytes <= self.capacity() {
            return Ok(None);
        }
        let needed = bytes - self.capacity();
        let pages = needed.div_ceil(PAGE_SIZE) as u32;
        Ok(Some(self.allocate_pages(pages)?))
    }

    fn remap(&mut self, page_count: u32) -> Result<()> {
        self.mapping = if self.readonly {
            Mapping::ReadOnly(unsafe { Mmap::map(&self.file)? })
        } else {
            Mapping::ReadWrite(unsafe { MmapMut::map_mut(&self.file)? })
        };
        self.page_count = page_count;
        Ok(())
    }

    /// Read-only view over the full mapped extent.
    pub fn as_slice(&self) -> &[u8] {
        match &self.mapping {
            Mapping::Empty => &[],
            Mapping::ReadOnly(m) => m,
            Mapping::ReadWrite(m) => m,
        }
    }

    /// Mutable view over the full mapped extent. Fails if the file was
    /// opened readonly.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        match &mut self.mapping {
            Mapping::Empty => Ok(&mut []),
            Mapping::ReadOnly(_) => Err(Error::Readonly),
            Mapping::ReadWrite(m) => Ok(m),
        }
    }

    /// Flush dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        if let Mapping::ReadWrite(m) = &self.mapping {
            m.flush()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_grows_capacity() {
        let dir = tempdir().unwrap();
        let mut pf = PagedFile::open(dir.path().join("t.dat"), false).unwrap();
        assert_eq!(pf.page_count(), 0);

        let first = pf.allocate_pages(2).unwrap();
        assert_eq!(first, 0);
        assert_eq!(pf.page_count(), 2);
        assert_eq!(pf.capacity(), 2 * PAGE_SIZE);

        let second = pf.allocate_pages(1).unwrap();
        assert_eq!(second, 2);
        assert_eq!(pf.page_count(), 3);
    }

    #[test]
    fn write_then_reopen_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        {
            let mut pf = PagedFile::open(&path, false).unwrap();
            pf.allocate_pages(1).unwrap();
            let buf = pf.as_mut_slice().unwrap();
            buf[0] = 42;
            pf.flush().unwrap();
        }
        let pf = PagedFile::open(&path, true).unwrap();
        assert_eq!(pf.page_count(), 1);
        assert_eq!(pf.as_slice()[0], 42);
    }

    #[test]
    fn corrupt_size_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        std::fs::write(&path, vec![0u8; 17]).unwrap();
        let err = PagedFile::open(&path, true).unwrap_err();
        assert!(matches!(err, Error::CorruptLayout(_)));
    }

    #[test]
    fn readonly_mutation_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        {
            let mut pf = PagedFile::open(&path, false).unwrap();
            pf.allocate_pages(1).unwrap();
        }
        let mut pf = PagedFile::open(&path, true).unwrap();
        assert!(matches!(pf.as_mut_slice(), Err(Error::Readonly)));
        assert!(matches!(pf.allocate_pages(1), Err(Error::Readonly)));
    }
}
