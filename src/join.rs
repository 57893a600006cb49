/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Join areas back plural associations and index value lists.
//!
//! A scalar join area is a packed array of `rod_id`s; a polymorphic join
//! area is a packed array of `(rod_id, class_tag)` pairs, used when a plural
//! association's target is declared as a supertype with multiple concrete
//! subtypes. Both are append-only: a collection proxy's flush appends a
//! fresh run and the owning record is updated to point at it, leaving any
//! previous run as unreferenced garbage in the file, consistent with the
//! record store and string heap.

use std::mem::size_of;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{ClassTag, RodId};
use crate::error::{Error, Result};
use crate::page::PagedFile;

const SCALAR_ELEM_SIZE: usize = size_of::<RodId>();
const POLY_ELEM_SIZE: usize = size_of::<RodId>() + size_of::<ClassTag>();

/// A contiguous run within a join area, as stored inline in a record, and
/// as the value half of a serialized index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRange {
    pub offset: u32,
    pub len: u32,
}

/// Packed array of `rod_id`s backing same-type plural associations.
pub struct ScalarJoinArea {
    file: PagedFile,
    tail: u32,
}

impl ScalarJoinArea {
    pub fn open(path: impl AsRef<Path>, readonly: bool) -> Result<Self> {
        let file = PagedFile::open(path, readonly)?;
        let tail = (file.capacity() / SCALAR_ELEM_SIZE as u64) as u32;
        Ok(Self { file, tail })
    }

    /// Append `ids` as a new run and return its range.
    pub fn append(&mut self, ids: &[RodId]) -> Result<JoinRange> {
        let offset = self.tail;
        let end_bytes = (offset as u64 + ids.len() as u64) * SCALAR_ELEM_SIZE as u64;
        self.file.ensure_capacity(end_bytes)?;
        let buf = self.file.as_mut_slice()?;
        let start = offset as usize * SCALAR_ELEM_SIZE;
        for (i, id) in ids.iter().enumerate() {
            let at = start + i * SCALAR_ELEM_SIZE;
            buf[at..at + SCALAR_ELEM_SIZE].copy_from_slice(&id.to_le_bytes());
        }
        self.tail = offset + ids.len() as u32;
        Ok(JoinRange {
            offset,
            len: ids.len() as u32,
        })
    }

    /// Read the run addressed by `range`.
    pub fn read(&self, range: JoinRange) -> Result<Vec<RodId>> {
        let start = range.offset as usize * SCALAR_ELEM_SIZE;
        let end = start + range.len as usize * SCALAR_ELEM_SIZE;
        let slice = self.file.as_slice();
        if end > slice.len() {
            return Err(Error::OutOfRange(format!(
                "scalar join range [{start}, {end}) exceeds area size {}",
                slice.len()
            )));
        }
        Ok(slice[start..end]
            .chunks_exact(SCALAR_ELEM_SIZE)
            .map(|c| RodId::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

/// Packed array of `(rod_id, class_tag)` pairs backing polymorphic plural
/// associations.
pub struct PolyJoinArea {
    file: PagedFile,
    tail: u32,
}

impl PolyJoinArea {
    pub fn open(path: impl AsRef<Path>, readonly: bool) -> Result<Self> {
        let file = PagedFile::open(path, readonly)?;
        let tail = (file.capacity() / POLY_ELEM_SIZE as u64) as u32;
        Ok(Self { file, tail })
    }

    pub fn append(&mut self, entries: &[(RodId, ClassTag)]) -> Result<JoinRange> {
        let offset = self.tail;
        let end_bytes = (offset as u64 + entries.len() as u64) * POLY_ELEM_SIZE as u64;
        self.file.ensure_capacity(end_bytes)?;
        let buf = self.file.as_mut_slice()?;
        let start = offset as usize * POLY_ELEM_SIZE;
        for (i, (id, tag)) in entries.iter().enumerate() {
            let at = start + i * POLY_ELEM_SIZE;
            buf[at..at + 4].copy_from_slice(&id.to_le_bytes());
            buf[at + 4..at + POLY_ELEM_SIZE].copy_from_slice(&tag.to_le_bytes());
        }
        self.tail = offset + entries.len() as u32;
        Ok(JoinRange {
            offset,
            len: entries.len() as u32,
        })
    }

    pub fn read(&self, range: JoinRange) -> Result<Vec<(RodId, ClassTag)>> {
        let start = range.offset as usize * POLY_ELEM_SIZE;
        let end = start + range.len as usize * POLY_ELEM_SIZE;
        let slice = self.file.as_slice();
        if end > slice.len() {
            return Err(Error::OutOfRange(format!(
                "polymorphic join range [{start}, {end}) exceeds area size {}",
                slice.len()
            )));
        }
        Ok(slice[start..end]
            .chunks_exact(POLY_ELEM_SIZE)
            .map(|c| {
                let id = RodId::from_le_bytes(c[0..4].try_into().unwrap());
                let tag = ClassTag::from_le_bytes(c[4..POLY_ELEM_SIZE].try_into().unwrap());
                (id, tag)
            })
            .collect())
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scalar_append_and_read() {
        let dir = tempdir().unwrap();
        let mut area = ScalarJoinArea::open(dir.path().join("join.dat"), false).unwrap();
        let r1 = area.append(&[1, 2, 3]).unwrap();
        let r2 = area.append(&[4, 5]).unwrap();
        assert_eq!(area.read(r1).unwrap(), vec![1, 2, 3]);
        assert_eq!(area.read(r2).unwrap(), vec![4, 5]);
    }

    #[test]
    fn poly_append_and_read() {
        let dir = tempdir().unwrap();
        let mut area = PolyJoinArea::open(dir.path().join("poly.dat"), false).unwrap();
        let r = area.append(&[(1, 111), (2, 222)]).unwrap();
        assert_eq!(area.read(r).unwrap(), vec![(1, 111), (2, 222)]);
    }

    #[test]
    fn scalar_out_of_range() {
        let dir = tempdir().unwrap();
        let area = ScalarJoinArea::open(dir.path().join("join.dat"), false).unwrap();
        let bogus = JoinRange { offset: 0, len: 10 };
        assert!(matches!(area.read(bogus), Err(Error::OutOfRange(_))));
    }
}
