/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Per-type append-only record store.
//!
//! Every registered record type gets its own paged, memory-mapped data
//! file: a dense array of fixed-width structs laid out by the type's
//! [`RecordLayout`]. `rod_id`s are dense and 1-based; `rod_id` `n` lives at
//! byte offset `(n - 1) * struct_len`. Appending a record is the only
//! mutation: there is no in-place delete, matching invariant 1 (record ids
//! are monotonic and dense within a type).

use std::path::Path;

use crate::constants::{HeapOffset, RodId, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::page::PagedFile;
use crate::schema::{RecordLayout, ScalarKind};

/// A single field or association slot read back from a stored record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    StringRef(HeapOffset, u32),
    SingularRef { rod_id: RodId, class_tag: Option<u64> },
    PluralRef { count: u32, offset: u32, polymorphic: bool },
}

/// Append-only fixed-struct array for one record type.
pub struct RecordStore {
    file: PagedFile,
    layout: RecordLayout,
    count: RodId,
}

impl RecordStore {
    /// Open the paged file at `path` and seed `count` from `stored_count`
    /// (the type's count recorded in metadata, or `0` for a type with no
    /// prior metadata entry), per §4.7: count is *seeded*, not derived from
    /// file size, since `struct_len` need not divide `PAGE_SIZE` evenly.
    /// Page math is used only to check invariant 1 — that `stored_count`
    /// fits within the records the mapped pages can actually hold.
    pub fn open(path: impl AsRef<Path>, layout: RecordLayout, readonly: bool, stored_count: RodId) -> Result<Self> {
        let file = PagedFile::open(path, readonly)?;
        let struct_len = layout.struct_len as u64;
        let count = if struct_len == 0 {
            0
        } else {
            let records_per_page = (PAGE_SIZE / struct_len) as RodId;
            let max_count = records_per_page.saturating_mul(file.page_count());
            if stored_count > max_count {
                return Err(Error::CorruptLayout(format!(
                    "{:?}: stored count {} exceeds the {} record(s) {} page(s) can hold at struct length {}",
                    file.path(),
                    stored_count,
                    max_count,
                    file.page_count(),
                    struct_len
                )));
            }
            stored_count
        };
        Ok(Self { file, layout, count })
    }

    /// Number of records currently stored (the highest valid `rod_id`).
    pub fn count(&self) -> RodId {
        self.count
    }

    /// Append a blank record (zeroed struct) and return its new `rod_id`.
    /// Callers fill in fields via the `write_*` methods before exposing the
    /// id to readers.
    pub fn append_blank(&mut self) -> Result<RodId> {
        let struct_len = self.layout.struct_len as u64;
        let new_id = self.count + 1;
        self.file.ensure_capacity(new_id as u64 * struct_len)?;
        self.count = new_id;
        Ok(new_id)
    }

    fn record_bounds(&self, rod_id: RodId) -> Result<(usize, usize)> {
        if rod_id == 0 || rod_id > self.count {
            return Err(Error::OutOfRange(format!(
                "rod_id {} out of range (count={})",
                rod_id, self.count
            )));
        }
        let struct_len = self.layout.struct_len as usize;
        let start = (rod_id as usize - 1) * struct_len;
        Ok((start, start + struct_len))
    }

    pub fn write_integer(&mut self, rod_id: RodId, field: &str, value: i64) -> Result<()> {
        let (start, _) = self.record_bounds(rod_id)?;
        let (offset, kind) = self.field_offset(field, ScalarKind::Integer)?;
        let buf = self.file.as_mut_slice()?;
        let at = start + offset as usize;
        buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
        let _ = kind;
        Ok(())
    }

    pub fn write_float(&mut self, rod_id: RodId, field: &str, value: f64) -> Result<()> {
        let (start, _) = self.record_bounds(rod_id)?;
        let (offset, _) = self.field_offset(field, ScalarKind::Float)?;
        let buf = self.file.as_mut_slice()?;
        let at = start + offset as usize;
        buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_bool(&mut self, rod_id: RodId, field: &str, value: bool) -> Result<()> {
        let (start, _) = self.record_bounds(rod_id)?;
        let (offset, _) = self.field_offset(field, ScalarKind::Bool)?;
        let buf = self.file.as_mut_slice()?;
        buf[start + offset as usize] = value as u8;
        Ok(())
    }

    pub fn write_string_ref(&mut self, rod_id: RodId, field: &str, heap_offset: HeapOffset, length: u32) -> Result<()> {
        let (start, _) = self.record_bounds(rod_id)?;
        let (offset, _) = self.field_offset(field, ScalarKind::String)?;
        let buf = self.file.as_mut_slice()?;
        let at = start + offset as usize;
        buf[at..at + 8].copy_from_slice(&heap_offset.to_le_bytes());
        buf[at + 8..at + 12].copy_from_slice(&length.to_le_bytes());
        Ok(())
    }

    pub fn write_singular_ref(&mut self, rod_id: RodId, assoc: &str, target: RodId, class_tag: Option<u64>) -> Result<()> {
        let (start, _) = self.record_bounds(rod_id)?;
        let &(offset, polymorphic) = self
            .layout
            .has_one_offsets
            .get(assoc)
            .ok_or_else(|| Error::OutOfRange(format!("no such association {assoc:?}")))?;
        let buf = self.file.as_mut_slice()?;
        let at = start + offset as usize;
        buf[at..at + 4].copy_from_slice(&target.to_le_bytes());
        if polymorphic {
            let tag = class_tag.unwrap_or(0);
            buf[at + 4..at + 12].copy_from_slice(&tag.to_le_bytes());
        }
        Ok(())
    }

    pub fn write_plural_ref(&mut self, rod_id: RodId, assoc: &str, count: u32, offset_in_join: u32) -> Result<()> {
        let (start, _) = self.record_bounds(rod_id)?;
        let &(offset, _) = self
            .layout
            .has_many_offsets
            .get(assoc)
            .ok_or_else(|| Error::OutOfRange(format!("no such association {assoc:?}")))?;
        let buf = self.file.as_mut_slice()?;
        let at = start + offset as usize;
        buf[at..at + 4].copy_from_slice(&count.to_le_bytes());
        buf[at + 4..at + 8].copy_from_slice(&offset_in_join.to_le_bytes());
        Ok(())
    }

    pub fn read_field(&self, rod_id: RodId, field: &str) -> Result<FieldValue> {
        let (start, _) = self.record_bounds(rod_id)?;
        let slice = self.file.as_slice();
        if let Some(&(offset, kind)) = self.layout.field_offsets.get(field) {
            let at = start + offset as usize;
            return Ok(match kind {
                ScalarKind::Integer => {
                    FieldValue::Integer(i64::from_le_bytes(slice[at..at + 8].try_into().unwrap()))
                }
                ScalarKind::Float => {
                    FieldValue::Float(f64::from_le_bytes(slice[at..at + 8].try_into().unwrap()))
                }
                ScalarKind::Bool => FieldValue::Bool(slice[at] != 0),
                ScalarKind::String => {
                    let heap_offset =
                        HeapOffset::from_le_bytes(slice[at..at + 8].try_into().unwrap());
                    let length = u32::from_le_bytes(slice[at + 8..at + 12].try_into().unwrap());
                    FieldValue::StringRef(heap_offset, length)
                }
            });
        }
        if let Some(&(offset, polymorphic)) = self.layout.has_one_offsets.get(field) {
            let at = start + offset as usize;
            let id = RodId::from_le_bytes(slice[at..at + 4].try_into().unwrap());
            let tag = if polymorphic {
                Some(u64::from_le_bytes(slice[at + 4..at + 12].try_into().unwrap()))
            } else {
                None
            };
            return Ok(FieldValue::SingularRef { rod_id: id, class_tag: tag });
        }
        if let Some(&(offset, polymorphic)) = self.layout.has_many_offsets.get(field) {
            let at = start + offset as usize;
            let count = u32::from_le_bytes(slice[at..at + 4].try_into().unwrap());
            let offset_in_join = u32::from_le_bytes(slice[at + 4..at + 8].try_into().unwrap());
            return Ok(FieldValue::PluralRef {
                count,
                offset: offset_in_join,
                polymorphic,
            });
        }
        Err(Error::OutOfRange(format!("no such field {field:?}")))
    }

    fn field_offset(&self, field: &str, expected: ScalarKind) -> Result<(u32, ScalarKind)> {
        self.layout
            .field_offsets
            .get(field)
            .copied()
            .filter(|(_, kind)| *kind == expected)
            .ok_or_else(|| Error::OutOfRange(format!("no such {expected:?} field {field:?}")))
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RecordType, ScalarKind as SK};
    use tempfile::tempdir;

    fn layout() -> RecordLayout {
        let rt = RecordType::new("User")
            .field("age", SK::Integer)
            .field("name", SK::String)
            .has_one("profile", "Profile", false)
            .has_many("files", "UserFile", false);
        RecordLayout::compute(&rt)
    }

    #[test]
    fn append_and_roundtrip_fields() {
        let dir = tempdir().unwrap();
        let mut store = RecordStore::open(dir.path().join("user.dat"), layout(), false, 0).unwrap();
        let id = store.append_blank().unwrap();
        assert_eq!(id, 1);
        store.write_integer(id, "age", 42).unwrap();
        store.write_string_ref(id, "name", 100, 5).unwrap();
        store.write_singular_ref(id, "profile", 7, None).unwrap();
        store.write_plural_ref(id, "files", 3, 0).unwrap();

        assert_eq!(store.read_field(id, "age").unwrap(), FieldValue::Integer(42));
        assert_eq!(store.read_field(id, "name").unwrap(), FieldValue::StringRef(100, 5));
        assert_eq!(
            store.read_field(id, "profile").unwrap(),
            FieldValue::SingularRef { rod_id: 7, class_tag: None }
        );
        assert_eq!(
            store.read_field(id, "files").unwrap(),
            FieldValue::PluralRef { count: 3, offset: 0, polymorphic: false }
        );
    }

    #[test]
    fn ids_are_dense_and_monotonic() {
        let dir = tempdir().unwrap();
        let mut store = RecordStore::open(dir.path().join("user.dat"), layout(), false, 0).unwrap();
        let a = store.append_blank().unwrap();
        let b = store.append_blank().unwrap();
        assert!(a < b);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn out_of_range_id_rejected() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("user.dat"), layout(), false, 0).unwrap();
        assert!(matches!(store.read_field(1, "age"), Err(Error::OutOfRange(_))));
    }

    /// `Fred{age:Integer, sex:String}` has a 20-byte struct, which does not
    /// divide the 4096-byte page size evenly. Reopening after a single page
    /// of records must seed `count` from the stored value rather than
    /// rejecting the file as corrupt.
    #[test]
    fn reopen_seeds_count_when_struct_len_does_not_divide_page_size() {
        let rt = RecordType::new("Fred").field("age", SK::Integer).field("sex", SK::String);
        let layout = RecordLayout::compute(&rt);
        assert_eq!(layout.struct_len, 20);

        let path = tempdir().unwrap().path().join("fred.dat");
        {
            let mut store = RecordStore::open(&path, layout.clone(), false, 0).unwrap();
            for _ in 0..3 {
                store.append_blank().unwrap();
            }
            store.flush().unwrap();
        }

        let store = RecordStore::open(&path, layout, true, 3).unwrap();
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn reopen_rejects_stored_count_exceeding_page_capacity() {
        let rt = RecordType::new("Fred").field("age", SK::Integer).field("sex", SK::String);
        let layout = RecordLayout::compute(&rt);
        let path = tempdir().unwrap().path().join("fred.dat");
        {
            let mut store = RecordStore::open(&path, layout.clone(), false, 0).unwrap();
            store.append_blank().unwrap();
            store.flush().unwrap();
        }
        // One page at struct_len=20 holds floor(4096/20) = 204 records; a
        // stored count beyond that cannot be backed by a single page.
        let err = RecordStore::open(&path, layout, true, 205).unwrap_err();
        assert!(matches!(err, Error::CorruptLayout(_)));
    }
}
