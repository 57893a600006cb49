/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! One-file-per-index backend: the whole key→range map is loaded on open
//! and rewritten atomically on save.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::index::{Index, IndexKey, IndexValue};

pub struct FlatIndex {
    path: PathBuf,
    map: HashMap<IndexKey, IndexValue>,
    dirty: bool,
}

impl FlatIndex {
    /// Load the index file at `path`. A missing or empty file loads as an
    /// empty map rather than erroring, since a freshly registered index has
    /// nothing on disk yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map = if path.exists() && fs::metadata(&path)?.len() > 0 {
            let file = File::open(&path)?;
            bincode::deserialize_from(file)?
        } else {
            HashMap::new()
        };
        debug!(path = ?path, entries = map.len(), "loaded flat index");
        Ok(Self {
            path,
            map,
            dirty: false,
        })
    }
}

impl Index for FlatIndex {
    fn get(&mut self, key: &IndexKey) -> Result<Option<IndexValue>> {
        Ok(self.map.get(key).copied())
    }

    fn put(&mut self, key: IndexKey, value: IndexValue) -> Result<()> {
        self.map.insert(key, value);
        self.dirty = true;
        Ok(())
    }

    /// Overwrite the index file atomically: write the full map to a
    /// temporary file in the same directory, then rename over the target.
    fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let tmp_path = self.path.with_extension("idx.tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, &self.map)?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.dirty = false;
        debug!(path = ?self.path, entries = self.map.len(), "saved flat index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::JoinRange;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let mut idx = FlatIndex::load(dir.path().join("age.idx")).unwrap();
        assert_eq!(idx.get(&IndexKey::Integer(5)).unwrap(), None);
    }

    #[test]
    fn put_then_save_then_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("age.idx");
        {
            let mut idx = FlatIndex::load(&path).unwrap();
            idx.put(IndexKey::Integer(5), JoinRange { offset: 0, len: 2 })
                .unwrap();
            idx.save().unwrap();
        }
        let mut idx = FlatIndex::load(&path).unwrap();
        assert_eq!(
            idx.get(&IndexKey::Integer(5)).unwrap(),
            Some(JoinRange { offset: 0, len: 2 })
        );
    }

    #[test]
    fn save_without_changes_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("age.idx");
        let mut idx = FlatIndex::load(&path).unwrap();
        idx.save().unwrap();
        assert!(!path.exists());
    }
}
