/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Bucketed, lazily-loaded index backend.
//!
//! The key space is split into a fixed number of buckets by hashing the
//! bincode-encoded key with `xxh3_64`; each bucket is its own small file
//! under the index's directory, loaded into memory only the first time a
//! lookup or insert touches it. This trades the flat backend's simpler
//! single-file atomicity for avoiding a full-map load when only a few keys
//! of a large index are ever touched in a session.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::index::{Index, IndexKey, IndexValue};

const DEFAULT_BUCKET_COUNT: u32 = 64;

type Bucket = HashMap<IndexKey, IndexValue>;

pub struct SegmentedIndex {
    dir: PathBuf,
    bucket_count: u32,
    loaded: HashMap<u32, Bucket>,
    dirty: HashSet<u32>,
}

impl SegmentedIndex {
    /// Open the segmented index directory at `dir`, creating it if absent.
    /// No bucket files are read until a lookup or insert names them.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            bucket_count: DEFAULT_BUCKET_COUNT,
            loaded: HashMap::new(),
            dirty: HashSet::new(),
        })
    }

    fn bucket_id(&self, key: &IndexKey) -> u32 {
        let encoded = bincode::serialize(key).expect("index key always serializes");
        (xxh3_64(&encoded) % self.bucket_count as u64) as u32
    }

    fn bucket_path(&self, bucket_id: u32) -> PathBuf {
        self.dir.join(format!("bucket_{bucket_id}.idx"))
    }

    fn ensure_loaded(&mut self, bucket_id: u32) -> Result<()> {
        if self.loaded.contains_key(&bucket_id) {
            return Ok(());
        }
        let path = self.bucket_path(bucket_id);
        let bucket = if path.exists() && fs::metadata(&path)?.len() > 0 {
            let file = File::open(&path)?;
            bincode::deserialize_from(file)?
        } else {
            Bucket::new()
        };
        debug!(path = ?path, entries = bucket.len(), "loaded index bucket");
        self.loaded.insert(bucket_id, bucket);
        Ok(())
    }
}

impl Index for SegmentedIndex {
    fn get(&mut self, key: &IndexKey) -> Result<Option<IndexValue>> {
        let bucket_id = self.bucket_id(key);
        self.ensure_loaded(bucket_id)?;
        Ok(self.loaded[&bucket_id].get(key).copied())
    }

    fn put(&mut self, key: IndexKey, value: IndexValue) -> Result<()> {
        let bucket_id = self.bucket_id(&key);
        self.ensure_loaded(bucket_id)?;
        self.loaded.get_mut(&bucket_id).unwrap().insert(key, value);
        self.dirty.insert(bucket_id);
        Ok(())
    }

    /// Overwrite only the buckets touched since the last save, each
    /// atomically via write-temp-then-rename.
    fn save(&mut self) -> Result<()> {
        for bucket_id in self.dirty.drain().collect::<Vec<_>>() {
            let bucket = &self.loaded[&bucket_id];
            let path = self.bucket_path(bucket_id);
            let tmp_path = path.with_extension("idx.tmp");
            {
                let file = File::create(&tmp_path)?;
                let mut writer = BufWriter::new(file);
                bincode::serialize_into(&mut writer, bucket)?;
            }
            fs::rename(&tmp_path, &path)?;
            debug!(path = ?path, entries = bucket.len(), "saved index bucket");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::JoinRange;
    use tempfile::tempdir;

    #[test]
    fn put_get_within_session() {
        let dir = tempdir().unwrap();
        let mut idx = SegmentedIndex::open(dir.path().join("name_idx")).unwrap();
        idx.put(IndexKey::String("alice".into()), JoinRange { offset: 0, len: 1 })
            .unwrap();
        assert_eq!(
            idx.get(&IndexKey::String("alice".into())).unwrap(),
            Some(JoinRange { offset: 0, len: 1 })
        );
    }

    #[test]
    fn save_then_reopen_lazily_loads_touched_bucket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("name_idx");
        {
            let mut idx = SegmentedIndex::open(&path).unwrap();
            idx.put(IndexKey::String("bob".into()), JoinRange { offset: 2, len: 3 })
                .unwrap();
            idx.save().unwrap();
        }
        let mut idx = SegmentedIndex::open(&path).unwrap();
        assert!(idx.loaded.is_empty());
        assert_eq!(
            idx.get(&IndexKey::String("bob".into())).unwrap(),
            Some(JoinRange { offset: 2, len: 3 })
        );
        assert_eq!(idx.loaded.len(), 1);
    }

    #[test]
    fn missing_key_returns_none() {
        let dir = tempdir().unwrap();
        let mut idx = SegmentedIndex::open(dir.path().join("name_idx")).unwrap();
        assert_eq!(idx.get(&IndexKey::Integer(1)).unwrap(), None);
    }
}
