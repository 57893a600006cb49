/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! The `database.yml` sidecar: engine version, timestamps, and one entry
//! per registered record type capturing the schema it was last stored
//! under.
//!
//! The file is a single YAML map. One key, [`crate::constants::METADATA_ROOT_KEY`],
//! holds engine-level bookkeeping; every other key is a record type name
//! mapping to that type's [`TypeMetadata`]. Field and association maps use
//! [`IndexMap`] so re-serializing preserves the declaration order they were
//! first written in, which matters for [`crate::schema::RecordLayout`]
//! offset computation on reopen.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::METADATA_ROOT_KEY;
use crate::error::Result;
use crate::version::Version;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RodMeta {
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMeta {
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationMeta {
    pub class_name: String,
    #[serde(default)]
    pub polymorphic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedPropertyMeta {
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeMetadata {
    #[serde(default)]
    pub superclass: Option<String>,
    pub count: u32,
    #[serde(default)]
    pub fields: IndexMap<String, FieldMeta>,
    #[serde(default)]
    pub has_one: IndexMap<String, AssociationMeta>,
    #[serde(default)]
    pub has_many: IndexMap<String, AssociationMeta>,
    #[serde(default)]
    pub indexed_properties: IndexMap<String, IndexedPropertyMeta>,
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub rod: RodMeta,
    pub types: IndexMap<String, TypeMetadata>,
}

impl Metadata {
    /// A fresh metadata document for a newly created database.
    pub fn new(version: Version) -> Self {
        let now = Utc::now();
        Self {
            rod: RodMeta {
                version,
                created_at: now,
                updated_at: now,
            },
            types: IndexMap::new(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut raw: IndexMap<String, serde_yaml::Value> = serde_yaml::from_reader(file)?;

        let rod_value = raw.shift_remove(METADATA_ROOT_KEY).ok_or_else(|| {
            crate::error::Error::CorruptLayout(format!(
                "{:?}: missing top-level {METADATA_ROOT_KEY:?} key",
                path
            ))
        })?;
        let rod: RodMeta = serde_yaml::from_value(rod_value)?;

        let mut types = IndexMap::new();
        for (name, value) in raw {
            types.insert(name, serde_yaml::from_value(value)?);
        }
        debug!(path = ?path, types = types.len(), "loaded metadata");
        Ok(Self { rod, types })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut raw: IndexMap<String, serde_yaml::Value> = IndexMap::new();
        raw.insert(
            METADATA_ROOT_KEY.to_string(),
            serde_yaml::to_value(&self.rod)?,
        );
        for (name, meta) in &self.types {
            raw.insert(name.clone(), serde_yaml::to_value(meta)?);
        }
        let tmp_path = path.with_extension("yml.tmp");
        {
            let file = File::create(&tmp_path)?;
            let writer = BufWriter::new(file);
            serde_yaml::to_writer(writer, &raw)?;
        }
        fs::rename(&tmp_path, path)?;
        debug!(path = ?path, types = self.types.len(), "saved metadata");
        Ok(())
    }

    /// Stamp `updated_at` to now; called by the controller before every
    /// save that follows a mutation.
    pub fn touch(&mut self) {
        self.rod.updated_at = Utc::now();
    }
}
