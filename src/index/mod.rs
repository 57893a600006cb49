/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Secondary index subsystem.
//!
//! An index maps a field's scalar value to the contiguous range in the
//! scalar join area holding the `rod_id`s of every record whose field
//! equals that value. Two on-disk representations are supported, chosen
//! per index at registration time:
//!
//! - [`flat::FlatIndex`]: the whole key→range map serialized as one file.
//! - [`segmented::SegmentedIndex`]: the map is bucketed by key hash into a
//!   directory of files, each loaded lazily on first lookup into that
//!   bucket.
//!
//! Both back onto the same [`IndexKey`]/[`IndexValue`] pair so the
//! controller can treat either backend uniformly through the [`Index`]
//! trait.

pub mod flat;
pub mod segmented;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::join::JoinRange;

/// The value stored for an index entry: a range into the scalar join area.
pub type IndexValue = JoinRange;

/// A field's scalar value, as used for index lookup. Floats are keyed by
/// their bit pattern rather than compared for equality, since `f64` has no
/// total order and indices are built around exact-match lookup only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Integer(i64),
    Bool(bool),
    String(String),
    FloatBits(u64),
}

impl IndexKey {
    pub fn from_float(value: f64) -> Self {
        IndexKey::FloatBits(value.to_bits())
    }
}

/// Uniform interface over the flat and segmented backends.
pub trait Index {
    /// Look up the range for `key`, if one has been recorded.
    fn get(&mut self, key: &IndexKey) -> Result<Option<IndexValue>>;

    /// Record (or overwrite) the range for `key`.
    fn put(&mut self, key: IndexKey, value: IndexValue) -> Result<()>;

    /// Persist any in-memory changes to disk.
    fn save(&mut self) -> Result<()>;
}
