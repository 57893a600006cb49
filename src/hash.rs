/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Stable hashing for polymorphic `class_tag`s.
//!
//! A `class_tag` identifies the target type of a polymorphic join element
//! or singular association. It must be stable across process runs (ruling
//! out `std`'s randomized `DefaultHasher`) and wide enough that accidental
//! collisions between type names are not a practical concern.
//!
//! Collision policy: a 64-bit hash is not collision-proof. This port does
//! not detect or handle class_tag collisions between distinct registered
//! type names, matching the source engine's behavior; callers that register
//! an astronomically unlucky pair of names get undefined polymorphic
//! resolution. This is an accepted limitation, not a silently-patched one.

use crate::constants::ClassTag;
use xxhash_rust::xxh3::xxh3_64;

/// Compute the class tag for a record type's struct name.
pub fn class_tag(struct_name: &str) -> ClassTag {
    xxh3_64(struct_name.as_bytes())
}
