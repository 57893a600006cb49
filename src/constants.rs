/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Type aliases and global constants shared across the storage engine.
//!
//! Note: this file is not a configuration file. The type aliases and
//! constants below exist purely to keep arithmetic in the rest of the crate
//! self-describing; they should not need to be tuned per-deployment.

/// Dense, 1-based record identifier, unique within a single record type.
/// A value of `0` denotes a null reference in singular associations.
pub type RodId = u32;

/// Index of a page within a paged file.
pub type PageIndex = u32;

/// 64-bit stable hash of a record type's struct name, used to tag the
/// target type of a polymorphic association or index element.
pub type ClassTag = u64;

/// Byte offset into the string heap.
pub type HeapOffset = u64;

/// Fixed page size used for every paged file (data files, string heap, join
/// areas). Chosen as a single common OS page so that growth always maps
/// cleanly onto the platform's mmap granularity.
pub const PAGE_SIZE: u64 = 4096;

/// Name of the metadata sidecar file.
pub const METADATA_FILENAME: &str = "database.yml";

/// Name of the string heap file.
pub const STRING_HEAP_FILENAME: &str = "_string_element.dat";

/// Name of the scalar join area file.
pub const JOIN_FILENAME: &str = "_join_element.dat";

/// Name of the polymorphic join area file.
pub const POLY_JOIN_FILENAME: &str = "_polymorphic_join_element.dat";

/// Top-level metadata key under which engine version and timestamps live.
pub const METADATA_ROOT_KEY: &str = "Rod";

/// Namespace under which the migration driver generates shadow types from
/// the on-disk metadata of a prior schema version.
pub const LEGACY_NAMESPACE: &str = "LEGACY";

/// Suffix applied to a type's data file while a migration is in flight.
pub const MIGRATION_NEW_SUFFIX: &str = "new";

/// Suffix applied to a type's data file once migration has swapped it out.
pub const MIGRATION_LEGACY_SUFFIX: &str = "legacy";

/// `rod_id` value reserved to mean "no association".
pub const NULL_ROD_ID: RodId = 0;
