/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Crate-wide error type.
//!
//! Every fallible operation in the storage engine returns [`Result<T>`],
//! whose error variants correspond one-to-one with the signals a caller is
//! expected to match on: lifecycle violations, version/schema
//! incompatibility, on-disk integrity failures, dangling references, and
//! configuration mistakes.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// `create` or `open` was called for a path that is already open in
    /// this process.
    #[error("database at {0:?} is already open")]
    AlreadyOpen(PathBuf),

    /// An operation that requires an open database was attempted before
    /// `open`/`create` succeeded, or after `close`.
    #[error("database is not open")]
    NotOpen,

    /// A mutating operation was attempted on a database opened read-only.
    #[error("database is readonly")]
    Readonly,

    /// The metadata file's engine version is incompatible with the
    /// running engine version under the rules in §4.8.
    #[error("incompatible version: file is {file}, runtime is {runtime}")]
    IncompatibleVersion { file: String, runtime: String },

    /// A registered record type's runtime schema does not match the
    /// schema recorded in metadata.
    #[error("incompatible schema for type {type_name:?}: {reason}")]
    IncompatibleSchema { type_name: String, reason: String },

    /// A paged file's size is not a multiple of the page size, or some
    /// other on-disk layout invariant does not hold.
    #[error("corrupt layout: {0}")]
    CorruptLayout(String),

    /// `close` was called on a read-write database with unresolved
    /// referenced-but-not-stored objects.
    #[error("{0} object(s) referenced but never stored")]
    DanglingReferences(usize),

    /// A `rod_id` (or string/join range) fell outside the bounds of the
    /// structure it addresses.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// An indexed property named an index kind the engine does not
    /// recognize (i.e. neither `flat` nor `segmented`).
    #[error("invalid index kind: {0:?}")]
    InvalidIndexKind(String),

    /// A string field's byte range was not valid UTF-8.
    #[error("string heap range [{offset}, {offset}+{length}) is not valid UTF-8")]
    InvalidUtf8 { offset: u64, length: u64 },

    /// An unrecognized record type name was referenced by an association
    /// or a lookup.
    #[error("unknown record type {0:?}")]
    UnknownType(String),

    /// Metadata (de)serialization failure.
    #[error("metadata error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Index (de)serialization failure.
    #[error("index codec error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
