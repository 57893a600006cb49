/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! An embedded, single-writer, memory-mapped object database: record types
//! are declared up front, each gets a fixed-width struct array on disk, and
//! strings/associations/index ranges live in their own append-only areas
//! alongside it. See [`controller::Database`] for the lifecycle entry point.

pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod hash;
pub mod index;
pub mod join;
pub mod metadata;
pub mod migration;
pub mod page;
pub mod proxy;
pub mod registry;
pub mod schema;
pub mod store;
pub mod strings;
pub mod version;

pub use config::{CreateOptions, OpenOptions};
pub use constants::{ClassTag, PageIndex, RodId};
pub use controller::{Database, RecordInput};
pub use error::{Error, Result};
pub use index::IndexKey;
pub use migration::{migrate, MigrateHook};
pub use schema::{IndexKind, RecordType, ScalarKind};
pub use store::FieldValue;
pub use version::Version;
