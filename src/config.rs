/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Option structs controlling `create`/`open`.

/// Options for [`crate::controller::Database::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Emit a debug-level trace line for every stale data/index file
    /// removed while preparing a fresh database directory.
    pub trace_removals: bool,
}

/// Options for [`crate::controller::Database::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Map files read-only; every mutating operation fails with
    /// [`crate::error::Error::Readonly`].
    pub readonly: bool,
    /// Synthesize type definitions from stored metadata under the given
    /// namespace (e.g. `Some("Generated".into())` registers `Generated::User`
    /// alongside whatever `record_types` the caller supplied) instead of
    /// requiring the caller to have registered a matching
    /// [`crate::schema::RecordType`] for every stored type. See
    /// [`crate::registry`].
    pub generate: Option<String>,
    /// Run the migration driver (see [`crate::migration`]) instead of the
    /// plain open path.
    pub migrate: bool,
    /// Skip flushing indexed properties on close. Used internally by the
    /// migration driver's intermediate close, and available to callers who
    /// know no indexed property changed this session.
    pub skip_indices: bool,
}

impl OpenOptions {
    pub fn readonly() -> Self {
        Self {
            readonly: true,
            ..Default::default()
        }
    }
}
