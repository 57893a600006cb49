/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! The migration driver: open a database under a newer schema while a
//! user-supplied hook copies each type's records forward from the prior
//! schema.
//!
//! Protocol (§4.9): a shadow `LEGACY` namespace is synthesized from the
//! stored metadata so the old data remains readable under its old layout;
//! new records are appended into a `.new`-suffixed file; once every hook
//! has run, each type's files are swapped via the two-phase rename
//! `current → .legacy`, `.new → current`, so a crash mid-migration never
//! leaves a type with neither a readable legacy file nor a complete new
//! one.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::info;

use crate::config::OpenOptions;
use crate::constants::{LEGACY_NAMESPACE, METADATA_FILENAME};
use crate::controller::Database;
use crate::error::Result;
use crate::metadata::{FieldMeta, Metadata};
use crate::schema::{RecordType, ScalarKind};
use crate::version::RUNTIME_VERSION;

/// A per-type hook invoked with the legacy type's name (`LEGACY::<Name>`)
/// and a handle to the in-flight database. The hook is expected to read
/// every legacy record and `store` its replacement under the plain type
/// name.
pub type MigrateHook<'a> = dyn Fn(&str, &mut Database) -> Result<()> + 'a;

fn scalar_kind_from_data_type(data_type: &str) -> ScalarKind {
    match data_type {
        "integer" => ScalarKind::Integer,
        "float" => ScalarKind::Float,
        "bool" => ScalarKind::Bool,
        _ => ScalarKind::String,
    }
}

/// Reconstruct the schema recorded in metadata as a [`RecordType`], so the
/// legacy namespace can be registered without requiring the caller to
/// hand-declare the old schema alongside the new one.
fn synthesize_legacy_type(name: &str, fields: &indexmap::IndexMap<String, FieldMeta>, superclass: Option<String>) -> RecordType {
    let mut rt = RecordType::new(format!("{LEGACY_NAMESPACE}::{name}"));
    rt.superclass_name = superclass;
    for (field_name, meta) in fields {
        rt = rt.field(field_name.clone(), scalar_kind_from_data_type(&meta.data_type));
    }
    rt
}

/// Run the migration driver: open `path` under `new_types`, inject a
/// `LEGACY::*` namespace generated from the metadata already on disk, run
/// `hooks` (one entry per migrated type name), swap files, and return a
/// freshly reopened, non-migrating [`Database`].
pub fn migrate(
    path: impl AsRef<Path>,
    new_types: Vec<RecordType>,
    hooks: HashMap<String, Box<MigrateHook<'_>>>,
    opts: OpenOptions,
) -> Result<Database> {
    let path = path.as_ref();
    let old_metadata = Metadata::load(path.join(METADATA_FILENAME))?;

    let mut legacy_types = Vec::new();
    let mut file_name_overrides = HashMap::new();
    for (name, meta) in &old_metadata.types {
        let legacy = synthesize_legacy_type(name, &meta.fields, meta.superclass.clone());
        file_name_overrides.insert(legacy.name.clone(), name.clone());
        legacy_types.push(legacy);
    }

    // Build the new-schema data files under a `.new` suffix so the
    // current (soon-to-be-legacy) files stay untouched until the swap.
    for rt in &new_types {
        let new_path = path.join(format!("{}.dat.new", rt.name));
        if new_path.exists() {
            fs::remove_file(&new_path)?;
        }
        fs::File::create(&new_path)?;
    }

    let mut combined = new_types.clone();
    combined.extend(legacy_types);

    // The legacy half of `combined` addresses the *current* (pre-swap)
    // `.dat` files under their old, unprefixed names, via
    // `file_name_overrides`; the new half needs its stores repointed at the
    // `.new` files before any hook runs. `migrate` stays set so the new
    // types' schema mismatch against the still-old stored metadata doesn't
    // trip the ordinary schema-match guard.
    let mut open_opts = opts.clone();
    open_opts.migrate = true;
    open_opts.readonly = false;
    // The types just swapped in carry no index state of their own yet;
    // skip the flush that `close` would otherwise run for them.
    open_opts.skip_indices = true;
    let mut db = Database::open_with_overrides(path, combined, open_opts, &file_name_overrides)?;
    db.repoint_stores_to_new_files(&new_types)?;

    for rt in &new_types {
        if let Some(hook) = hooks.get(&rt.name) {
            let legacy_name = format!("{LEGACY_NAMESPACE}::{}", rt.name);
            hook(&legacy_name, &mut db)?;
        }
    }

    db.swap_migrated_files(&new_types)?;
    db.retarget_metadata(&new_types, RUNTIME_VERSION);
    db.close()?;

    info!(path = ?path, types = new_types.len(), "migration complete");
    Database::open(path, new_types, OpenOptions { migrate: false, ..opts })
}
