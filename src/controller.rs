/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! The database controller: create/open/close lifecycle, the process-wide
//! open-path registry, and the single entry point that ties the record
//! store, string heap, join areas, and index subsystem together into
//! `store`/`read`/`find_by` operations.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::config::{CreateOptions, OpenOptions};
use crate::constants::{
    ClassTag, RodId, JOIN_FILENAME, LEGACY_NAMESPACE, METADATA_FILENAME, POLY_JOIN_FILENAME,
    STRING_HEAP_FILENAME,
};
use crate::error::{Error, Result};
use crate::index::flat::FlatIndex;
use crate::index::segmented::SegmentedIndex;
use crate::index::{Index, IndexKey};
use crate::join::{JoinRange, PolyJoinArea, ScalarJoinArea};
use crate::metadata::{AssociationMeta, FieldMeta, IndexedPropertyMeta, Metadata, TypeMetadata};
use crate::proxy::{CollectionElement, CollectionProxy};
use crate::schema::{IndexKind, RecordLayout, RecordType, ScalarKind};
use crate::store::{FieldValue, RecordStore};
use crate::version::{Version, RUNTIME_VERSION};

fn open_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static REGISTRY: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// One backend behind a registered index, chosen per [`crate::schema::IndexedProperty`].
enum IndexBackend {
    Flat(FlatIndex),
    Segmented(SegmentedIndex),
}

impl Index for IndexBackend {
    fn get(&mut self, key: &IndexKey) -> Result<Option<JoinRange>> {
        match self {
            IndexBackend::Flat(i) => i.get(key),
            IndexBackend::Segmented(i) => i.get(key),
        }
    }

    fn put(&mut self, key: IndexKey, value: JoinRange) -> Result<()> {
        match self {
            IndexBackend::Flat(i) => i.put(key, value),
            IndexBackend::Segmented(i) => i.put(key, value),
        }
    }

    fn save(&mut self) -> Result<()> {
        match self {
            IndexBackend::Flat(i) => i.save(),
            IndexBackend::Segmented(i) => i.save(),
        }
    }
}

/// Scalar field values and association targets for one record, keyed by
/// name. The surface object model that produces this from a user-facing
/// record class is outside this crate's scope; this is the boundary the
/// core accepts.
#[derive(Debug, Clone, Default)]
pub struct RecordInput {
    pub integers: HashMap<String, i64>,
    pub floats: HashMap<String, f64>,
    pub bools: HashMap<String, bool>,
    pub strings: HashMap<String, String>,
    pub has_one: HashMap<String, Option<(RodId, Option<ClassTag>)>>,
    pub has_many: HashMap<String, Vec<Option<(RodId, ClassTag)>>>,
}

struct RegisteredType {
    record_type: RecordType,
    layout: RecordLayout,
}

/// An explicit database value, per the decision in the data model's
/// ownership note: callers hold and thread a `Database` themselves rather
/// than reaching a hidden process-wide instance. The process-wide state is
/// limited to the open-path registry needed to detect [`Error::AlreadyOpen`].
pub struct Database {
    path: PathBuf,
    readonly: bool,
    skip_indices: bool,
    metadata: Metadata,
    types: IndexMap<String, RegisteredType>,
    stores: HashMap<String, RecordStore>,
    strings: crate::strings::StringHeap,
    scalar_join: ScalarJoinArea,
    poly_join: PolyJoinArea,
    indices: HashMap<(String, String), IndexBackend>,
    index_staging: HashMap<(String, String), HashMap<IndexKey, CollectionProxy>>,
    plural_staging: HashMap<(String, RodId, String), CollectionProxy>,
    pending: HashSet<(String, RodId)>,
    /// Registered type name -> on-disk file stem, for a `LEGACY::X` or
    /// generated `Namespace::X` type whose files live under the plain `X`
    /// name. A type with no entry here is its own file stem.
    file_stems: HashMap<String, String>,
}

impl Database {
    fn data_path(&self, struct_name: &str) -> PathBuf {
        self.path.join(format!("{struct_name}.dat"))
    }

    fn flat_index_path(&self, struct_name: &str, field: &str) -> PathBuf {
        self.path.join(format!("{struct_name}_{field}.idx"))
    }

    fn segmented_index_path(&self, struct_name: &str, field: &str) -> PathBuf {
        self.path.join(format!("{struct_name}_{field}"))
    }

    /// Create a fresh database directory and open it read-write, purging
    /// any prior data/index files for every `record_types` entry.
    pub fn create(
        path: impl AsRef<Path>,
        record_types: Vec<RecordType>,
        opts: CreateOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::claim_path(&path)?;
        fs::create_dir_all(&path)?;

        let metadata_path = path.join(METADATA_FILENAME);
        if metadata_path.exists() {
            fs::remove_file(&metadata_path)?;
        }
        for rt in &record_types {
            Self::purge_type_files(&path, &rt.name, opts.trace_removals)?;
        }

        let mut types = IndexMap::new();
        for rt in record_types {
            let layout = RecordLayout::compute(&rt);
            types.insert(rt.name.clone(), RegisteredType { record_type: rt, layout });
        }

        let mut stores = HashMap::new();
        for (name, registered) in &types {
            let store = RecordStore::open(
                path.join(format!("{name}.dat")),
                registered.layout.clone(),
                false,
                0,
            )?;
            stores.insert(name.clone(), store);
        }

        let strings = crate::strings::StringHeap::open(path.join(STRING_HEAP_FILENAME), false)?;
        let scalar_join = ScalarJoinArea::open(path.join(JOIN_FILENAME), false)?;
        let poly_join = PolyJoinArea::open(path.join(POLY_JOIN_FILENAME), false)?;

        let mut metadata = Metadata::new(RUNTIME_VERSION);
        for (name, registered) in &types {
            metadata.types.insert(name.clone(), type_metadata(&registered.record_type));
        }
        metadata.save(&metadata_path)?;

        info!(path = ?path, types = metadata.types.len(), "created database");
        Ok(Self {
            path,
            readonly: false,
            skip_indices: false,
            metadata,
            types,
            stores,
            strings,
            scalar_join,
            poly_join,
            indices: HashMap::new(),
            index_staging: HashMap::new(),
            plural_staging: HashMap::new(),
            pending: HashSet::new(),
            file_stems: HashMap::new(),
        })
    }

    /// Open an existing database directory.
    pub fn open(path: impl AsRef<Path>, record_types: Vec<RecordType>, opts: OpenOptions) -> Result<Self> {
        Self::open_with_overrides(path, record_types, opts, &HashMap::new())
    }

    /// As [`Self::open`], but a type named in `file_name_overrides` maps to
    /// the given on-disk file stem instead of its own name. Used by the
    /// migration driver to register a `LEGACY::<Name>` type against the
    /// still-current `<Name>.dat` file.
    pub(crate) fn open_with_overrides(
        path: impl AsRef<Path>,
        record_types: Vec<RecordType>,
        opts: OpenOptions,
        file_name_overrides: &HashMap<String, String>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::claim_path(&path)?;

        let metadata_path = path.join(METADATA_FILENAME);
        let metadata = match Metadata::load(&metadata_path) {
            Ok(m) => m,
            Err(e) => {
                Self::release_path(&path);
                return Err(e);
            }
        };
        if let Err(e) = metadata.rod.version.check_compatible(RUNTIME_VERSION) {
            Self::release_path(&path);
            return Err(e);
        }

        let mut record_types = record_types;
        let mut file_name_overrides = file_name_overrides.clone();
        if let Some(namespace) = &opts.generate {
            let (generated, generated_overrides) = crate::registry::synthesize_namespace(&metadata, namespace);
            info!(namespace = %namespace, types = generated.len(), "generated types from stored metadata");
            file_name_overrides.extend(generated_overrides);
            record_types.extend(generated);
        }

        let mut types = IndexMap::new();
        for rt in record_types {
            // A generated or legacy-migration type is registered straight
            // into `file_name_overrides` by construction, so it never needs
            // the schema-match guard below — there's no independently
            // declared runtime schema to diverge from.
            if !file_name_overrides.contains_key(&rt.name) {
                if let Some(stored) = metadata.types.get(&rt.name) {
                    if !opts.migrate && !schema_matches(&rt, stored) {
                        Self::release_path(&path);
                        return Err(Error::IncompatibleSchema {
                            type_name: rt.name.clone(),
                            reason: "stored fields/associations/superclass diverge from runtime declaration".into(),
                        });
                    }
                }
            }
            let layout = RecordLayout::compute(&rt);
            types.insert(rt.name.clone(), RegisteredType { record_type: rt, layout });
        }

        let mut stores = HashMap::new();
        for (name, registered) in &types {
            let file_stem = file_name_overrides.get(name).cloned().unwrap_or_else(|| name.clone());
            // §4.7: seed count from metadata (keyed by the on-disk file
            // stem, since a legacy type's own name never appears there)
            // rather than deriving it from file size — `struct_len` need
            // not divide `PAGE_SIZE` evenly.
            let stored_count = metadata.types.get(&file_stem).map(|m| m.count).unwrap_or(0);
            let store = RecordStore::open(
                path.join(format!("{file_stem}.dat")),
                registered.layout.clone(),
                opts.readonly,
                stored_count,
            )?;
            stores.insert(name.clone(), store);
        }

        let strings = crate::strings::StringHeap::open(path.join(STRING_HEAP_FILENAME), opts.readonly)?;
        let scalar_join = ScalarJoinArea::open(path.join(JOIN_FILENAME), opts.readonly)?;
        let poly_join = PolyJoinArea::open(path.join(POLY_JOIN_FILENAME), opts.readonly)?;

        info!(path = ?path, readonly = opts.readonly, types = types.len(), "opened database");
        Ok(Self {
            path,
            readonly: opts.readonly,
            skip_indices: opts.skip_indices,
            metadata,
            types,
            stores,
            strings,
            scalar_join,
            poly_join,
            indices: HashMap::new(),
            index_staging: HashMap::new(),
            plural_staging: HashMap::new(),
            pending: HashSet::new(),
            file_stems: file_name_overrides,
        })
    }

    fn claim_path(path: &Path) -> Result<()> {
        let canonical = path.to_path_buf();
        let mut registry = open_paths().lock().unwrap();
        if !registry.insert(canonical.clone()) {
            return Err(Error::AlreadyOpen(canonical));
        }
        Ok(())
    }

    fn release_path(path: &Path) {
        open_paths().lock().unwrap().remove(path);
    }

    fn purge_type_files(dir: &Path, struct_name: &str, trace: bool) -> Result<()> {
        let data = dir.join(format!("{struct_name}.dat"));
        if data.exists() {
            if trace {
                info!(file = ?data, "removing stale data file");
            } else {
                debug!(file = ?data, "removing stale data file");
            }
            fs::remove_file(&data)?;
        }
        let prefix = format!("{struct_name}_");
        for entry in fs::read_dir(dir).into_iter().flatten().flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(prefix.as_str()) {
                if trace {
                    info!(file = ?entry.path(), "removing stale index file");
                } else {
                    debug!(file = ?entry.path(), "removing stale index file");
                }
                let path = entry.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    /// Reserve a blank slot in `type_name`'s record store, returning a
    /// valid `rod_id` usable immediately in other records' associations
    /// (needed for cyclic schema graphs) but not yet committed with field
    /// values. Uncommitted reservations are reported as
    /// [`Error::DanglingReferences`] on close.
    pub fn reserve(&mut self, type_name: &str) -> Result<RodId> {
        if self.readonly {
            return Err(Error::Readonly);
        }
        let store = self
            .stores
            .get_mut(type_name)
            .ok_or_else(|| Error::UnknownType(type_name.to_string()))?;
        let id = store.append_blank()?;
        self.pending.insert((type_name.to_string(), id));
        Ok(id)
    }

    /// Fill in a previously [`reserve`](Self::reserve)d slot's fields and
    /// associations, appending any plural association targets into the
    /// shared join areas and staging indexed-property updates.
    pub fn commit(&mut self, type_name: &str, rod_id: RodId, input: RecordInput) -> Result<()> {
        if self.readonly {
            return Err(Error::Readonly);
        }
        if !self.types.contains_key(type_name) {
            return Err(Error::UnknownType(type_name.to_string()));
        }

        for (field, value) in &input.integers {
            self.stores.get_mut(type_name).unwrap().write_integer(rod_id, field, *value)?;
        }
        for (field, value) in &input.floats {
            self.stores.get_mut(type_name).unwrap().write_float(rod_id, field, *value)?;
        }
        for (field, value) in &input.bools {
            self.stores.get_mut(type_name).unwrap().write_bool(rod_id, field, *value)?;
        }
        for (field, value) in &input.strings {
            let (offset, length) = self.strings.append(value)?;
            self.stores.get_mut(type_name).unwrap().write_string_ref(rod_id, field, offset, length)?;
        }
        for (assoc, target) in &input.has_one {
            let (id, tag) = target.unwrap_or((0, None));
            self.stores.get_mut(type_name).unwrap().write_singular_ref(rod_id, assoc, id, tag)?;
        }
        for (assoc, elements) in &input.has_many {
            let registered = &self.types[type_name];
            let &(_, polymorphic) = registered
                .layout
                .has_many_offsets
                .get(assoc)
                .ok_or_else(|| Error::OutOfRange(format!("no such association {assoc:?}")))?;
            let (count, offset) = if polymorphic {
                let entries: Vec<(RodId, ClassTag)> = elements
                    .iter()
                    .map(|e| e.map(|(id, tag)| (id, tag)).unwrap_or((0, 0)))
                    .collect();
                let range = self.poly_join.append(&entries)?;
                (range.len, range.offset)
            } else {
                let entries: Vec<RodId> = elements.iter().map(|e| e.map(|(id, _)| id).unwrap_or(0)).collect();
                let range = self.scalar_join.append(&entries)?;
                (range.len, range.offset)
            };
            self.stores.get_mut(type_name).unwrap().write_plural_ref(rod_id, assoc, count, offset)?;
        }

        self.pending.remove(&(type_name.to_string(), rod_id));

        let count = self.stores[type_name].count();
        if let Some(meta) = self.metadata.types.get_mut(type_name) {
            meta.count = count;
        }

        self.stage_index_updates(type_name, rod_id, &input)?;
        Ok(())
    }

    /// Reserve and commit in one call, for the common non-cyclic case.
    pub fn store(&mut self, type_name: &str, input: RecordInput) -> Result<RodId> {
        let id = self.reserve(type_name)?;
        self.commit(type_name, id, input)?;
        Ok(id)
    }

    fn stage_index_updates(&mut self, type_name: &str, rod_id: RodId, input: &RecordInput) -> Result<()> {
        let registered = &self.types[type_name];
        let indexed: Vec<String> = registered
            .record_type
            .indexed_properties
            .iter()
            .map(|p| p.field_name.clone())
            .collect();
        for field in indexed {
            let key = if let Some(v) = input.integers.get(&field) {
                Some(IndexKey::Integer(*v))
            } else if let Some(v) = input.floats.get(&field) {
                Some(IndexKey::from_float(*v))
            } else if let Some(v) = input.bools.get(&field) {
                Some(IndexKey::Bool(*v))
            } else if let Some(v) = input.strings.get(&field) {
                Some(IndexKey::String(v.clone()))
            } else {
                None
            };
            let Some(key) = key else { continue };
            let staging = self
                .index_staging
                .entry((type_name.to_string(), field))
                .or_default();
            let proxy = staging.entry(key).or_insert_with(CollectionProxy::empty);
            proxy.push(CollectionElement {
                rod_id: Some(rod_id),
                class_tag: None,
            });
        }
        Ok(())
    }

    /// Resolve a single field or association.
    pub fn read_field(&self, type_name: &str, rod_id: RodId, field: &str) -> Result<FieldValue> {
        let store = self.stores.get(type_name).ok_or_else(|| Error::UnknownType(type_name.to_string()))?;
        store.read_field(rod_id, field)
    }

    /// Resolve a string field to its text.
    pub fn read_string(&self, type_name: &str, rod_id: RodId, field: &str) -> Result<String> {
        match self.read_field(type_name, rod_id, field)? {
            FieldValue::StringRef(offset, length) => Ok(self.strings.read(offset, length)?.to_string()),
            _ => Err(Error::OutOfRange(format!("{field:?} is not a string field"))),
        }
    }

    /// Resolve a plural association into its ordered element list, through
    /// the same [`CollectionProxy`] a reader builds with [`Self::plural`] —
    /// a staged-but-unflushed append is reflected here too.
    pub fn read_plural(&self, type_name: &str, rod_id: RodId, assoc: &str) -> Result<Vec<Option<(RodId, Option<ClassTag>)>>> {
        let polymorphic = self.plural_polymorphic(type_name, assoc)?;
        let proxy = self.plural(type_name, rod_id, assoc)?;
        let (scalar_join, poly_join) = (&self.scalar_join, &self.poly_join);
        let materialized = proxy.materialize(|range| load_plural_range(scalar_join, poly_join, range, polymorphic));
        Ok(materialized.iter().map(|e| e.rod_id.map(|id| (id, e.class_tag))).collect())
    }

    /// A lazy view over a `has_many` association: indexing and iteration
    /// defer resolving the persisted range until `get`/`each_id` actually
    /// need it (§4.5). Any append staged through [`Self::append_to_plural`]
    /// this session but not yet flushed is folded in.
    pub fn plural(&self, type_name: &str, rod_id: RodId, assoc: &str) -> Result<CollectionProxy> {
        let key = (type_name.to_string(), rod_id, assoc.to_string());
        if let Some(staged) = self.plural_staging.get(&key) {
            return Ok(staged.clone());
        }
        match self.read_field(type_name, rod_id, assoc)? {
            FieldValue::PluralRef { count, offset, .. } => {
                if count == 0 {
                    Ok(CollectionProxy::empty())
                } else {
                    Ok(CollectionProxy::from_persisted(JoinRange { offset, len: count }))
                }
            }
            _ => Err(Error::OutOfRange(format!("{assoc:?} is not a plural association"))),
        }
    }

    /// The element at position `i` of a `has_many` association, without
    /// materializing the rest of the collection on a held strong reference.
    pub fn plural_get(&self, type_name: &str, rod_id: RodId, assoc: &str, i: usize) -> Result<Option<CollectionElement>> {
        let polymorphic = self.plural_polymorphic(type_name, assoc)?;
        let proxy = self.plural(type_name, rod_id, assoc)?;
        let (scalar_join, poly_join) = (&self.scalar_join, &self.poly_join);
        Ok(proxy.get(i, |range| load_plural_range(scalar_join, poly_join, range, polymorphic)))
    }

    /// Every id in a `has_many` association, in order, including any
    /// not-yet-flushed append.
    pub fn plural_each_id(&self, type_name: &str, rod_id: RodId, assoc: &str) -> Result<Vec<Option<RodId>>> {
        let polymorphic = self.plural_polymorphic(type_name, assoc)?;
        let proxy = self.plural(type_name, rod_id, assoc)?;
        let (scalar_join, poly_join) = (&self.scalar_join, &self.poly_join);
        Ok(proxy.each_id(|range| load_plural_range(scalar_join, poly_join, range, polymorphic)))
    }

    /// Append one target onto an already-stored record's `has_many`
    /// association without supplying the full target list atomically.
    /// Staged per `(type_name, rod_id, assoc)` like an indexed property
    /// (§4.6), flushed into a fresh join-area range and written back to the
    /// record's inline `(count, offset)` slot on [`Self::close`].
    pub fn append_to_plural(
        &mut self,
        type_name: &str,
        rod_id: RodId,
        assoc: &str,
        target: Option<(RodId, Option<ClassTag>)>,
    ) -> Result<()> {
        if self.readonly {
            return Err(Error::Readonly);
        }
        let key = (type_name.to_string(), rod_id, assoc.to_string());
        if !self.plural_staging.contains_key(&key) {
            let proxy = self.plural(type_name, rod_id, assoc)?;
            self.plural_staging.insert(key.clone(), proxy);
        }
        let element = match target {
            Some((id, tag)) => CollectionElement { rod_id: Some(id), class_tag: tag },
            None => CollectionElement { rod_id: None, class_tag: None },
        };
        self.plural_staging.get_mut(&key).unwrap().push(element);
        Ok(())
    }

    fn plural_polymorphic(&self, type_name: &str, assoc: &str) -> Result<bool> {
        let registered = self.types.get(type_name).ok_or_else(|| Error::UnknownType(type_name.to_string()))?;
        registered
            .layout
            .has_many_offsets
            .get(assoc)
            .map(|&(_, polymorphic)| polymorphic)
            .ok_or_else(|| Error::OutOfRange(format!("{assoc:?} is not a plural association")))
    }

    /// Flush every staged plural-association append: drain its proxy into
    /// a fresh join-area range and rewrite the owning record's inline
    /// `(count, offset)` slot to point at it.
    fn flush_plural_appends(&mut self) -> Result<()> {
        let staging = std::mem::take(&mut self.plural_staging);
        for ((type_name, rod_id, assoc), proxy) in staging {
            if !proxy.is_dirty() {
                continue;
            }
            let polymorphic = self.plural_polymorphic(&type_name, &assoc)?;
            let (scalar_join, poly_join) = (&self.scalar_join, &self.poly_join);
            let materialized = proxy.materialize(|range| load_plural_range(scalar_join, poly_join, range, polymorphic));
            let (count, offset) = if polymorphic {
                let entries: Vec<(RodId, ClassTag)> =
                    materialized.iter().map(|e| (e.rod_id.unwrap_or(0), e.class_tag.unwrap_or(0))).collect();
                let range = self.poly_join.append(&entries)?;
                (range.len, range.offset)
            } else {
                let entries: Vec<RodId> = materialized.iter().map(|e| e.rod_id.unwrap_or(0)).collect();
                let range = self.scalar_join.append(&entries)?;
                (range.len, range.offset)
            };
            self.stores.get_mut(&type_name).unwrap().write_plural_ref(rod_id, &assoc, count, offset)?;
        }
        Ok(())
    }

    pub fn count(&self, type_name: &str) -> Result<RodId> {
        Ok(self.stores.get(type_name).ok_or_else(|| Error::UnknownType(type_name.to_string()))?.count())
    }

    fn index_for(&mut self, type_name: &str, field: &str) -> Result<&mut IndexBackend> {
        let key = (type_name.to_string(), field.to_string());
        if !self.indices.contains_key(&key) {
            let registered = &self.types[type_name];
            let property = registered
                .record_type
                .indexed_properties
                .iter()
                .find(|p| p.field_name == field)
                .ok_or_else(|| Error::InvalidIndexKind(format!("{field:?} is not indexed on {type_name:?}")))?;
            // A generated or `LEGACY::` type's index lives under its real
            // on-disk file stem, not its (possibly namespaced) registered
            // name — same remapping `data_path` gets via `file_stems`.
            let stem = self.file_stems.get(type_name).cloned().unwrap_or_else(|| type_name.to_string());
            let backend = match property.kind {
                IndexKind::Flat => IndexBackend::Flat(FlatIndex::load(self.flat_index_path(&stem, field))?),
                IndexKind::Segmented => {
                    IndexBackend::Segmented(SegmentedIndex::open(self.segmented_index_path(&stem, field))?)
                }
            };
            self.indices.insert(key.clone(), backend);
        }
        Ok(self.indices.get_mut(&key).unwrap())
    }

    /// Look up every `rod_id` of `type_name` whose `field` equals `key`,
    /// in insertion order. Reads through any not-yet-flushed index staging
    /// for this session before falling back to the on-disk index.
    pub fn find_by(&mut self, type_name: &str, field: &str, key: IndexKey) -> Result<Vec<RodId>> {
        if let Some(staged) = self.index_staging.get(&(type_name.to_string(), field.to_string())) {
            if let Some(proxy) = staged.get(&key) {
                let scalar_join = &self.scalar_join;
                let loaded = proxy.materialize(|range| {
                    scalar_join
                        .read(range)
                        .unwrap_or_default()
                        .into_iter()
                        .map(|id| CollectionElement { rod_id: Some(id), class_tag: None })
                        .collect()
                });
                return Ok(loaded.iter().filter_map(|e| e.rod_id).collect());
            }
        }
        let backend = self.index_for(type_name, field)?;
        match backend.get(&key)? {
            Some(range) => self.scalar_join.read(range),
            None => Ok(Vec::new()),
        }
    }

    /// Flush every dirty staged index entry: drain its proxy into a fresh
    /// scalar-join range and record that range in the backend.
    fn flush_indices(&mut self) -> Result<()> {
        let staging = std::mem::take(&mut self.index_staging);
        for ((type_name, field), entries) in staging {
            for (key, proxy) in entries {
                if !proxy.is_dirty() {
                    continue;
                }
                let scalar_join = &self.scalar_join;
                let materialized = proxy.materialize(|range| {
                    scalar_join
                        .read(range)
                        .unwrap_or_default()
                        .into_iter()
                        .map(|id| CollectionElement { rod_id: Some(id), class_tag: None })
                        .collect()
                });
                let ids: Vec<RodId> = materialized.iter().filter_map(|e| e.rod_id).collect();
                let range = self.scalar_join.append(&ids)?;
                let backend = self.index_for(&type_name, &field)?;
                backend.put(key, range)?;
            }
            if let Ok(backend) = self.index_for(&type_name, &field) {
                backend.save()?;
            }
        }
        Ok(())
    }

    /// Close the database: flush staged plural-association appends, flush
    /// indices (unless opened with `OpenOptions::skip_indices`), write
    /// metadata, flush paged files, and release the open-path claim.
    pub fn close(&mut self) -> Result<()> {
        if !self.readonly && !self.pending.is_empty() {
            return Err(Error::DanglingReferences(self.pending.len()));
        }
        if !self.readonly {
            self.flush_plural_appends()?;
            if !self.skip_indices {
                self.flush_indices()?;
            }
            self.metadata.touch();
            self.metadata.save(self.path.join(METADATA_FILENAME))?;
            for store in self.stores.values() {
                store.flush()?;
            }
            self.strings.flush()?;
            self.scalar_join.flush()?;
            self.poly_join.flush()?;
        }
        Self::release_path(&self.path);
        info!(path = ?self.path, "closed database");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Repoint a migrating type's store at its `.new`-suffixed file,
    /// leaving the original `<name>.dat` untouched (still mapped read-only
    /// by that type's `LEGACY::<name>` registration) until the swap.
    pub(crate) fn repoint_stores_to_new_files(&mut self, new_types: &[RecordType]) -> Result<()> {
        for rt in new_types {
            let layout = self.types[&rt.name].layout.clone();
            let store = RecordStore::open(self.path.join(format!("{}.dat.new", rt.name)), layout, false, 0)?;
            self.stores.insert(rt.name.clone(), store);
        }
        Ok(())
    }

    /// Two-phase rename per type: `<name>.dat` → `.legacy`, then
    /// `<name>.dat.new` → `<name>.dat`, dropping the legacy registration.
    pub(crate) fn swap_migrated_files(&mut self, new_types: &[RecordType]) -> Result<()> {
        for rt in new_types {
            let migrated_count = self.stores.get(&rt.name).map(|s| s.count()).unwrap_or(0);
            self.stores.remove(&rt.name);
            let legacy_name = format!("{LEGACY_NAMESPACE}::{}", rt.name);
            self.stores.remove(&legacy_name);
            self.types.shift_remove(&legacy_name);

            let current = self.data_path(&rt.name);
            let legacy = self.path.join(format!("{}.dat.legacy", rt.name));
            let new_file = self.path.join(format!("{}.dat.new", rt.name));
            fs::rename(&current, &legacy)?;
            fs::rename(&new_file, &current)?;

            let layout = self.types[&rt.name].layout.clone();
            let store = RecordStore::open(current, layout, false, migrated_count)?;
            self.stores.insert(rt.name.clone(), store);
        }
        Ok(())
    }

    /// Drop every type not in `new_types` from metadata (clearing the
    /// synthesized legacy entries) and bump the recorded engine version.
    pub(crate) fn retarget_metadata(&mut self, new_types: &[RecordType], version: Version) {
        let mut types = IndexMap::new();
        for rt in new_types {
            let mut meta = type_metadata(rt);
            meta.count = self.stores.get(&rt.name).map(|s| s.count()).unwrap_or(0);
            types.insert(rt.name.clone(), meta);
        }
        self.metadata.types = types;
        self.metadata.rod.version = version;
    }
}

/// Resolve a join-area range into `CollectionElement`s, through whichever
/// join area matches the association's polymorphism. An id of `0` is an
/// explicit null slot, per the scalar/poly join area's own convention.
fn load_plural_range(
    scalar_join: &ScalarJoinArea,
    poly_join: &PolyJoinArea,
    range: JoinRange,
    polymorphic: bool,
) -> Vec<CollectionElement> {
    if polymorphic {
        poly_join
            .read(range)
            .unwrap_or_default()
            .into_iter()
            .map(|(id, tag)| if id == 0 {
                CollectionElement { rod_id: None, class_tag: None }
            } else {
                CollectionElement { rod_id: Some(id), class_tag: Some(tag) }
            })
            .collect()
    } else {
        scalar_join
            .read(range)
            .unwrap_or_default()
            .into_iter()
            .map(|id| if id == 0 {
                CollectionElement { rod_id: None, class_tag: None }
            } else {
                CollectionElement { rod_id: Some(id), class_tag: None }
            })
            .collect()
    }
}

fn data_type_name(kind: ScalarKind) -> &'static str {
    match kind {
        ScalarKind::Integer => "integer",
        ScalarKind::Float => "float",
        ScalarKind::String => "string",
        ScalarKind::Bool => "bool",
    }
}

fn type_metadata(rt: &RecordType) -> TypeMetadata {
    let mut fields = IndexMap::new();
    for f in &rt.fields {
        fields.insert(f.name.clone(), FieldMeta { data_type: data_type_name(f.kind).to_string() });
    }
    let mut has_one = IndexMap::new();
    for a in &rt.has_one {
        has_one.insert(a.name.clone(), AssociationMeta { class_name: a.target_type_name.clone(), polymorphic: a.polymorphic });
    }
    let mut has_many = IndexMap::new();
    for a in &rt.has_many {
        has_many.insert(a.name.clone(), AssociationMeta { class_name: a.target_type_name.clone(), polymorphic: a.polymorphic });
    }
    let mut indexed_properties = IndexMap::new();
    for p in &rt.indexed_properties {
        let kind = match p.kind {
            IndexKind::Flat => "flat",
            IndexKind::Segmented => "segmented",
        };
        indexed_properties.insert(p.field_name.clone(), IndexedPropertyMeta { kind: kind.to_string() });
    }
    TypeMetadata {
        superclass: rt.superclass_name.clone(),
        count: 0,
        fields,
        has_one,
        has_many,
        indexed_properties,
    }
}

/// Compare a runtime [`RecordType`] declaration against its stored
/// metadata, per §4.8: fields, associations, and superclass must match
/// exactly (in declaration order, since order determines byte offsets).
fn schema_matches(rt: &RecordType, stored: &TypeMetadata) -> bool {
    if rt.superclass_name != stored.superclass {
        return false;
    }
    let fields_match = rt.fields.len() == stored.fields.len()
        && rt.fields.iter().zip(stored.fields.iter()).all(|(f, (name, meta))| {
            &f.name == name && data_type_name(f.kind) == meta.data_type
        });
    let has_one_match = rt.has_one.len() == stored.has_one.len()
        && rt.has_one.iter().zip(stored.has_one.iter()).all(|(a, (name, meta))| {
            &a.name == name && a.target_type_name == meta.class_name && a.polymorphic == meta.polymorphic
        });
    let has_many_match = rt.has_many.len() == stored.has_many.len()
        && rt.has_many.iter().zip(stored.has_many.iter()).all(|(a, (name, meta))| {
            &a.name == name && a.target_type_name == meta.class_name && a.polymorphic == meta.polymorphic
        });
    let indexed_match = rt.indexed_properties.len() == stored.indexed_properties.len()
        && rt.indexed_properties.iter().zip(stored.indexed_properties.iter()).all(|(p, (name, meta))| {
            let kind = match p.kind {
                IndexKind::Flat => "flat",
                IndexKind::Segmented => "segmented",
            };
            &p.field_name == name && kind == meta.kind
        });
    if !indexed_match {
        warn!(type_name = %rt.name, "indexed properties diverge from stored metadata");
    }
    fields_match && has_one_match && has_many_match && indexed_match
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::class_tag;
    use crate::schema::ScalarKind as SK;
    use tempfile::tempdir;

    fn fred() -> RecordType {
        RecordType::new("Fred")
            .field("age", SK::Integer)
            .field("sex", SK::String)
            .indexed("sex", IndexKind::Flat)
    }

    #[test]
    fn create_store_close_reopen_roundtrip() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path(), vec![fred()], CreateOptions::default()).unwrap();

        for (age, sex) in [(2, "male"), (8, "female"), (8, "female")] {
            let mut input = RecordInput::default();
            input.integers.insert("age".into(), age);
            input.strings.insert("sex".into(), sex.into());
            db.store("Fred", input).unwrap();
        }
        db.close().unwrap();

        let mut db = Database::open(dir.path(), vec![fred()], OpenOptions::readonly()).unwrap();
        assert_eq!(db.count("Fred").unwrap(), 3);
        let females = db.find_by("Fred", "sex", IndexKey::String("female".into())).unwrap();
        assert_eq!(females.len(), 2);
        assert_eq!(db.read_field("Fred", 1, "age").unwrap(), FieldValue::Integer(2));
        db.close().unwrap();
    }

    #[test]
    fn already_open_rejected() {
        let dir = tempdir().unwrap();
        let _db = Database::create(dir.path(), vec![fred()], CreateOptions::default()).unwrap();
        let err = Database::open(dir.path(), vec![fred()], OpenOptions::default()).unwrap_err();
        assert!(matches!(err, Error::AlreadyOpen(_)));
    }

    #[test]
    fn plural_association_preserves_order_across_reopen() {
        let dir = tempdir().unwrap();
        let user_file = RecordType::new("UserFile").field("name", SK::String);
        let user = RecordType::new("User").has_many("files", "UserFile", false);

        let mut db = Database::create(dir.path(), vec![user.clone(), user_file.clone()], CreateOptions::default()).unwrap();
        let f1 = db.store("UserFile", RecordInput::default()).unwrap();
        let f2 = db.store("UserFile", RecordInput::default()).unwrap();
        let f3 = db.store("UserFile", RecordInput::default()).unwrap();

        let mut input = RecordInput::default();
        input.has_many.insert("files".into(), vec![Some((f1, 0)), Some((f2, 0)), Some((f3, 0))]);
        db.store("User", input).unwrap();
        db.close().unwrap();

        let mut db = Database::open(dir.path(), vec![user, user_file], OpenOptions::readonly()).unwrap();
        let files = db.read_plural("User", 1, "files").unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].unwrap().0, f1);
        assert_eq!(files[2].unwrap().0, f3);
        db.close().unwrap();
    }

    #[test]
    fn polymorphic_plural_with_null_preserves_size() {
        let dir = tempdir().unwrap();
        let user_file = RecordType::new("UserFile").field("name", SK::String);
        let user = RecordType::new("User").has_many("files", "UserFile", true);

        let mut db = Database::create(dir.path(), vec![user.clone(), user_file.clone()], CreateOptions::default()).unwrap();
        let f1 = db.store("UserFile", RecordInput::default()).unwrap();
        let f2 = db.store("UserFile", RecordInput::default()).unwrap();
        let tag = class_tag("UserFile");

        let mut input = RecordInput::default();
        input.has_many.insert("files".into(), vec![Some((f1, tag)), None, Some((f2, tag))]);
        db.store("User", input).unwrap();
        db.close().unwrap();

        let mut db = Database::open(dir.path(), vec![user, user_file], OpenOptions::readonly()).unwrap();
        let files = db.read_plural("User", 1, "files").unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[1].is_none());
        db.close().unwrap();
    }

    #[test]
    fn plural_get_and_each_id_match_read_plural() {
        let dir = tempdir().unwrap();
        let user_file = RecordType::new("UserFile").field("name", SK::String);
        let user = RecordType::new("User").has_many("files", "UserFile", false);

        let mut db = Database::create(dir.path(), vec![user, user_file], CreateOptions::default()).unwrap();
        let f1 = db.store("UserFile", RecordInput::default()).unwrap();
        let f2 = db.store("UserFile", RecordInput::default()).unwrap();

        let mut input = RecordInput::default();
        input.has_many.insert("files".into(), vec![Some((f1, 0)), Some((f2, 0))]);
        db.store("User", input).unwrap();

        assert_eq!(db.plural_each_id("User", 1, "files").unwrap(), vec![Some(f1), Some(f2)]);
        assert_eq!(db.plural_get("User", 1, "files", 1).unwrap().unwrap().rod_id, Some(f2));
        assert!(db.plural_get("User", 1, "files", 5).unwrap().is_none());
        db.close().unwrap();
    }

    #[test]
    fn append_to_plural_is_visible_before_close_and_persists_after() {
        let dir = tempdir().unwrap();
        let user_file = RecordType::new("UserFile").field("name", SK::String);
        let user = RecordType::new("User").has_many("files", "UserFile", false);

        let mut db = Database::create(dir.path(), vec![user.clone(), user_file.clone()], CreateOptions::default()).unwrap();
        let f1 = db.store("UserFile", RecordInput::default()).unwrap();
        db.store("User", RecordInput::default()).unwrap();

        db.append_to_plural("User", 1, "files", Some((f1, None))).unwrap();
        assert_eq!(db.plural_each_id("User", 1, "files").unwrap(), vec![Some(f1)]);
        db.close().unwrap();

        let mut db = Database::open(dir.path(), vec![user, user_file], OpenOptions::readonly()).unwrap();
        let files = db.read_plural("User", 1, "files").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].unwrap().0, f1);
        db.close().unwrap();
    }

    #[test]
    fn schema_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let v1 = RecordType::new("User").field("name", SK::String).field("surname", SK::String);
        let mut db = Database::create(dir.path(), vec![v1], CreateOptions::default()).unwrap();
        db.close().unwrap();

        let v2 = RecordType::new("User").field("surname", SK::String).field("name", SK::String);
        let err = Database::open(dir.path(), vec![v2], OpenOptions::readonly()).unwrap_err();
        assert!(matches!(err, Error::IncompatibleSchema { .. }));
    }

    #[test]
    fn indexed_property_divergence_rejected() {
        let dir = tempdir().unwrap();
        let v1 = RecordType::new("User")
            .field("age", SK::Integer)
            .field("name", SK::String)
            .indexed("age", IndexKind::Flat);
        let mut db = Database::create(dir.path(), vec![v1], CreateOptions::default()).unwrap();
        db.close().unwrap();

        let v2 = RecordType::new("User")
            .field("age", SK::Integer)
            .field("name", SK::String)
            .indexed("name", IndexKind::Flat);
        let err = Database::open(dir.path(), vec![v2], OpenOptions::readonly()).unwrap_err();
        assert!(matches!(err, Error::IncompatibleSchema { .. }));
    }

    #[test]
    fn dangling_reservation_blocks_close() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path(), vec![fred()], CreateOptions::default()).unwrap();
        db.reserve("Fred").unwrap();
        let err = db.close().unwrap_err();
        assert!(matches!(err, Error::DanglingReferences(1)));
    }

    #[test]
    fn readonly_store_rejected() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path(), vec![fred()], CreateOptions::default()).unwrap();
        db.close().unwrap();
        let mut db = Database::open(dir.path(), vec![fred()], OpenOptions::readonly()).unwrap();
        assert!(matches!(db.store("Fred", RecordInput::default()), Err(Error::Readonly)));
        db.close().unwrap();
    }

    #[test]
    fn generate_synthesizes_types_from_metadata_without_runtime_declarations() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path(), vec![fred()], CreateOptions::default()).unwrap();
        let mut input = RecordInput::default();
        input.integers.insert("age".into(), 42);
        input.strings.insert("sex".into(), "female".into());
        db.store("Fred", input).unwrap();
        db.close().unwrap();

        let opts = OpenOptions { generate: Some("Gen".into()), ..OpenOptions::readonly() };
        let mut db = Database::open(dir.path(), vec![], opts).unwrap();
        assert_eq!(db.count("Gen::Fred").unwrap(), 1);
        assert_eq!(db.read_field("Gen::Fred", 1, "age").unwrap(), FieldValue::Integer(42));
        let females = db.find_by("Gen::Fred", "sex", IndexKey::String("female".into())).unwrap();
        assert_eq!(females, vec![1]);
        db.close().unwrap();
    }
}
