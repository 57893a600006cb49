/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Synthesizing [`RecordType`] declarations directly from stored metadata,
//! for [`crate::config::OpenOptions::generate`].
//!
//! Construction happens in two passes, the same shape the migration driver
//! uses to resolve `LEGACY::*` names (see
//! [`crate::migration::synthesize_legacy_type`]): every stored type is first
//! registered under `<namespace>::<Name>`, so every name in the namespace is
//! known, then each association's `target_type_name` is remapped into that
//! same namespace against the now-complete table. There is no reflection
//! step; the synthesized [`RecordType`] reads its fields, associations, and
//! indexed properties straight out of [`TypeMetadata`].

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;

use crate::metadata::Metadata;
use crate::schema::{IndexKind, RecordType, ScalarKind};

fn scalar_kind_from_data_type(data_type: &str) -> ScalarKind {
    match data_type {
        "integer" => ScalarKind::Integer,
        "float" => ScalarKind::Float,
        "bool" => ScalarKind::Bool,
        _ => ScalarKind::String,
    }
}

fn index_kind_from_str(kind: &str) -> IndexKind {
    match kind {
        "segmented" => IndexKind::Segmented,
        _ => IndexKind::Flat,
    }
}

/// Stored type names in topologically sorted order by superclass relation
/// (roots first): a type with no superclass, or whose superclass is not
/// itself present in `metadata`, is a root. Kahn's algorithm over the
/// superclass-to-subclasses edge; any name metadata's own cycle would
/// strand is appended at the end rather than dropped.
fn topological_order(metadata: &Metadata) -> Vec<String> {
    let mut children: IndexMap<&str, Vec<&str>> = IndexMap::new();
    let mut indegree: IndexMap<&str, u32> = IndexMap::new();
    for name in metadata.types.keys() {
        indegree.insert(name.as_str(), 0);
    }
    for (name, meta) in &metadata.types {
        if let Some(superclass) = meta.superclass.as_deref() {
            if metadata.types.contains_key(superclass) {
                children.entry(superclass).or_default().push(name.as_str());
                *indegree.get_mut(name.as_str()).unwrap() += 1;
            }
        }
    }

    let mut ready: VecDeque<&str> = metadata
        .types
        .keys()
        .map(String::as_str)
        .filter(|name| indegree[name] == 0)
        .collect();
    let mut order = Vec::with_capacity(metadata.types.len());
    while let Some(name) = ready.pop_front() {
        order.push(name.to_string());
        if let Some(kids) = children.get(name) {
            for kid in kids {
                let d = indegree.get_mut(kid).unwrap();
                *d -= 1;
                if *d == 0 {
                    ready.push_back(kid);
                }
            }
        }
    }

    let seen: HashSet<&str> = order.iter().map(String::as_str).collect();
    for name in metadata.types.keys() {
        if !seen.contains(name.as_str()) {
            order.push(name.clone());
        }
    }
    order
}

/// Build one [`RecordType`] per entry in `metadata.types`, named
/// `<namespace>::<Name>`, in topologically sorted order, with every
/// association's `target_type_name` remapped into `namespace`. Returns the
/// synthesized types alongside a `synthesized name -> on-disk file stem`
/// map, for the caller to fold into its `file_name_overrides` so the
/// synthesized store opens against the type's real, unprefixed data file.
pub fn synthesize_namespace(metadata: &Metadata, namespace: &str) -> (Vec<RecordType>, IndexMap<String, String>) {
    let namespaced = |name: &str| format!("{namespace}::{name}");

    let order = topological_order(metadata);
    let mut types = Vec::with_capacity(order.len());
    let mut file_name_overrides = IndexMap::new();

    for name in &order {
        let meta = &metadata.types[name];
        let mut rt = RecordType::new(namespaced(name));
        rt.superclass_name = meta.superclass.as_deref().map(&namespaced);

        for (field_name, field_meta) in &meta.fields {
            rt = rt.field(field_name.clone(), scalar_kind_from_data_type(&field_meta.data_type));
        }
        for (assoc_name, assoc_meta) in &meta.has_one {
            rt = rt.has_one(assoc_name.clone(), namespaced(&assoc_meta.class_name), assoc_meta.polymorphic);
        }
        for (assoc_name, assoc_meta) in &meta.has_many {
            rt = rt.has_many(assoc_name.clone(), namespaced(&assoc_meta.class_name), assoc_meta.polymorphic);
        }
        for (field_name, idx_meta) in &meta.indexed_properties {
            rt = rt.indexed(field_name.clone(), index_kind_from_str(&idx_meta.kind));
        }

        file_name_overrides.insert(rt.name.clone(), name.clone());
        types.push(rt);
    }

    (types, file_name_overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{AssociationMeta, FieldMeta, TypeMetadata};
    use crate::version::RUNTIME_VERSION;
    use indexmap::IndexMap;

    fn meta_with(types: Vec<(&str, TypeMetadata)>) -> Metadata {
        let mut metadata = Metadata::new(RUNTIME_VERSION);
        for (name, meta) in types {
            metadata.types.insert(name.to_string(), meta);
        }
        metadata
    }

    fn blank_type(superclass: Option<&str>) -> TypeMetadata {
        TypeMetadata {
            superclass: superclass.map(str::to_string),
            count: 0,
            fields: IndexMap::new(),
            has_one: IndexMap::new(),
            has_many: IndexMap::new(),
            indexed_properties: IndexMap::new(),
        }
    }

    #[test]
    fn orders_roots_before_subclasses() {
        let metadata = meta_with(vec![
            ("Admin", blank_type(Some("User"))),
            ("User", blank_type(None)),
        ]);
        let (types, _) = synthesize_namespace(&metadata, "Gen");
        let names: Vec<_> = types.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["Gen::User", "Gen::Admin"]);
        assert_eq!(types[1].superclass_name.as_deref(), Some("Gen::User"));
    }

    #[test]
    fn remaps_cross_type_associations_into_namespace() {
        let mut user = blank_type(None);
        user.has_many.insert(
            "files".to_string(),
            AssociationMeta { class_name: "UserFile".to_string(), polymorphic: false },
        );
        let metadata = meta_with(vec![("User", user), ("UserFile", blank_type(None))]);

        let (types, overrides) = synthesize_namespace(&metadata, "Gen");
        let user_type = types.iter().find(|t| t.name == "Gen::User").unwrap();
        assert_eq!(user_type.has_many[0].target_type_name, "Gen::UserFile");
        assert_eq!(overrides["Gen::User"], "User");
        assert_eq!(overrides["Gen::UserFile"], "UserFile");
    }

    #[test]
    fn fields_and_indexed_properties_carry_over() {
        let mut user = blank_type(None);
        user.fields.insert("age".to_string(), FieldMeta { data_type: "integer".to_string() });
        user.indexed_properties.insert(
            "age".to_string(),
            crate::metadata::IndexedPropertyMeta { kind: "flat".to_string() },
        );
        let metadata = meta_with(vec![("User", user)]);

        let (types, _) = synthesize_namespace(&metadata, "Gen");
        assert_eq!(types[0].fields[0].name, "age");
        assert_eq!(types[0].indexed_properties[0].field_name, "age");
        assert_eq!(types[0].indexed_properties[0].kind, IndexKind::Flat);
    }
}
