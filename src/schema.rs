/*
 * Copyright (c) 2024 - 2026, Rodb Contributors.
 * Licensed under the MIT license; see LICENSE at the crate root for details.
 */

//! Record type declarations and the fixed-struct layout derived from them.
//!
//! A [`RecordType`] is the schema entity: an ordered list of scalar fields,
//! an ordered list of singular associations, and an ordered list of plural
//! associations. [`RecordLayout`] turns that declaration into byte offsets
//! within the fixed-width struct every instance of the type is stored as,
//! in declaration order, matching the order `database.yml` round-trips
//! field and association maps in.

use indexmap::IndexMap;

use crate::constants::ClassTag;
use crate::hash::class_tag;

/// Scalar field kind. Bool is stored as a single byte to keep the layout
/// byte-addressable without bit-packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Integer,
    Float,
    String,
    Bool,
}

impl ScalarKind {
    /// Inline byte width of this field's on-disk representation.
    /// String fields store a `(offset, length)` pair into the string heap
    /// rather than their bytes inline.
    pub fn inline_width(self) -> u32 {
        match self {
            ScalarKind::Integer => 8,
            ScalarKind::Float => 8,
            ScalarKind::String => 12, // u64 offset + u32 length
            ScalarKind::Bool => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScalarField {
    pub name: String,
    pub kind: ScalarKind,
}

/// A `has_one` declaration. Polymorphic singular associations store an
/// additional inline [`ClassTag`] alongside the `rod_id`.
#[derive(Debug, Clone)]
pub struct SingularAssociation {
    pub name: String,
    pub target_type_name: String,
    pub polymorphic: bool,
}

impl SingularAssociation {
    /// Inline byte width: one `rod_id` word, plus a `class_tag` word when
    /// polymorphic.
    pub fn inline_width(&self) -> u32 {
        if self.polymorphic {
            4 + 8
        } else {
            4
        }
    }
}

/// A `has_many` declaration. Backed by a `(count, offset)` pair into
/// whichever join area matches the association's polymorphism.
#[derive(Debug, Clone)]
pub struct PluralAssociation {
    pub name: String,
    pub target_type_name: String,
    pub polymorphic: bool,
}

impl PluralAssociation {
    pub fn inline_width(&self) -> u32 {
        8 // u32 count + u32 offset
    }
}

/// An indexed property: a scalar or singular-association field with an
/// associated on-disk index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Flat,
    Segmented,
}

#[derive(Debug, Clone)]
pub struct IndexedProperty {
    pub field_name: String,
    pub kind: IndexKind,
}

/// A record type declaration, as registered by a caller before opening a
/// database.
#[derive(Debug, Clone)]
pub struct RecordType {
    pub name: String,
    pub superclass_name: Option<String>,
    pub fields: Vec<ScalarField>,
    pub has_one: Vec<SingularAssociation>,
    pub has_many: Vec<PluralAssociation>,
    pub indexed_properties: Vec<IndexedProperty>,
}

impl RecordType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass_name: None,
            fields: Vec::new(),
            has_one: Vec::new(),
            has_many: Vec::new(),
            indexed_properties: Vec::new(),
        }
    }

    pub fn with_superclass(mut self, superclass: impl Into<String>) -> Self {
        self.superclass_name = Some(superclass.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.fields.push(ScalarField {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn has_one(mut self, name: impl Into<String>, target: impl Into<String>, polymorphic: bool) -> Self {
        self.has_one.push(SingularAssociation {
            name: name.into(),
            target_type_name: target.into(),
            polymorphic,
        });
        self
    }

    pub fn has_many(mut self, name: impl Into<String>, target: impl Into<String>, polymorphic: bool) -> Self {
        self.has_many.push(PluralAssociation {
            name: name.into(),
            target_type_name: target.into(),
            polymorphic,
        });
        self
    }

    pub fn indexed(mut self, field_name: impl Into<String>, kind: IndexKind) -> Self {
        self.indexed_properties.push(IndexedProperty {
            field_name: field_name.into(),
            kind,
        });
        self
    }

    /// This type's stable on-disk class tag, derived from its name.
    pub fn class_tag(&self) -> ClassTag {
        class_tag(&self.name)
    }
}

/// Byte offsets for every field/association slot within a type's fixed
/// struct, computed once at registration and reused by the record store on
/// every read and write.
#[derive(Debug, Clone)]
pub struct RecordLayout {
    pub struct_len: u32,
    pub field_offsets: IndexMap<String, (u32, ScalarKind)>,
    pub has_one_offsets: IndexMap<String, (u32, bool)>,
    pub has_many_offsets: IndexMap<String, (u32, bool)>,
}

impl RecordLayout {
    /// Compute the layout for `record_type`, walking fields then singular
    /// then plural associations in declaration order.
    pub fn compute(record_type: &RecordType) -> Self {
        let mut offset = 0u32;
        let mut field_offsets = IndexMap::new();
        for field in &record_type.fields {
            field_offsets.insert(field.name.clone(), (offset, field.kind));
            offset += field.kind.inline_width();
        }

        let mut has_one_offsets = IndexMap::new();
        for assoc in &record_type.has_one {
            has_one_offsets.insert(assoc.name.clone(), (offset, assoc.polymorphic));
            offset += assoc.inline_width();
        }

        let mut has_many_offsets = IndexMap::new();
        for assoc in &record_type.has_many {
            has_many_offsets.insert(assoc.name.clone(), (offset, assoc.polymorphic));
            offset += assoc.inline_width();
        }

        Self {
            struct_len: offset,
            field_offsets,
            has_one_offsets,
            has_many_offsets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_packs_fields_in_declaration_order() {
        let rt = RecordType::new("User")
            .field("age", ScalarKind::Integer)
            .field("name", ScalarKind::String)
            .has_one("profile", "Profile", false)
            .has_many("files", "UserFile", true);
        let layout = RecordLayout::compute(&rt);

        assert_eq!(layout.field_offsets["age"], (0, ScalarKind::Integer));
        assert_eq!(layout.field_offsets["name"], (8, ScalarKind::String));
        assert_eq!(layout.has_one_offsets["profile"], (20, false));
        assert_eq!(layout.has_many_offsets["files"], (24, true));
        assert_eq!(layout.struct_len, 32);
    }

    #[test]
    fn class_tag_is_stable() {
        let rt = RecordType::new("UserFile");
        assert_eq!(rt.class_tag(), class_tag("UserFile"));
    }
}
