//! Type definitions for parsed structure layouts.

use serde::Deserialize;
use std::collections::HashMap;

/// Top-level layout file structure.
#[derive(Debug, Deserialize)]
pub struct LayoutFile {
    #[serde(default = "default_pointer_size")]
    pub pointer_size: usize,
    #[serde(default)]
    pub types: HashMap<String, StructLayout>,
}

fn default_pointer_size() -> usize {
    8
}

/// A structure layout: total size plus named fields.
#[derive(Debug, Clone, Deserialize)]
pub struct StructLayout {
    pub size: usize,
    #[serde(default)]
    pub fields: HashMap<String, FieldDef>,
}

/// A field within a structure.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub offset: usize,
    #[serde(rename = "type")]
    pub kind: FieldKind,
}

/// The shape of a field. Scalars are little-endian.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    Pointer,
    Bytes { count: usize },
    Struct { name: String },
}

/// Resolved layouts, ready for use by [`crate::StructReader`].
#[derive(Debug, Clone)]
pub struct StructLayouts {
    /// Pointer width of the target in bytes (4 or 8).
    pub pointer_size: usize,
    pub types: HashMap<String, StructLayout>,
}

impl StructLayouts {
    /// Look up a structure layout by name.
    pub fn get_type(&self, name: &str) -> Option<&StructLayout> {
        self.types.get(name)
    }

    /// Look up a field definition.
    pub fn field(&self, type_name: &str, field: &str) -> Option<&FieldDef> {
        self.get_type(type_name)?.fields.get(field)
    }

    /// Byte offset of `field` within `type_name`.
    pub fn field_offset(&self, type_name: &str, field: &str) -> Option<usize> {
        self.field(type_name, field).map(|f| f.offset)
    }

    /// Total size of a structure type.
    pub fn type_size(&self, type_name: &str) -> Option<usize> {
        self.get_type(type_name).map(|t| t.size)
    }

    /// Size in bytes of a field of the given kind.
    pub fn kind_size(&self, kind: &FieldKind) -> Option<usize> {
        match kind {
            FieldKind::U8 => Some(1),
            FieldKind::U16 => Some(2),
            FieldKind::U32 => Some(4),
            FieldKind::U64 => Some(8),
            FieldKind::Pointer => Some(self.pointer_size),
            FieldKind::Bytes { count } => Some(*count),
            FieldKind::Struct { name } => self.type_size(name),
        }
    }
}
