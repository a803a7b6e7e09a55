//! Class, struct and enum definitions.

use std::fmt;

use crate::function::FunctionId;
use crate::property::PropertyDef;
use crate::value::ValueKind;

/// Index into the class arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class:{}", self.0)
    }
}

/// Index into the struct arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructId(pub u32);

/// Index into the enum arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumId(pub u32);

/// One reflected class: properties, functions, and a super index forming
/// the inheritance chain.
#[derive(Debug)]
pub struct ClassDef {
    pub name: String,
    pub super_class: Option<ClassId>,
    /// Interface classes carry declarations only; calls through them are
    /// re-resolved by name on the receiver's concrete class.
    pub is_interface: bool,
    pub properties: Vec<PropertyDef>,
    pub functions: Vec<FunctionId>,
}

impl ClassDef {
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// One reflected struct: named fields in declaration order.
#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<(String, ValueKind)>,
}

impl StructDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    pub fn field_kind(&self, name: &str) -> Option<&ValueKind> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, k)| k)
    }
}

/// One reflected enum: named integer variants.
#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    pub variants: Vec<(String, i64)>,
}

impl EnumDef {
    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.variants
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.variants
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| n.as_str())
    }

    pub fn is_valid(&self, value: i64) -> bool {
        self.variants.iter().any(|(_, v)| *v == value)
    }

    /// Value objects of this enum default to; the first declared variant.
    pub fn default_value(&self) -> i64 {
        self.variants.first().map(|(_, v)| *v).unwrap_or(0)
    }
}
