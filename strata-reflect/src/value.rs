//! Dynamic values flowing across the reflection boundary.
//!
//! Reflected properties, function parameters and delegate payloads are all
//! represented as [`Value`]s. Struct and container payloads sit behind
//! shared cells so that a scripting-side wrapper and native code observe
//! each other's in-place mutations without copying.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::class::{ClassId, EnumId, StructId};
use crate::object::ObjectId;

/// Token identifying one pending latent completion.
///
/// Handed to the native side when a latent function is invoked; the host
/// scheduler later completes the call through the binding layer using the
/// same token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LatentToken(pub u64);

impl fmt::Display for LatentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "latent:{}", self.0)
    }
}

/// Hashable scalar used for map keys and set elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarKey {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for ScalarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarKey::Bool(b) => write!(f, "{b}"),
            ScalarKey::Int(n) => write!(f, "{n}"),
            ScalarKey::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Shared array payload; order is element order.
pub type SharedArray = Rc<RefCell<Vec<Value>>>;
/// Shared set payload; iteration follows insertion order.
pub type SharedSet = Rc<RefCell<IndexSet<ScalarKey>>>;
/// Shared map payload; iteration follows insertion order.
pub type SharedMap = Rc<RefCell<IndexMap<ScalarKey, Value>>>;
/// Shared struct payload.
pub type SharedStruct = Rc<RefCell<StructValue>>;

/// A struct instance: field values in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub struct_id: StructId,
    pub fields: Vec<Value>,
}

impl StructValue {
    pub fn new(struct_id: StructId, fields: Vec<Value>) -> Self {
        Self { struct_id, fields }
    }

    /// Wrap into a shared cell.
    pub fn into_shared(self) -> SharedStruct {
        Rc::new(RefCell::new(self))
    }

    /// Deep copy with every nested cell detached.
    pub fn detached(&self) -> StructValue {
        StructValue {
            struct_id: self.struct_id,
            fields: self.fields.iter().map(Value::deep_clone).collect(),
        }
    }
}

/// A single dynamically-typed value.
///
/// `Empty` doubles as "no value yet" in parameter frames and as the null
/// object reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Object(ObjectId),
    Struct(SharedStruct),
    Array(SharedArray),
    Set(SharedSet),
    Map(SharedMap),
    Latent(LatentToken),
}

impl Value {
    /// Convenience constructor for a shared array.
    pub fn array(elements: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    /// Convenience constructor for a shared map.
    pub fn map(entries: Vec<(ScalarKey, Value)>) -> Value {
        Value::Map(Rc::new(RefCell::new(entries.into_iter().collect())))
    }

    /// Convenience constructor for a shared set.
    pub fn set(elements: Vec<ScalarKey>) -> Value {
        Value::Set(Rc::new(RefCell::new(elements.into_iter().collect())))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the carried variant for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Latent(_) => "latent",
        }
    }

    /// Whether two values point at the same shared cell.
    ///
    /// Scalars are never cell-shared; for them this is always false.
    pub fn shares_cell(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Struct(a), Value::Struct(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Recursively clone shared payloads into fresh cells.
    ///
    /// A plain `clone()` of a struct/container value aliases the same cell;
    /// this produces a detached copy instead.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::Struct(cell) => {
                let inner = cell.borrow();
                let fields = inner.fields.iter().map(Value::deep_clone).collect();
                Value::Struct(StructValue::new(inner.struct_id, fields).into_shared())
            }
            Value::Array(cell) => {
                let elements = cell.borrow().iter().map(Value::deep_clone).collect();
                Value::Array(Rc::new(RefCell::new(elements)))
            }
            Value::Set(cell) => Value::Set(Rc::new(RefCell::new(cell.borrow().clone()))),
            Value::Map(cell) => {
                let entries = cell
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_clone()))
                    .collect();
                Value::Map(Rc::new(RefCell::new(entries)))
            }
            other => other.clone(),
        }
    }
}

/// Type shape of a property or parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Str,
    /// Marshalled as the underlying integer value.
    Enum(EnumId),
    /// Reference to a host object of the given class (or a subclass).
    Object(ClassId),
    Struct(StructId),
    Array(Box<ValueKind>),
    Set(Box<ValueKind>),
    Map(Box<ValueKind>, Box<ValueKind>),
    /// Continuation slot of a latent function.
    Latent,
}

impl ValueKind {
    /// Short name for diagnostics; does not resolve ids to names.
    pub fn describe(&self) -> &'static str {
        match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "integer",
            ValueKind::Float => "float",
            ValueKind::Str => "string",
            ValueKind::Enum(_) => "enum",
            ValueKind::Object(_) => "object",
            ValueKind::Struct(_) => "struct",
            ValueKind::Array(_) => "array",
            ValueKind::Set(_) => "set",
            ValueKind::Map(_, _) => "map",
            ValueKind::Latent => "latent",
        }
    }

    /// Whether this kind can serve as a map key or set element.
    pub fn is_scalar_key(&self) -> bool {
        matches!(
            self,
            ValueKind::Bool | ValueKind::Int | ValueKind::Str | ValueKind::Enum(_)
        )
    }
}

/// Native-side parameter frame: one slot per parameter descriptor, in
/// declaration order. The return parameter (when present) occupies its own
/// slot like any other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamFrame {
    slots: Vec<Value>,
}

impl ParamFrame {
    /// Frame of `len` empty slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![Value::Empty; len],
        }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self { slots: values }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.slots.get(index)
    }

    /// Slot access; out-of-range indicates a descriptor bookkeeping bug.
    pub fn slot(&self, index: usize) -> &Value {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut Value {
        &mut self.slots[index]
    }

    pub fn set(&mut self, index: usize, value: Value) {
        self.slots[index] = value;
    }

    /// Move a value out, leaving `Empty` behind.
    pub fn take(&mut self, index: usize) -> Value {
        std::mem::take(&mut self.slots[index])
    }

    pub fn values(&self) -> &[Value] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_array_mutation_is_visible_through_clones() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = a.clone();

        if let Value::Array(cell) = &a {
            cell.borrow_mut().push(Value::Int(2));
        }

        if let Value::Array(cell) = &b {
            assert_eq!(cell.borrow().len(), 2);
        } else {
            panic!("expected array");
        }
        assert!(a.shares_cell(&b));
    }

    #[test]
    fn deep_clone_detaches_cells() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = a.deep_clone();
        assert!(!a.shares_cell(&b));

        if let Value::Array(cell) = &a {
            cell.borrow_mut().push(Value::Int(2));
        }
        if let Value::Array(cell) = &b {
            assert_eq!(cell.borrow().len(), 1);
        }
    }

    #[test]
    fn deep_clone_recurses_into_nested_payloads() {
        let inner = Value::array(vec![Value::Int(7)]);
        let outer = Value::array(vec![inner.clone()]);
        let copy = outer.deep_clone();

        if let Value::Array(cell) = &inner {
            cell.borrow_mut().push(Value::Int(8));
        }

        if let Value::Array(cell) = &copy {
            let first = cell.borrow()[0].clone();
            if let Value::Array(nested) = first {
                assert_eq!(nested.borrow().len(), 1);
            } else {
                panic!("expected nested array");
            }
        }
    }

    #[test]
    fn frame_take_leaves_empty() {
        let mut frame = ParamFrame::from_values(vec![Value::Int(5), Value::Str("x".into())]);
        let taken = frame.take(0);
        assert_eq!(taken, Value::Int(5));
        assert!(frame.slot(0).is_empty());
        assert_eq!(frame.len(), 2);
    }

    #[test]
    fn map_preserves_insertion_order() {
        let v = Value::map(vec![
            (ScalarKey::Str("b".into()), Value::Int(1)),
            (ScalarKey::Str("a".into()), Value::Int(2)),
        ]);
        if let Value::Map(cell) = &v {
            let keys: Vec<_> = cell.borrow().keys().cloned().collect();
            assert_eq!(
                keys,
                vec![ScalarKey::Str("b".into()), ScalarKey::Str("a".into())]
            );
        }
    }
}
