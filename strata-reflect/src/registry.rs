//! The reflection database: arenas of classes, structs, enums and
//! functions, plus the lookups the binding layer drives everything with.
//!
//! Inheritance is a super index into the class arena; all chain lookups
//! are plain outward walks over that index, first match wins.

use indexmap::IndexMap;
use log::debug;

use crate::class::{ClassDef, ClassId, EnumDef, EnumId, StructDef, StructId};
use crate::delegate::DelegateSlot;
use crate::function::{FunctionDef, FunctionId, NativeFn, ScriptHook};
use crate::property::{ParamDef, PropertyDef, PropertyKind};
use crate::value::{StructValue, Value, ValueKind};

/// Reflection metadata for one world.
#[derive(Debug, Default)]
pub struct ReflectionDb {
    classes: Vec<ClassDef>,
    structs: Vec<StructDef>,
    enums: Vec<EnumDef>,
    functions: Vec<FunctionDef>,
    /// Bumped whenever a function identity is replaced in place. Caches
    /// built against an older generation must be discarded.
    generation: u64,
}

impl ReflectionDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    // ==================== Construction ====================

    pub fn add_class(&mut self, name: &str, super_class: Option<ClassId>) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(ClassDef {
            name: name.to_string(),
            super_class,
            is_interface: false,
            properties: Vec::new(),
            functions: Vec::new(),
        });
        id
    }

    pub fn add_interface(&mut self, name: &str) -> ClassId {
        let id = self.add_class(name, None);
        self.classes[id.0 as usize].is_interface = true;
        id
    }

    pub fn add_property(&mut self, class: ClassId, property: PropertyDef) {
        self.classes[class.0 as usize].properties.push(property);
    }

    pub fn add_struct(&mut self, name: &str, fields: Vec<(String, ValueKind)>) -> StructId {
        let id = StructId(self.structs.len() as u32);
        self.structs.push(StructDef {
            name: name.to_string(),
            fields,
        });
        id
    }

    pub fn add_enum(&mut self, name: &str, variants: &[(&str, i64)]) -> EnumId {
        let id = EnumId(self.enums.len() as u32);
        self.enums.push(EnumDef {
            name: name.to_string(),
            variants: variants
                .iter()
                .map(|(n, v)| (n.to_string(), *v))
                .collect(),
        });
        id
    }

    /// Declare an instance function on `class`.
    pub fn add_function(&mut self, class: ClassId, name: &str, params: Vec<ParamDef>) -> FunctionId {
        self.add_function_inner(class, name, params, false)
    }

    /// Declare a static function on `class`.
    pub fn add_static_function(
        &mut self,
        class: ClassId,
        name: &str,
        params: Vec<ParamDef>,
    ) -> FunctionId {
        self.add_function_inner(class, name, params, true)
    }

    fn add_function_inner(
        &mut self,
        class: ClassId,
        name: &str,
        params: Vec<ParamDef>,
        is_static: bool,
    ) -> FunctionId {
        debug_assert!(
            params.iter().filter(|p| p.is_return()).count() <= 1,
            "function '{name}' declares more than one return slot"
        );
        debug_assert!(
            params.iter().filter(|p| p.is_latent()).count() <= 1,
            "function '{name}' declares more than one latent slot"
        );

        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(FunctionDef {
            name: name.to_string(),
            owner: class,
            params,
            is_static,
            native: None,
            hook: None,
        });
        self.classes[class.0 as usize].functions.push(id);
        id
    }

    /// Attach a native implementation.
    pub fn set_native(&mut self, function: FunctionId, native: NativeFn) {
        self.functions[function.0 as usize].native = Some(native);
    }

    /// Install or remove the script override hook.
    pub fn set_hook(&mut self, function: FunctionId, hook: Option<ScriptHook>) {
        self.functions[function.0 as usize].hook = hook;
    }

    /// Replace a function in place, keeping its identity.
    ///
    /// Models the hot-reload path: the parameter list is swapped, any
    /// native implementation or script hook is dropped (the reinstated
    /// function is a fresh identity as far as callers are concerned), and
    /// the database generation is bumped so descriptor caches refresh.
    pub fn replace_function(&mut self, function: FunctionId, params: Vec<ParamDef>) {
        let def = &mut self.functions[function.0 as usize];
        def.params = params;
        def.native = None;
        def.hook = None;
        self.generation += 1;
        debug!(
            "replaced function '{}' ({function}), generation now {}",
            def.name, self.generation
        );
    }

    // ==================== Lookup ====================

    pub fn class(&self, id: ClassId) -> &ClassDef {
        &self.classes[id.0 as usize]
    }

    pub fn function(&self, id: FunctionId) -> &FunctionDef {
        &self.functions[id.0 as usize]
    }

    pub fn struct_def(&self, id: StructId) -> &StructDef {
        &self.structs[id.0 as usize]
    }

    pub fn enum_def(&self, id: EnumId) -> &EnumDef {
        &self.enums[id.0 as usize]
    }

    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(|i| ClassId(i as u32))
    }

    pub fn struct_by_name(&self, name: &str) -> Option<StructId> {
        self.structs
            .iter()
            .position(|s| s.name == name)
            .map(|i| StructId(i as u32))
    }

    pub fn enum_by_name(&self, name: &str) -> Option<EnumId> {
        self.enums
            .iter()
            .position(|e| e.name == name)
            .map(|i| EnumId(i as u32))
    }

    /// Iterate `class` and its ancestors, most-derived first.
    pub fn chain(&self, class: ClassId) -> ClassChain<'_> {
        ClassChain {
            db: self,
            next: Some(class),
        }
    }

    /// Whether `class` is `ancestor` or inherits from it.
    pub fn is_a(&self, class: ClassId, ancestor: ClassId) -> bool {
        self.chain(class).any(|c| c == ancestor)
    }

    /// Find a function by name over the inheritance chain; first match
    /// wins, so redeclarations in derived classes shadow base ones.
    pub fn find_function(&self, class: ClassId, name: &str) -> Option<FunctionId> {
        for c in self.chain(class) {
            for &f in &self.classes[c.0 as usize].functions {
                if self.functions[f.0 as usize].name == name {
                    return Some(f);
                }
            }
        }
        None
    }

    /// Find a property by name over the inheritance chain.
    pub fn find_property(&self, class: ClassId, name: &str) -> Option<&PropertyDef> {
        self.chain(class)
            .find_map(|c| self.classes[c.0 as usize].property(name))
    }

    /// Per-object storage for a freshly created instance: value properties
    /// (defaults deep-cloned) and delegate slots, over the whole chain.
    /// Derived declarations shadow base ones of the same name.
    pub(crate) fn instantiate_storage(
        &self,
        class: ClassId,
    ) -> (IndexMap<String, Value>, IndexMap<String, DelegateSlot>) {
        let mut properties = IndexMap::new();
        let mut delegates = IndexMap::new();
        for c in self.chain(class) {
            for prop in &self.classes[c.0 as usize].properties {
                match &prop.kind {
                    PropertyKind::Value { kind, default } => {
                        properties.entry(prop.name.clone()).or_insert_with(|| {
                            if default.is_empty() {
                                self.default_value(kind)
                            } else {
                                default.deep_clone()
                            }
                        });
                    }
                    PropertyKind::Delegate {
                        signature,
                        multicast,
                    } => {
                        delegates
                            .entry(prop.name.clone())
                            .or_insert_with(|| DelegateSlot::new(*signature, *multicast));
                    }
                }
            }
        }
        (properties, delegates)
    }

    /// Neutral value for a kind: zero for scalars, the first variant for
    /// enums, empty cells for containers, field defaults for structs, and
    /// a null reference for objects.
    pub fn default_value(&self, kind: &ValueKind) -> Value {
        match kind {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Str => Value::Str(String::new()),
            ValueKind::Enum(id) => Value::Int(self.enum_def(*id).default_value()),
            ValueKind::Object(_) => Value::Empty,
            ValueKind::Struct(id) => {
                let def = self.struct_def(*id);
                let fields = def
                    .fields
                    .iter()
                    .map(|(_, k)| self.default_value(k))
                    .collect();
                Value::Struct(StructValue::new(*id, fields).into_shared())
            }
            ValueKind::Array(_) => Value::array(Vec::new()),
            ValueKind::Set(_) => Value::set(Vec::new()),
            ValueKind::Map(_, _) => Value::map(Vec::new()),
            ValueKind::Latent => Value::Empty,
        }
    }

    /// Shape check for a value against a kind.
    ///
    /// Object class compatibility needs the world (the value only carries
    /// an id) and is checked there; here any object reference or null
    /// matches an object kind. Enums accept any integer, matching native
    /// enum-as-int semantics.
    pub fn value_matches(&self, value: &Value, kind: &ValueKind) -> bool {
        match (value, kind) {
            (Value::Bool(_), ValueKind::Bool) => true,
            (Value::Int(_), ValueKind::Int) => true,
            (Value::Float(_), ValueKind::Float) => true,
            (Value::Int(_), ValueKind::Float) => true,
            (Value::Str(_), ValueKind::Str) => true,
            (Value::Int(_), ValueKind::Enum(_)) => true,
            (Value::Object(_), ValueKind::Object(_)) => true,
            (Value::Empty, ValueKind::Object(_)) => true,
            (Value::Struct(cell), ValueKind::Struct(id)) => cell.borrow().struct_id == *id,
            (Value::Array(cell), ValueKind::Array(elem)) => {
                cell.borrow().iter().all(|v| self.value_matches(v, elem))
            }
            (Value::Set(_), ValueKind::Set(_)) => true,
            (Value::Map(cell), ValueKind::Map(_, value_kind)) => cell
                .borrow()
                .values()
                .all(|v| self.value_matches(v, value_kind)),
            (Value::Latent(_), ValueKind::Latent) => true,
            (Value::Empty, ValueKind::Latent) => true,
            _ => false,
        }
    }
}

/// Iterator over a class and its ancestors.
pub struct ClassChain<'a> {
    db: &'a ReflectionDb,
    next: Option<ClassId>,
}

impl Iterator for ClassChain<'_> {
    type Item = ClassId;

    fn next(&mut self) -> Option<ClassId> {
        let current = self.next?;
        self.next = self.db.class(current).super_class;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_walks_outward() {
        let mut db = ReflectionDb::new();
        let base = db.add_class("Base", None);
        let mid = db.add_class("Mid", Some(base));
        let leaf = db.add_class("Leaf", Some(mid));

        let chain: Vec<_> = db.chain(leaf).collect();
        assert_eq!(chain, vec![leaf, mid, base]);
        assert!(db.is_a(leaf, base));
        assert!(!db.is_a(base, leaf));
    }

    #[test]
    fn find_function_prefers_derived_redeclaration() {
        let mut db = ReflectionDb::new();
        let base = db.add_class("Base", None);
        let leaf = db.add_class("Leaf", Some(base));
        let base_fn = db.add_function(base, "Tick", vec![]);
        let leaf_fn = db.add_function(leaf, "Tick", vec![]);

        assert_eq!(db.find_function(leaf, "Tick"), Some(leaf_fn));
        assert_eq!(db.find_function(base, "Tick"), Some(base_fn));
        assert_eq!(db.find_function(leaf, "Missing"), None);
    }

    #[test]
    fn find_property_walks_chain() {
        let mut db = ReflectionDb::new();
        let base = db.add_class("Base", None);
        let leaf = db.add_class("Leaf", Some(base));
        db.add_property(base, PropertyDef::value("health", ValueKind::Int));

        assert!(db.find_property(leaf, "health").is_some());
        assert!(db.find_property(leaf, "mana").is_none());
    }

    #[test]
    fn replace_function_bumps_generation_and_drops_impls() {
        let mut db = ReflectionDb::new();
        let class = db.add_class("Thing", None);
        let f = db.add_function(class, "Act", vec![ParamDef::input("x", ValueKind::Int)]);
        db.set_native(f, std::rc::Rc::new(|_, _, _| {}));
        assert_eq!(db.generation(), 0);
        assert!(db.function(f).has_native());

        db.replace_function(f, vec![]);
        assert_eq!(db.generation(), 1);
        assert!(!db.function(f).has_native());
        assert!(db.function(f).params.is_empty());
        assert_eq!(db.function(f).name, "Act");
    }

    #[test]
    fn default_struct_value_has_field_defaults() {
        let mut db = ReflectionDb::new();
        let point = db.add_struct(
            "Point",
            vec![
                ("x".to_string(), ValueKind::Float),
                ("y".to_string(), ValueKind::Float),
            ],
        );
        let v = db.default_value(&ValueKind::Struct(point));
        if let Value::Struct(cell) = v {
            let inner = cell.borrow();
            assert_eq!(inner.fields, vec![Value::Float(0.0), Value::Float(0.0)]);
        } else {
            panic!("expected struct value");
        }
    }

    #[test]
    fn value_matches_basic_shapes() {
        let mut db = ReflectionDb::new();
        let color = db.add_enum("Color", &[("Red", 0), ("Blue", 2)]);
        let any_class = db.add_class("Thing", None);

        assert!(db.value_matches(&Value::Int(3), &ValueKind::Int));
        assert!(db.value_matches(&Value::Int(3), &ValueKind::Float));
        assert!(!db.value_matches(&Value::Float(3.0), &ValueKind::Int));
        assert!(db.value_matches(&Value::Int(7), &ValueKind::Enum(color)));
        assert!(db.value_matches(&Value::Empty, &ValueKind::Object(any_class)));
        assert!(!db.value_matches(&Value::Str("x".into()), &ValueKind::Bool));

        let arr = Value::array(vec![Value::Int(1), Value::Int(2)]);
        assert!(db.value_matches(&arr, &ValueKind::Array(Box::new(ValueKind::Int))));
        assert!(!db.value_matches(&arr, &ValueKind::Array(Box::new(ValueKind::Str))));
    }
}
