//! Reflected function definitions.

use std::fmt;
use std::rc::Rc;

use crate::class::ClassId;
use crate::object::ObjectId;
use crate::property::ParamDef;
use crate::value::ParamFrame;
use crate::world::SharedWorld;

/// Index into the function arena. Stable for the lifetime of the database;
/// replacing a function keeps its id and bumps the database generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn:{}", self.0)
    }
}

/// Native implementation of a reflected function.
///
/// Receives the shared world rather than a borrow so it can re-enter it
/// (fire delegates, create objects) without holding a lock across the call.
pub type NativeFn = Rc<dyn Fn(&SharedWorld, Option<ObjectId>, &mut ParamFrame)>;

/// Script override installed over a reflected function. When present, the
/// host's event dispatch prefers it over the native implementation.
pub type ScriptHook = Rc<dyn Fn(Option<ObjectId>, &mut ParamFrame)>;

/// One reflected function.
pub struct FunctionDef {
    pub name: String,
    pub owner: ClassId,
    /// Declaration order; at most one return slot, at most one latent slot.
    pub params: Vec<ParamDef>,
    pub is_static: bool,
    pub native: Option<NativeFn>,
    pub hook: Option<ScriptHook>,
}

impl FunctionDef {
    pub fn param(&self, index: usize) -> &ParamDef {
        &self.params[index]
    }

    pub fn find_param(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    pub fn has_native(&self) -> bool {
        self.native.is_some()
    }

    pub fn has_hook(&self) -> bool {
        self.hook.is_some()
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("params", &self.params)
            .field("is_static", &self.is_static)
            .field("native", &self.native.is_some())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
