//! Runtime reflection model for the Strata scripting bindings.
//!
//! This crate is the host side of the binding boundary: a reflection
//! database describing classes, structs, enums, properties and functions;
//! an object world with lifetime states and notifications; and delegate
//! slots that invoke native-shaped callback targets. It knows nothing
//! about any particular scripting runtime; `strata-lua` builds on these
//! interfaces to put a Lua VM behind them.

pub mod class;
pub mod delegate;
pub mod function;
pub mod object;
pub mod property;
pub mod registry;
pub mod value;
pub mod world;

pub use class::{ClassDef, ClassId, EnumDef, EnumId, StructDef, StructId};
pub use delegate::{DelegateFieldId, DelegateSlot, DelegateTarget};
pub use function::{FunctionDef, FunctionId, NativeFn, ScriptHook};
pub use object::{HostObject, ObjectId, ObjectState};
pub use property::{ParamDef, ParamFlags, PropertyDef, PropertyKind};
pub use registry::ReflectionDb;
pub use value::{
    LatentToken, ParamFrame, ScalarKey, SharedArray, SharedMap, SharedSet, SharedStruct,
    StructValue, Value, ValueKind,
};
pub use world::{
    call_native_direct, fire_delegate, process_event, HostWorld, ObjectEvent, SharedWorld,
};
