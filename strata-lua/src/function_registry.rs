//! Function descriptor cache and inbound call dispatch.
//!
//! Descriptors are cached per function id; override entries additionally
//! cache, per concrete class, which Lua function (if any) handles a
//! reflected function. Both caches carry the database generation they were
//! built against and refresh themselves when it moves, so hot-reloaded
//! functions never run against a stale calling convention.

use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, warn};
use mlua::prelude::*;
use strata_reflect::{call_native_direct, ClassId, FunctionId, ObjectId, ParamFrame, ReflectionDb};

use crate::env::EnvContext;
use crate::function_desc::FunctionDesc;

struct OverrideEntry {
    /// Pinned Lua handler; `None` caches a miss so unbound functions do not
    /// re-walk the module chain on every call.
    lua_ref: Option<LuaRegistryKey>,
    generation: u64,
}

#[derive(Default)]
pub struct FunctionRegistry {
    descriptors: HashMap<FunctionId, Rc<FunctionDesc>>,
    overrides: HashMap<(ClassId, FunctionId), OverrideEntry>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor for a function, built on first use and rebuilt when the
    /// database generation has moved.
    pub fn descriptor(&mut self, db: &ReflectionDb, function: FunctionId) -> Rc<FunctionDesc> {
        match self.descriptors.get(&function) {
            Some(desc) if !desc.is_stale(db) => desc.clone(),
            _ => {
                let desc = FunctionDesc::build(db, function);
                self.descriptors.insert(function, desc.clone());
                desc
            }
        }
    }

    /// Drop every cached override resolution; the next inbound call per
    /// (class, function) pair re-walks the bound modules. Used when a class
    /// binding is replaced.
    pub fn clear_overrides(&mut self, lua: &Lua) {
        for (_, entry) in self.overrides.drain() {
            if let Some(key) = entry.lua_ref {
                let _ = lua.remove_registry_value(key);
            }
        }
    }

    pub fn clear(&mut self, lua: &Lua) {
        self.clear_overrides(lua);
        self.descriptors.clear();
    }

    /// Dispatch a host-initiated call into script.
    ///
    /// Resolution order: the object is bound lazily if this is its first
    /// contact with the script side, then the concrete class's module chain
    /// is searched for a function of the callee's name. With a handler
    /// found, it runs with the instance handle as `self`; otherwise the
    /// call falls back to the function's native implementation, and with
    /// neither present it is a silent no-op. Errors in the handler are
    /// logged and leave the frame's result slots untouched.
    pub fn invoke_from_native(
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        function: FunctionId,
        target: ObjectId,
        frame: &mut ParamFrame,
    ) {
        let class = {
            let world = ctx.world.borrow();
            if !world.is_alive(target) {
                warn!("dropping an inbound call to dead object {target}");
                return;
            }
            match world.class_of(target) {
                Some(class) => class,
                None => return,
            }
        };

        // First inbound contact binds the object.
        if !ctx.objects.borrow().is_bound(target) {
            let resolved = ctx.objects.borrow_mut().resolve(lua, ctx, target);
            if let Err(err) = resolved {
                warn!("cannot bind {target} for an inbound call: {err}");
                Self::fallback_native(ctx, function, target, frame);
                return;
            }
        }

        let desc = {
            let mut functions = ctx.functions.borrow_mut();
            let world = ctx.world.borrow();
            functions.descriptor(world.db(), function)
        };

        let generation = { ctx.world.borrow().db().generation() };
        let needs_refresh = {
            let functions = ctx.functions.borrow();
            match functions.overrides.get(&(class, function)) {
                Some(entry) => entry.generation != generation,
                None => true,
            }
        };
        if needs_refresh {
            let found = {
                let bindings = ctx.bindings.borrow();
                let world = ctx.world.borrow();
                bindings.lookup_script_function(lua, world.db(), class, &desc.name)
            };
            let lua_ref = match found {
                Some(func) => match lua.create_registry_value(&func) {
                    Ok(key) => Some(key),
                    Err(err) => {
                        warn!("cannot pin the handler for '{}': {err}", desc.qualified());
                        None
                    }
                },
                None => None,
            };
            let mut functions = ctx.functions.borrow_mut();
            let old = functions
                .overrides
                .insert((class, function), OverrideEntry { lua_ref, generation });
            if let Some(OverrideEntry {
                lua_ref: Some(key), ..
            }) = old
            {
                let _ = lua.remove_registry_value(key);
            }
        }

        let func: Option<LuaFunction> = {
            let functions = ctx.functions.borrow();
            functions
                .overrides
                .get(&(class, function))
                .and_then(|entry| entry.lua_ref.as_ref())
                .and_then(|key| lua.registry_value(key).ok())
        };

        match func {
            Some(func) => {
                let handle = { ctx.objects.borrow().handle(lua, target) };
                let Some(handle) = handle else {
                    Self::fallback_native(ctx, function, target, frame);
                    return;
                };
                desc.call_script(lua, ctx, &func, Some(LuaValue::Table(handle)), frame);
            }
            None => Self::fallback_native(ctx, function, target, frame),
        }
    }

    fn fallback_native(
        ctx: &Rc<EnvContext>,
        function: FunctionId,
        target: ObjectId,
        frame: &mut ParamFrame,
    ) {
        if !call_native_direct(&ctx.world, function, Some(target), frame) {
            let name = { ctx.world.borrow().db().function(function).name.clone() };
            debug!("'{name}' has no script handler and no native implementation");
        }
    }
}
