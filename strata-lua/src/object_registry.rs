//! Host object to script instance bindings.
//!
//! At most one instance table exists per object; [`ObjectRegistry::resolve`]
//! either returns the cached one or creates it. Tables are pinned in the
//! Lua registry until the object's destroyed notification (or environment
//! teardown) releases them.

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;
use mlua::prelude::*;
use strata_reflect::{ObjectId, ObjectState};

use crate::binding;
use crate::env::EnvContext;

#[derive(Default)]
pub struct ObjectRegistry {
    refs: HashMap<ObjectId, LuaRegistryKey>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the instance table bound to `id`, creating it on first use.
    ///
    /// The flag reports whether this call created the binding. Resolution
    /// fails for an unknown object and for one whose destruction has begun;
    /// new bindings to a dying object must not come into existence.
    pub fn resolve(
        &mut self,
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        id: ObjectId,
    ) -> LuaResult<(LuaTable, bool)> {
        if let Some(key) = self.refs.get(&id) {
            let table: LuaTable = lua.registry_value(key)?;
            return Ok((table, false));
        }

        match ctx.world.borrow().state(id) {
            Some(ObjectState::Alive) => {}
            Some(_) => {
                return Err(LuaError::RuntimeError(format!(
                    "object {id} is being destroyed and cannot be bound"
                )));
            }
            None => {
                return Err(LuaError::RuntimeError(format!("unknown object {id}")));
            }
        }

        let table = binding::make_instance_table(lua, ctx, id)?;
        let key = lua.create_registry_value(&table)?;
        self.refs.insert(id, key);
        debug!("bound object {id} to a script instance table");
        Ok((table, true))
    }

    /// Whether `id` currently has an instance table.
    pub fn is_bound(&self, id: ObjectId) -> bool {
        self.refs.contains_key(&id)
    }

    /// Fetch the instance table without creating one.
    pub fn handle(&self, lua: &Lua, id: ObjectId) -> Option<LuaTable> {
        let key = self.refs.get(&id)?;
        lua.registry_value(key).ok()
    }

    /// Drop the binding for `id`, unpinning its instance table.
    pub fn unbind(&mut self, lua: &Lua, id: ObjectId) {
        if let Some(key) = self.refs.remove(&id) {
            let _ = lua.remove_registry_value(key);
            debug!("released script binding for {id}");
        }
    }

    pub fn clear(&mut self, lua: &Lua) {
        for (_, key) in self.refs.drain() {
            let _ = lua.remove_registry_value(key);
        }
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
