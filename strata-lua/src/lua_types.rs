//! Userdata view over a shared struct cell.
//!
//! Field access reads through to the native cell using the struct's
//! declared field kinds, so `s.Field = v` from a script is immediately
//! visible to native readers of the same cell.

use std::rc::{Rc, Weak};

use mlua::prelude::*;
use strata_reflect::{SharedStruct, StructId};

use crate::env::{upgrade_env, EnvContext};
use crate::marshal;

pub struct StructProxy {
    cell: SharedStruct,
    env: Weak<EnvContext>,
}

impl StructProxy {
    pub(crate) fn new(cell: SharedStruct, env: Weak<EnvContext>) -> Self {
        Self { cell, env }
    }

    pub(crate) fn struct_id(&self) -> StructId {
        self.cell.borrow().struct_id
    }

    pub(crate) fn cell(&self) -> SharedStruct {
        self.cell.clone()
    }

    fn field_slot(&self, ctx: &Rc<EnvContext>, name: &str) -> Option<(usize, strata_reflect::ValueKind)> {
        let world = ctx.world.borrow();
        let def = world.db().struct_def(self.struct_id());
        let index = def.field_index(name)?;
        Some((index, def.fields[index].1.clone()))
    }
}

impl LuaUserData for StructProxy {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        // Detached deep copy; mutations on the result no longer reach the
        // original cell.
        methods.add_method("Copy", |_, this, ()| {
            let copy = Rc::new(std::cell::RefCell::new(this.cell.borrow().detached()));
            Ok(StructProxy::new(copy, this.env.clone()))
        });

        methods.add_meta_method(LuaMetaMethod::Index, |lua, this, name: String| {
            let ctx = upgrade_env(&this.env)?;
            let Some((index, kind)) = this.field_slot(&ctx, &name) else {
                return Ok(LuaValue::Nil);
            };
            let value = this.cell.borrow().fields[index].clone();
            marshal::push_value(lua, &ctx, &value, &kind, false)
        });

        methods.add_meta_method(
            LuaMetaMethod::NewIndex,
            |_, this, (name, value): (String, LuaValue)| {
                let ctx = upgrade_env(&this.env)?;
                let Some((index, kind)) = this.field_slot(&ctx, &name) else {
                    let struct_name = ctx.world.borrow().db().struct_def(this.struct_id()).name.clone();
                    return Err(LuaError::RuntimeError(format!(
                        "struct '{struct_name}' has no field '{name}'"
                    )));
                };
                let (converted, _) = marshal::read_value(&ctx, &value, &kind);
                this.cell.borrow_mut().fields[index] = converted;
                Ok(())
            },
        );

        methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
            let ctx = upgrade_env(&this.env)?;
            let name = ctx.world.borrow().db().struct_def(this.struct_id()).name.clone();
            Ok(name)
        });
    }
}
