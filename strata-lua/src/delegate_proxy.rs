//! Script-facing delegate endpoints.
//!
//! Accessing a delegate property on an instance handle produces one of
//! these, cached on the handle. All mutation goes through the delegate
//! registry; binding takes an explicit lifecycle anchor object so handlers
//! detach automatically when that object goes away.

use std::rc::Weak;

use mlua::prelude::*;
use strata_reflect::DelegateFieldId;

use crate::delegate_registry::DelegateRegistry;
use crate::env::{upgrade_env, EnvContext};
use crate::marshal;

pub struct DelegateProxy {
    field: DelegateFieldId,
    env: Weak<EnvContext>,
}

impl DelegateProxy {
    pub(crate) fn new(field: DelegateFieldId, env: Weak<EnvContext>) -> Self {
        Self { field, env }
    }
}

fn anchor_of(value: &LuaValue) -> LuaResult<strata_reflect::ObjectId> {
    marshal::object_id_of(value).ok_or_else(|| {
        LuaError::RuntimeError(
            "expected an object handle as the lifecycle anchor".to_string(),
        )
    })
}

fn function_of(value: LuaValue) -> LuaResult<LuaFunction> {
    match value {
        LuaValue::Function(f) => Ok(f),
        other => Err(LuaError::RuntimeError(format!(
            "expected a function, got {}",
            other.type_name()
        ))),
    }
}

impl LuaUserData for DelegateProxy {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method(
            "Bind",
            |lua, this, (owner, callable): (LuaValue, LuaValue)| {
                let ctx = upgrade_env(&this.env)?;
                let owner = anchor_of(&owner)?;
                let callable = function_of(callable)?;
                DelegateRegistry::bind(lua, &ctx, &this.field, owner, &callable)
            },
        );

        methods.add_method("Unbind", |_, this, ()| {
            let ctx = upgrade_env(&this.env)?;
            DelegateRegistry::clear_field(&ctx, &this.field);
            Ok(())
        });

        methods.add_method("Execute", |lua, this, args: LuaMultiValue| {
            let ctx = upgrade_env(&this.env)?;
            DelegateRegistry::execute(lua, &ctx, &this.field, args)
        });

        methods.add_method(
            "Add",
            |lua, this, (owner, callable): (LuaValue, LuaValue)| {
                let ctx = upgrade_env(&this.env)?;
                let owner = anchor_of(&owner)?;
                let callable = function_of(callable)?;
                DelegateRegistry::add(lua, &ctx, &this.field, owner, &callable)
            },
        );

        methods.add_method("Remove", |_, this, callable: LuaValue| {
            let ctx = upgrade_env(&this.env)?;
            let callable = function_of(callable)?;
            DelegateRegistry::remove(&ctx, &this.field, &callable);
            Ok(())
        });

        methods.add_method("Clear", |_, this, ()| {
            let ctx = upgrade_env(&this.env)?;
            DelegateRegistry::clear_field(&ctx, &this.field);
            Ok(())
        });

        methods.add_method("Broadcast", |lua, this, args: LuaMultiValue| {
            let ctx = upgrade_env(&this.env)?;
            DelegateRegistry::broadcast(lua, &ctx, &this.field, args)?;
            Ok(())
        });

        methods.add_method("IsBound", |_, this, ()| {
            let ctx = upgrade_env(&this.env)?;
            Ok(DelegateRegistry::is_bound(&ctx, &this.field))
        });

        methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
            let multicast = this
                .env
                .upgrade()
                .and_then(|ctx| {
                    let world = ctx.world.borrow();
                    world.delegate_signature(&this.field).map(|(_, m)| m)
                })
                .unwrap_or(false);
            if multicast {
                Ok(format!("MulticastDelegate({})", this.field))
            } else {
                Ok(format!("Delegate({})", this.field))
            }
        });
    }
}
