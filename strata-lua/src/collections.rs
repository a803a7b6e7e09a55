//! Script-side views over shared native containers.
//!
//! Each proxy wraps the same cell the native side owns, so `Set`/`Add`
//! calls from a script mutate native state directly. Element conversions
//! go through the marshaller and inherit its fail-soft behaviour; index
//! errors on mutation raise, since they are script bugs rather than type
//! drift.

use std::rc::Weak;

use log::warn;
use mlua::prelude::*;
use strata_reflect::{SharedArray, SharedMap, SharedSet, ValueKind};

use crate::env::{upgrade_env, EnvContext};
use crate::marshal;

/// Userdata view over a shared array cell. Indices are 1-based on the
/// script side.
pub struct ArrayProxy {
    cell: SharedArray,
    elem: ValueKind,
    env: Weak<EnvContext>,
}

impl ArrayProxy {
    pub(crate) fn new(cell: SharedArray, elem: ValueKind, env: Weak<EnvContext>) -> Self {
        Self { cell, elem, env }
    }

    pub(crate) fn cell(&self) -> SharedArray {
        self.cell.clone()
    }

    fn index(&self, index: i64) -> LuaResult<usize> {
        let len = self.cell.borrow().len();
        if index < 1 || index as usize > len {
            return Err(LuaError::RuntimeError(format!(
                "array index {index} out of range (length {len})"
            )));
        }
        Ok(index as usize - 1)
    }
}

impl LuaUserData for ArrayProxy {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("Length", |_, this, ()| Ok(this.cell.borrow().len() as i64));

        methods.add_method("Get", |lua, this, index: i64| {
            let ctx = upgrade_env(&this.env)?;
            let item = {
                let guard = this.cell.borrow();
                let Some(idx) = (index as usize).checked_sub(1) else {
                    warn!("array index {index} out of range (length {})", guard.len());
                    return Ok(LuaValue::Nil);
                };
                match guard.get(idx) {
                    Some(v) => v.clone(),
                    None => {
                        warn!("array index {index} out of range (length {})", guard.len());
                        return Ok(LuaValue::Nil);
                    }
                }
            };
            marshal::push_value(lua, &ctx, &item, &this.elem, false)
        });

        methods.add_method("Set", |_, this, (index, value): (i64, LuaValue)| {
            let ctx = upgrade_env(&this.env)?;
            let idx = this.index(index)?;
            let (converted, _) = marshal::read_value(&ctx, &value, &this.elem);
            this.cell.borrow_mut()[idx] = converted;
            Ok(())
        });

        methods.add_method("Add", |_, this, value: LuaValue| {
            let ctx = upgrade_env(&this.env)?;
            let (converted, _) = marshal::read_value(&ctx, &value, &this.elem);
            let mut guard = this.cell.borrow_mut();
            guard.push(converted);
            Ok(guard.len() as i64)
        });

        methods.add_method("Insert", |_, this, (index, value): (i64, LuaValue)| {
            let ctx = upgrade_env(&this.env)?;
            let len = this.cell.borrow().len();
            // Inserting at length + 1 appends, like table.insert.
            if index < 1 || index as usize > len + 1 {
                return Err(LuaError::RuntimeError(format!(
                    "array insert position {index} out of range (length {len})"
                )));
            }
            let (converted, _) = marshal::read_value(&ctx, &value, &this.elem);
            this.cell.borrow_mut().insert(index as usize - 1, converted);
            Ok(())
        });

        methods.add_method("Remove", |_, this, index: i64| {
            let idx = this.index(index)?;
            this.cell.borrow_mut().remove(idx);
            Ok(())
        });

        methods.add_method("Clear", |_, this, ()| {
            this.cell.borrow_mut().clear();
            Ok(())
        });

        methods.add_method("Contains", |_, this, value: LuaValue| {
            let ctx = upgrade_env(&this.env)?;
            let (probe, _) = marshal::read_value(&ctx, &value, &this.elem);
            Ok(this.cell.borrow().iter().any(|v| *v == probe))
        });

        methods.add_meta_method(LuaMetaMethod::Len, |_, this, ()| {
            Ok(this.cell.borrow().len() as i64)
        });
        methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
            Ok(format!("Array[{}]", this.cell.borrow().len()))
        });
    }
}

/// Userdata view over a shared set cell. Elements are restricted to the
/// scalar key kinds.
pub struct SetProxy {
    cell: SharedSet,
    elem: ValueKind,
    env: Weak<EnvContext>,
}

impl SetProxy {
    pub(crate) fn new(cell: SharedSet, elem: ValueKind, env: Weak<EnvContext>) -> Self {
        Self { cell, elem, env }
    }

    pub(crate) fn cell(&self) -> SharedSet {
        self.cell.clone()
    }
}

impl LuaUserData for SetProxy {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("Length", |_, this, ()| Ok(this.cell.borrow().len() as i64));

        methods.add_method("Add", |_, this, value: LuaValue| {
            let ctx = upgrade_env(&this.env)?;
            match marshal::read_scalar_key(&ctx, &value, &this.elem) {
                Some(key) => {
                    this.cell.borrow_mut().insert(key);
                }
                None => warn!(
                    "cannot add {} to a set of {}",
                    value.type_name(),
                    this.elem.describe()
                ),
            }
            Ok(())
        });

        methods.add_method("Remove", |_, this, value: LuaValue| {
            let ctx = upgrade_env(&this.env)?;
            match marshal::read_scalar_key(&ctx, &value, &this.elem) {
                Some(key) => Ok(this.cell.borrow_mut().shift_remove(&key)),
                None => Ok(false),
            }
        });

        methods.add_method("Contains", |_, this, value: LuaValue| {
            let ctx = upgrade_env(&this.env)?;
            match marshal::read_scalar_key(&ctx, &value, &this.elem) {
                Some(key) => Ok(this.cell.borrow().contains(&key)),
                None => Ok(false),
            }
        });

        methods.add_method("Clear", |_, this, ()| {
            this.cell.borrow_mut().clear();
            Ok(())
        });

        // Snapshot of the elements as a plain sequence table.
        methods.add_method("Items", |lua, this, ()| {
            let items = lua.create_table()?;
            for (i, key) in this.cell.borrow().iter().enumerate() {
                items.raw_set(i + 1, marshal::push_scalar_key(lua, key)?)?;
            }
            Ok(items)
        });

        methods.add_meta_method(LuaMetaMethod::Len, |_, this, ()| {
            Ok(this.cell.borrow().len() as i64)
        });
        methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
            Ok(format!("Set[{}]", this.cell.borrow().len()))
        });
    }
}

/// Userdata view over a shared map cell.
pub struct MapProxy {
    cell: SharedMap,
    key_kind: ValueKind,
    value_kind: ValueKind,
    env: Weak<EnvContext>,
}

impl MapProxy {
    pub(crate) fn new(
        cell: SharedMap,
        key_kind: ValueKind,
        value_kind: ValueKind,
        env: Weak<EnvContext>,
    ) -> Self {
        Self {
            cell,
            key_kind,
            value_kind,
            env,
        }
    }

    pub(crate) fn cell(&self) -> SharedMap {
        self.cell.clone()
    }
}

impl LuaUserData for MapProxy {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("Length", |_, this, ()| Ok(this.cell.borrow().len() as i64));

        methods.add_method("Get", |lua, this, key: LuaValue| {
            let ctx = upgrade_env(&this.env)?;
            let Some(key) = marshal::read_scalar_key(&ctx, &key, &this.key_kind) else {
                return Ok(LuaValue::Nil);
            };
            let found = this.cell.borrow().get(&key).cloned();
            match found {
                Some(value) => marshal::push_value(lua, &ctx, &value, &this.value_kind, false),
                None => Ok(LuaValue::Nil),
            }
        });

        methods.add_method("Set", |_, this, (key, value): (LuaValue, LuaValue)| {
            let ctx = upgrade_env(&this.env)?;
            let Some(key) = marshal::read_scalar_key(&ctx, &key, &this.key_kind) else {
                return Err(LuaError::RuntimeError(format!(
                    "cannot use {} as a {} map key",
                    key.type_name(),
                    this.key_kind.describe()
                )));
            };
            let (converted, _) = marshal::read_value(&ctx, &value, &this.value_kind);
            this.cell.borrow_mut().insert(key, converted);
            Ok(())
        });

        methods.add_method("Remove", |_, this, key: LuaValue| {
            let ctx = upgrade_env(&this.env)?;
            match marshal::read_scalar_key(&ctx, &key, &this.key_kind) {
                Some(key) => Ok(this.cell.borrow_mut().shift_remove(&key).is_some()),
                None => Ok(false),
            }
        });

        methods.add_method("Contains", |_, this, key: LuaValue| {
            let ctx = upgrade_env(&this.env)?;
            match marshal::read_scalar_key(&ctx, &key, &this.key_kind) {
                Some(key) => Ok(this.cell.borrow().contains_key(&key)),
                None => Ok(false),
            }
        });

        methods.add_method("Clear", |_, this, ()| {
            this.cell.borrow_mut().clear();
            Ok(())
        });

        // Snapshot of the keys as a plain sequence table.
        methods.add_method("Keys", |lua, this, ()| {
            let keys = lua.create_table()?;
            for (i, key) in this.cell.borrow().keys().enumerate() {
                keys.raw_set(i + 1, marshal::push_scalar_key(lua, key)?)?;
            }
            Ok(keys)
        });

        methods.add_meta_method(LuaMetaMethod::Len, |_, this, ()| {
            Ok(this.cell.borrow().len() as i64)
        });
        methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
            Ok(format!("Map[{}]", this.cell.borrow().len()))
        });
    }
}
