//! Value marshalling between Lua and the reflection value model.
//!
//! Conversions fail soft: a Lua value that does not fit the requested kind
//! logs a warning and produces the kind's neutral value instead of raising.
//! Struct and container values cross the boundary as userdata proxies
//! wrapping the shared cell, so script-side mutation is visible natively
//! without a copy unless the caller asks for one.

use std::rc::Rc;

use log::warn;
use mlua::prelude::*;
use strata_reflect::{ObjectId, ScalarKey, StructValue, Value, ValueKind};

use crate::collections::{ArrayProxy, MapProxy, SetProxy};
use crate::env::EnvContext;
use crate::lua_types::StructProxy;

/// Key the object registry stores an instance's identity under in its
/// handle table.
pub(crate) const HANDLE_ID_KEY: &str = "__id";

/// Extract the object identity from an instance handle table, if `value`
/// is one. Performs no liveness check.
pub(crate) fn object_id_of(value: &LuaValue) -> Option<ObjectId> {
    let table = value.as_table()?;
    let raw: Option<u64> = table.raw_get(HANDLE_ID_KEY).ok();
    raw.map(ObjectId)
}

/// Best-effort kind for a value with no declared kind in reach (host-fed
/// latent results, mostly). Exact for objects and structs; containers fall
/// back to their first element's shape.
pub(crate) fn infer_kind(ctx: &Rc<EnvContext>, value: &Value) -> ValueKind {
    match value {
        Value::Empty | Value::Latent(_) => ValueKind::Latent,
        Value::Bool(_) => ValueKind::Bool,
        Value::Int(_) => ValueKind::Int,
        Value::Float(_) => ValueKind::Float,
        Value::Str(_) => ValueKind::Str,
        Value::Object(id) => {
            let class = ctx.world.borrow().class_of(*id);
            // A released object still needs some kind; any class will do
            // since the push will substitute nil regardless.
            ValueKind::Object(class.unwrap_or(strata_reflect::ClassId(0)))
        }
        Value::Struct(cell) => ValueKind::Struct(cell.borrow().struct_id),
        Value::Array(cell) => {
            let guard = cell.borrow();
            let elem = guard
                .first()
                .map(|v| infer_kind(ctx, v))
                .unwrap_or(ValueKind::Int);
            ValueKind::Array(Box::new(elem))
        }
        Value::Set(_) => ValueKind::Set(Box::new(ValueKind::Int)),
        Value::Map(cell) => {
            let guard = cell.borrow();
            let key = guard
                .keys()
                .next()
                .map(|k| match k {
                    ScalarKey::Bool(_) => ValueKind::Bool,
                    ScalarKey::Int(_) => ValueKind::Int,
                    ScalarKey::Str(_) => ValueKind::Str,
                })
                .unwrap_or(ValueKind::Int);
            let value = guard
                .values()
                .next()
                .map(|v| infer_kind(ctx, v))
                .unwrap_or(ValueKind::Int);
            ValueKind::Map(Box::new(key), Box::new(value))
        }
    }
}

/// Convert a native value into a Lua value.
///
/// `kind` is the declared kind of the slot the value came from; it feeds
/// element typing into container proxies. Objects come back as their
/// cached instance handle; a null or destroyed reference marshals to nil
/// after the released-marker check. For struct and container values,
/// `create_copy` detaches the payload into a fresh cell first; otherwise
/// the proxy shares the native cell.
pub(crate) fn push_value(
    lua: &Lua,
    ctx: &Rc<EnvContext>,
    value: &Value,
    kind: &ValueKind,
    create_copy: bool,
) -> LuaResult<LuaValue> {
    let copied;
    let value = if create_copy {
        copied = value.deep_clone();
        &copied
    } else {
        value
    };

    match value {
        Value::Empty => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Int(n) => Ok(LuaValue::Integer(*n)),
        Value::Float(x) => Ok(LuaValue::Number(*x)),
        Value::Str(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        Value::Object(id) => {
            if !ctx.world.borrow().is_alive(*id) {
                warn!("marshalling released object {id}, substituting nil");
                return Ok(LuaValue::Nil);
            }
            let (handle, _) = ctx.objects.borrow_mut().resolve(lua, ctx, *id)?;
            Ok(LuaValue::Table(handle))
        }
        Value::Struct(cell) => {
            let proxy = StructProxy::new(cell.clone(), Rc::downgrade(ctx));
            Ok(LuaValue::UserData(lua.create_userdata(proxy)?))
        }
        Value::Array(cell) => {
            let elem = match kind {
                ValueKind::Array(elem) => (**elem).clone(),
                _ => match infer_kind(ctx, value) {
                    ValueKind::Array(elem) => *elem,
                    _ => ValueKind::Int,
                },
            };
            let proxy = ArrayProxy::new(cell.clone(), elem, Rc::downgrade(ctx));
            Ok(LuaValue::UserData(lua.create_userdata(proxy)?))
        }
        Value::Set(cell) => {
            let elem = match kind {
                ValueKind::Set(elem) => (**elem).clone(),
                _ => ValueKind::Int,
            };
            let proxy = SetProxy::new(cell.clone(), elem, Rc::downgrade(ctx));
            Ok(LuaValue::UserData(lua.create_userdata(proxy)?))
        }
        Value::Map(cell) => {
            let (key_kind, value_kind) = match kind {
                ValueKind::Map(k, v) => ((**k).clone(), (**v).clone()),
                _ => match infer_kind(ctx, value) {
                    ValueKind::Map(k, v) => (*k, *v),
                    _ => (ValueKind::Int, ValueKind::Int),
                },
            };
            let proxy = MapProxy::new(cell.clone(), key_kind, value_kind, Rc::downgrade(ctx));
            Ok(LuaValue::UserData(lua.create_userdata(proxy)?))
        }
        Value::Latent(token) => Ok(LuaValue::Integer(token.0 as i64)),
    }
}

/// Convert a Lua value into a native value of the given kind.
///
/// Returns the converted value plus whether it aliases the Lua side's own
/// cell (a struct/container proxy handed straight through); callers use
/// the flag to skip redundant copy-back pushes. Mismatches warn and yield
/// the kind's neutral value.
pub(crate) fn read_value(ctx: &Rc<EnvContext>, value: &LuaValue, kind: &ValueKind) -> (Value, bool) {
    match kind {
        // Anything coerces to bool, matching the scripting language's own
        // truthiness rules.
        ValueKind::Bool => (Value::Bool(truthy(value)), false),
        ValueKind::Int => match value {
            LuaValue::Integer(n) => (Value::Int(*n), false),
            LuaValue::Number(x) => {
                if x.fract() != 0.0 {
                    warn!("truncating {x} to an integer parameter");
                }
                (Value::Int(*x as i64), false)
            }
            other => mismatch(other, kind),
        },
        ValueKind::Float => match value {
            LuaValue::Number(x) => (Value::Float(*x), false),
            LuaValue::Integer(n) => (Value::Float(*n as f64), false),
            other => mismatch(other, kind),
        },
        ValueKind::Str => match value {
            LuaValue::String(s) => (Value::Str(s.to_string_lossy()), false),
            LuaValue::Integer(n) => (Value::Str(n.to_string()), false),
            LuaValue::Number(x) => (Value::Str(x.to_string()), false),
            other => mismatch(other, kind),
        },
        ValueKind::Enum(id) => match value {
            LuaValue::Integer(n) => (Value::Int(*n), false),
            LuaValue::Number(x) => (Value::Int(*x as i64), false),
            LuaValue::String(s) => {
                let name = s.to_string_lossy();
                let world = ctx.world.borrow();
                let def = world.db().enum_def(*id);
                match def.value_of(&name) {
                    Some(v) => (Value::Int(v), false),
                    None => {
                        warn!("'{name}' is not a variant of enum '{}'", def.name);
                        (Value::Int(def.default_value()), false)
                    }
                }
            }
            other => mismatch(other, kind),
        },
        ValueKind::Object(class) => match value {
            LuaValue::Nil => (Value::Empty, false),
            other => match object_id_of(other) {
                Some(id) => {
                    let world = ctx.world.borrow();
                    if !world.is_alive(id) {
                        warn!("reading released object {id}, substituting nil");
                        (Value::Empty, false)
                    } else if !world.object_is_a(id, *class) {
                        warn!(
                            "object {id} is not a '{}', substituting nil",
                            world.db().class(*class).name
                        );
                        (Value::Empty, false)
                    } else {
                        (Value::Object(id), false)
                    }
                }
                None => mismatch(other, kind),
            },
        },
        ValueKind::Struct(id) => match value {
            LuaValue::UserData(ud) => match ud.borrow::<StructProxy>() {
                Ok(proxy) if proxy.struct_id() == *id => (Value::Struct(proxy.cell()), true),
                _ => mismatch(value, kind),
            },
            LuaValue::Table(table) => (struct_from_table(ctx, table, *id), false),
            other => mismatch(other, kind),
        },
        ValueKind::Array(elem) => match value {
            LuaValue::UserData(ud) => match ud.borrow::<ArrayProxy>() {
                Ok(proxy) => (Value::Array(proxy.cell()), true),
                _ => mismatch(value, kind),
            },
            LuaValue::Table(table) => (array_from_table(ctx, table, elem), false),
            other => mismatch(other, kind),
        },
        ValueKind::Set(elem) => match value {
            LuaValue::UserData(ud) => match ud.borrow::<SetProxy>() {
                Ok(proxy) => (Value::Set(proxy.cell()), true),
                _ => mismatch(value, kind),
            },
            LuaValue::Table(table) => (set_from_table(ctx, table, elem), false),
            other => mismatch(other, kind),
        },
        ValueKind::Map(key_kind, value_kind) => match value {
            LuaValue::UserData(ud) => match ud.borrow::<MapProxy>() {
                Ok(proxy) => (Value::Map(proxy.cell()), true),
                _ => mismatch(value, kind),
            },
            LuaValue::Table(table) => (map_from_table(ctx, table, key_kind, value_kind), false),
            other => mismatch(other, kind),
        },
        ValueKind::Latent => (Value::Empty, false),
    }
}

/// Cheap compatibility probe, used before committing to a read.
///
/// Stricter than [`read_value`]'s coercions so that overload-style
/// dispatch in calling code can tell types apart.
pub(crate) fn is_type(ctx: &Rc<EnvContext>, value: &LuaValue, kind: &ValueKind) -> bool {
    match kind {
        ValueKind::Bool => matches!(value, LuaValue::Boolean(_)),
        ValueKind::Int => matches!(value, LuaValue::Integer(_)),
        ValueKind::Float => matches!(value, LuaValue::Integer(_) | LuaValue::Number(_)),
        ValueKind::Str => matches!(value, LuaValue::String(_)),
        ValueKind::Enum(id) => match value {
            LuaValue::Integer(_) | LuaValue::Number(_) => true,
            LuaValue::String(s) => {
                let name = s.to_string_lossy();
                ctx.world.borrow().db().enum_def(*id).value_of(&name).is_some()
            }
            _ => false,
        },
        ValueKind::Object(class) => match value {
            LuaValue::Nil => true,
            other => match object_id_of(other) {
                Some(id) => ctx.world.borrow().object_is_a(id, *class),
                None => false,
            },
        },
        ValueKind::Struct(id) => match value {
            LuaValue::UserData(ud) => ud
                .borrow::<StructProxy>()
                .map(|p| p.struct_id() == *id)
                .unwrap_or(false),
            LuaValue::Table(_) => true,
            _ => false,
        },
        ValueKind::Array(_) => match value {
            LuaValue::UserData(ud) => ud.borrow::<ArrayProxy>().is_ok(),
            LuaValue::Table(_) => true,
            _ => false,
        },
        ValueKind::Set(_) => match value {
            LuaValue::UserData(ud) => ud.borrow::<SetProxy>().is_ok(),
            LuaValue::Table(_) => true,
            _ => false,
        },
        ValueKind::Map(_, _) => match value {
            LuaValue::UserData(ud) => ud.borrow::<MapProxy>().is_ok(),
            LuaValue::Table(_) => true,
            _ => false,
        },
        ValueKind::Latent => matches!(value, LuaValue::Function(_) | LuaValue::Nil),
    }
}

/// Convert a Lua value into a map key or set element of the given kind.
pub(crate) fn read_scalar_key(
    ctx: &Rc<EnvContext>,
    value: &LuaValue,
    kind: &ValueKind,
) -> Option<ScalarKey> {
    match kind {
        ValueKind::Bool => value.as_boolean().map(ScalarKey::Bool),
        ValueKind::Int | ValueKind::Enum(_) => match read_value(ctx, value, &ValueKind::Int) {
            (Value::Int(n), _) => Some(ScalarKey::Int(n)),
            _ => None,
        },
        ValueKind::Str => match value {
            LuaValue::String(s) => Some(ScalarKey::Str(s.to_string_lossy())),
            _ => None,
        },
        _ => None,
    }
}

/// Push a scalar key back into Lua.
pub(crate) fn push_scalar_key(lua: &Lua, key: &ScalarKey) -> LuaResult<LuaValue> {
    match key {
        ScalarKey::Bool(b) => Ok(LuaValue::Boolean(*b)),
        ScalarKey::Int(n) => Ok(LuaValue::Integer(*n)),
        ScalarKey::Str(s) => Ok(LuaValue::String(lua.create_string(s)?)),
    }
}

fn truthy(value: &LuaValue) -> bool {
    !matches!(value, LuaValue::Nil | LuaValue::Boolean(false))
}

fn mismatch(value: &LuaValue, kind: &ValueKind) -> (Value, bool) {
    warn!(
        "cannot read {} as {}, substituting a default",
        value.type_name(),
        kind.describe()
    );
    (kind_free_default(kind), false)
}

// Defaults that do not need the database; struct and enum defaults are
// built where the database is in reach.
fn kind_free_default(kind: &ValueKind) -> Value {
    match kind {
        ValueKind::Bool => Value::Bool(false),
        ValueKind::Int | ValueKind::Enum(_) => Value::Int(0),
        ValueKind::Float => Value::Float(0.0),
        ValueKind::Str => Value::Str(String::new()),
        ValueKind::Array(_) => Value::array(Vec::new()),
        ValueKind::Set(_) => Value::set(Vec::new()),
        ValueKind::Map(_, _) => Value::map(Vec::new()),
        _ => Value::Empty,
    }
}

fn struct_from_table(ctx: &Rc<EnvContext>, table: &LuaTable, id: strata_reflect::StructId) -> Value {
    let fields: Vec<(String, ValueKind)> = {
        let world = ctx.world.borrow();
        world.db().struct_def(id).fields.clone()
    };
    let mut values = Vec::with_capacity(fields.len());
    for (name, kind) in &fields {
        let raw: LuaValue = table.raw_get(name.as_str()).unwrap_or(LuaValue::Nil);
        if raw.is_nil() {
            let default = ctx.world.borrow().db().default_value(kind);
            values.push(default);
        } else {
            values.push(read_value(ctx, &raw, kind).0);
        }
    }
    Value::Struct(StructValue::new(id, values).into_shared())
}

fn array_from_table(ctx: &Rc<EnvContext>, table: &LuaTable, elem: &ValueKind) -> Value {
    let len = table.raw_len();
    let mut elements = Vec::with_capacity(len);
    for i in 1..=len {
        let raw: LuaValue = table.raw_get(i).unwrap_or(LuaValue::Nil);
        elements.push(read_value(ctx, &raw, elem).0);
    }
    Value::array(elements)
}

fn set_from_table(ctx: &Rc<EnvContext>, table: &LuaTable, elem: &ValueKind) -> Value {
    let len = table.raw_len();
    let mut elements = Vec::with_capacity(len);
    for i in 1..=len {
        let raw: LuaValue = table.raw_get(i).unwrap_or(LuaValue::Nil);
        if let Some(key) = read_scalar_key(ctx, &raw, elem) {
            elements.push(key);
        } else {
            warn!("skipping {} in set literal", raw.type_name());
        }
    }
    Value::set(elements)
}

fn map_from_table(
    ctx: &Rc<EnvContext>,
    table: &LuaTable,
    key_kind: &ValueKind,
    value_kind: &ValueKind,
) -> Value {
    let mut entries = Vec::new();
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        let Ok((k, v)) = pair else { continue };
        match read_scalar_key(ctx, &k, key_kind) {
            Some(key) => entries.push((key, read_value(ctx, &v, value_kind).0)),
            None => warn!("skipping {} key in map literal", k.type_name()),
        }
    }
    Value::map(entries)
}
