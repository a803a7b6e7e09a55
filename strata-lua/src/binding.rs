//! Class-to-module bindings and instance handle dispatch.
//!
//! A script module (a plain Lua table of functions) can be bound to a
//! reflected class. Binding installs override hooks on the reflected
//! functions the module names, so host-initiated calls route into script,
//! and makes the module's entries reachable through every instance handle
//! of the class and its subclasses.
//!
//! Instance handles are tables holding only the object id; everything else
//! resolves through a per-class metatable whose `__index` walks, in order:
//! the per-class method cache, the bound module chain, the reflected
//! function table, delegate properties, then value properties. Methods and
//! module functions are cached after the first hit; property reads are
//! computed on every access.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, warn};
use mlua::prelude::*;
use strata_reflect::{ClassId, DelegateFieldId, FunctionId, ObjectId, ReflectionDb, ScriptHook};

use crate::delegate_proxy::DelegateProxy;
use crate::env::{upgrade_env, EnvContext};
use crate::function_registry::FunctionRegistry;
use crate::marshal;

struct ModuleBinding {
    /// Module name, for diagnostics.
    name: String,
    table: LuaRegistryKey,
}

/// Per-environment class binding state.
#[derive(Default)]
pub struct ClassBindings {
    modules: IndexMap<ClassId, ModuleBinding>,
    metatables: HashMap<ClassId, LuaRegistryKey>,
    method_caches: HashMap<ClassId, LuaRegistryKey>,
    /// Reflected functions carrying an installed override hook.
    hooked: HashSet<FunctionId>,
}

impl ClassBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self, class: ClassId) -> bool {
        self.modules.contains_key(&class)
    }

    pub fn module_name(&self, class: ClassId) -> Option<&str> {
        self.modules.get(&class).map(|m| m.name.as_str())
    }

    /// The module table bound to exactly `class` (no chain walk).
    pub fn module_table(&self, lua: &Lua, class: ClassId) -> Option<LuaTable> {
        let module = self.modules.get(&class)?;
        lua.registry_value(&module.table).ok()
    }

    /// First non-nil entry named `name` over the bound module chain.
    ///
    /// A non-function entry shadowing a lookup that expects a function is
    /// reported and treated as absent, and stops the walk the same way a
    /// match would.
    pub fn lookup_script_function(
        &self,
        lua: &Lua,
        db: &ReflectionDb,
        class: ClassId,
        name: &str,
    ) -> Option<LuaFunction> {
        for c in db.chain(class) {
            let Some(module) = self.modules.get(&c) else {
                continue;
            };
            let Ok(table) = lua.registry_value::<LuaTable>(&module.table) else {
                continue;
            };
            let value: LuaValue = table.raw_get(name).unwrap_or(LuaValue::Nil);
            match value {
                LuaValue::Nil => continue,
                LuaValue::Function(f) => return Some(f),
                other => {
                    warn!(
                        "'{name}' in module '{}' is a {}, not a function",
                        module.name,
                        other.type_name()
                    );
                    return None;
                }
            }
        }
        None
    }

    /// First non-nil entry named `name` over the bound module chain, of any
    /// value type.
    pub fn lookup_module_value(
        &self,
        lua: &Lua,
        db: &ReflectionDb,
        class: ClassId,
        name: &str,
    ) -> Option<LuaValue> {
        for c in db.chain(class) {
            let Some(module) = self.modules.get(&c) else {
                continue;
            };
            let Ok(table) = lua.registry_value::<LuaTable>(&module.table) else {
                continue;
            };
            let value: LuaValue = table.raw_get(name).unwrap_or(LuaValue::Nil);
            if !value.is_nil() {
                return Some(value);
            }
        }
        None
    }

    /// Metatable shared by every instance handle of `class`, built lazily.
    pub fn instance_metatable(
        &mut self,
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        class: ClassId,
    ) -> LuaResult<LuaTable> {
        if let Some(key) = self.metatables.get(&class) {
            return lua.registry_value(key);
        }

        let cache = lua.create_table()?;
        let meta = lua.create_table()?;

        let weak = Rc::downgrade(ctx);
        let index_cache = cache.clone();
        let index = lua.create_function(move |lua, (handle, key): (LuaTable, LuaValue)| {
            let ctx = upgrade_env(&weak)?;
            let LuaValue::String(name) = key else {
                return Ok(LuaValue::Nil);
            };
            let name = name.to_string_lossy();

            let cached: LuaValue = index_cache.raw_get(name.as_str())?;
            if !cached.is_nil() {
                return Ok(cached);
            }

            let Some(id) = handle_id(&handle) else {
                return Ok(LuaValue::Nil);
            };

            // Bound module chain first, so script modules can shadow
            // reflected names.
            let module_value = {
                let bindings = ctx.bindings.borrow();
                let world = ctx.world.borrow();
                bindings.lookup_module_value(lua, world.db(), class, &name)
            };
            if let Some(value) = module_value {
                if matches!(value, LuaValue::Function(_)) {
                    index_cache.raw_set(name.as_str(), value.clone())?;
                }
                return Ok(value);
            }

            let function = { ctx.world.borrow().db().find_function(class, &name) };
            if let Some(function) = function {
                let method = make_method(lua, &ctx, function)?;
                index_cache.raw_set(name.as_str(), &method)?;
                return Ok(LuaValue::Function(method));
            }

            let is_delegate = {
                let world = ctx.world.borrow();
                world
                    .db()
                    .find_property(class, &name)
                    .map(|p| p.is_delegate())
                    .unwrap_or(false)
            };
            if is_delegate {
                let proxy = DelegateProxy::new(
                    DelegateFieldId::new(id, name.clone()),
                    Rc::downgrade(&ctx),
                );
                let ud = lua.create_userdata(proxy)?;
                // Delegate endpoints are per instance; cache on the handle
                // itself so the next access raw-hits.
                handle.raw_set(name.as_str(), &ud)?;
                return Ok(LuaValue::UserData(ud));
            }

            let slot = {
                let world = ctx.world.borrow();
                world
                    .property_kind(id, &name)
                    .and_then(|kind| world.property(id, &name).map(|value| (value, kind)))
            };
            match slot {
                Some((value, kind)) => marshal::push_value(lua, &ctx, &value, &kind, false),
                None => Ok(LuaValue::Nil),
            }
        })?;
        meta.raw_set("__index", index)?;

        let weak = Rc::downgrade(ctx);
        let newindex = lua.create_function(
            move |_, (handle, key, value): (LuaTable, LuaValue, LuaValue)| {
                let ctx = upgrade_env(&weak)?;
                let LuaValue::String(name) = key else {
                    handle.raw_set(key, value)?;
                    return Ok(());
                };
                let name = name.to_string_lossy();
                let Some(id) = handle_id(&handle) else {
                    handle.raw_set(name.as_str(), value)?;
                    return Ok(());
                };

                enum Target {
                    Delegate,
                    Property(strata_reflect::ValueKind),
                    Plain,
                }
                let target = {
                    let world = ctx.world.borrow();
                    match world.db().find_property(class, &name) {
                        Some(p) if p.is_delegate() => Target::Delegate,
                        Some(_) => match world.property_kind(id, &name) {
                            Some(kind) => Target::Property(kind),
                            None => Target::Plain,
                        },
                        None => Target::Plain,
                    }
                };
                match target {
                    Target::Delegate => Err(LuaError::RuntimeError(format!(
                        "'{name}' is a delegate; attach handlers with Bind or Add"
                    ))),
                    Target::Property(kind) => {
                        let (converted, _) = marshal::read_value(&ctx, &value, &kind);
                        ctx.world.borrow_mut().set_property(id, &name, converted);
                        Ok(())
                    }
                    Target::Plain => {
                        // Not a reflected name; plain script state on the
                        // instance.
                        handle.raw_set(name.as_str(), value)?;
                        Ok(())
                    }
                }
            },
        )?;
        meta.raw_set("__newindex", newindex)?;

        let weak = Rc::downgrade(ctx);
        let tostring = lua.create_function(move |_, handle: LuaTable| {
            let Some(ctx) = weak.upgrade() else {
                return Ok("Object(<dead environment>)".to_string());
            };
            let name = ctx.world.borrow().db().class(class).name.clone();
            match handle_id(&handle) {
                Some(id) => Ok(format!("{name}{id}")),
                None => Ok(name),
            }
        })?;
        meta.raw_set("__tostring", tostring)?;

        self.metatables
            .insert(class, lua.create_registry_value(&meta)?);
        self.method_caches
            .insert(class, lua.create_registry_value(&cache)?);
        Ok(meta)
    }

    /// Uninstall all hooks and release every pinned Lua value.
    pub fn teardown(&mut self, lua: &Lua, db: &mut ReflectionDb) {
        for function in self.hooked.drain() {
            db.set_hook(function, None);
        }
        for (_, module) in self.modules.drain(..) {
            let _ = lua.remove_registry_value(module.table);
        }
        for (_, key) in self.metatables.drain() {
            let _ = lua.remove_registry_value(key);
        }
        for (_, key) in self.method_caches.drain() {
            let _ = lua.remove_registry_value(key);
        }
    }

    fn clear_method_caches(&self, lua: &Lua) {
        for key in self.method_caches.values() {
            if let Ok(table) = lua.registry_value::<LuaTable>(key) {
                let _ = table.clear();
            }
        }
    }
}

fn handle_id(handle: &LuaTable) -> Option<ObjectId> {
    let raw: Option<u64> = handle.raw_get(marshal::HANDLE_ID_KEY).ok();
    raw.map(ObjectId)
}

/// Bind `table` as the script module of `class`.
///
/// Replaces any previous binding for the class, invalidating cached
/// override resolutions and method caches across the environment. Module
/// entries whose names match reflected instance functions anywhere on the
/// class's chain get an override hook installed, so host-initiated calls
/// to those functions dispatch into script from now on.
pub fn bind_class(
    lua: &Lua,
    ctx: &Rc<EnvContext>,
    class: ClassId,
    module_name: &str,
    table: LuaTable,
) -> LuaResult<()> {
    let key = lua.create_registry_value(&table)?;
    let replaced = {
        let mut bindings = ctx.bindings.borrow_mut();
        bindings.modules.insert(
            class,
            ModuleBinding {
                name: module_name.to_string(),
                table: key,
            },
        )
    };
    if let Some(old) = replaced {
        debug!("rebinding class with module '{module_name}', displacing '{}'", old.name);
        let _ = lua.remove_registry_value(old.table);
    } else {
        debug!("bound module '{module_name}'");
    }

    // Cached lookups may now resolve differently anywhere in the
    // hierarchy.
    ctx.functions.borrow_mut().clear_overrides(lua);
    ctx.bindings.borrow().clear_method_caches(lua);

    // Collect override targets before touching the database.
    let mut targets: Vec<FunctionId> = Vec::new();
    for pair in table.pairs::<LuaValue, LuaValue>() {
        let Ok((LuaValue::String(name), LuaValue::Function(_))) = pair else {
            continue;
        };
        let name = name.to_string_lossy();
        let found = {
            let world = ctx.world.borrow();
            world
                .db()
                .find_function(class, &name)
                .filter(|&f| !world.db().function(f).is_static)
        };
        if let Some(function) = found {
            targets.push(function);
        }
    }

    for function in targets {
        let already = { ctx.bindings.borrow().hooked.contains(&function) };
        if already {
            continue;
        }
        let weak = Rc::downgrade(ctx);
        let hook_lua = lua.clone();
        let hook: ScriptHook = Rc::new(move |target, frame| {
            let Some(ctx) = weak.upgrade() else { return };
            if !ctx.is_alive() {
                return;
            }
            let Some(target) = target else { return };
            FunctionRegistry::invoke_from_native(&hook_lua, &ctx, function, target, frame);
        });
        ctx.world.borrow_mut().db_mut().set_hook(function, Some(hook));
        ctx.bindings.borrow_mut().hooked.insert(function);
        debug!("installed override hook for {function}");
    }

    Ok(())
}

/// Instance handle for `id`: a table carrying the object id, behind the
/// class's shared metatable.
pub(crate) fn make_instance_table(
    lua: &Lua,
    ctx: &Rc<EnvContext>,
    id: ObjectId,
) -> LuaResult<LuaTable> {
    let class = ctx
        .world
        .borrow()
        .class_of(id)
        .ok_or_else(|| LuaError::RuntimeError(format!("unknown object {id}")))?;

    let table = lua.create_table()?;
    table.raw_set(marshal::HANDLE_ID_KEY, id.0)?;
    let meta = ctx.bindings.borrow_mut().instance_metatable(lua, ctx, class)?;
    let _ = table.set_metatable(Some(meta));
    Ok(table)
}

/// Closure invoking a reflected function. Instance functions expect the
/// handle as their first argument (`:` call syntax); statics take their
/// declared arguments only.
pub(crate) fn make_method(
    lua: &Lua,
    ctx: &Rc<EnvContext>,
    function: FunctionId,
) -> LuaResult<LuaFunction> {
    let weak = Rc::downgrade(ctx);
    lua.create_function(move |lua, args: LuaMultiValue| {
        let ctx = upgrade_env(&weak)?;
        let desc = {
            let mut functions = ctx.functions.borrow_mut();
            let world = ctx.world.borrow();
            functions.descriptor(world.db(), function)
        };

        let mut args: Vec<LuaValue> = args.into_iter().collect();
        let this = if desc.is_static {
            None
        } else if args.first().is_some() {
            match marshal::object_id_of(&args[0]) {
                Some(id) => {
                    args.remove(0);
                    Some(id)
                }
                None => None,
            }
        } else {
            None
        };

        desc.call_native(lua, &ctx, this, LuaMultiValue::from_vec(args))
    })
}
