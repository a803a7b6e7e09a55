//! The script environment: one embedded Lua VM wired to one host world.
//!
//! All state lives in an [`EnvContext`] owned by the [`ScriptEnv`]; every
//! closure handed to Lua captures only a weak reference to it, so the VM
//! never keeps its own environment alive and teardown cannot be defeated
//! by leftover script values. Several environments can run against the
//! same world independently, each with its own VM and registries.
//!
//! Everything here is single-threaded and cooperative. Host lifetime
//! notifications are delivered over a channel and folded in by
//! [`ScriptEnv::pump_host_events`] at a point the embedder chooses; no
//! binding state changes behind the script's back mid-call.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use log::{debug, error};
use mlua::prelude::*;
use strata_reflect::{
    DelegateFieldId, FunctionId, LatentToken, ObjectEvent, ObjectId, ParamFrame, SharedWorld,
    Value,
};

use crate::binding::{self, ClassBindings};
use crate::delegate_registry::DelegateRegistry;
use crate::function_registry::FunctionRegistry;
use crate::latent::LatentManager;
use crate::object_registry::ObjectRegistry;

/// Order of a call's Lua results when it has both a return value and out
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnOrder {
    /// Return value first, then out parameters in declaration order.
    #[default]
    ReturnFirst,
    /// Out parameters first, return value last. Compatibility mode for
    /// scripts written against the historical ordering.
    OutsFirst,
}

/// Guard rails for script execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    /// Warn when a single script call runs longer than this.
    pub slow_call_warning: Option<Duration>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            slow_call_warning: Some(Duration::from_secs(1)),
        }
    }
}

impl ExecutionLimits {
    pub fn unlimited() -> Self {
        Self {
            slow_call_warning: None,
        }
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            slow_call_warning: Some(threshold),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOptions {
    pub return_order: ReturnOrder,
    pub limits: ExecutionLimits,
}

/// Shared state of one environment. Lua-side closures hold this weakly;
/// the [`ScriptEnv`] holds the one strong reference.
pub struct EnvContext {
    pub(crate) world: SharedWorld,
    pub(crate) objects: RefCell<ObjectRegistry>,
    pub(crate) delegates: RefCell<DelegateRegistry>,
    pub(crate) functions: RefCell<FunctionRegistry>,
    pub(crate) bindings: RefCell<ClassBindings>,
    pub(crate) latents: RefCell<LatentManager>,
    pub(crate) order: ReturnOrder,
    pub(crate) limits: ExecutionLimits,
    alive: Cell<bool>,
}

impl EnvContext {
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.get()
    }
}

/// Upgrade a weak environment reference, failing the surrounding Lua call
/// when the environment is gone or torn down.
pub(crate) fn upgrade_env(env: &Weak<EnvContext>) -> LuaResult<Rc<EnvContext>> {
    match env.upgrade() {
        Some(ctx) if ctx.is_alive() => Ok(ctx),
        _ => Err(LuaError::RuntimeError(
            "the script environment has been shut down".to_string(),
        )),
    }
}

/// An embedded Lua VM bound to a host world.
pub struct ScriptEnv {
    lua: Lua,
    ctx: Rc<EnvContext>,
    events: async_channel::Receiver<ObjectEvent>,
}

impl ScriptEnv {
    pub fn new(world: SharedWorld) -> LuaResult<ScriptEnv> {
        Self::with_options(world, EnvOptions::default())
    }

    pub fn with_options(world: SharedWorld, options: EnvOptions) -> LuaResult<ScriptEnv> {
        let lua = Lua::new();
        let events = world.borrow_mut().subscribe();
        let ctx = Rc::new(EnvContext {
            world,
            objects: RefCell::new(ObjectRegistry::new()),
            delegates: RefCell::new(DelegateRegistry::new()),
            functions: RefCell::new(FunctionRegistry::new()),
            bindings: RefCell::new(ClassBindings::new()),
            latents: RefCell::new(LatentManager::new()),
            order: options.return_order,
            limits: options.limits,
            alive: Cell::new(true),
        });
        install_globals(&lua, &ctx)?;
        debug!("script environment ready");
        Ok(ScriptEnv { lua, ctx, events })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn world(&self) -> &SharedWorld {
        &self.ctx.world
    }

    pub fn return_order(&self) -> ReturnOrder {
        self.ctx.order
    }

    // ==================== Running script code ====================

    /// Run a chunk for its side effects.
    pub fn exec(&self, source: &str, chunk_name: &str) -> LuaResult<()> {
        self.lua.load(source).set_name(chunk_name).exec()
    }

    /// Evaluate a chunk and convert its results.
    pub fn eval<T: FromLuaMulti>(&self, source: &str) -> LuaResult<T> {
        self.lua.load(source).eval()
    }

    /// Load a module chunk expected to evaluate to a table.
    pub fn load_module(&self, name: &str, source: &str) -> LuaResult<LuaTable> {
        self.lua.load(source).set_name(name).eval()
    }

    /// Load a module table from a file; the module name is the file stem.
    pub fn load_module_file(&self, path: &Path) -> anyhow::Result<(String, LuaTable)> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading script module {}", path.display()))?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module")
            .to_string();
        let table = anyhow::Context::with_context(self.load_module(&name, &source), || {
            format!("loading script module {}", path.display())
        })?;
        Ok((name, table))
    }

    // ==================== Class bindings ====================

    /// Bind a module table to a class by name.
    pub fn bind_class(
        &self,
        class_name: &str,
        module_name: &str,
        module: LuaTable,
    ) -> LuaResult<()> {
        let class = { self.ctx.world.borrow().db().class_by_name(class_name) }
            .ok_or_else(|| LuaError::RuntimeError(format!("unknown class '{class_name}'")))?;
        binding::bind_class(&self.lua, &self.ctx, class, module_name, module)
    }

    /// Load `source` as a module and bind it to a class in one step.
    pub fn bind_class_source(
        &self,
        class_name: &str,
        module_name: &str,
        source: &str,
    ) -> LuaResult<()> {
        let module = self.load_module(module_name, source)?;
        self.bind_class(class_name, module_name, module)
    }

    // ==================== Object bindings ====================

    /// Bind an object and, when this creates the binding, run the bound
    /// module's `Initialize` with the instance handle.
    pub fn attach_object(&self, id: ObjectId) -> LuaResult<LuaTable> {
        let (handle, created) = self
            .ctx
            .objects
            .borrow_mut()
            .resolve(&self.lua, &self.ctx, id)?;
        if created {
            let init = {
                let world = self.ctx.world.borrow();
                let bindings = self.ctx.bindings.borrow();
                world.class_of(id).and_then(|class| {
                    bindings.lookup_script_function(&self.lua, world.db(), class, "Initialize")
                })
            };
            if let Some(init) = init {
                if let Err(err) = init.call::<()>(&handle) {
                    error!("Initialize for {id} failed: {err}");
                }
            }
        }
        Ok(handle)
    }

    /// The instance handle for `id`, created lazily. Unlike
    /// [`ScriptEnv::attach_object`] this never runs `Initialize`.
    pub fn handle_for(&self, id: ObjectId) -> LuaResult<LuaTable> {
        let (handle, _) = self
            .ctx
            .objects
            .borrow_mut()
            .resolve(&self.lua, &self.ctx, id)?;
        Ok(handle)
    }

    pub fn is_object_bound(&self, id: ObjectId) -> bool {
        self.ctx.objects.borrow().is_bound(id)
    }

    /// Fold pending host lifetime notifications into binding state.
    ///
    /// Destroyed objects lose their instance binding, their delegate
    /// tracking, and every handler anchored to them. Returns how many
    /// notifications were processed.
    pub fn pump_host_events(&self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.events.try_recv() {
            processed += 1;
            match event {
                ObjectEvent::Created(_) => {}
                // Resolution refuses objects in this state already; the
                // binding itself survives until destruction completes.
                ObjectEvent::PendingDestroy(_) => {}
                ObjectEvent::Destroyed(id) => {
                    self.ctx.objects.borrow_mut().unbind(&self.lua, id);
                    DelegateRegistry::on_object_destroyed(&self.ctx, id);
                }
            }
        }
        processed
    }

    // ==================== Host-driven calls ====================

    /// Dispatch a host-initiated function call into script.
    pub fn invoke_from_native(
        &self,
        function: FunctionId,
        target: ObjectId,
        frame: &mut ParamFrame,
    ) {
        FunctionRegistry::invoke_from_native(&self.lua, &self.ctx, function, target, frame);
    }

    /// Complete a pending latent call with the host's results.
    pub fn complete_latent(&self, token: LatentToken, results: &[Value]) -> bool {
        LatentManager::complete(&self.lua, &self.ctx, token, results)
    }

    /// Drop a pending latent call without running its continuation.
    pub fn cancel_latent(&self, token: LatentToken) -> bool {
        self.ctx.latents.borrow_mut().cancel(&self.lua, token)
    }

    // ==================== Introspection ====================

    pub fn bound_objects(&self) -> usize {
        self.ctx.objects.borrow().len()
    }

    pub fn handler_count(&self, field: &DelegateFieldId) -> usize {
        self.ctx.delegates.borrow().handler_count(field)
    }

    pub fn pending_latents(&self) -> usize {
        self.ctx.latents.borrow().len()
    }

    // ==================== Teardown ====================

    /// Tear the environment down: detach every delegate handler, uninstall
    /// every override hook, release every pinned script value. Idempotent,
    /// and runs automatically on drop.
    pub fn teardown(&self) {
        if !self.ctx.is_alive() {
            return;
        }
        self.ctx.alive.set(false);

        DelegateRegistry::teardown(&self.ctx);
        {
            let mut world = self.ctx.world.borrow_mut();
            self.ctx.bindings.borrow_mut().teardown(&self.lua, world.db_mut());
        }
        self.ctx.functions.borrow_mut().clear(&self.lua);
        self.ctx.objects.borrow_mut().clear(&self.lua);
        self.ctx.latents.borrow_mut().clear(&self.lua);
        debug!("script environment torn down");
    }
}

impl Drop for ScriptEnv {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Install the `strata` global: `strata.log`, plus the lazily populated
/// `strata.classes` and `strata.enums` namespaces.
fn install_globals(lua: &Lua, ctx: &Rc<EnvContext>) -> LuaResult<()> {
    let strata = lua.create_table()?;

    strata.set(
        "log",
        lua.create_function(|_, message: String| {
            debug!("[script] {message}");
            Ok(())
        })?,
    )?;

    let classes = lua.create_table()?;
    let classes_meta = lua.create_table()?;
    let weak = Rc::downgrade(ctx);
    let class_index = lua.create_function(move |lua, (tbl, key): (LuaTable, LuaValue)| {
        let ctx = upgrade_env(&weak)?;
        let LuaValue::String(name) = key else {
            return Ok(LuaValue::Nil);
        };
        let name = name.to_string_lossy();
        let Some(class) = ({ ctx.world.borrow().db().class_by_name(&name) }) else {
            return Ok(LuaValue::Nil);
        };
        let entry = build_class_table(lua, &ctx, class)?;
        tbl.raw_set(name.as_str(), &entry)?;
        Ok(LuaValue::Table(entry))
    })?;
    classes_meta.raw_set("__index", class_index)?;
    let _ = classes.set_metatable(Some(classes_meta));
    strata.set("classes", classes)?;

    let enums = lua.create_table()?;
    let enums_meta = lua.create_table()?;
    let weak = Rc::downgrade(ctx);
    let enum_index = lua.create_function(move |lua, (tbl, key): (LuaTable, LuaValue)| {
        let ctx = upgrade_env(&weak)?;
        let LuaValue::String(name) = key else {
            return Ok(LuaValue::Nil);
        };
        let name = name.to_string_lossy();
        let Some(id) = ({ ctx.world.borrow().db().enum_by_name(&name) }) else {
            return Ok(LuaValue::Nil);
        };
        let entry = lua.create_table()?;
        {
            let world = ctx.world.borrow();
            for (variant, value) in &world.db().enum_def(id).variants {
                entry.raw_set(variant.as_str(), *value)?;
            }
        }
        tbl.raw_set(name.as_str(), &entry)?;
        Ok(LuaValue::Table(entry))
    })?;
    enums_meta.raw_set("__index", enum_index)?;
    let _ = enums.set_metatable(Some(enums_meta));
    strata.set("enums", enums)?;

    lua.globals().set("strata", strata)
}

/// Class namespace entry: a `New` constructor plus the class's static
/// functions over its chain (derived declarations shadow base ones).
fn build_class_table(
    lua: &Lua,
    ctx: &Rc<EnvContext>,
    class: strata_reflect::ClassId,
) -> LuaResult<LuaTable> {
    let entry = lua.create_table()?;

    let weak = Rc::downgrade(ctx);
    entry.raw_set(
        "New",
        lua.create_function(move |lua, _: LuaMultiValue| {
            let ctx = upgrade_env(&weak)?;
            let id = ctx.world.borrow_mut().create_object(class);
            let (handle, _) = ctx.objects.borrow_mut().resolve(lua, &ctx, id)?;
            Ok(handle)
        })?,
    )?;

    let statics: Vec<(String, FunctionId)> = {
        let world = ctx.world.borrow();
        let db = world.db();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for c in db.chain(class) {
            for &f in &db.class(c).functions {
                let def = db.function(f);
                if def.is_static && seen.insert(def.name.clone()) {
                    out.push((def.name.clone(), f));
                }
            }
        }
        out
    };
    for (name, function) in statics {
        entry.raw_set(name.as_str(), binding::make_method(lua, ctx, function)?)?;
    }

    Ok(entry)
}
