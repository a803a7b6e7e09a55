//! Delegate handler tracking: the bridge between world-side delegate slots
//! and Lua callables.
//!
//! Every bound Lua function is wrapped in a [`ProxyHandler`]. The world's
//! delegate slot owns the handler (as its target); the registry only keeps
//! weak references plus the signature metadata, so dropping a slot drops
//! its handlers. Each handler is anchored to a lifecycle object: when that
//! object's destroyed notification arrives, the handler is detached and its
//! Lua function released without the script having to do anything.
//!
//! Handlers never auto-unbind by being polled; detachment happens on
//! notifications processed by the environment, or explicitly through the
//! script-facing delegate API.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use log::{debug, error, warn};
use mlua::prelude::*;
use strata_reflect::{
    fire_delegate, DelegateFieldId, DelegateTarget, FunctionId, ObjectId, ParamFrame,
};

use crate::env::EnvContext;
use crate::function_desc::FunctionDesc;

/// One Lua function bound to a delegate field.
///
/// Owned by the world-side slot; holds only a weak reference back to the
/// environment so a forgotten handler can never keep the VM alive.
pub struct ProxyHandler {
    key: u64,
    lua: Lua,
    env: Weak<EnvContext>,
    field: DelegateFieldId,
    /// The handler dies with this object.
    lifecycle: ObjectId,
    callable: RefCell<Option<LuaRegistryKey>>,
}

impl ProxyHandler {
    fn new(
        key: u64,
        lua: &Lua,
        env: Weak<EnvContext>,
        field: DelegateFieldId,
        lifecycle: ObjectId,
        callable: &LuaFunction,
    ) -> LuaResult<Rc<Self>> {
        let registered = lua.create_registry_value(callable)?;
        Ok(Rc::new(Self {
            key,
            lua: lua.clone(),
            env,
            field,
            lifecycle,
            callable: RefCell::new(Some(registered)),
        }))
    }

    fn callable_fn(&self) -> Option<LuaFunction> {
        let guard = self.callable.borrow();
        let key = guard.as_ref()?;
        self.lua.registry_value(key).ok()
    }

    /// Whether this handler wraps exactly `func` (reference identity).
    fn matches(&self, func: &LuaFunction) -> bool {
        match self.callable_fn() {
            Some(mine) => LuaValue::Function(mine) == LuaValue::Function(func.clone()),
            None => false,
        }
    }

    /// Release the pinned Lua function. Idempotent; the handler stays in
    /// whatever slot still holds it but reports dead from here on.
    fn release(&self) {
        if let Some(key) = self.callable.borrow_mut().take() {
            let _ = self.lua.remove_registry_value(key);
        }
    }

    fn is_released(&self) -> bool {
        self.callable.borrow().is_none()
    }
}

impl DelegateTarget for ProxyHandler {
    fn target_key(&self) -> u64 {
        self.key
    }

    fn is_alive(&self) -> bool {
        if self.is_released() {
            return false;
        }
        let Some(env) = self.env.upgrade() else {
            return false;
        };
        env.is_alive() && env.world.borrow().is_alive(self.lifecycle)
    }

    fn invoke(&self, frame: &mut ParamFrame) {
        let Some(env) = self.env.upgrade() else {
            debug!("skipping handler {} of a dropped environment", self.key);
            return;
        };
        if !env.is_alive() {
            return;
        }
        DelegateRegistry::execute_handler(&self.lua, &env, self, frame);
    }
}

struct DelegateInfo {
    signature: FunctionId,
    multicast: bool,
    desc: Option<Rc<FunctionDesc>>,
    handlers: Vec<Weak<ProxyHandler>>,
}

/// Per-environment delegate bookkeeping. Driving operations are associated
/// functions taking the environment context, so nothing here holds a borrow
/// while script code runs.
#[derive(Default)]
pub struct DelegateRegistry {
    infos: IndexMap<DelegateFieldId, DelegateInfo>,
    next_key: u64,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a delegate field. Idempotent; re-registering an
    /// already-tracked field keeps its handlers.
    ///
    /// Fails when the field does not name a delegate property of a live
    /// object, which is a binding integrity error rather than type drift.
    pub fn register(ctx: &Rc<EnvContext>, field: &DelegateFieldId) -> LuaResult<()> {
        if ctx.delegates.borrow().infos.contains_key(field) {
            return Ok(());
        }
        let (signature, multicast) = ctx
            .world
            .borrow()
            .delegate_signature(field)
            .ok_or_else(|| {
                LuaError::RuntimeError(format!("'{field}' is not a delegate property"))
            })?;
        ctx.delegates.borrow_mut().infos.insert(
            field.clone(),
            DelegateInfo {
                signature,
                multicast,
                desc: None,
                handlers: Vec::new(),
            },
        );
        debug!("registered delegate field {field}");
        Ok(())
    }

    pub fn is_registered(&self, field: &DelegateFieldId) -> bool {
        self.infos.contains_key(field)
    }

    /// Live handlers currently attached to a field.
    pub fn handler_count(&self, field: &DelegateFieldId) -> usize {
        self.infos
            .get(field)
            .map(|info| info.handlers.iter().filter_map(Weak::upgrade).count())
            .unwrap_or(0)
    }

    pub fn total_handlers(&self) -> usize {
        self.infos
            .values()
            .map(|info| info.handlers.iter().filter_map(Weak::upgrade).count())
            .sum()
    }

    /// Bind `callable` as a single-cast delegate's one handler, anchored to
    /// `owner`'s lifetime. A previous handler is displaced and released.
    pub fn bind(
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        field: &DelegateFieldId,
        owner: ObjectId,
        callable: &LuaFunction,
    ) -> LuaResult<()> {
        Self::register(ctx, field)?;
        Self::check_anchor(ctx, field, owner)?;
        if Self::field_multicast(ctx, field)? {
            return Err(LuaError::RuntimeError(format!(
                "'{field}' is a multicast delegate; use Add instead of Bind"
            )));
        }

        let handler = Self::new_handler(lua, ctx, field, owner, callable)?;

        let displaced: Vec<Rc<ProxyHandler>> = {
            let mut delegates = ctx.delegates.borrow_mut();
            let info = Self::info_mut(&mut delegates, field)?;
            let old = info.handlers.drain(..).filter_map(|w| w.upgrade()).collect();
            info.handlers.push(Rc::downgrade(&handler));
            old
        };
        for old in displaced {
            debug!("displacing handler {} on {field}", old.target_key());
            old.release();
        }

        match ctx.world.borrow_mut().slot_mut(field) {
            Some(slot) => slot.bind(handler.clone()),
            None => {
                handler.release();
                return Err(LuaError::RuntimeError(format!(
                    "delegate slot behind {field} is gone"
                )));
            }
        }
        debug!("bound handler {} to {field}", handler.target_key());
        Ok(())
    }

    /// Append `callable` to a multicast delegate, anchored to `owner`.
    pub fn add(
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        field: &DelegateFieldId,
        owner: ObjectId,
        callable: &LuaFunction,
    ) -> LuaResult<()> {
        Self::register(ctx, field)?;
        Self::check_anchor(ctx, field, owner)?;
        if !Self::field_multicast(ctx, field)? {
            return Err(LuaError::RuntimeError(format!(
                "'{field}' is a single-cast delegate; use Bind instead of Add"
            )));
        }

        let handler = Self::new_handler(lua, ctx, field, owner, callable)?;
        {
            let mut delegates = ctx.delegates.borrow_mut();
            let info = Self::info_mut(&mut delegates, field)?;
            info.handlers.push(Rc::downgrade(&handler));
        }

        match ctx.world.borrow_mut().slot_mut(field) {
            Some(slot) => slot.add(handler.clone()),
            None => {
                handler.release();
                return Err(LuaError::RuntimeError(format!(
                    "delegate slot behind {field} is gone"
                )));
            }
        }
        debug!("added handler {} to {field}", handler.target_key());
        Ok(())
    }

    /// Detach the handler wrapping exactly `callable`. Removing a function
    /// that was never added is a no-op.
    pub fn remove(ctx: &Rc<EnvContext>, field: &DelegateFieldId, callable: &LuaFunction) {
        let found: Option<Rc<ProxyHandler>> = {
            let delegates = ctx.delegates.borrow();
            delegates.infos.get(field).and_then(|info| {
                info.handlers
                    .iter()
                    .filter_map(Weak::upgrade)
                    .find(|h| h.matches(callable))
            })
        };

        match found {
            Some(handler) => {
                if let Some(slot) = ctx.world.borrow_mut().slot_mut(field) {
                    slot.remove(handler.target_key());
                }
                handler.release();
                ctx.delegates.borrow_mut().prune(field);
                debug!("removed handler {} from {field}", handler.target_key());
            }
            None => debug!("no matching handler to remove from {field}"),
        }
    }

    /// Detach every handler from a field, including targets other
    /// environments put on the same slot. The field stays registered.
    pub fn clear_field(ctx: &Rc<EnvContext>, field: &DelegateFieldId) {
        let handlers: Vec<Rc<ProxyHandler>> = {
            let mut delegates = ctx.delegates.borrow_mut();
            match delegates.infos.get_mut(field) {
                Some(info) => info.handlers.drain(..).filter_map(|w| w.upgrade()).collect(),
                None => Vec::new(),
            }
        };
        if let Some(slot) = ctx.world.borrow_mut().slot_mut(field) {
            slot.clear();
        }
        for handler in &handlers {
            handler.release();
        }
        if !handlers.is_empty() {
            debug!("cleared {} handlers from {field}", handlers.len());
        }
    }

    /// Detach only this environment's handlers from a field, one target at
    /// a time, so registrations made by other environments on the same
    /// world slot survive.
    fn detach_own(ctx: &Rc<EnvContext>, field: &DelegateFieldId) {
        let handlers: Vec<Rc<ProxyHandler>> = {
            let mut delegates = ctx.delegates.borrow_mut();
            match delegates.infos.get_mut(field) {
                Some(info) => info.handlers.drain(..).filter_map(|w| w.upgrade()).collect(),
                None => Vec::new(),
            }
        };
        for handler in &handlers {
            if let Some(slot) = ctx.world.borrow_mut().slot_mut(field) {
                slot.remove(handler.target_key());
            }
            handler.release();
        }
        if !handlers.is_empty() {
            debug!("detached {} handlers from {field}", handlers.len());
        }
    }

    /// Stop tracking a field entirely, detaching its handlers first.
    pub fn unregister(ctx: &Rc<EnvContext>, field: &DelegateFieldId) {
        Self::clear_field(ctx, field);
        ctx.delegates.borrow_mut().infos.shift_remove(field);
    }

    /// Whether the field currently has at least one live handler.
    pub fn is_bound(ctx: &Rc<EnvContext>, field: &DelegateFieldId) -> bool {
        ctx.world
            .borrow()
            .slot(field)
            .map(|slot| slot.is_bound())
            .unwrap_or(false)
    }

    /// Script-driven fire of a single-cast delegate: marshal arguments,
    /// fire the slot, marshal the handler's results back out.
    pub fn execute(
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        field: &DelegateFieldId,
        args: LuaMultiValue,
    ) -> LuaResult<LuaMultiValue> {
        if Self::field_multicast(ctx, field)? {
            return Err(LuaError::RuntimeError(format!(
                "'{field}' is a multicast delegate; use Broadcast instead of Execute"
            )));
        }
        let desc = Self::signature_desc(ctx, field)?;

        let args: Vec<LuaValue> = args.into_iter().collect();
        let mut frame = ParamFrame::new(desc.params.len());
        let state = desc.pre_call(lua, ctx, &args, &mut frame)?;

        if fire_delegate(&ctx.world, field, &mut frame) == 0 {
            warn!("executing {field} with no live handler");
        }
        desc.post_call(lua, ctx, &mut frame, &state)
    }

    /// Script-driven fire of a multicast delegate. Handlers run in
    /// registration order against the same frame; results are discarded.
    /// Returns how many handlers ran.
    pub fn broadcast(
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        field: &DelegateFieldId,
        args: LuaMultiValue,
    ) -> LuaResult<usize> {
        if !Self::field_multicast(ctx, field)? {
            return Err(LuaError::RuntimeError(format!(
                "'{field}' is a single-cast delegate; use Execute instead of Broadcast"
            )));
        }
        let desc = Self::signature_desc(ctx, field)?;

        let args: Vec<LuaValue> = args.into_iter().collect();
        let mut frame = ParamFrame::new(desc.params.len());
        desc.pre_call(lua, ctx, &args, &mut frame)?;

        Ok(fire_delegate(&ctx.world, field, &mut frame))
    }

    /// Run one handler with an already-marshalled frame. Called by the
    /// world-side slot through [`DelegateTarget::invoke`]; no registry
    /// borrow is held while the Lua function runs.
    pub(crate) fn execute_handler(
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        handler: &ProxyHandler,
        frame: &mut ParamFrame,
    ) {
        let desc = match Self::signature_desc(ctx, &handler.field) {
            Ok(desc) => desc,
            Err(err) => {
                error!("cannot resolve the signature of {}: {err}", handler.field);
                return;
            }
        };
        let Some(func) = handler.callable_fn() else {
            debug!("handler {} already released, skipping", handler.key);
            return;
        };
        desc.call_script(lua, ctx, &func, None, frame);
    }

    /// React to an object's destroyed notification: drop tracking for
    /// delegate fields the object owned, and detach handlers anchored to it
    /// from every other field.
    pub fn on_object_destroyed(ctx: &Rc<EnvContext>, object: ObjectId) {
        let owned: Vec<DelegateFieldId> = {
            let delegates = ctx.delegates.borrow();
            delegates
                .infos
                .keys()
                .filter(|f| f.object == object)
                .cloned()
                .collect()
        };
        for field in &owned {
            Self::unregister(ctx, field);
        }

        let anchored: Vec<(DelegateFieldId, Vec<Rc<ProxyHandler>>)> = {
            let delegates = ctx.delegates.borrow();
            delegates
                .infos
                .iter()
                .map(|(field, info)| {
                    let dying: Vec<Rc<ProxyHandler>> = info
                        .handlers
                        .iter()
                        .filter_map(Weak::upgrade)
                        .filter(|h| h.lifecycle == object)
                        .collect();
                    (field.clone(), dying)
                })
                .filter(|(_, dying)| !dying.is_empty())
                .collect()
        };
        for (field, handlers) in anchored {
            for handler in handlers {
                if let Some(slot) = ctx.world.borrow_mut().slot_mut(&field) {
                    slot.remove(handler.target_key());
                }
                handler.release();
                debug!(
                    "detached handler {} from {field}: anchor {object} destroyed",
                    handler.target_key()
                );
            }
        }

        ctx.delegates.borrow_mut().prune_all();
    }

    /// Detach and release everything this environment registered. Used on
    /// environment teardown; handlers belonging to other environments stay
    /// on their world slots.
    pub fn teardown(ctx: &Rc<EnvContext>) {
        let fields: Vec<DelegateFieldId> =
            ctx.delegates.borrow().infos.keys().cloned().collect();
        for field in &fields {
            Self::detach_own(ctx, field);
        }
        ctx.delegates.borrow_mut().infos.clear();
    }

    // ==================== Internals ====================

    fn new_handler(
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        field: &DelegateFieldId,
        owner: ObjectId,
        callable: &LuaFunction,
    ) -> LuaResult<Rc<ProxyHandler>> {
        let key = {
            let mut delegates = ctx.delegates.borrow_mut();
            delegates.next_key += 1;
            delegates.next_key
        };
        ProxyHandler::new(
            key,
            lua,
            Rc::downgrade(ctx),
            field.clone(),
            owner,
            callable,
        )
    }

    fn check_anchor(
        ctx: &Rc<EnvContext>,
        field: &DelegateFieldId,
        owner: ObjectId,
    ) -> LuaResult<()> {
        let world = ctx.world.borrow();
        if !world.is_alive(field.object) {
            return Err(LuaError::RuntimeError(format!(
                "cannot bind {field}: its object is not alive"
            )));
        }
        if !world.is_alive(owner) {
            return Err(LuaError::RuntimeError(format!(
                "cannot bind {field}: lifecycle anchor {owner} is not alive"
            )));
        }
        Ok(())
    }

    fn field_multicast(ctx: &Rc<EnvContext>, field: &DelegateFieldId) -> LuaResult<bool> {
        Self::register(ctx, field)?;
        let delegates = ctx.delegates.borrow();
        Ok(Self::info(&delegates, field)?.multicast)
    }

    /// Signature descriptor for a field, built on first use and rebuilt
    /// when the database generation has moved.
    fn signature_desc(
        ctx: &Rc<EnvContext>,
        field: &DelegateFieldId,
    ) -> LuaResult<Rc<FunctionDesc>> {
        Self::register(ctx, field)?;
        let mut delegates = ctx.delegates.borrow_mut();
        let world = ctx.world.borrow();
        let info = Self::info_mut(&mut delegates, field)?;
        match &info.desc {
            Some(desc) if !desc.is_stale(world.db()) => Ok(desc.clone()),
            _ => {
                let desc = FunctionDesc::build(world.db(), info.signature);
                info.desc = Some(desc.clone());
                Ok(desc)
            }
        }
    }

    fn info<'a>(
        registry: &'a DelegateRegistry,
        field: &DelegateFieldId,
    ) -> LuaResult<&'a DelegateInfo> {
        registry.infos.get(field).ok_or_else(|| {
            LuaError::RuntimeError(format!("delegate field {field} is not registered"))
        })
    }

    fn info_mut<'a>(
        registry: &'a mut DelegateRegistry,
        field: &DelegateFieldId,
    ) -> LuaResult<&'a mut DelegateInfo> {
        registry.infos.get_mut(field).ok_or_else(|| {
            LuaError::RuntimeError(format!("delegate field {field} is not registered"))
        })
    }

    fn prune(&mut self, field: &DelegateFieldId) {
        if let Some(info) = self.infos.get_mut(field) {
            info.handlers
                .retain(|w| w.upgrade().map(|h| !h.is_released()).unwrap_or(false));
        }
    }

    fn prune_all(&mut self) {
        for info in self.infos.values_mut() {
            info.handlers
                .retain(|w| w.upgrade().map(|h| !h.is_released()).unwrap_or(false));
        }
    }
}
