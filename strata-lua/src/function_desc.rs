//! Cached calling-convention descriptors for reflected functions.
//!
//! A [`FunctionDesc`] is built lazily the first time a function crosses the
//! boundary and captures everything invocation needs: the parameter list,
//! the return and latent slot positions, and the copy-back set. Descriptors
//! record the database generation they were built against; after a function
//! is replaced in place (hot reload), stale descriptors are discarded and
//! rebuilt on next use rather than patched.
//!
//! Both call directions live here. [`FunctionDesc::call_native`] drives a
//! script-initiated call into the host, [`FunctionDesc::call_script`] drives
//! a host-initiated call into a Lua function. Script errors never cross the
//! boundary in either direction; they are logged and the call degrades to
//! "no results".

use std::rc::Rc;
use std::time::Instant;

use log::{error, warn};
use mlua::prelude::*;
use strata_reflect::{
    call_native_direct, process_event, FunctionId, ObjectId, ParamDef, ParamFrame, ReflectionDb,
    Value,
};

use crate::env::{EnvContext, ReturnOrder};
use crate::marshal;

/// Calling convention of one reflected function, flattened for invocation.
#[derive(Debug)]
pub struct FunctionDesc {
    function: FunctionId,
    pub name: String,
    pub class_name: String,
    pub params: Vec<ParamDef>,
    /// Slot of the return parameter, if the function has one.
    pub return_index: Option<usize>,
    /// Slot of the latent continuation parameter, if the function has one.
    pub latent_index: Option<usize>,
    /// Slots copied back to the caller after the call, in declaration order.
    pub out_indices: Vec<usize>,
    pub is_static: bool,
    pub is_interface: bool,
    generation: u64,
}

/// Bookkeeping carried from argument reading to result writing.
pub(crate) struct PreCallState {
    /// Per-slot flag: the caller's argument aliases the frame's cell, so the
    /// copy-back push is skipped.
    shared: Vec<bool>,
    /// The caller passed a destination for the return value in place.
    return_shared: bool,
}

impl FunctionDesc {
    /// Flatten a function's metadata into a descriptor.
    pub fn build(db: &ReflectionDb, function: FunctionId) -> Rc<FunctionDesc> {
        let def = db.function(function);
        let owner = db.class(def.owner);

        let mut return_index = None;
        let mut latent_index = None;
        let mut out_indices = Vec::new();
        for (i, param) in def.params.iter().enumerate() {
            if param.is_return() {
                return_index = Some(i);
            } else if param.is_latent() {
                latent_index = Some(i);
            } else if param.is_out() {
                out_indices.push(i);
            }
        }

        Rc::new(FunctionDesc {
            function,
            name: def.name.clone(),
            class_name: owner.name.clone(),
            params: def.params.clone(),
            return_index,
            latent_index,
            out_indices,
            is_static: def.is_static,
            is_interface: owner.is_interface,
            generation: db.generation(),
        })
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Whether the database has moved on since this descriptor was built.
    pub fn is_stale(&self, db: &ReflectionDb) -> bool {
        self.generation != db.generation()
    }

    /// "Class.Function", for diagnostics.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.class_name, self.name)
    }

    // ==================== Script -> native ====================

    /// Invoke the reflected function on behalf of a script caller.
    ///
    /// Arguments are consumed positionally into a parameter frame; missing
    /// trailing arguments fall back to kind defaults. A trailing Lua
    /// function fills the latent slot as the call's continuation. After the
    /// native side runs, the return slot and out slots come back as Lua
    /// results in the environment's configured order, skipping slots whose
    /// argument already aliases the frame's cell.
    pub fn call_native(
        &self,
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        this: Option<ObjectId>,
        args: LuaMultiValue,
    ) -> LuaResult<LuaMultiValue> {
        if !self.is_static {
            let Some(id) = this else {
                return Err(LuaError::RuntimeError(format!(
                    "'{}' is an instance function; call it with ':' instead of '.'",
                    self.qualified()
                )));
            };
            if !ctx.world.borrow().is_alive(id) {
                return Err(LuaError::RuntimeError(format!(
                    "calling '{}' on a released object",
                    self.qualified()
                )));
            }
        }

        let args: Vec<LuaValue> = args.into_iter().collect();
        let mut frame = ParamFrame::new(self.params.len());
        let state = self.pre_call(lua, ctx, &args, &mut frame)?;

        // An overridden function keeps routing script-initiated calls to its
        // original native entry point; going through the dispatch mechanism
        // would re-enter the override.
        let use_native =
            !self.is_interface && ctx.world.borrow().db().function(self.function).has_native();
        if use_native {
            call_native_direct(&ctx.world, self.function, this, &mut frame);
        } else {
            process_event(&ctx.world, this, self.function, &mut frame);
        }

        self.post_call(lua, ctx, &mut frame, &state)
    }

    pub(crate) fn pre_call(
        &self,
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        args: &[LuaValue],
        frame: &mut ParamFrame,
    ) -> LuaResult<PreCallState> {
        let mut shared = vec![false; self.params.len()];
        let mut return_shared = false;
        let mut cursor = 0usize;

        for (i, param) in self.params.iter().enumerate() {
            if param.is_return() {
                continue;
            }
            if param.is_latent() {
                let callback = match args.get(cursor) {
                    Some(LuaValue::Function(f)) => {
                        cursor += 1;
                        Some(f.clone())
                    }
                    _ => None,
                };
                let token = ctx
                    .latents
                    .borrow_mut()
                    .register(lua, self.qualified(), callback)?;
                frame.set(i, Value::Latent(token));
                continue;
            }
            match args.get(cursor) {
                Some(arg) => {
                    let (value, aliased) = marshal::read_value(ctx, arg, &param.kind);
                    shared[i] = aliased;
                    frame.set(i, value);
                    cursor += 1;
                }
                None => {
                    let default = { ctx.world.borrow().db().default_value(&param.kind) };
                    frame.set(i, default);
                }
            }
        }

        // One extra trailing argument of the return kind acts as the return
        // destination: the callee writes straight into the caller's cell and
        // the result push is skipped.
        if let Some(ret) = self.return_index {
            let kind = self.params[ret].kind.clone();
            if let Some(extra) = args.get(cursor) {
                if marshal::is_type(ctx, extra, &kind) {
                    let (value, aliased) = marshal::read_value(ctx, extra, &kind);
                    if aliased {
                        frame.set(ret, value);
                        return_shared = true;
                    }
                }
            }
            if !return_shared {
                let default = { ctx.world.borrow().db().default_value(&kind) };
                frame.set(ret, default);
            }
        }

        Ok(PreCallState {
            shared,
            return_shared,
        })
    }

    pub(crate) fn post_call(
        &self,
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        frame: &mut ParamFrame,
        state: &PreCallState,
    ) -> LuaResult<LuaMultiValue> {
        let mut results = Vec::new();
        match ctx.order {
            ReturnOrder::ReturnFirst => {
                self.push_return(lua, ctx, frame, state, &mut results)?;
                self.push_outs(lua, ctx, frame, state, &mut results)?;
            }
            ReturnOrder::OutsFirst => {
                self.push_outs(lua, ctx, frame, state, &mut results)?;
                self.push_return(lua, ctx, frame, state, &mut results)?;
            }
        }
        Ok(LuaMultiValue::from_vec(results))
    }

    fn push_return(
        &self,
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        frame: &mut ParamFrame,
        state: &PreCallState,
        results: &mut Vec<LuaValue>,
    ) -> LuaResult<()> {
        if let Some(ret) = self.return_index {
            if !state.return_shared {
                let value = frame.take(ret);
                results.push(marshal::push_value(
                    lua,
                    ctx,
                    &value,
                    &self.params[ret].kind,
                    false,
                )?);
            }
        }
        Ok(())
    }

    fn push_outs(
        &self,
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        frame: &mut ParamFrame,
        state: &PreCallState,
        results: &mut Vec<LuaValue>,
    ) -> LuaResult<()> {
        for &i in &self.out_indices {
            if state.shared[i] {
                continue;
            }
            let value = frame.take(i);
            results.push(marshal::push_value(
                lua,
                ctx,
                &value,
                &self.params[i].kind,
                false,
            )?);
        }
        Ok(())
    }

    // ==================== Native -> script ====================

    /// Invoke a Lua function on behalf of the host, marshalling the frame's
    /// input slots as arguments and folding results back into the frame.
    ///
    /// Returns false when the function raised; the frame's result slots are
    /// left untouched in that case and the error stays on this side of the
    /// boundary.
    pub fn call_script(
        &self,
        lua: &Lua,
        ctx: &Rc<EnvContext>,
        func: &LuaFunction,
        this: Option<LuaValue>,
        frame: &mut ParamFrame,
    ) -> bool {
        let mut args = Vec::new();
        if let Some(this) = this {
            args.push(this);
        }
        for (i, param) in self.params.iter().enumerate() {
            if param.is_return() || param.is_out() {
                continue;
            }
            match marshal::push_value(lua, ctx, frame.slot(i), &param.kind, false) {
                Ok(value) => args.push(value),
                Err(err) => {
                    error!(
                        "cannot marshal argument '{}' for '{}': {err}",
                        param.name,
                        self.qualified()
                    );
                    return false;
                }
            }
        }

        let started = Instant::now();
        let results = match func.call::<LuaMultiValue>(LuaMultiValue::from_vec(args)) {
            Ok(results) => results,
            Err(err) => {
                error!("script handler for '{}' failed: {err}", self.qualified());
                return false;
            }
        };
        if let Some(threshold) = ctx.limits.slow_call_warning {
            let elapsed = started.elapsed();
            if elapsed > threshold {
                warn!(
                    "script handler for '{}' took {elapsed:?}",
                    self.qualified()
                );
            }
        }

        let results: Vec<LuaValue> = results.into_iter().collect();
        let mut cursor = 0usize;
        match ctx.order {
            ReturnOrder::ReturnFirst => {
                self.read_return(ctx, &results, &mut cursor, frame);
                self.read_outs(ctx, &results, &mut cursor, frame);
            }
            ReturnOrder::OutsFirst => {
                self.read_outs(ctx, &results, &mut cursor, frame);
                self.read_return(ctx, &results, &mut cursor, frame);
            }
        }
        true
    }

    fn read_return(
        &self,
        ctx: &Rc<EnvContext>,
        results: &[LuaValue],
        cursor: &mut usize,
        frame: &mut ParamFrame,
    ) {
        let Some(ret) = self.return_index else { return };
        match results.get(*cursor) {
            Some(value) => {
                let (converted, _) = marshal::read_value(ctx, value, &self.params[ret].kind);
                frame.set(ret, converted);
                *cursor += 1;
            }
            None => warn!(
                "script handler for '{}' returned no value",
                self.qualified()
            ),
        }
    }

    fn read_outs(
        &self,
        ctx: &Rc<EnvContext>,
        results: &[LuaValue],
        cursor: &mut usize,
        frame: &mut ParamFrame,
    ) {
        for &i in &self.out_indices {
            // A handler may return fewer values than there are out slots;
            // untouched slots keep their pre-call contents.
            let Some(value) = results.get(*cursor) else { break };
            let (converted, _) = marshal::read_value(ctx, value, &self.params[i].kind);
            frame.set(i, converted);
            *cursor += 1;
        }
    }
}
