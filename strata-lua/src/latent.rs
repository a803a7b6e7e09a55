//! Pending latent calls.
//!
//! A latent function does not produce its results inside the call; the
//! caller's continuation is parked here under a token, the token travels
//! through the parameter frame to the host, and the host completes it at
//! its own pace. The environment never polls; completion is explicit.

use std::rc::Rc;
use std::time::Instant;

use indexmap::IndexMap;
use log::{debug, error, warn};
use mlua::prelude::*;
use strata_reflect::{LatentToken, Value};

use crate::env::EnvContext;
use crate::marshal;

struct PendingLatent {
    /// Qualified function name, for diagnostics.
    name: String,
    callback: Option<LuaRegistryKey>,
}

#[derive(Default)]
pub struct LatentManager {
    pending: IndexMap<LatentToken, PendingLatent>,
    next: u64,
}

impl LatentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a continuation and hand back its token. A call site without a
    /// continuation function still gets a token, so the host sees a uniform
    /// frame either way.
    pub fn register(
        &mut self,
        lua: &Lua,
        name: String,
        callback: Option<LuaFunction>,
    ) -> LuaResult<LatentToken> {
        let token = LatentToken(self.next);
        self.next += 1;
        let callback = match callback {
            Some(f) => Some(lua.create_registry_value(&f)?),
            None => None,
        };
        debug!("parked latent continuation {token} for '{name}'");
        self.pending.insert(token, PendingLatent { name, callback });
        Ok(token)
    }

    /// Complete a parked latent call, running its continuation with the
    /// host-provided results.
    ///
    /// Unknown tokens are a no-op; completing twice is therefore harmless.
    /// A continuation error is logged and swallowed. Returns whether the
    /// token was pending.
    pub fn complete(lua: &Lua, ctx: &Rc<EnvContext>, token: LatentToken, results: &[Value]) -> bool {
        let entry = { ctx.latents.borrow_mut().pending.shift_remove(&token) };
        let Some(entry) = entry else {
            debug!("latent completion for unknown token {token}");
            return false;
        };
        let Some(key) = entry.callback else {
            // The call site passed no continuation; the completion itself
            // still counts.
            return true;
        };

        let func: LuaFunction = match lua.registry_value(&key) {
            Ok(f) => f,
            Err(err) => {
                error!("lost latent continuation for '{}': {err}", entry.name);
                let _ = lua.remove_registry_value(key);
                return true;
            }
        };

        let mut args = Vec::with_capacity(results.len());
        for value in results {
            let kind = marshal::infer_kind(ctx, value);
            match marshal::push_value(lua, ctx, value, &kind, false) {
                Ok(v) => args.push(v),
                Err(err) => {
                    error!(
                        "cannot marshal latent result for '{}': {err}",
                        entry.name
                    );
                    let _ = lua.remove_registry_value(key);
                    return true;
                }
            }
        }

        let started = Instant::now();
        if let Err(err) = func.call::<()>(LuaMultiValue::from_vec(args)) {
            error!("latent continuation for '{}' failed: {err}", entry.name);
        }
        if let Some(threshold) = ctx.limits.slow_call_warning {
            let elapsed = started.elapsed();
            if elapsed > threshold {
                warn!("latent continuation for '{}' took {elapsed:?}", entry.name);
            }
        }

        let _ = lua.remove_registry_value(key);
        true
    }

    /// Drop a parked continuation without running it.
    pub fn cancel(&mut self, lua: &Lua, token: LatentToken) -> bool {
        match self.pending.shift_remove(&token) {
            Some(entry) => {
                if let Some(key) = entry.callback {
                    let _ = lua.remove_registry_value(key);
                }
                debug!("cancelled latent continuation {token} for '{}'", entry.name);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self, lua: &Lua) {
        for (_, entry) in self.pending.drain(..) {
            if let Some(key) = entry.callback {
                let _ = lua.remove_registry_value(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
