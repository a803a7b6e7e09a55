//! Lua scripting bindings for the strata reflection model.
//!
//! The crate embeds a Lua VM into a host built on [`strata_reflect`]:
//! scripts call reflected functions, read and write reflected properties,
//! bind handlers to delegates, and override reflected functions with
//! module tables bound per class; the host dispatches calls and delegate
//! fires into script and completes latent calls at its own pace.
//!
//! The entry point is [`ScriptEnv`], which owns the VM and all binding
//! state for one environment. Everything is single-threaded; host lifetime
//! notifications arrive over a channel and are folded in at an explicit
//! pump point. Script errors are contained at the boundary: a failing
//! handler is logged and skipped, never unwound into the host.

pub mod binding;
pub mod collections;
pub mod delegate_proxy;
pub mod delegate_registry;
pub mod env;
pub mod function_desc;
pub mod function_registry;
pub mod latent;
pub mod lua_types;
pub mod marshal;
pub mod object_registry;

pub use binding::ClassBindings;
pub use collections::{ArrayProxy, MapProxy, SetProxy};
pub use delegate_proxy::DelegateProxy;
pub use delegate_registry::DelegateRegistry;
pub use env::{EnvOptions, ExecutionLimits, ReturnOrder, ScriptEnv};
pub use function_desc::FunctionDesc;
pub use function_registry::FunctionRegistry;
pub use latent::LatentManager;
pub use lua_types::StructProxy;
pub use object_registry::ObjectRegistry;
