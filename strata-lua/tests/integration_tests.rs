//! Integration tests for strata-lua.
//!
//! These drive whole call paths through a real Lua VM against the shared
//! fixture world: marshalling, instance handles, class modules, delegates,
//! the calling convention in both directions, latent calls, and lifetime
//! handling.

mod common;

use std::rc::Rc;

use common::{env_for, fixture, Fixture};
use strata_lua::{EnvOptions, ReturnOrder, ScriptEnv};
use strata_reflect::{ClassId, DelegateFieldId, ObjectId, ParamFrame, Value};

fn spawn(env: &ScriptEnv, fx: &Fixture, class: ClassId, global: &str) -> ObjectId {
    let id = fx.world.borrow_mut().create_object(class);
    let handle = env.handle_for(id).expect("Failed to bind the object");
    env.lua()
        .globals()
        .set(global, handle)
        .expect("Failed to install the handle global");
    id
}

fn spawn_actor(env: &ScriptEnv, fx: &Fixture, global: &str) -> ObjectId {
    spawn(env, fx, fx.actor, global)
}

fn spawn_enemy(env: &ScriptEnv, fx: &Fixture, global: &str) -> ObjectId {
    spawn(env, fx, fx.enemy, global)
}

// ========================================================================
// VALUE MARSHALLING
// ========================================================================

#[test]
fn scalars_round_trip_through_a_native_call() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    let result: i64 = env
        .eval("a.health = 10 return a:Heal(5)")
        .expect("Failed to call Heal");
    assert_eq!(result, 15);
    assert_eq!(
        fx.world.borrow().property(a, "health"),
        Some(Value::Int(15)),
        "the native side must see the scripted property write"
    );
}

#[test]
fn enum_properties_accept_variant_names() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    env.exec(r#"a.team = "Blue""#, "set_team").unwrap();
    assert_eq!(fx.world.borrow().property(a, "team"), Some(Value::Int(2)));

    let team: i64 = env.eval("return a.team").unwrap();
    assert_eq!(team, 2, "enums read back as their integer value");

    let blue: i64 = env.eval("return strata.enums.Team.Blue").unwrap();
    assert_eq!(blue, 2);
}

#[test]
fn struct_fields_share_the_native_cell() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    env.exec("a.position.x = 1.5", "set_position").unwrap();
    let stored = fx.world.borrow().property(a, "position").unwrap();
    let Value::Struct(cell) = stored else {
        panic!("expected struct storage");
    };
    assert_eq!(cell.borrow().fields[0], Value::Float(1.5));

    cell.borrow_mut().fields[1] = Value::Float(9.0);
    let y: f64 = env.eval("return a.position.y").unwrap();
    assert_eq!(y, 9.0, "native writes must be visible through the proxy");
}

#[test]
fn struct_copies_detach_from_the_original() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    env.exec(
        r#"
        a.position.x = 2.0
        copy = a.position:Copy()
        copy.x = 99.0
    "#,
        "copy_struct",
    )
    .unwrap();

    let copied_x: f64 = env.eval("return copy.x").unwrap();
    assert_eq!(copied_x, 99.0);
    let original_x: f64 = env.eval("return a.position.x").unwrap();
    assert_eq!(original_x, 2.0, "mutating the copy must not reach the original");
}

#[test]
fn array_proxy_mutations_reach_the_world() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    env.exec(
        r#"
        local tags = a.tags
        tags:Add("brave")
        tags:Add("swift")
        tags:Remove(1)
    "#,
        "edit_tags",
    )
    .unwrap();

    let stored = fx.world.borrow().property(a, "tags").unwrap();
    let Value::Array(cell) = stored else {
        panic!("expected array storage");
    };
    assert_eq!(*cell.borrow(), vec![Value::Str("swift".to_string())]);

    let len: i64 = env.eval("return #a.tags").unwrap();
    assert_eq!(len, 1);
    let has: bool = env.eval(r#"return a.tags:Contains("swift")"#).unwrap();
    assert!(has);
}

#[test]
fn object_properties_reuse_the_instance_handle() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    let b = spawn_actor(&env, &fx, "b");

    env.exec("a.target = b", "link").unwrap();
    assert_eq!(fx.world.borrow().property(a, "target"), Some(Value::Object(b)));

    let same: bool = env.eval("return rawequal(a.target, b)").unwrap();
    assert!(same, "reading a stored object must produce its existing handle");
}

#[test]
fn released_objects_marshal_to_nil() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");
    let b = spawn_actor(&env, &fx, "b");

    env.exec("a.target = b", "link").unwrap();
    fx.world.borrow_mut().destroy_object(b);

    let is_nil: bool = env.eval("return a.target == nil").unwrap();
    assert!(is_nil, "a destroyed reference must read as nil, not raise");
}

// ========================================================================
// INSTANCE HANDLES AND CLASS MODULES
// ========================================================================

#[test]
fn objects_bind_to_at_most_one_handle() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    let again = env.handle_for(a).unwrap();
    env.lua().globals().set("a2", again).unwrap();

    let same: bool = env.eval("return rawequal(a, a2)").unwrap();
    assert!(same, "resolving twice must return the same table");
    assert_eq!(env.bound_objects(), 1);
}

#[test]
fn plain_fields_stay_on_the_handle() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    env.exec(r#"a.custom_note = "hello""#, "note").unwrap();
    let note: String = env.eval("return a.custom_note").unwrap();
    assert_eq!(note, "hello");
    assert_eq!(
        fx.world.borrow().property(a, "custom_note"),
        None,
        "unreflected names never become world properties"
    );
}

#[test]
fn methods_resolve_over_the_inheritance_chain() {
    let fx = fixture();
    let env = env_for(&fx);
    let e = spawn_enemy(&env, &fx, "e");

    let healed: i64 = env.eval("return e:Heal(3)").unwrap();
    assert_eq!(healed, 3, "a parent-class function must be callable");

    let described: String = env.eval("return e:Describe()").unwrap();
    assert_eq!(
        described,
        format!("entity {e}"),
        "a grandparent-class function must be callable"
    );
}

#[test]
fn bound_modules_receive_host_initiated_calls() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    env.bind_class_source(
        "Actor",
        "actor_module",
        r#"
        return {
            Describe = function(self)
                return "scripted " .. tostring(self)
            end,
        }
    "#,
    )
    .unwrap();

    let mut frame = ParamFrame::new(1);
    env.invoke_from_native(fx.describe, a, &mut frame);

    let Value::Str(text) = frame.slot(0) else {
        panic!("expected a string result");
    };
    assert!(
        text.starts_with("scripted Actor#"),
        "the override must run with the instance handle, got '{text}'"
    );
}

#[test]
fn grandparent_modules_handle_derived_objects() {
    let fx = fixture();
    let env = env_for(&fx);
    let e = spawn_enemy(&env, &fx, "e");

    env.bind_class_source(
        "Entity",
        "entity_module",
        r#"
        return {
            Describe = function(self)
                return "entity module"
            end,
        }
    "#,
    )
    .unwrap();

    let mut frame = ParamFrame::new(1);
    env.invoke_from_native(fx.describe, e, &mut frame);
    assert_eq!(
        frame.slot(0),
        &Value::Str("entity module".to_string()),
        "module lookup must walk up to the grandparent class"
    );
}

#[test]
fn inbound_calls_fall_back_to_native_without_an_override() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    let mut frame = ParamFrame::new(2);
    frame.set(0, Value::Int(4));
    env.invoke_from_native(fx.heal, a, &mut frame);

    assert_eq!(frame.slot(1), &Value::Int(4));
    assert_eq!(fx.world.borrow().property(a, "health"), Some(Value::Int(4)));
}

#[test]
fn rebinding_a_class_replaces_its_overrides() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    env.bind_class_source(
        "Actor",
        "v1",
        r#"return { Describe = function(self) return "one" end }"#,
    )
    .unwrap();
    let mut frame = ParamFrame::new(1);
    env.invoke_from_native(fx.describe, a, &mut frame);
    assert_eq!(frame.slot(0), &Value::Str("one".to_string()));

    env.bind_class_source(
        "Actor",
        "v2",
        r#"return { Describe = function(self) return "two" end }"#,
    )
    .unwrap();
    let mut frame = ParamFrame::new(1);
    env.invoke_from_native(fx.describe, a, &mut frame);
    assert_eq!(
        frame.slot(0),
        &Value::Str("two".to_string()),
        "the second module must displace the first"
    );
}

#[test]
fn initialize_runs_once_per_created_binding() {
    let fx = fixture();
    let env = env_for(&fx);
    env.exec("inits = 0", "setup").unwrap();
    env.bind_class_source(
        "Actor",
        "actor_module",
        r#"
        return {
            Initialize = function(self)
                self.ready = true
                inits = inits + 1
            end,
        }
    "#,
    )
    .unwrap();

    let first = fx.world.borrow_mut().create_object(fx.actor);
    let handle = env.attach_object(first).unwrap();
    env.lua().globals().set("first", handle).unwrap();

    let ready: bool = env.eval("return first.ready == true").unwrap();
    assert!(ready);
    let inits: i64 = env.eval("return inits").unwrap();
    assert_eq!(inits, 1);

    env.attach_object(first).unwrap();
    let inits: i64 = env.eval("return inits").unwrap();
    assert_eq!(inits, 1, "re-attaching an existing binding must not re-run Initialize");

    // A binding created through plain resolution never runs Initialize,
    // not even when attached afterwards.
    let second = fx.world.borrow_mut().create_object(fx.actor);
    env.handle_for(second).unwrap();
    env.attach_object(second).unwrap();
    let inits: i64 = env.eval("return inits").unwrap();
    assert_eq!(inits, 1);
}

#[test]
fn stale_hooks_do_not_capture_script_calls() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    env.bind_class_source(
        "Actor",
        "v1",
        r#"return { Heal = function(self, amount) return -1 end }"#,
    )
    .unwrap();
    env.bind_class_source("Actor", "v2", "return {}").unwrap();

    // Host-initiated calls fall back to the native implementation now that
    // no module names the function.
    let mut frame = ParamFrame::new(2);
    frame.set(0, Value::Int(2));
    env.invoke_from_native(fx.heal, a, &mut frame);
    assert_eq!(frame.slot(1), &Value::Int(2));

    // Script-initiated calls go straight to the native entry point and do
    // not loop through the leftover hook.
    let healed: i64 = env.eval("return a:Heal(5)").unwrap();
    assert_eq!(healed, 7);
}

#[test]
fn class_namespace_statics_create_objects() {
    let fx = fixture();
    let env = env_for(&fx);

    let before = fx.world.borrow().live_objects();
    let health: i64 = env
        .eval("local b = strata.classes.Actor.Spawn() return b.health")
        .unwrap();
    assert_eq!(health, 0);
    assert_eq!(fx.world.borrow().live_objects(), before + 1);
}

#[test]
fn modules_load_from_files() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guard.lua");
    std::fs::write(
        &path,
        r#"return { Describe = function(self) return "from file" end }"#,
    )
    .unwrap();

    let (name, module) = env.load_module_file(&path).unwrap();
    assert_eq!(name, "guard", "the module name comes from the file stem");
    env.bind_class("Actor", &name, module).unwrap();

    let mut frame = ParamFrame::new(1);
    env.invoke_from_native(fx.describe, a, &mut frame);
    assert_eq!(frame.slot(0), &Value::Str("from file".to_string()));
}

// ========================================================================
// DELEGATES
// ========================================================================

#[test]
fn single_cast_execute_reaches_the_bound_handler() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    let field = DelegateFieldId::new(a, "OnScored");

    env.exec(
        r#"
        a.OnScored:Bind(a, function(points)
            seen = points
            return points * 2
        end)
    "#,
        "bind",
    )
    .unwrap();
    assert_eq!(env.handler_count(&field), 1);

    let result: i64 = env.eval("return a.OnScored:Execute(42)").unwrap();
    assert_eq!(result, 84, "Execute must return the handler's result");
    let seen: i64 = env.eval("return seen").unwrap();
    assert_eq!(seen, 42, "the handler must receive the marshalled argument");
}

#[test]
fn teardown_releases_handlers_and_the_world() {
    let fx = fixture();
    let a = fx.world.borrow_mut().create_object(fx.actor);
    let field = DelegateFieldId::new(a, "OnScored");

    {
        let env = env_for(&fx);
        let handle = env.handle_for(a).unwrap();
        env.lua().globals().set("a", handle).unwrap();
        env.exec(
            "a.OnScored:Bind(a, function(points) return points end)",
            "bind",
        )
        .unwrap();
        assert_eq!(
            fx.world.borrow().slot(&field).map(|slot| slot.is_bound()),
            Some(true)
        );
    }

    assert_eq!(
        fx.world.borrow().slot(&field).map(|slot| slot.len()),
        Some(0),
        "teardown must leave no handler in the world slot"
    );
    assert_eq!(
        Rc::strong_count(&fx.world),
        1,
        "a dropped environment must not keep the world alive"
    );
}

#[test]
fn bind_displaces_the_previous_handler() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    let field = DelegateFieldId::new(a, "OnScored");

    env.exec(
        r#"
        first_calls = 0
        a.OnScored:Bind(a, function(points)
            first_calls = first_calls + 1
            return 1
        end)
        a.OnScored:Bind(a, function(points) return 2 end)
    "#,
        "rebind",
    )
    .unwrap();
    assert_eq!(env.handler_count(&field), 1);

    let result: i64 = env.eval("return a.OnScored:Execute(0)").unwrap();
    assert_eq!(result, 2);
    let first_calls: i64 = env.eval("return first_calls").unwrap();
    assert_eq!(first_calls, 0, "the displaced handler must never fire");
}

#[test]
fn multicast_handlers_fire_in_registration_order() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    env.exec(
        r#"
        order = {}
        a.OnDamaged:Add(a, function(amount) table.insert(order, "first:" .. amount) end)
        a.OnDamaged:Add(a, function(amount) table.insert(order, "second:" .. amount) end)
        a.OnDamaged:Broadcast(7)
    "#,
        "broadcast",
    )
    .unwrap();

    let order: Vec<String> = env.eval("return order").unwrap();
    assert_eq!(order, vec!["first:7".to_string(), "second:7".to_string()]);
}

#[test]
fn removing_a_handler_leaves_the_others() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    let field = DelegateFieldId::new(a, "OnDamaged");

    env.exec(
        r#"
        hits = {}
        function on_first(amount) table.insert(hits, "first") end
        function on_second(amount) table.insert(hits, "second") end
        a.OnDamaged:Add(a, on_first)
        a.OnDamaged:Add(a, on_second)
        a.OnDamaged:Remove(on_first)
        a.OnDamaged:Broadcast(1)
    "#,
        "remove_first",
    )
    .unwrap();

    let hits: Vec<String> = env.eval("return hits").unwrap();
    assert_eq!(hits, vec!["second".to_string()]);
    assert_eq!(env.handler_count(&field), 1);
}

#[test]
fn removing_an_unknown_function_is_a_no_op() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    let field = DelegateFieldId::new(a, "OnDamaged");

    env.exec(
        r#"
        hits = 0
        a.OnDamaged:Add(a, function(amount) hits = hits + 1 end)
        a.OnDamaged:Remove(function() end)
        a.OnDamaged:Broadcast(1)
    "#,
        "remove_stranger",
    )
    .unwrap();

    let hits: i64 = env.eval("return hits").unwrap();
    assert_eq!(hits, 1, "the registered handler must survive the stray remove");
    assert_eq!(env.handler_count(&field), 1);
}

#[test]
fn unbind_reverses_bind() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    let field = DelegateFieldId::new(a, "OnScored");

    env.exec(
        "a.OnScored:Bind(a, function(points) return points end)",
        "bind",
    )
    .unwrap();
    let bound: bool = env.eval("return a.OnScored:IsBound()").unwrap();
    assert!(bound);

    env.exec("a.OnScored:Unbind()", "unbind").unwrap();
    let bound: bool = env.eval("return a.OnScored:IsBound()").unwrap();
    assert!(!bound);
    assert_eq!(env.handler_count(&field), 0);
    assert_eq!(fx.world.borrow().slot(&field).map(|slot| slot.len()), Some(0));

    // Executing an unbound single-cast yields the signature's default.
    let result: i64 = env.eval("return a.OnScored:Execute(5)").unwrap();
    assert_eq!(result, 0);
}

#[test]
fn handler_errors_do_not_stop_a_broadcast() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    env.exec(
        r#"
        a.OnDamaged:Add(a, function(amount) error("boom") end)
        a.OnDamaged:Add(a, function(amount) survived = true end)
        a.OnDamaged:Broadcast(1)
    "#,
        "faulty_broadcast",
    )
    .unwrap();

    let survived: bool = env.eval("return survived == true").unwrap();
    assert!(survived, "the second handler must run despite the first failing");
}

#[test]
fn handlers_removed_mid_broadcast_do_not_fire() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    let field = DelegateFieldId::new(a, "OnDamaged");

    env.exec(
        r#"
        function on_second(amount) second_fired = true end
        a.OnDamaged:Add(a, function(amount) a.OnDamaged:Remove(on_second) end)
        a.OnDamaged:Add(a, on_second)
        a.OnDamaged:Broadcast(1)
    "#,
        "reentrant_remove",
    )
    .unwrap();

    let second_fired: bool = env.eval("return second_fired == true").unwrap();
    assert!(!second_fired, "a handler removed mid-broadcast must be skipped");
    assert_eq!(env.handler_count(&field), 1);
}

#[test]
fn destroying_the_anchor_detaches_its_handlers() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    let b = spawn_actor(&env, &fx, "b");
    let field = DelegateFieldId::new(a, "OnDamaged");

    env.exec(
        "a.OnDamaged:Add(b, function(amount) fired = true end)",
        "add",
    )
    .unwrap();
    assert_eq!(env.handler_count(&field), 1);

    fx.world.borrow_mut().destroy_object(b);
    env.pump_host_events();

    assert_eq!(env.handler_count(&field), 0);
    assert_eq!(fx.world.borrow().slot(&field).map(|slot| slot.len()), Some(0));

    env.exec("a.OnDamaged:Broadcast(1)", "broadcast").unwrap();
    let fired: bool = env.eval("return fired == true").unwrap();
    assert!(!fired, "handlers anchored to a destroyed object must not fire");
}

#[test]
fn destroying_the_owner_clears_its_delegates() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    let field = DelegateFieldId::new(a, "OnScored");

    env.exec(
        "a.OnScored:Bind(a, function(points) return points end)",
        "bind",
    )
    .unwrap();

    fx.world.borrow_mut().destroy_object(a);
    env.pump_host_events();

    assert!(!env.is_object_bound(a));
    assert_eq!(env.handler_count(&field), 0);

    // The endpoint cached on the leftover handle no longer resolves.
    let err = env.eval::<i64>("return a.OnScored:Execute(1)").unwrap_err();
    assert!(err.to_string().contains("not a delegate"));
}

#[test]
fn assigning_to_a_delegate_property_raises() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    let err = env.exec("a.OnScored = 5", "assign").unwrap_err();
    assert!(err.to_string().contains("Bind or Add"));
}

#[test]
fn execute_and_broadcast_enforce_the_delegate_flavor() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    let err = env.eval::<i64>("return a.OnDamaged:Execute(1)").unwrap_err();
    assert!(err.to_string().contains("Broadcast"));

    let err = env.exec("a.OnScored:Broadcast(1)", "broadcast").unwrap_err();
    assert!(err.to_string().contains("Execute"));
}

// ========================================================================
// CALLING CONVENTION
// ========================================================================

#[test]
fn out_parameters_follow_the_return_value_by_default() {
    let fx = fixture();
    let env = env_for(&fx);
    let e = spawn_enemy(&env, &fx, "e");
    {
        let mut world = fx.world.borrow_mut();
        world.set_property(e, "health", Value::Int(10));
        world.set_property(e, "armor", Value::Int(2));
    }

    let (survived, remaining): (bool, i64) = env.eval("return e:TakeDamage(6)").unwrap();
    assert!(survived);
    assert_eq!(remaining, 6);
}

#[test]
fn legacy_order_puts_out_parameters_first() {
    let fx = fixture();
    let env = ScriptEnv::with_options(
        fx.world.clone(),
        EnvOptions {
            return_order: ReturnOrder::OutsFirst,
            ..Default::default()
        },
    )
    .unwrap();
    let e = spawn_enemy(&env, &fx, "e");
    {
        let mut world = fx.world.borrow_mut();
        world.set_property(e, "health", Value::Int(10));
        world.set_property(e, "armor", Value::Int(2));
    }

    let (remaining, survived): (i64, bool) = env.eval("return e:TakeDamage(6)").unwrap();
    assert_eq!(remaining, 6);
    assert!(survived);
}

#[test]
fn script_results_are_consumed_in_the_configured_order() {
    let fx = fixture();
    let env = env_for(&fx);
    let e = spawn_enemy(&env, &fx, "e");

    env.bind_class_source(
        "Enemy",
        "enemy_module",
        r#"
        return {
            TakeDamage = function(self, amount)
                return amount < 100, 99
            end,
        }
    "#,
    )
    .unwrap();

    let mut frame = ParamFrame::new(3);
    frame.set(0, Value::Int(50));
    env.invoke_from_native(fx.take_damage, e, &mut frame);

    assert_eq!(frame.slot(2), &Value::Bool(true), "first result is the return");
    assert_eq!(frame.slot(1), &Value::Int(99), "second result is the out slot");
}

#[test]
fn legacy_order_consumes_out_results_first() {
    let fx = fixture();
    let env = ScriptEnv::with_options(
        fx.world.clone(),
        EnvOptions {
            return_order: ReturnOrder::OutsFirst,
            ..Default::default()
        },
    )
    .unwrap();
    let e = spawn_enemy(&env, &fx, "e");

    env.bind_class_source(
        "Enemy",
        "enemy_module",
        r#"
        return {
            TakeDamage = function(self, amount)
                return 99, amount < 100
            end,
        }
    "#,
    )
    .unwrap();

    let mut frame = ParamFrame::new(3);
    frame.set(0, Value::Int(50));
    env.invoke_from_native(fx.take_damage, e, &mut frame);

    assert_eq!(frame.slot(1), &Value::Int(99), "first result is the out slot");
    assert_eq!(frame.slot(2), &Value::Bool(true), "second result is the return");
}

#[test]
fn missing_arguments_fall_back_to_kind_defaults() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    fx.world.borrow_mut().set_property(a, "health", Value::Int(3));

    let result: i64 = env.eval("return a:Heal()").unwrap();
    assert_eq!(result, 3, "a missing amount must default to zero");
}

#[test]
fn a_trailing_return_destination_suppresses_the_result() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    let in_place: bool = env
        .eval(
            r#"
        local dest = a.tags
        local extra = a:CollectTags(dest)
        return extra == nil and dest:Length() == 1
    "#,
        )
        .unwrap();
    assert!(in_place, "the callee must write into the caller's cell");

    let stored = fx.world.borrow().property(a, "tags").unwrap();
    let Value::Array(cell) = stored else {
        panic!("expected array storage");
    };
    assert_eq!(*cell.borrow(), vec![Value::Str("looted".to_string())]);
}

#[test]
fn container_returns_come_back_as_proxies() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    let len: i64 = env.eval("return a:CollectTags():Length()").unwrap();
    assert_eq!(len, 1);

    let tags_len: i64 = env.eval("return a.tags:Length()").unwrap();
    assert_eq!(tags_len, 0, "a plain call must not touch the property");
}

#[test]
fn aliased_out_arguments_skip_the_copy_back() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    let in_place: bool = env
        .eval(
            r#"
        local res = a:FillTags(a.tags)
        return res == nil and a.tags:Length() == 2
    "#,
        )
        .unwrap();
    assert!(in_place, "an aliased out argument is mutated, not returned");

    let fresh: i64 = env.eval("return a:FillTags():Length()").unwrap();
    assert_eq!(fresh, 2, "without an alias the out slot comes back as a result");
}

#[test]
fn replaced_functions_refresh_their_calling_convention() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    let healed: i64 = env.eval("return a:Heal(5)").unwrap();
    assert_eq!(healed, 5);

    fx.world.borrow_mut().db_mut().replace_function(fx.heal, vec![]);

    let is_nil: bool = env.eval("return a:Heal() == nil").unwrap();
    assert!(is_nil, "the replaced function no longer declares a return");
}

// ========================================================================
// LATENT CALLS
// ========================================================================

#[test]
fn latent_calls_complete_through_their_token() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    env.exec(
        r#"a:Travel("north", function(result) arrived = result end)"#,
        "travel",
    )
    .unwrap();
    assert_eq!(env.pending_latents(), 1);
    let token = *fx
        .travel_tokens
        .borrow()
        .last()
        .expect("the native must have seen a token");

    assert!(env.complete_latent(token, &[Value::Str("harbor".to_string())]));
    let arrived: String = env.eval("return arrived").unwrap();
    assert_eq!(arrived, "harbor");
    assert_eq!(env.pending_latents(), 0);

    assert!(
        !env.complete_latent(token, &[]),
        "completing a token twice must be a no-op"
    );
}

#[test]
fn latent_calls_without_a_continuation_still_park() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    env.exec(r#"a:Travel("south")"#, "travel").unwrap();
    assert_eq!(env.pending_latents(), 1);

    let token = *fx.travel_tokens.borrow().last().unwrap();
    assert!(env.complete_latent(token, &[]));
    assert_eq!(env.pending_latents(), 0);
}

#[test]
fn cancelled_latents_never_run_their_continuation() {
    let fx = fixture();
    let env = env_for(&fx);
    spawn_actor(&env, &fx, "a");

    env.exec(
        r#"a:Travel("east", function(result) arrived = result end)"#,
        "travel",
    )
    .unwrap();
    let token = *fx.travel_tokens.borrow().last().unwrap();

    assert!(env.cancel_latent(token));
    assert!(!env.complete_latent(token, &[Value::Str("lost".to_string())]));

    let arrived: bool = env.eval("return arrived == nil").unwrap();
    assert!(arrived, "a cancelled continuation must never run");
}

// ========================================================================
// LIFETIME AND TEARDOWN
// ========================================================================

#[test]
fn destroyed_objects_lose_their_script_binding() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");
    assert!(env.is_object_bound(a));

    fx.world.borrow_mut().destroy_object(a);
    env.pump_host_events();

    assert!(!env.is_object_bound(a));
    assert_eq!(env.bound_objects(), 0);
}

#[test]
fn objects_pending_destroy_cannot_be_bound() {
    let fx = fixture();
    let env = env_for(&fx);
    let id = fx.world.borrow_mut().create_object(fx.actor);

    fx.world.borrow_mut().begin_destroy(id);
    let err = env.handle_for(id).unwrap_err();
    assert!(err.to_string().contains("being destroyed"));
}

#[test]
fn method_calls_on_released_objects_raise() {
    let fx = fixture();
    let env = env_for(&fx);
    let a = spawn_actor(&env, &fx, "a");

    fx.world.borrow_mut().destroy_object(a);

    let err = env.eval::<i64>("return a:Heal(1)").unwrap_err();
    assert!(err.to_string().contains("released object"));
}

#[test]
fn environments_share_the_world_but_not_their_state() {
    let fx = fixture();
    let env1 = env_for(&fx);
    let env2 = env_for(&fx);
    let a = fx.world.borrow_mut().create_object(fx.actor);
    let field = DelegateFieldId::new(a, "OnDamaged");

    for env in [&env1, &env2] {
        let handle = env.handle_for(a).unwrap();
        env.lua().globals().set("a", handle).unwrap();
    }

    env1.exec(
        "a.OnDamaged:Add(a, function(amount) hits = (hits or 0) + 1 end)",
        "add",
    )
    .unwrap();
    assert_eq!(env1.handler_count(&field), 1);
    assert_eq!(env2.handler_count(&field), 0);

    // A broadcast from the second environment fires the first's handler
    // through the shared world slot.
    env2.exec("a.OnDamaged:Broadcast(1)", "broadcast").unwrap();
    let hits: i64 = env1.eval("return hits").unwrap();
    assert_eq!(hits, 1);

    // Tearing down one environment leaves the other's handlers in place.
    drop(env2);
    env1.exec("a.OnDamaged:Broadcast(1)", "broadcast").unwrap();
    let hits: i64 = env1.eval("return hits").unwrap();
    assert_eq!(hits, 2);
}
