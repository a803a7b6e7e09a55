//! Shared world fixture for the integration tests.
//!
//! Builds a small reflected hierarchy (Entity <- Actor <- Enemy) with the
//! property, function, delegate and latent shapes the tests exercise.

use std::cell::RefCell;
use std::rc::Rc;

use strata_lua::ScriptEnv;
use strata_reflect::{
    FunctionId, HostWorld, LatentToken, ParamDef, PropertyDef, ReflectionDb, SharedWorld, Value,
    ValueKind,
};

pub struct Fixture {
    pub world: SharedWorld,
    pub actor: strata_reflect::ClassId,
    pub enemy: strata_reflect::ClassId,
    pub heal: FunctionId,
    pub take_damage: FunctionId,
    pub describe: FunctionId,
    /// Latent tokens the `Travel` native has received, newest last.
    pub travel_tokens: Rc<RefCell<Vec<LatentToken>>>,
}

pub fn fixture() -> Fixture {
    let mut db = ReflectionDb::new();

    let vec2 = db.add_struct(
        "Vec2",
        vec![
            ("x".to_string(), ValueKind::Float),
            ("y".to_string(), ValueKind::Float),
        ],
    );
    let team = db.add_enum("Team", &[("Neutral", 0), ("Red", 1), ("Blue", 2)]);

    let entity = db.add_class("Entity", None);
    let describe = db.add_function(entity, "Describe", vec![ParamDef::ret(ValueKind::Str)]);
    db.set_native(
        describe,
        Rc::new(|_, target, frame| {
            let label = match target {
                Some(id) => format!("entity {id}"),
                None => "entity".to_string(),
            };
            frame.set(0, Value::Str(label));
        }),
    );

    let actor = db.add_class("Actor", Some(entity));
    db.add_property(actor, PropertyDef::value("health", ValueKind::Int));
    db.add_property(
        actor,
        PropertyDef::value("tags", ValueKind::Array(Box::new(ValueKind::Str))),
    );
    db.add_property(actor, PropertyDef::value("position", ValueKind::Struct(vec2)));
    db.add_property(actor, PropertyDef::value("team", ValueKind::Enum(team)));
    db.add_property(actor, PropertyDef::value("target", ValueKind::Object(actor)));

    let heal = db.add_function(
        actor,
        "Heal",
        vec![
            ParamDef::input("amount", ValueKind::Int),
            ParamDef::ret(ValueKind::Int),
        ],
    );
    db.set_native(
        heal,
        Rc::new(|world, target, frame| {
            let Some(id) = target else { return };
            let amount = frame.slot(0).as_int().unwrap_or(0);
            let mut w = world.borrow_mut();
            let health = w.property(id, "health").and_then(|v| v.as_int()).unwrap_or(0);
            w.set_property(id, "health", Value::Int(health + amount));
            frame.set(1, Value::Int(health + amount));
        }),
    );

    let scored_sig = db.add_function(
        actor,
        "ScoredSignature",
        vec![
            ParamDef::input("points", ValueKind::Int),
            ParamDef::ret(ValueKind::Int),
        ],
    );
    let damaged_sig = db.add_function(
        actor,
        "DamagedSignature",
        vec![ParamDef::input("amount", ValueKind::Int)],
    );
    db.add_property(actor, PropertyDef::delegate("OnScored", scored_sig));
    db.add_property(actor, PropertyDef::multicast("OnDamaged", damaged_sig));

    let travel_tokens = Rc::new(RefCell::new(Vec::new()));
    let travel = db.add_function(
        actor,
        "Travel",
        vec![
            ParamDef::input("destination", ValueKind::Str),
            ParamDef::latent("continuation"),
        ],
    );
    let sink = travel_tokens.clone();
    db.set_native(
        travel,
        Rc::new(move |_, _, frame| {
            if let Value::Latent(token) = frame.slot(1) {
                sink.borrow_mut().push(*token);
            }
        }),
    );

    // Appends one element to its return array, in place. With a caller
    // destination the call produces no Lua results at all.
    let collect_tags = db.add_function(
        actor,
        "CollectTags",
        vec![ParamDef::ret(ValueKind::Array(Box::new(ValueKind::Str)))],
    );
    db.set_native(
        collect_tags,
        Rc::new(|_, _, frame| {
            if let Value::Array(cell) = frame.slot(0) {
                cell.borrow_mut().push(Value::Str("looted".to_string()));
            }
        }),
    );

    let fill_tags = db.add_function(
        actor,
        "FillTags",
        vec![ParamDef::out("bucket", ValueKind::Array(Box::new(ValueKind::Str)))],
    );
    db.set_native(
        fill_tags,
        Rc::new(|_, _, frame| {
            if let Value::Array(cell) = frame.slot(0) {
                let mut items = cell.borrow_mut();
                items.push(Value::Str("alpha".to_string()));
                items.push(Value::Str("beta".to_string()));
            }
        }),
    );

    let spawn = db.add_static_function(
        actor,
        "Spawn",
        vec![ParamDef::ret(ValueKind::Object(actor))],
    );
    db.set_native(
        spawn,
        Rc::new(move |world, _, frame| {
            let id = world.borrow_mut().create_object(actor);
            frame.set(0, Value::Object(id));
        }),
    );

    let enemy = db.add_class("Enemy", Some(actor));
    db.add_property(enemy, PropertyDef::value("armor", ValueKind::Int));
    let take_damage = db.add_function(
        enemy,
        "TakeDamage",
        vec![
            ParamDef::input("amount", ValueKind::Int),
            ParamDef::out("remaining", ValueKind::Int),
            ParamDef::ret(ValueKind::Bool),
        ],
    );
    db.set_native(
        take_damage,
        Rc::new(|world, target, frame| {
            let Some(id) = target else { return };
            let amount = frame.slot(0).as_int().unwrap_or(0);
            let mut w = world.borrow_mut();
            let armor = w.property(id, "armor").and_then(|v| v.as_int()).unwrap_or(0);
            let health = w.property(id, "health").and_then(|v| v.as_int()).unwrap_or(0);
            let health = health - (amount - armor).max(0);
            w.set_property(id, "health", Value::Int(health));
            frame.set(1, Value::Int(health));
            frame.set(2, Value::Bool(health > 0));
        }),
    );

    Fixture {
        world: HostWorld::shared(db),
        actor,
        enemy,
        heal,
        take_damage,
        describe,
        travel_tokens,
    }
}

/// Fresh environment over the fixture's world.
pub fn env_for(fx: &Fixture) -> ScriptEnv {
    ScriptEnv::new(fx.world.clone()).expect("Failed to create script environment")
}
