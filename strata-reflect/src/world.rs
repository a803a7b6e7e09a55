//! The host object world: object arena, lifetime notifications, and the
//! native call dispatch the binding layer plugs into.
//!
//! Lifetime events are fanned out over channels so a consumer on another
//! thread of control can drain them at a safe point instead of being
//! called back mid-mutation.

use std::cell::RefCell;
use std::rc::Rc;

use async_channel::{Receiver, Sender};
use log::{debug, warn};

use crate::class::ClassId;
use crate::delegate::{DelegateFieldId, DelegateSlot, DelegateTarget};
use crate::function::FunctionId;
use crate::object::{HostObject, ObjectId, ObjectState};
use crate::registry::ReflectionDb;
use crate::value::{ParamFrame, Value, ValueKind};

/// Object lifetime notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectEvent {
    Created(ObjectId),
    PendingDestroy(ObjectId),
    Destroyed(ObjectId),
}

/// Shared handle to a world. Everything that re-enters the world during a
/// call (native implementations, delegate targets) goes through this.
pub type SharedWorld = Rc<RefCell<HostWorld>>;

/// One host application instance: reflection metadata plus live objects.
pub struct HostWorld {
    db: ReflectionDb,
    objects: std::collections::HashMap<ObjectId, HostObject>,
    next_object: u64,
    listeners: Vec<Sender<ObjectEvent>>,
}

impl HostWorld {
    pub fn new(db: ReflectionDb) -> Self {
        Self {
            db,
            objects: std::collections::HashMap::new(),
            next_object: 1,
            listeners: Vec::new(),
        }
    }

    /// Wrap a database into a shared world handle.
    pub fn shared(db: ReflectionDb) -> SharedWorld {
        Rc::new(RefCell::new(Self::new(db)))
    }

    pub fn db(&self) -> &ReflectionDb {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut ReflectionDb {
        &mut self.db
    }

    /// Subscribe to lifetime events. The receiver sees every event emitted
    /// after this call, in emission order.
    pub fn subscribe(&mut self) -> Receiver<ObjectEvent> {
        let (tx, rx) = async_channel::unbounded();
        self.listeners.push(tx);
        rx
    }

    fn notify(&mut self, event: ObjectEvent) {
        self.listeners.retain(|tx| tx.try_send(event).is_ok());
    }

    // ==================== Objects ====================

    /// Create an object of `class`, initializing property storage from
    /// class defaults over the whole inheritance chain.
    pub fn create_object(&mut self, class: ClassId) -> ObjectId {
        let id = ObjectId(self.next_object);
        self.next_object += 1;

        let (properties, delegates) = self.db.instantiate_storage(class);
        self.objects.insert(
            id,
            HostObject {
                id,
                class,
                state: ObjectState::Alive,
                properties,
                delegates,
            },
        );
        debug!("created object {id} of class '{}'", self.db.class(class).name);
        self.notify(ObjectEvent::Created(id));
        id
    }

    /// Move an object to `PendingDestroy`. Returns false if it does not
    /// exist or destruction already began.
    pub fn begin_destroy(&mut self, id: ObjectId) -> bool {
        match self.objects.get_mut(&id) {
            Some(obj) if obj.state == ObjectState::Alive => {
                obj.state = ObjectState::PendingDestroy;
                self.notify(ObjectEvent::PendingDestroy(id));
                true
            }
            _ => false,
        }
    }

    /// Destroy an object outright, releasing its storage. Returns false if
    /// it does not exist.
    pub fn finish_destroy(&mut self, id: ObjectId) -> bool {
        if self.objects.remove(&id).is_none() {
            return false;
        }
        debug!("destroyed object {id}");
        self.notify(ObjectEvent::Destroyed(id));
        true
    }

    /// Full destruction: pending-destroy notification followed by the
    /// destroyed notification.
    pub fn destroy_object(&mut self, id: ObjectId) -> bool {
        self.begin_destroy(id);
        self.finish_destroy(id)
    }

    pub fn state(&self, id: ObjectId) -> Option<ObjectState> {
        self.objects.get(&id).map(|o| o.state)
    }

    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.state(id) == Some(ObjectState::Alive)
    }

    pub fn object(&self, id: ObjectId) -> Option<&HostObject> {
        self.objects.get(&id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut HostObject> {
        self.objects.get_mut(&id)
    }

    pub fn class_of(&self, id: ObjectId) -> Option<ClassId> {
        self.objects.get(&id).map(|o| o.class)
    }

    pub fn object_is_a(&self, id: ObjectId, ancestor: ClassId) -> bool {
        match self.class_of(id) {
            Some(class) => self.db.is_a(class, ancestor),
            None => false,
        }
    }

    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    // ==================== Properties ====================

    /// Read a property value. Shared payloads come back as the same cell,
    /// so mutations through the result are visible in the object.
    pub fn property(&self, id: ObjectId, name: &str) -> Option<Value> {
        self.objects.get(&id).and_then(|o| o.property(name).cloned())
    }

    /// Declared kind of a value property, over the inheritance chain.
    pub fn property_kind(&self, id: ObjectId, name: &str) -> Option<ValueKind> {
        let class = self.class_of(id)?;
        match &self.db.find_property(class, name)?.kind {
            crate::property::PropertyKind::Value { kind, .. } => Some(kind.clone()),
            crate::property::PropertyKind::Delegate { .. } => None,
        }
    }

    /// Write a property value after shape-checking it against the declared
    /// kind. Object references additionally check class compatibility.
    /// Returns false (and warns) on mismatch or a missing property.
    pub fn set_property(&mut self, id: ObjectId, name: &str, value: Value) -> bool {
        let Some(class) = self.class_of(id) else {
            warn!("set_property: no object {id}");
            return false;
        };
        let Some(kind) = ({
            match self.db.find_property(class, name).map(|p| &p.kind) {
                Some(crate::property::PropertyKind::Value { kind, .. }) => Some(kind.clone()),
                _ => None,
            }
        }) else {
            warn!("set_property: '{name}' is not a value property of {id}");
            return false;
        };

        if !self.db.value_matches(&value, &kind) {
            warn!(
                "set_property: {} does not fit '{name}' ({})",
                value.kind_name(),
                kind.describe()
            );
            return false;
        }
        if let (Value::Object(target), ValueKind::Object(required)) = (&value, &kind) {
            if !self.object_is_a(*target, *required) {
                warn!("set_property: object {target} is not a '{}'", self.db.class(*required).name);
                return false;
            }
        }

        match self.objects.get_mut(&id).and_then(|o| o.property_mut(name)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    // ==================== Delegate slots ====================

    /// Signature and multicast flag of a delegate field, if the object is
    /// still around and declares it.
    pub fn delegate_signature(&self, field: &DelegateFieldId) -> Option<(FunctionId, bool)> {
        self.objects
            .get(&field.object)
            .and_then(|o| o.delegate(&field.property))
            .map(|slot| (slot.signature(), slot.is_multicast()))
    }

    pub fn slot(&self, field: &DelegateFieldId) -> Option<&DelegateSlot> {
        self.objects
            .get(&field.object)
            .and_then(|o| o.delegate(&field.property))
    }

    pub fn slot_mut(&mut self, field: &DelegateFieldId) -> Option<&mut DelegateSlot> {
        self.objects
            .get_mut(&field.object)
            .and_then(|o| o.delegate_mut(&field.property))
    }
}

/// The host's calling mechanism for reflected functions.
///
/// Interface declarations are re-resolved by name on the target's concrete
/// class. A script override hook, when installed, takes precedence over
/// the native implementation; with neither present the call is a silent
/// no-op (script-only events fall out of this naturally).
pub fn process_event(
    world: &SharedWorld,
    target: Option<ObjectId>,
    function: FunctionId,
    frame: &mut ParamFrame,
) {
    let resolved = {
        let w = world.borrow();
        if let Some(id) = target {
            if !w.is_alive(id) {
                warn!(
                    "process_event: dropping call to '{}' on dead object {id}",
                    w.db.function(function).name
                );
                return;
            }
        }

        let def = w.db.function(function);
        let mut callee = function;
        if w.db.class(def.owner).is_interface {
            if let Some(id) = target {
                match w
                    .class_of(id)
                    .and_then(|class| w.db.find_function(class, &def.name))
                {
                    Some(found) => callee = found,
                    None => {
                        warn!(
                            "process_event: {id} does not implement interface function '{}'",
                            def.name
                        );
                        return;
                    }
                }
            }
        }

        let def = w.db.function(callee);
        (callee, def.hook.clone(), def.native.clone())
    };

    let (callee, hook, native) = resolved;
    if let Some(hook) = hook {
        hook(target, frame);
    } else if let Some(native) = native {
        native(world, target, frame);
    } else {
        debug!("process_event: {callee} has no implementation, skipping");
    }
}

/// Invoke a function's native implementation directly, bypassing any
/// script hook. Returns whether a native implementation existed.
pub fn call_native_direct(
    world: &SharedWorld,
    function: FunctionId,
    target: Option<ObjectId>,
    frame: &mut ParamFrame,
) -> bool {
    let native = { world.borrow().db.function(function).native.clone() };
    match native {
        Some(native) => {
            native(world, target, frame);
            true
        }
        None => false,
    }
}

/// Fire a delegate field: snapshot its targets, then invoke each live one
/// in registration order with the given frame. Targets may re-enter the
/// world (including mutating this very slot); such mutations affect later
/// fires only. Returns the number of targets invoked.
pub fn fire_delegate(world: &SharedWorld, field: &DelegateFieldId, frame: &mut ParamFrame) -> usize {
    let targets: Vec<Rc<dyn DelegateTarget>> = {
        let w = world.borrow();
        let Some(obj) = w.object(field.object) else {
            warn!("fire_delegate: no object behind {field}");
            return 0;
        };
        if !obj.is_alive() {
            warn!("fire_delegate: {field} fired on an object being destroyed");
            return 0;
        }
        match obj.delegate(&field.property) {
            Some(slot) => slot.snapshot(),
            None => {
                warn!("fire_delegate: {field} is not a delegate property");
                return 0;
            }
        }
    };

    let mut fired = 0;
    for target in targets {
        if !target.is_alive() {
            continue;
        }
        target.invoke(frame);
        fired += 1;
    }
    fired
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::property::{ParamDef, PropertyDef};

    fn world_with_classes() -> (SharedWorld, ClassId, ClassId) {
        let mut db = ReflectionDb::new();
        let base = db.add_class("Base", None);
        db.add_property(base, PropertyDef::value("health", ValueKind::Int));
        let leaf = db.add_class("Leaf", Some(base));
        db.add_property(leaf, PropertyDef::value("name", ValueKind::Str));
        (HostWorld::shared(db), base, leaf)
    }

    #[test]
    fn object_storage_includes_inherited_properties() {
        let (world, _, leaf) = world_with_classes();
        let id = world.borrow_mut().create_object(leaf);

        let w = world.borrow();
        assert_eq!(w.property(id, "health"), Some(Value::Int(0)));
        assert_eq!(w.property(id, "name"), Some(Value::Str(String::new())));
    }

    #[test]
    fn lifetime_events_arrive_in_order() {
        let (world, _, leaf) = world_with_classes();
        let rx = world.borrow_mut().subscribe();

        let id = world.borrow_mut().create_object(leaf);
        world.borrow_mut().destroy_object(id);

        assert_eq!(rx.try_recv(), Ok(ObjectEvent::Created(id)));
        assert_eq!(rx.try_recv(), Ok(ObjectEvent::PendingDestroy(id)));
        assert_eq!(rx.try_recv(), Ok(ObjectEvent::Destroyed(id)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn begin_destroy_blocks_reentry() {
        let (world, _, leaf) = world_with_classes();
        let id = world.borrow_mut().create_object(leaf);

        assert!(world.borrow_mut().begin_destroy(id));
        assert!(!world.borrow_mut().begin_destroy(id));
        assert_eq!(world.borrow().state(id), Some(ObjectState::PendingDestroy));
        assert!(!world.borrow().is_alive(id));

        assert!(world.borrow_mut().finish_destroy(id));
        assert_eq!(world.borrow().state(id), None);
    }

    #[test]
    fn set_property_rejects_wrong_kind() {
        let (world, _, leaf) = world_with_classes();
        let id = world.borrow_mut().create_object(leaf);

        assert!(world.borrow_mut().set_property(id, "health", Value::Int(7)));
        assert!(!world
            .borrow_mut()
            .set_property(id, "health", Value::Str("nope".into())));
        assert_eq!(world.borrow().property(id, "health"), Some(Value::Int(7)));
    }

    #[test]
    fn process_event_prefers_hook_over_native() {
        let (world, base, _) = world_with_classes();
        let f = {
            let mut w = world.borrow_mut();
            let f = w.db_mut().add_function(base, "Act", vec![]);
            let native_runs = Rc::new(Cell::new(0));
            let counter = native_runs.clone();
            w.db_mut()
                .set_native(f, Rc::new(move |_, _, _| counter.set(counter.get() + 1)));
            f
        };
        let id = world.borrow_mut().create_object(base);

        let hook_runs = Rc::new(Cell::new(0));
        let counter = hook_runs.clone();
        world
            .borrow_mut()
            .db_mut()
            .set_hook(f, Some(Rc::new(move |_, _| counter.set(counter.get() + 1))));

        let mut frame = ParamFrame::new(0);
        process_event(&world, Some(id), f, &mut frame);
        assert_eq!(hook_runs.get(), 1);

        world.borrow_mut().db_mut().set_hook(f, None);
        process_event(&world, Some(id), f, &mut frame);
        assert_eq!(hook_runs.get(), 1);
    }

    #[test]
    fn interface_call_resolves_on_concrete_class() {
        let mut db = ReflectionDb::new();
        let iface = db.add_interface("Interactable");
        let decl = db.add_function(iface, "Use", vec![ParamDef::out("n", ValueKind::Int)]);

        let class = db.add_class("Door", None);
        let implementation = db.add_function(class, "Use", vec![ParamDef::out("n", ValueKind::Int)]);
        db.set_native(
            implementation,
            Rc::new(|_, _, frame| frame.set(0, Value::Int(42))),
        );

        let world = HostWorld::shared(db);
        let id = world.borrow_mut().create_object(class);

        let mut frame = ParamFrame::new(1);
        process_event(&world, Some(id), decl, &mut frame);
        assert_eq!(frame.slot(0), &Value::Int(42));
    }

    #[test]
    fn fire_delegate_skips_missing_slots() {
        let (world, _, leaf) = world_with_classes();
        let id = world.borrow_mut().create_object(leaf);
        let field = DelegateFieldId::new(id, "OnNothing");
        let mut frame = ParamFrame::new(0);
        assert_eq!(fire_delegate(&world, &field, &mut frame), 0);
    }
}
