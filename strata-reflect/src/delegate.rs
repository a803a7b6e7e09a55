//! Delegate slots: callback registrations on host objects.
//!
//! A slot only knows how to call [`DelegateTarget`]s, the native-shaped
//! callback interface. What those targets actually do (for instance,
//! re-entering a scripting runtime) is none of the slot's business.

use std::fmt;
use std::rc::Rc;

use crate::function::FunctionId;
use crate::object::ObjectId;
use crate::value::ParamFrame;

/// Identifies one delegate property instance on one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DelegateFieldId {
    pub object: ObjectId,
    pub property: String,
}

impl DelegateFieldId {
    pub fn new(object: ObjectId, property: impl Into<String>) -> Self {
        Self {
            object,
            property: property.into(),
        }
    }
}

impl fmt::Display for DelegateFieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.property)
    }
}

/// Native-shaped callback target a delegate slot can invoke.
pub trait DelegateTarget {
    /// Stable identity used for detach bookkeeping.
    fn target_key(&self) -> u64;

    /// Dead targets are skipped on fire and may be pruned at any time.
    fn is_alive(&self) -> bool;

    /// Invoke with the delegate signature's parameter frame. Out and return
    /// slots may be written back into the frame.
    fn invoke(&self, frame: &mut ParamFrame);
}

/// One delegate property's registration state.
///
/// Single-cast slots hold at most one target; multicast slots hold any
/// number, fired in registration order.
pub struct DelegateSlot {
    signature: FunctionId,
    multicast: bool,
    targets: Vec<Rc<dyn DelegateTarget>>,
}

impl DelegateSlot {
    pub fn new(signature: FunctionId, multicast: bool) -> Self {
        Self {
            signature,
            multicast,
            targets: Vec::new(),
        }
    }

    pub fn signature(&self) -> FunctionId {
        self.signature
    }

    pub fn is_multicast(&self) -> bool {
        self.multicast
    }

    pub fn is_bound(&self) -> bool {
        !self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Install as the sole target, displacing any previous one.
    pub fn bind(&mut self, target: Rc<dyn DelegateTarget>) {
        self.targets.clear();
        self.targets.push(target);
    }

    /// Append a target, keeping existing registrations.
    pub fn add(&mut self, target: Rc<dyn DelegateTarget>) {
        self.targets.push(target);
    }

    /// Detach the first target with the given key. Returns whether one was
    /// found.
    pub fn remove(&mut self, key: u64) -> bool {
        if let Some(pos) = self.targets.iter().position(|t| t.target_key() == key) {
            self.targets.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }

    /// Drop targets that report themselves dead. Returns how many were
    /// removed.
    pub fn prune_dead(&mut self) -> usize {
        let before = self.targets.len();
        self.targets.retain(|t| t.is_alive());
        before - self.targets.len()
    }

    /// Snapshot the current target list for firing. Mutations made while
    /// iterating the snapshot affect later fires only.
    pub fn snapshot(&self) -> Vec<Rc<dyn DelegateTarget>> {
        self.targets.clone()
    }
}

impl fmt::Debug for DelegateSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateSlot")
            .field("signature", &self.signature)
            .field("multicast", &self.multicast)
            .field("targets", &self.targets.len())
            .finish()
    }
}
