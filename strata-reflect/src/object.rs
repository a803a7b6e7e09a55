//! Host object instances and their lifetime states.

use std::fmt;

use indexmap::IndexMap;

use crate::class::ClassId;
use crate::delegate::DelegateSlot;
use crate::value::Value;

/// World-unique object identity. Ids are never reused within one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifetime state; transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Alive,
    /// Destruction has begun; the object still exists but must not be
    /// handed out to new holders.
    PendingDestroy,
    Destroyed,
}

/// One live host object.
#[derive(Debug)]
pub struct HostObject {
    pub id: ObjectId,
    pub class: ClassId,
    pub state: ObjectState,
    /// Value properties by name, initialized from class defaults over the
    /// whole inheritance chain.
    pub(crate) properties: IndexMap<String, Value>,
    /// Delegate properties by name.
    pub(crate) delegates: IndexMap<String, DelegateSlot>,
}

impl HostObject {
    pub fn is_alive(&self) -> bool {
        self.state == ObjectState::Alive
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.properties.get_mut(name)
    }

    pub fn delegate(&self, name: &str) -> Option<&DelegateSlot> {
        self.delegates.get(name)
    }

    pub fn delegate_mut(&mut self, name: &str) -> Option<&mut DelegateSlot> {
        self.delegates.get_mut(name)
    }

    /// Names of the delegate properties this object carries.
    pub fn delegate_names(&self) -> impl Iterator<Item = &str> {
        self.delegates.keys().map(String::as_str)
    }
}
