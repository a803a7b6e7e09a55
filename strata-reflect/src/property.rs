//! Property and parameter descriptors.
//!
//! Parameters carry direction flags that drive the calling convention:
//! plain inputs, const references, non-const references (copied back to the
//! caller after the call) and the return slot.

use bitflags::bitflags;

use crate::function::FunctionId;
use crate::value::{Value, ValueKind};

bitflags! {
    /// Direction and qualification of one function parameter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParamFlags: u8 {
        const CONST = 1 << 0;
        /// Non-const reference: the callee's final value is copied back out.
        const OUT = 1 << 1;
        const REFERENCE = 1 << 2;
        /// The function's return slot.
        const RETURN = 1 << 3;
    }
}

/// One parameter of a reflected function, in declaration order.
#[derive(Debug, Clone)]
pub struct ParamDef {
    pub name: String,
    pub kind: ValueKind,
    pub flags: ParamFlags,
}

impl ParamDef {
    /// Plain input parameter.
    pub fn input(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            flags: ParamFlags::empty(),
        }
    }

    /// Const reference parameter; never copied back.
    pub fn const_ref(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            flags: ParamFlags::CONST | ParamFlags::REFERENCE,
        }
    }

    /// Non-const reference parameter (an "out" parameter).
    pub fn out(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            flags: ParamFlags::OUT | ParamFlags::REFERENCE,
        }
    }

    /// Return slot.
    pub fn ret(kind: ValueKind) -> Self {
        Self {
            name: "__return".to_string(),
            kind,
            flags: ParamFlags::RETURN,
        }
    }

    /// Latent continuation slot.
    pub fn latent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ValueKind::Latent,
            flags: ParamFlags::empty(),
        }
    }

    pub fn is_return(&self) -> bool {
        self.flags.contains(ParamFlags::RETURN)
    }

    /// Out parameters exclude the return slot by construction.
    pub fn is_out(&self) -> bool {
        self.flags.contains(ParamFlags::OUT) && !self.is_return()
    }

    pub fn is_latent(&self) -> bool {
        matches!(self.kind, ValueKind::Latent)
    }
}

/// What a class property holds.
#[derive(Debug, Clone)]
pub enum PropertyKind {
    /// A regular value slot with its initial value.
    Value { kind: ValueKind, default: Value },
    /// A delegate slot; `signature` names the reflected function shape its
    /// targets must match.
    Delegate {
        signature: FunctionId,
        multicast: bool,
    },
}

/// One declared property of a class.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub kind: PropertyKind,
}

impl PropertyDef {
    pub fn value(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Value {
                kind,
                default: Value::Empty,
            },
        }
    }

    /// Value property with an explicit initial value.
    ///
    /// Shared-cell defaults are deep-cloned per object at construction so
    /// instances never alias each other's storage.
    pub fn value_with_default(name: &str, kind: ValueKind, default: Value) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Value { kind, default },
        }
    }

    /// Single-cast delegate property.
    pub fn delegate(name: &str, signature: FunctionId) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Delegate {
                signature,
                multicast: false,
            },
        }
    }

    /// Multicast delegate property.
    pub fn multicast(name: &str, signature: FunctionId) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyKind::Delegate {
                signature,
                multicast: true,
            },
        }
    }

    pub fn is_delegate(&self) -> bool {
        matches!(self.kind, PropertyKind::Delegate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_excludes_return() {
        let p = ParamDef::ret(ValueKind::Int);
        assert!(p.is_return());
        assert!(!p.is_out());

        let q = ParamDef::out("count", ValueKind::Int);
        assert!(q.is_out());
        assert!(!q.is_return());
    }

    #[test]
    fn latent_param_has_latent_kind() {
        let p = ParamDef::latent("continuation");
        assert!(p.is_latent());
        assert!(!p.is_out());
    }
}
