//! The identity queries and saves run as.

use std::fmt;

use warden_proto::Value;

/// An opaque, already-authenticated identity.
///
/// Rules may compare it for equality (usually through `$principal`); its
/// structure is never inspected by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal(Value);

impl Principal {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    /// Principal with no identity.
    pub fn anonymous() -> Self {
        Self(Value::Null)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Value> for Principal {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
