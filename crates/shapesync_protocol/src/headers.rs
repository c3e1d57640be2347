//! Message headers.
//!
//! Headers arrive as a loosely typed JSON object. The accessors here are the
//! only place the engine reads them, and they refuse to coerce malformed LSNs.

use crate::error::{ProtocolError, ProtocolResult};
use crate::lsn::Lsn;
use crate::messages::{Control, Operation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Header carrying the LSN of a change.
pub const LSN: &str = "lsn";
/// Header carrying the position of a change inside its transaction.
pub const OP_POSITION: &str = "op_position";
/// Header marking the final change of a transaction within one shape.
pub const LAST: &str = "last";
/// Header carrying the LSN a shape has caught up to.
pub const GLOBAL_LAST_SEEN_LSN: &str = "global_last_seen_lsn";
/// Header naming a control message.
pub const CONTROL: &str = "control";
/// Header naming the row operation of a change.
pub const OPERATION: &str = "operation";

/// Headers attached to a change or control message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Map<String, Value>);

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Sets a header, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Sets a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns a raw header value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Returns the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// The `lsn` header, if present.
    pub fn lsn(&self) -> ProtocolResult<Option<Lsn>> {
        self.lsn_field(LSN)
    }

    /// The `global_last_seen_lsn` header, if present.
    pub fn global_last_seen_lsn(&self) -> ProtocolResult<Option<Lsn>> {
        self.lsn_field(GLOBAL_LAST_SEEN_LSN)
    }

    /// The `op_position` header.
    ///
    /// Snapshot rows carry none; a non-integer value is treated as absent.
    pub fn op_position(&self) -> Option<u64> {
        self.0.get(OP_POSITION).and_then(Value::as_u64)
    }

    /// The `last` header, false when absent or not a boolean.
    pub fn last(&self) -> bool {
        self.0.get(LAST).and_then(Value::as_bool).unwrap_or(false)
    }

    /// The `control` header.
    pub fn control(&self) -> Option<Control> {
        self.0.get(CONTROL).and_then(Value::as_str).map(Control::from_name)
    }

    /// The `operation` header.
    pub fn operation(&self) -> Option<Operation> {
        self.0
            .get(OPERATION)
            .and_then(Value::as_str)
            .and_then(Operation::from_name)
    }

    fn lsn_field(&self, field: &'static str) -> ProtocolResult<Option<Lsn>> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Lsn::parse(field, text).map(Some),
            Some(Value::Number(number)) => number
                .as_u64()
                .map(|value| Some(Lsn::new(value)))
                .ok_or_else(|| ProtocolError::invalid_lsn(field, number)),
            Some(other) => Err(ProtocolError::invalid_lsn(field, other)),
        }
    }
}

impl From<Map<String, Value>> for Headers {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
