//! Change and control messages delivered by a shape's feed.

use crate::error::{ProtocolError, ProtocolResult};
use crate::headers::{self, Headers};
use crate::lsn::Lsn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;

/// Row operation carried by a change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Row entered the shape.
    Insert,
    /// Row changed while staying in the shape.
    Update,
    /// Row left the shape.
    Delete,
}

impl Operation {
    /// Returns the header spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Parses the header spelling.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// Kind of a control message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Control {
    /// The feed has caught up to `global_last_seen_lsn`.
    UpToDate,
    /// The server discarded the shape; the client must refetch it.
    MustRefetch,
    /// Any other control value, passed through untouched.
    Other(String),
}

impl Control {
    /// Returns the header spelling.
    pub fn as_str(&self) -> &str {
        match self {
            Control::UpToDate => "up-to-date",
            Control::MustRefetch => "must-refetch",
            Control::Other(name) => name,
        }
    }

    /// Parses the header spelling.
    pub fn from_name(name: &str) -> Self {
        match name {
            "up-to-date" => Control::UpToDate,
            "must-refetch" => Control::MustRefetch,
            other => Control::Other(other.to_string()),
        }
    }
}

/// A row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// Row key within the shape.
    pub key: String,
    /// Row value.
    pub value: Value,
    /// Message headers.
    pub headers: Headers,
}

impl ChangeMessage {
    /// Creates a change message with the `operation` header set.
    pub fn new(operation: Operation, key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            headers: Headers::new().with(headers::OPERATION, operation.as_str()),
        }
    }

    /// Sets the `lsn` header.
    pub fn with_lsn(mut self, lsn: Lsn) -> Self {
        self.headers.insert(headers::LSN, lsn.to_string());
        self
    }

    /// Sets the `op_position` header.
    pub fn with_op_position(mut self, position: u64) -> Self {
        self.headers.insert(headers::OP_POSITION, position);
        self
    }

    /// Sets the `last` header.
    pub fn with_last(mut self, last: bool) -> Self {
        self.headers.insert(headers::LAST, last);
        self
    }

    /// Returns the row operation.
    pub fn operation(&self) -> Option<Operation> {
        self.headers.operation()
    }

    /// Returns the LSN, treating an absent header as [`Lsn::ZERO`].
    ///
    /// Snapshot rows are emitted before any live change and carry no LSN.
    pub fn lsn_or_zero(&self) -> ProtocolResult<Lsn> {
        Ok(self.headers.lsn()?.unwrap_or(Lsn::ZERO))
    }
}

/// A control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Message headers.
    pub headers: Headers,
}

impl ControlMessage {
    /// Creates an `up-to-date` control at the given LSN.
    pub fn up_to_date(global_last_seen_lsn: Lsn) -> Self {
        Self {
            headers: Headers::new()
                .with(headers::CONTROL, Control::UpToDate.as_str())
                .with(headers::GLOBAL_LAST_SEEN_LSN, global_last_seen_lsn.to_string()),
        }
    }

    /// Creates a `must-refetch` control.
    pub fn must_refetch() -> Self {
        Self {
            headers: Headers::new().with(headers::CONTROL, Control::MustRefetch.as_str()),
        }
    }

    /// Returns the control kind.
    pub fn control(&self) -> Option<Control> {
        self.headers.control()
    }

    /// Returns true for an `up-to-date` control.
    pub fn is_up_to_date(&self) -> bool {
        self.control() == Some(Control::UpToDate)
    }
}

/// A message on a shape's feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// Row change.
    Change(ChangeMessage),
    /// Control signal.
    Control(ControlMessage),
}

impl Message {
    /// Decodes a message from its JSON object form.
    ///
    /// Objects with a `key` are changes; objects whose headers carry
    /// `control` are control messages.
    pub fn from_json(value: Value) -> ProtocolResult<Self> {
        let Value::Object(object) = value else {
            return Err(ProtocolError::InvalidMessage("expected object".into()));
        };
        if object.contains_key("key") {
            let change: ChangeMessage = serde_json::from_value(Value::Object(object))?;
            return Ok(Message::Change(change));
        }
        let control: ControlMessage = serde_json::from_value(Value::Object(object))?;
        if control.headers.get(headers::CONTROL).is_none() {
            return Err(ProtocolError::MissingHeader(headers::CONTROL));
        }
        Ok(Message::Control(control))
    }

    /// Decodes a batch from a JSON array.
    pub fn batch_from_json(text: &str) -> ProtocolResult<Vec<Self>> {
        let values: Vec<Value> = serde_json::from_str(text)?;
        values.into_iter().map(Message::from_json).collect()
    }

    /// Returns the headers.
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Change(change) => &change.headers,
            Message::Control(control) => &control.headers,
        }
    }

    /// Returns the change, if this is one.
    pub fn as_change(&self) -> Option<&ChangeMessage> {
        match self {
            Message::Change(change) => Some(change),
            Message::Control(_) => None,
        }
    }

    /// Returns the control, if this is one.
    pub fn as_control(&self) -> Option<&ControlMessage> {
        match self {
            Message::Change(_) => None,
            Message::Control(control) => Some(control),
        }
    }

    /// Returns true for a row change.
    pub fn is_change(&self) -> bool {
        matches!(self, Message::Change(_))
    }

    /// Returns true for a control message.
    pub fn is_control(&self) -> bool {
        matches!(self, Message::Control(_))
    }
}

impl From<ChangeMessage> for Message {
    fn from(change: ChangeMessage) -> Self {
        Message::Change(change)
    }
}

impl From<ControlMessage> for Message {
    fn from(control: ControlMessage) -> Self {
        Message::Control(control)
    }
}

/// Name of a shape within one coordinator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeKey(String);

impl ShapeKey {
    /// Creates a shape key.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeKey {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ShapeKey {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for ShapeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ShapeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A message tagged with the shape it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiShapeMessage {
    /// Originating shape.
    pub shape: ShapeKey,
    /// The message itself.
    #[serde(flatten)]
    pub message: Message,
}

impl MultiShapeMessage {
    /// Tags a message with its shape.
    pub fn new(shape: ShapeKey, message: Message) -> Self {
        Self { shape, message }
    }

    /// Returns the headers of the inner message.
    pub fn headers(&self) -> &Headers {
        self.message.headers()
    }

    /// Returns the change, if the inner message is one.
    pub fn as_change(&self) -> Option<&ChangeMessage> {
        self.message.as_change()
    }

    /// Returns the control, if the inner message is one.
    pub fn as_control(&self) -> Option<&ControlMessage> {
        self.message.as_control()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_change_message() {
        let message = Message::from_json(json!({
            "key": "\"public\".\"issues\"/\"1\"",
            "value": {"id": "1", "priority": 5},
            "headers": {"operation": "insert", "lsn": "1234", "op_position": 0, "last": true}
        }))
        .unwrap();

        let change = message.as_change().unwrap();
        assert_eq!(change.operation(), Some(Operation::Insert));
        assert_eq!(change.lsn_or_zero().unwrap(), Lsn::new(1234));
        assert_eq!(change.headers.op_position(), Some(0));
        assert!(change.headers.last());
        assert_eq!(change.value["priority"], 5);
    }

    #[test]
    fn decode_control_message() {
        let message = Message::from_json(json!({
            "headers": {"control": "up-to-date", "global_last_seen_lsn": "99"}
        }))
        .unwrap();

        let control = message.as_control().unwrap();
        assert!(control.is_up_to_date());
        assert_eq!(
            control.headers.global_last_seen_lsn().unwrap(),
            Some(Lsn::new(99))
        );
    }

    #[test]
    fn decode_rejects_unknown_shapes() {
        assert!(Message::from_json(json!([])).is_err());
        assert!(matches!(
            Message::from_json(json!({"headers": {}})),
            Err(ProtocolError::MissingHeader("control"))
        ));
        assert!(Message::from_json(json!({"key": "k", "headers": {}})).is_err());
    }

    #[test]
    fn decode_batch() {
        let batch = Message::batch_from_json(
            r#"[
                {"key": "a", "value": {}, "headers": {"operation": "insert"}},
                {"headers": {"control": "up-to-date", "global_last_seen_lsn": "0"}}
            ]"#,
        )
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch[0].is_change());
        assert!(batch[1].is_control());
    }

    #[test]
    fn snapshot_rows_default_to_zero_lsn() {
        let change = ChangeMessage::new(Operation::Insert, "a", json!({"id": "a"}));
        assert_eq!(change.lsn_or_zero().unwrap(), Lsn::ZERO);
        assert_eq!(change.headers.op_position(), None);
    }

    #[test]
    fn tagged_message_serializes_flat() {
        let tagged = MultiShapeMessage::new(
            ShapeKey::from("low"),
            ControlMessage::up_to_date(Lsn::new(7)).into(),
        );
        let value = serde_json::to_value(&tagged).unwrap();
        assert_eq!(value["shape"], "low");
        assert_eq!(value["headers"]["control"], "up-to-date");
        assert_eq!(value["headers"]["global_last_seen_lsn"], "7");
    }
}
