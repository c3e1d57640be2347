//! # shapesync Protocol
//!
//! Message types for shape change feeds.
//!
//! This crate provides:
//! - `Lsn` and `LsnMark` with the ordering helpers the engine needs
//! - Change and control messages, and their shape-tagged form
//! - Typed access to message headers
//!
//! This is a pure protocol crate with no I/O operations. It does not define a
//! wire format; it only interprets the headers a shape transport hands over.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod headers;
mod lsn;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use headers::Headers;
pub use lsn::{Lsn, LsnMark};
pub use messages::{
    ChangeMessage, Control, ControlMessage, Message, MultiShapeMessage, Operation, ShapeKey,
};
