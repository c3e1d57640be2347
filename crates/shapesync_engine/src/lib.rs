//! # shapesync Engine
//!
//! Coordinates several shape change feeds as one stream.
//!
//! This crate provides:
//! - The `ShapeStream` contract a per-shape transport implements
//! - `MultiShapeStream`, which tags and fans out every shape's batches
//! - A debounced lag monitor that forces lagging shapes to refresh
//! - `TransactionalMultiShapeStream`, which publishes whole transactions
//!
//! ## Architecture
//!
//! Each shape delivers ordered batches to a handler owned by the
//! coordinator. The handler:
//! 1. Records the highest data and up-to-date LSNs in the ledger
//! 2. Arms the lag check when the data LSN advanced
//! 3. Tags the batch with its shape and hands it to the subscribers
//!
//! ## Key Invariants
//!
//! - Per-shape LSN marks never decrease
//! - A coordinator starts at most once
//! - At most one lag check is pending per coordinator
//! - A failing subscriber never blocks delivery to the others
//! - Transactional batches are released in LSN order

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod ledger;
mod monitor;
mod reassembler;
mod shape;
mod stream;
mod subscribers;
mod transactional;

pub use config::{MultiShapeOptions, ShapeOptions, ShapeSource, DEFAULT_CHECK_FOR_UPDATES_AFTER};
pub use error::{MultiShapeError, MultiShapeResult, ShapeError, SubscriberError, SubscriberFailure};
pub use ledger::{LsnLedger, ShapeLsns};
pub use reassembler::TransactionReassembler;
pub use shape::{
    BatchHandler, MockShapeStream, ShapeErrorHandler, ShapeHandlers, ShapeStatus, ShapeStream,
    ShapeStreamFactory, Unsubscribe,
};
pub use stream::MultiShapeStream;
pub use subscribers::{
    log_failure, BatchCallback, ErrorCallback, FailureHook, Subscription, SubscriptionId,
};
pub use transactional::TransactionalMultiShapeStream;
