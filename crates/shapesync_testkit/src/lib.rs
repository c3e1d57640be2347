//! # shapesync Testkit
//!
//! Test utilities for shapesync.
//!
//! This crate provides:
//! - A simulated source table with a transaction log
//! - Shape streams and a stream factory serving filtered views of it
//! - Fixtures for the partitioned-issues scenario and batch recording
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shapesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_partitioned_shapes() {
//!     let source = issues_source();
//!     let factory = SimulatedShapeFactory::new(Arc::clone(&source));
//!     let stream = MultiShapeStream::with_factory(partitioned_options(10), &factory)?;
//!     // ... commit rows, assert on published batches
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod simulation;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::simulation::*;
}

pub use fixtures::*;
pub use generators::*;
pub use simulation::*;
