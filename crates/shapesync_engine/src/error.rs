//! Error types for the multi-shape engine.

use crate::subscribers::SubscriptionId;
use shapesync_protocol::{ProtocolError, ShapeKey};
use thiserror::Error;

/// Result type for multi-shape operations.
pub type MultiShapeResult<T> = Result<T, MultiShapeError>;

/// Error type a subscriber callback may return.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by a shape's transport.
///
/// These are produced by the transport, never by the engine, and are handed
/// to subscribers unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// The server answered with an error status.
    #[error("fetch error {status}: {message}")]
    Fetch {
        /// HTTP-like status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Network or transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The stream was aborted by its owner.
    #[error("shape stream aborted")]
    Aborted,
}

/// Errors surfaced by a multi-shape stream.
#[derive(Error, Debug)]
pub enum MultiShapeError {
    /// `start` was called on a stream that already started.
    #[error("cannot start multi-shape stream twice")]
    AlreadyStarted,

    /// A constituent shape stream was started outside the coordinator.
    #[error("shape {0} already started")]
    ShapeAlreadyStarted(ShapeKey),

    /// A shape was configured by options but no factory was supplied.
    #[error("shape {0} is configured by options but no stream factory was given")]
    MissingFactory(ShapeKey),

    /// The stream factory failed to build a shape.
    #[error("failed to build shape {shape}: {message}")]
    Build {
        /// Shape that failed.
        shape: ShapeKey,
        /// Reason reported by the factory.
        message: String,
    },

    /// A shape's transport reported an error.
    #[error("shape {shape}: {source}")]
    Shape {
        /// Shape that failed.
        shape: ShapeKey,
        /// Transport error, unchanged.
        #[source]
        source: ShapeError,
    },

    /// A shape delivered a message that could not be interpreted.
    #[error("malformed message from shape {shape}: {source}")]
    Protocol {
        /// Shape that sent the message.
        shape: ShapeKey,
        /// Decoding failure.
        #[source]
        source: ProtocolError,
    },
}

impl MultiShapeError {
    /// Wraps a protocol error with the shape it came from.
    pub fn protocol(shape: &ShapeKey, source: ProtocolError) -> Self {
        Self::Protocol {
            shape: shape.clone(),
            source,
        }
    }

    /// Returns true for errors caused by misuse of the API.
    ///
    /// These are returned synchronously and never reach subscribers.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            MultiShapeError::AlreadyStarted
                | MultiShapeError::ShapeAlreadyStarted(_)
                | MultiShapeError::MissingFactory(_)
                | MultiShapeError::Build { .. }
        )
    }

    /// Returns the shape the error relates to, if any.
    pub fn shape(&self) -> Option<&ShapeKey> {
        match self {
            MultiShapeError::AlreadyStarted => None,
            MultiShapeError::ShapeAlreadyStarted(shape) | MultiShapeError::MissingFactory(shape) => {
                Some(shape)
            }
            MultiShapeError::Build { shape, .. }
            | MultiShapeError::Shape { shape, .. }
            | MultiShapeError::Protocol { shape, .. } => Some(shape),
        }
    }
}

/// A subscriber callback that did not complete normally.
///
/// Failures are isolated from the other subscribers and handed to the
/// stream's failure hook once the fan-out of the batch has finished.
#[derive(Error, Debug)]
pub enum SubscriberFailure {
    /// The callback returned an error.
    #[error("subscriber {id} failed: {source}")]
    Failed {
        /// Subscription whose callback failed.
        id: SubscriptionId,
        /// Returned error.
        source: SubscriberError,
    },

    /// The callback panicked.
    #[error("subscriber {id} panicked: {message}")]
    Panicked {
        /// Subscription whose callback panicked.
        id: SubscriptionId,
        /// Panic payload, if it was a string.
        message: String,
    },
}

impl SubscriberFailure {
    /// Returns the subscription that failed.
    pub fn id(&self) -> SubscriptionId {
        match self {
            SubscriberFailure::Failed { id, .. } | SubscriberFailure::Panicked { id, .. } => *id,
        }
    }
}
