//! Configuration for multi-shape streams.

use crate::shape::ShapeStream;
use shapesync_protocol::ShapeKey;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default delay before lagging shapes are forced to refresh.
pub const DEFAULT_CHECK_FOR_UPDATES_AFTER: Duration = Duration::from_millis(100);

/// Options describing one shape for a [`ShapeStreamFactory`](crate::ShapeStreamFactory).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShapeOptions {
    /// Shape endpoint URL.
    pub url: String,
    /// Source table.
    pub table: String,
    /// Row filter.
    pub where_clause: Option<String>,
    /// Column subset, all columns when `None`.
    pub columns: Option<Vec<String>>,
    /// Extra transport parameters.
    pub params: BTreeMap<String, String>,
}

impl ShapeOptions {
    /// Creates options for a table behind a URL.
    pub fn new(url: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: table.into(),
            ..Self::default()
        }
    }

    /// Sets the row filter.
    pub fn with_where(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    /// Restricts the shape to some columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a transport parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Where a shape's stream comes from.
#[derive(Clone)]
pub enum ShapeSource {
    /// A stream built by the caller. It is shared: the coordinator neither
    /// starts it on construction nor tears it down.
    Stream(Arc<dyn ShapeStream>),
    /// Options for a stream the coordinator builds unstarted and owns.
    Options(ShapeOptions),
}

impl fmt::Debug for ShapeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeSource::Stream(_) => f.write_str("Stream(..)"),
            ShapeSource::Options(options) => f.debug_tuple("Options").field(options).finish(),
        }
    }
}

/// Configuration for a multi-shape stream.
#[derive(Debug, Clone)]
pub struct MultiShapeOptions {
    /// Shapes by key.
    pub shapes: BTreeMap<ShapeKey, ShapeSource>,
    /// Start the stream on construction.
    pub start: bool,
    /// Delay between new data arriving and the lag check.
    pub check_for_updates_after: Duration,
}

impl MultiShapeOptions {
    /// Creates options with no shapes.
    pub fn new() -> Self {
        Self {
            shapes: BTreeMap::new(),
            start: true,
            check_for_updates_after: DEFAULT_CHECK_FOR_UPDATES_AFTER,
        }
    }

    /// Adds a shape.
    pub fn with_shape(mut self, key: impl Into<ShapeKey>, source: ShapeSource) -> Self {
        self.shapes.insert(key.into(), source);
        self
    }

    /// Adds a shape backed by an existing stream.
    pub fn with_stream(self, key: impl Into<ShapeKey>, stream: Arc<dyn ShapeStream>) -> Self {
        self.with_shape(key, ShapeSource::Stream(stream))
    }

    /// Adds a shape the coordinator builds from options.
    pub fn with_options(self, key: impl Into<ShapeKey>, options: ShapeOptions) -> Self {
        self.with_shape(key, ShapeSource::Options(options))
    }

    /// Sets whether the stream starts on construction.
    pub fn with_start(mut self, start: bool) -> Self {
        self.start = start;
        self
    }

    /// Sets the lag check delay.
    pub fn with_check_for_updates_after(mut self, delay: Duration) -> Self {
        self.check_for_updates_after = delay;
        self
    }
}

impl Default for MultiShapeOptions {
    fn default() -> Self {
        Self::new()
    }
}
