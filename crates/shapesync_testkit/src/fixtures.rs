//! Test fixtures for the partitioned-issues scenario.
//!
//! An `issues` table is split into two shapes by priority. Rows at or below
//! the threshold belong to [`LOW_SHAPE`], the rest to [`HIGH_SHAPE`].

use crate::simulation::{Comparison, Predicate, SimulatedShapeStream, SimulatedSource, SimulationConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};
use shapesync_engine::{
    MultiShapeError, MultiShapeOptions, MultiShapeResult, MultiShapeStream, ShapeOptions,
    ShapeStream, SubscriberError, Subscription,
};
use shapesync_protocol::{ChangeMessage, MultiShapeMessage};
use std::sync::Arc;
use std::time::Duration;

/// Table used by the fixtures.
pub const ISSUES_TABLE: &str = "issues";

/// URL placed in fixture shape options.
pub const SHAPE_URL: &str = "http://localhost:3000/v1/shape";

/// Key of the low-priority shape.
pub const LOW_SHAPE: &str = "low";

/// Key of the high-priority shape.
pub const HIGH_SHAPE: &str = "high";

/// Builds an issue row.
pub fn issue(id: u64, priority: i64, title: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "priority": priority,
    })
}

/// An empty `issues` source with default timing.
pub fn issues_source() -> Arc<SimulatedSource> {
    Arc::new(SimulatedSource::new(ISSUES_TABLE))
}

/// An empty `issues` source with the given timing.
pub fn issues_source_with(config: SimulationConfig) -> Arc<SimulatedSource> {
    Arc::new(SimulatedSource::with_config(ISSUES_TABLE, config))
}

fn low_clause(threshold: i64) -> String {
    format!("priority <= {threshold}")
}

fn high_clause(threshold: i64) -> String {
    format!("priority > {threshold}")
}

/// Options for the two partitioned shapes, built through a factory.
pub fn partitioned_options(threshold: i64) -> MultiShapeOptions {
    MultiShapeOptions::new()
        .with_options(
            LOW_SHAPE,
            ShapeOptions::new(SHAPE_URL, ISSUES_TABLE).with_where(low_clause(threshold)),
        )
        .with_options(
            HIGH_SHAPE,
            ShapeOptions::new(SHAPE_URL, ISSUES_TABLE).with_where(high_clause(threshold)),
        )
}

/// The two partitioned shape streams, unstarted.
pub fn partitioned_streams(
    source: &Arc<SimulatedSource>,
    threshold: i64,
) -> (Arc<SimulatedShapeStream>, Arc<SimulatedShapeStream>) {
    let priority = |op| Predicate::Compare {
        column: "priority".to_string(),
        op,
        value: threshold,
    };
    (
        Arc::new(SimulatedShapeStream::new(
            LOW_SHAPE,
            Arc::clone(source),
            priority(Comparison::Le),
        )),
        Arc::new(SimulatedShapeStream::new(
            HIGH_SHAPE,
            Arc::clone(source),
            priority(Comparison::Gt),
        )),
    )
}

/// Options over already-built partitioned streams.
pub fn shared_partitioned_options(
    low: &Arc<SimulatedShapeStream>,
    high: &Arc<SimulatedShapeStream>,
) -> MultiShapeOptions {
    MultiShapeOptions::new()
        .with_stream(LOW_SHAPE, Arc::clone(low) as Arc<dyn ShapeStream>)
        .with_stream(HIGH_SHAPE, Arc::clone(high) as Arc<dyn ShapeStream>)
}

/// Records every batch and error a subscriber receives.
#[derive(Debug, Clone, Default)]
pub struct BatchRecorder {
    batches: Arc<Mutex<Vec<Vec<MultiShapeMessage>>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl BatchRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes the recorder to a stream.
    pub fn attach(&self, stream: &MultiShapeStream) -> MultiShapeResult<Subscription> {
        let batches = Arc::clone(&self.batches);
        let errors = Arc::clone(&self.errors);
        stream.subscribe_with_errors(
            move |batch: Arc<[MultiShapeMessage]>| {
                let batches = Arc::clone(&batches);
                async move {
                    batches.lock().push(batch.to_vec());
                    Ok::<(), SubscriberError>(())
                }
            },
            move |err: &MultiShapeError| errors.lock().push(err.to_string()),
        )
    }

    /// Every batch so far.
    pub fn batches(&self) -> Vec<Vec<MultiShapeMessage>> {
        self.batches.lock().clone()
    }

    /// Number of batches so far.
    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Every change message so far with its shape, in delivery order.
    pub fn changes(&self) -> Vec<(String, ChangeMessage)> {
        self.batches
            .lock()
            .iter()
            .flatten()
            .filter_map(|message| {
                message
                    .as_change()
                    .map(|change| (message.shape.to_string(), change.clone()))
            })
            .collect()
    }

    /// Errors so far, rendered.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

/// Polls `condition` until it holds or `timeout` passes. Returns whether it
/// held.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
