//! Demo command implementation.
//!
//! Runs two shapes partitioned by priority over an in-memory `issues`
//! table, writes rows that cross the partition, and prints every batch the
//! coordinator publishes.

use serde::Serialize;
use shapesync_engine::{
    MultiShapeError, MultiShapeStream, SubscriberError, TransactionalMultiShapeStream,
};
use shapesync_protocol::{Lsn, MultiShapeMessage, ShapeKey};
use shapesync_testkit::prelude::*;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long the demo waits for the shapes to catch up.
const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Output format for published batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One human-readable line per message.
    Text,
    /// One JSON document per batch.
    Json,
}

/// Error for an unrecognized `--format`.
#[derive(Debug, thiserror::Error)]
#[error("unknown output format: {0} (expected text or json)")]
pub struct UnknownFormat(String);

impl FromStr for OutputFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}

/// Options for the demo run.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Publish whole transactions only.
    pub transactional: bool,
    /// Lag check delay.
    pub check_after: Duration,
    /// Rows inserted before the moves.
    pub rows: u64,
    /// Partition threshold.
    pub threshold: i64,
    /// Output format.
    pub format: OutputFormat,
}

#[derive(Serialize)]
struct BatchReport<'a> {
    batch: usize,
    messages: &'a [MultiShapeMessage],
}

#[derive(Debug, Serialize)]
struct ShapeSummary {
    shape: String,
    last_data_lsn: Option<Lsn>,
    last_up_to_date_lsn: Option<Lsn>,
}

#[derive(Debug, Serialize)]
struct DemoSummary {
    transactional: bool,
    batches: usize,
    changes: usize,
    head: Lsn,
    up_to_date: bool,
    last_synced_at: Option<u64>,
    shapes: Vec<ShapeSummary>,
}

/// Prints batches and counts what it printed.
struct Printer {
    format: OutputFormat,
    batches: AtomicUsize,
    changes: AtomicUsize,
}

impl Printer {
    fn new(format: OutputFormat) -> Self {
        Self {
            format,
            batches: AtomicUsize::new(0),
            changes: AtomicUsize::new(0),
        }
    }

    fn print(&self, batch: &[MultiShapeMessage]) -> Result<(), SubscriberError> {
        let number = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
        match self.format {
            OutputFormat::Json => {
                let report = BatchReport {
                    batch: number,
                    messages: batch,
                };
                println!("{}", serde_json::to_string(&report)?);
            }
            OutputFormat::Text => {
                println!("batch {number} ({} messages)", batch.len());
                for message in batch {
                    println!("  {}", describe(message));
                }
            }
        }
        let changes = batch.iter().filter(|m| m.as_change().is_some()).count();
        self.changes.fetch_add(changes, Ordering::SeqCst);
        Ok(())
    }

    fn changes(&self) -> usize {
        self.changes.load(Ordering::SeqCst)
    }

    fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

fn render_lsn(lsn: Option<Lsn>) -> String {
    lsn.map_or_else(|| "-".to_string(), |lsn| lsn.to_string())
}

/// One text line for a message.
fn describe(message: &MultiShapeMessage) -> String {
    let headers = message.headers();
    match message.as_change() {
        Some(change) => format!(
            "[{}] {} {} lsn={} pos={} {}",
            message.shape,
            change.operation().map_or("?", |op| op.as_str()),
            change.key,
            render_lsn(headers.lsn().ok().flatten()),
            headers
                .op_position()
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            change.value,
        ),
        None => format!(
            "[{}] {} global_last_seen_lsn={}",
            message.shape,
            headers
                .control()
                .map_or_else(|| "control".to_string(), |c| c.as_str().to_string()),
            render_lsn(headers.global_last_seen_lsn().ok().flatten()),
        ),
    }
}

fn priority_for(id: u64, threshold: i64) -> i64 {
    let spread = (id % 3) as i64;
    if id % 2 == 1 {
        threshold - spread
    } else {
        threshold + 1 + spread
    }
}

/// Writes the demo workload: plain inserts, a cross-shape transaction, a
/// single-row move and a delete.
fn write_workload(source: &SimulatedSource, rows: u64, threshold: i64) -> SimulationResult<Lsn> {
    for id in 1..=rows {
        source.insert(issue(id, priority_for(id, threshold), &format!("issue {id}")))?;
    }

    let moved = source.commit(vec![
        Write::Update(issue(1, threshold + 5, "issue 1")),
        Write::Insert(issue(rows + 1, threshold - 1, &format!("issue {}", rows + 1))),
    ])?;
    info!(lsn = %moved, "moved issue 1 to the high shape");

    source.update(issue(2, threshold, "issue 2"))?;
    if rows >= 3 {
        source.delete(rows.to_string())?;
    }
    Ok(source.head())
}

/// Runs the demo.
pub async fn run(options: DemoOptions) -> Result<(), Box<dyn std::error::Error>> {
    let rows = options.rows.max(2);
    let source = issues_source();
    let factory = SimulatedShapeFactory::new(Arc::clone(&source));
    let shape_options = partitioned_options(options.threshold)
        .with_start(false)
        .with_check_for_updates_after(options.check_after);

    let (stream, transactional) = if options.transactional {
        let transactional =
            TransactionalMultiShapeStream::with_factory(shape_options, &factory)?;
        (transactional.as_stream().clone(), Some(transactional))
    } else {
        (MultiShapeStream::with_factory(shape_options, &factory)?, None)
    };

    let printer = Arc::new(Printer::new(options.format));
    let sink = Arc::clone(&printer);
    let _subscription = stream.subscribe_with_errors(
        move |batch: Arc<[MultiShapeMessage]>| {
            let sink = Arc::clone(&sink);
            async move { sink.print(&batch) }
        },
        |err: &MultiShapeError| warn!(error = %err, "shape stream error"),
    )?;

    if !wait_until(SYNC_TIMEOUT, || stream.is_up_to_date()).await {
        return Err("shapes did not finish their initial sync".into());
    }
    info!(transactional = options.transactional, rows, "shapes synced, writing rows");

    let head = write_workload(&source, rows, options.threshold)?;

    let mut expected = 0;
    for key in [LOW_SHAPE, HIGH_SHAPE] {
        let shape = factory
            .stream(key)
            .ok_or_else(|| format!("shape {key} was not built"))?;
        expected += source.changes_since(Lsn::new(0), shape.predicate()).0.len();
    }

    let timeout = SYNC_TIMEOUT + options.check_after;
    if !wait_until(timeout, || printer.changes() >= expected).await {
        return Err(format!(
            "published {} of {expected} changes before timing out",
            printer.changes()
        )
        .into());
    }

    if let Some(transactional) = &transactional {
        let buffered = transactional.buffered_lsns();
        if !buffered.is_empty() {
            warn!(?buffered, "transactions still buffered");
        }
    }

    let summary = DemoSummary {
        transactional: options.transactional,
        batches: printer.batches(),
        changes: printer.changes(),
        head,
        up_to_date: stream.is_up_to_date(),
        last_synced_at: stream.last_synced_at(),
        shapes: [LOW_SHAPE, HIGH_SHAPE]
            .into_iter()
            .filter_map(|key| {
                let key = ShapeKey::from(key);
                stream.shape_lsns(&key).map(|lsns| ShapeSummary {
                    shape: key.to_string(),
                    last_data_lsn: lsns.last_data_lsn.lsn(),
                    last_up_to_date_lsn: lsns.last_up_to_date_lsn.lsn(),
                })
            })
            .collect(),
    };

    match options.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => {
            println!();
            println!("Demo Summary");
            println!("============");
            println!("Mode:           {}", if summary.transactional { "transactional" } else { "direct" });
            println!("Batches:        {}", summary.batches);
            println!("Changes:        {}", summary.changes);
            println!("Source head:    {}", summary.head);
            println!("Up to date:     {}", summary.up_to_date);
            for shape in &summary.shapes {
                println!(
                    "Shape {:<8} data={} up-to-date={}",
                    shape.shape,
                    render_lsn(shape.last_data_lsn),
                    render_lsn(shape.last_up_to_date_lsn),
                );
            }
        }
    }

    Ok(())
}
