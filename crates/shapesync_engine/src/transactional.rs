//! Multi-shape stream that publishes whole transactions.

use crate::config::MultiShapeOptions;
use crate::error::MultiShapeResult;
use crate::shape::ShapeStreamFactory;
use crate::stream::{Delivery, MultiShapeStream};
use shapesync_protocol::{Lsn, LsnMark, ShapeKey};
use std::ops::Deref;

/// A [`MultiShapeStream`] that holds messages back until every shape has
/// confirmed the transaction they belong to.
///
/// Each published batch holds one or more complete transactions in LSN
/// order, with the changes of a transaction ordered by their position in it,
/// whichever shapes they came from. A row that moves from one shape to
/// another therefore shows up as a delete and an insert in the same batch.
///
/// Everything else, including subscribing and status queries, is available
/// through [`Deref`] to the underlying stream.
#[derive(Debug, Clone)]
pub struct TransactionalMultiShapeStream {
    stream: MultiShapeStream,
}

impl TransactionalMultiShapeStream {
    /// Creates a transactional stream over caller-built shape streams.
    pub fn new(options: MultiShapeOptions) -> MultiShapeResult<Self> {
        Ok(Self {
            stream: MultiShapeStream::build(options, None, true)?,
        })
    }

    /// Creates a transactional stream, building shapes given as options
    /// with `factory`.
    pub fn with_factory(
        options: MultiShapeOptions,
        factory: &dyn ShapeStreamFactory,
    ) -> MultiShapeResult<Self> {
        Ok(Self {
            stream: MultiShapeStream::build(options, Some(factory), true)?,
        })
    }

    /// LSN through which `key` is known to be complete.
    pub fn complete_lsn(&self, key: &ShapeKey) -> Option<LsnMark> {
        match self.stream.delivery() {
            Delivery::Transactional(reassembly) => {
                reassembly.reassembler.lock().complete_lsn(key)
            }
            Delivery::Direct => None,
        }
    }

    /// Lowest complete LSN across shapes.
    pub fn watermark(&self) -> Option<LsnMark> {
        match self.stream.delivery() {
            Delivery::Transactional(reassembly) => reassembly.reassembler.lock().watermark(),
            Delivery::Direct => None,
        }
    }

    /// LSNs of transactions still waiting for some shape.
    pub fn buffered_lsns(&self) -> Vec<Lsn> {
        match self.stream.delivery() {
            Delivery::Transactional(reassembly) => {
                reassembly.reassembler.lock().buffered_lsns()
            }
            Delivery::Direct => Vec::new(),
        }
    }

    /// Returns the underlying stream.
    pub fn as_stream(&self) -> &MultiShapeStream {
        &self.stream
    }
}

impl Deref for TransactionalMultiShapeStream {
    type Target = MultiShapeStream;

    fn deref(&self) -> &MultiShapeStream {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MultiShapeError, SubscriberError};
    use crate::shape::{MockShapeStream, ShapeStream};
    use parking_lot::Mutex;
    use serde_json::json;
    use shapesync_protocol::{
        ChangeMessage, ControlMessage, Headers, Message, MultiShapeMessage, Operation,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn change(operation: Operation, id: &str, lsn: u64, position: u64) -> Message {
        ChangeMessage::new(operation, id, json!({"id": id}))
            .with_lsn(Lsn::new(lsn))
            .with_op_position(position)
            .with_last(true)
            .into()
    }

    fn up_to_date(lsn: u64) -> Message {
        ControlMessage::up_to_date(Lsn::new(lsn)).into()
    }

    struct Fixture {
        low: Arc<MockShapeStream>,
        high: Arc<MockShapeStream>,
        stream: TransactionalMultiShapeStream,
        batches: Arc<Mutex<Vec<Vec<MultiShapeMessage>>>>,
    }

    fn fixture() -> Fixture {
        let low = Arc::new(MockShapeStream::new());
        let high = Arc::new(MockShapeStream::new());
        let options = MultiShapeOptions::new()
            .with_stream("low", Arc::clone(&low) as Arc<dyn ShapeStream>)
            .with_stream("high", Arc::clone(&high) as Arc<dyn ShapeStream>);
        let stream = TransactionalMultiShapeStream::new(options).unwrap();

        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        stream
            .subscribe(move |batch: Arc<[MultiShapeMessage]>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(batch.to_vec());
                    Ok::<(), SubscriberError>(())
                }
            })
            .unwrap();

        Fixture {
            low,
            high,
            stream,
            batches,
        }
    }

    fn describe(batch: &[MultiShapeMessage]) -> Vec<(String, String)> {
        batch
            .iter()
            .filter_map(|message| {
                let change = message.as_change()?;
                let operation = change.operation()?.as_str().to_string();
                Some((message.shape.to_string(), operation))
            })
            .collect()
    }

    #[tokio::test]
    async fn row_move_is_published_as_one_transaction() {
        let f = fixture();
        f.low.emit(vec![up_to_date(5)]).await;
        f.high.emit(vec![up_to_date(5)]).await;
        assert!(f.batches.lock().is_empty());

        f.high.emit(vec![change(Operation::Insert, "7", 20, 1), up_to_date(20)]).await;
        assert!(f.batches.lock().is_empty());
        assert_eq!(f.stream.buffered_lsns(), vec![Lsn::new(20)]);

        f.low.emit(vec![change(Operation::Delete, "7", 20, 0), up_to_date(20)]).await;

        let batches = f.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            describe(&batches[0]),
            vec![
                ("low".to_string(), "delete".to_string()),
                ("high".to_string(), "insert".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn complete_lsn_follows_up_to_date() {
        let f = fixture();
        assert_eq!(f.stream.complete_lsn(&"low".into()), Some(LsnMark::Unset));
        assert_eq!(f.stream.watermark(), Some(LsnMark::Unset));

        f.low.emit(vec![up_to_date(12)]).await;
        assert_eq!(
            f.stream.complete_lsn(&"low".into()),
            Some(LsnMark::At(Lsn::new(12)))
        );
        assert_eq!(f.stream.watermark(), Some(LsnMark::Unset));
        assert_eq!(f.stream.complete_lsn(&"missing".into()), None);
    }

    #[tokio::test]
    async fn controls_are_not_published() {
        let f = fixture();
        f.low.emit(vec![change(Operation::Insert, "1", 3, 0), up_to_date(3)]).await;
        f.high.emit(vec![up_to_date(3)]).await;

        let batches = f.batches.lock();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].iter().all(|message| message.as_change().is_some()));
    }

    #[tokio::test]
    async fn deref_exposes_status() {
        let f = fixture();
        assert!(f.stream.has_started());
        assert!(!f.stream.is_up_to_date());
        f.low.emit(vec![up_to_date(1)]).await;
        f.high.emit(vec![up_to_date(1)]).await;
        assert!(f.stream.as_stream().is_up_to_date());
    }

    #[tokio::test]
    async fn subscriber_can_inspect_the_reassembler_from_its_callback() {
        let f = fixture();
        let watermarks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&watermarks);
        let inspector = f.stream.clone();
        f.stream
            .subscribe(move |_batch: Arc<[MultiShapeMessage]>| {
                let sink = Arc::clone(&sink);
                let watermark = inspector.watermark();
                let buffered = inspector.buffered_lsns();
                async move {
                    sink.lock().push((watermark, buffered));
                    Ok::<(), SubscriberError>(())
                }
            })
            .unwrap();

        f.high.emit(vec![up_to_date(5)]).await;
        let delivered = tokio::time::timeout(
            Duration::from_secs(2),
            f.low.emit(vec![change(Operation::Insert, "1", 5, 0), up_to_date(5)]),
        )
        .await;

        assert!(delivered.is_ok());
        assert_eq!(
            *watermarks.lock(),
            vec![(Some(LsnMark::At(Lsn::new(5))), Vec::new())]
        );
        assert_eq!(f.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn incomplete_control_is_rejected_before_lsns_are_recorded() {
        let f = fixture();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        f.stream
            .subscribe_with_errors(
                |_batch: Arc<[MultiShapeMessage]>| async { Ok::<(), SubscriberError>(()) },
                move |err: &MultiShapeError| sink.lock().push(err.to_string()),
            )
            .unwrap();

        let control = ControlMessage {
            headers: Headers::new().with("control", "up-to-date"),
        };
        f.low
            .emit(vec![change(Operation::Insert, "1", 9, 0), control.into()])
            .await;

        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("low"));
        let lsns = f.stream.shape_lsns(&"low".into()).unwrap();
        assert!(lsns.last_data_lsn.is_unset());
        assert!(!f.stream.is_checking_for_updates());
        assert!(f.stream.buffered_lsns().is_empty());
        assert!(f.batches.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn last_marker_uses_status_at_arrival() {
        let f = fixture();
        f.low.emit(vec![up_to_date(5)]).await;
        f.high.emit(vec![up_to_date(5)]).await;

        // Hold the first release in its subscriber so later batches queue.
        let release = Arc::new(Notify::new());
        let gate = Arc::clone(&release);
        f.stream
            .subscribe(move |batch: Arc<[MultiShapeMessage]>| {
                let gate = Arc::clone(&gate);
                async move {
                    let first = batch
                        .iter()
                        .any(|m| m.as_change().is_some_and(|c| c.key == "6"));
                    if first {
                        gate.notified().await;
                    }
                    Ok::<(), SubscriberError>(())
                }
            })
            .unwrap();

        f.low.emit(vec![change(Operation::Insert, "6", 6, 0), up_to_date(6)]).await;
        let high = Arc::clone(&f.high);
        let held = tokio::spawn(async move { high.emit(vec![up_to_date(6)]).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Arrives while every shape is up to date.
        let low = Arc::clone(&f.low);
        let queued = tokio::spawn(async move {
            low.emit(vec![change(Operation::Insert, "8", 8, 0), up_to_date(7)])
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // New data on high clears the coordinator's up-to-date status.
        let high = Arc::clone(&f.high);
        let later = tokio::spawn(async move {
            high.emit(vec![change(Operation::Insert, "9", 9, 0)]).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!f.stream.is_up_to_date());

        release.notify_one();
        held.await.unwrap();
        queued.await.unwrap();
        later.await.unwrap();

        assert_eq!(
            f.stream.complete_lsn(&"low".into()),
            Some(LsnMark::At(Lsn::new(8)))
        );
    }
}
