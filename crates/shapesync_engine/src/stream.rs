//! Multi-shape coordinator.

use crate::config::{MultiShapeOptions, ShapeSource};
use crate::error::{MultiShapeError, MultiShapeResult, ShapeError, SubscriberError};
use crate::ledger::{LsnLedger, ShapeLsns};
use crate::monitor::LagMonitor;
use crate::reassembler::TransactionReassembler;
use crate::shape::{
    now_millis, BatchHandler, ShapeErrorHandler, ShapeStream, ShapeStreamFactory, Unsubscribe,
};
use crate::subscribers::{ErrorCallback, FailureHook, SubscriberRegistry, Subscription};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use shapesync_protocol::{Lsn, Message, MultiShapeMessage, ProtocolResult, ShapeKey};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

struct ShapeEntry {
    stream: Arc<dyn ShapeStream>,
    /// Built from options by the coordinator, closed when it is dropped.
    owned: bool,
}

/// How tagged batches reach subscribers.
pub(crate) enum Delivery {
    /// Every batch is published as it arrives.
    Direct,
    /// Batches are held until whole transactions are complete.
    Transactional(Reassembly),
}

/// Transactional delivery state.
///
/// The reassembler lock is never held across an await, so subscribers may
/// inspect it from their callbacks. `publish` is held from `accept` until
/// the released messages have been published, which keeps releases in LSN
/// order across shapes.
pub(crate) struct Reassembly {
    publish: tokio::sync::Mutex<()>,
    pub(crate) reassembler: Mutex<TransactionReassembler>,
}

impl Reassembly {
    fn new(keys: impl IntoIterator<Item = ShapeKey>) -> Self {
        Self {
            publish: tokio::sync::Mutex::new(()),
            reassembler: Mutex::new(TransactionReassembler::new(keys)),
        }
    }
}

/// Highest LSNs found in one batch.
#[derive(Debug, Default)]
struct BatchLsns {
    data: Option<Lsn>,
    up_to_date: Option<Lsn>,
}

impl BatchLsns {
    fn scan<'a>(batch: impl IntoIterator<Item = &'a Message>) -> ProtocolResult<Self> {
        let mut data = Vec::new();
        let mut up_to_date = Vec::new();
        for message in batch {
            match message {
                Message::Change(change) => data.push(change.lsn_or_zero()?),
                Message::Control(control) => {
                    if let Some(lsn) = control.headers.global_last_seen_lsn()? {
                        up_to_date.push(lsn);
                    }
                }
            }
        }
        Ok(Self {
            data: Lsn::max_of(data),
            up_to_date: Lsn::max_of(up_to_date),
        })
    }
}

struct Inner {
    shapes: BTreeMap<ShapeKey, ShapeEntry>,
    started: AtomicBool,
    ledger: Mutex<LsnLedger>,
    monitor: Arc<LagMonitor>,
    subscribers: SubscriberRegistry,
    delivery: Delivery,
    shape_subscriptions: Mutex<Vec<Unsubscribe>>,
}

impl Inner {
    fn start(self: &Arc<Self>) -> MultiShapeResult<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MultiShapeError::AlreadyStarted);
        }

        if let Some((key, _)) = self
            .shapes
            .iter()
            .find(|(_, entry)| entry.stream.has_started())
        {
            self.started.store(false, Ordering::SeqCst);
            return Err(MultiShapeError::ShapeAlreadyStarted(key.clone()));
        }

        let handles: Vec<Unsubscribe> = self
            .shapes
            .iter()
            .map(|(key, entry)| {
                entry
                    .stream
                    .subscribe(self.batch_handler(key.clone()), self.error_handler(key.clone()))
            })
            .collect();
        self.shape_subscriptions.lock().extend(handles);

        info!(
            shapes = self.shapes.len(),
            transactional = matches!(self.delivery, Delivery::Transactional(_)),
            "multi-shape stream started"
        );
        Ok(())
    }

    fn batch_handler(self: &Arc<Self>, key: ShapeKey) -> BatchHandler {
        let inner = Arc::downgrade(self);
        Arc::new(move |batch: Vec<Message>| {
            let inner = Weak::clone(&inner);
            let key = key.clone();
            async move {
                if let Some(inner) = inner.upgrade() {
                    inner.handle_batch(&key, batch).await;
                }
            }
            .boxed()
        })
    }

    fn error_handler(self: &Arc<Self>, key: ShapeKey) -> ShapeErrorHandler {
        let inner = Arc::downgrade(self);
        Arc::new(move |source: ShapeError| {
            if let Some(inner) = inner.upgrade() {
                warn!(shape = %key, error = %source, "shape stream error");
                inner.subscribers.broadcast_error(&MultiShapeError::Shape {
                    shape: key.clone(),
                    source,
                });
            }
        })
    }

    async fn handle_batch(self: &Arc<Self>, key: &ShapeKey, batch: Vec<Message>) {
        let up_to_date = self.is_up_to_date();
        let tagged: Vec<MultiShapeMessage> = batch
            .into_iter()
            .map(|message| MultiShapeMessage::new(key.clone(), message))
            .collect();

        let lsns = match self.validate(key, &tagged) {
            Ok(lsns) => lsns,
            Err(err) => {
                warn!(shape = %key, error = %err, "rejecting malformed batch");
                self.subscribers.broadcast_error(&err);
                return;
            }
        };

        let data_advanced = {
            let mut ledger = self.ledger.lock();
            if let Some(lsn) = lsns.up_to_date {
                ledger.observe_up_to_date(key, lsn);
            }
            lsns.data.is_some_and(|lsn| ledger.observe_data(key, lsn))
        };
        debug!(
            shape = %key,
            messages = tagged.len(),
            data_lsn = ?lsns.data,
            up_to_date_lsn = ?lsns.up_to_date,
            "batch received"
        );
        if data_advanced {
            self.schedule_lag_check();
        }

        self.deliver(tagged, up_to_date).await;
    }

    /// Checks a batch before anything is recorded. Transactional delivery
    /// also requires every up-to-date control to carry its LSN.
    fn validate(
        &self,
        key: &ShapeKey,
        batch: &[MultiShapeMessage],
    ) -> MultiShapeResult<BatchLsns> {
        let lsns = BatchLsns::scan(batch.iter().map(|tagged| &tagged.message))
            .map_err(|source| MultiShapeError::protocol(key, source))?;
        if let Delivery::Transactional(_) = self.delivery {
            TransactionReassembler::validate(batch)?;
        }
        Ok(lsns)
    }

    /// Publishes a batch, or in transactional mode the transactions it
    /// completes. `up_to_date` is the coordinator status when the batch
    /// arrived.
    async fn deliver(&self, batch: Vec<MultiShapeMessage>, up_to_date: bool) {
        match &self.delivery {
            Delivery::Direct => {
                if !batch.is_empty() {
                    self.subscribers.publish(batch).await;
                }
            }
            Delivery::Transactional(reassembly) => {
                let _gate = reassembly.publish.lock().await;
                let accepted = {
                    let mut reassembler = reassembly.reassembler.lock();
                    reassembler
                        .accept(batch, up_to_date)
                        .map(|released| (released, reassembler.watermark()))
                };
                match accepted {
                    Ok((released, _)) if released.is_empty() => {}
                    Ok((released, watermark)) => {
                        debug!(
                            messages = released.len(),
                            ?watermark,
                            "releasing complete transactions"
                        );
                        self.subscribers.publish(released).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "rejecting malformed batch");
                        self.subscribers.broadcast_error(&err);
                    }
                }
            }
        }
    }

    fn schedule_lag_check(self: &Arc<Self>) {
        let inner = Arc::downgrade(self);
        self.monitor.schedule(move || {
            let inner = Weak::clone(&inner);
            async move {
                if let Some(inner) = inner.upgrade() {
                    inner.check_for_updates().await;
                }
            }
        });
    }

    /// Forces every shape behind the highest data LSN to refresh.
    async fn check_for_updates(&self) {
        let (max_data_lsn, lagging) = {
            let ledger = self.ledger.lock();
            (ledger.max_data_lsn(), ledger.lagging_shapes())
        };
        if lagging.is_empty() {
            debug!(%max_data_lsn, "no lagging shapes");
            return;
        }

        debug!(%max_data_lsn, shapes = ?lagging, "refreshing lagging shapes");
        let refreshes = lagging
            .iter()
            .filter_map(|key| self.shapes.get(key))
            .map(|entry| entry.stream.force_disconnect_and_refresh());
        join_all(refreshes).await;
    }

    fn is_up_to_date(&self) -> bool {
        self.shapes.values().all(|entry| entry.stream.is_up_to_date())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.monitor.cancel();
        for unsubscribe in self.shape_subscriptions.get_mut().drain(..) {
            unsubscribe.call();
        }
        for (key, entry) in &self.shapes {
            if entry.owned {
                debug!(shape = %key, "closing owned shape stream");
                entry.stream.close();
            }
        }
    }
}

/// Merges several shape streams into one tagged stream.
///
/// Keeps shapes within a bounded distance of each other: when one shape
/// receives data, every shape that has not confirmed it is up to date at
/// that LSN is forced to refresh after
/// [`check_for_updates_after`](MultiShapeOptions::check_for_updates_after).
///
/// Cloning is cheap and every clone drives the same coordinator. It shuts
/// down, closing the streams it built, when the last clone is dropped.
#[derive(Clone)]
pub struct MultiShapeStream {
    inner: Arc<Inner>,
}

impl MultiShapeStream {
    /// Creates a stream over caller-built shape streams.
    ///
    /// Fails with [`MultiShapeError::MissingFactory`] if a shape is given
    /// as options.
    pub fn new(options: MultiShapeOptions) -> MultiShapeResult<Self> {
        Self::build(options, None, false)
    }

    /// Creates a stream, building shapes given as options with `factory`.
    pub fn with_factory(
        options: MultiShapeOptions,
        factory: &dyn ShapeStreamFactory,
    ) -> MultiShapeResult<Self> {
        Self::build(options, Some(factory), false)
    }

    pub(crate) fn build(
        options: MultiShapeOptions,
        factory: Option<&dyn ShapeStreamFactory>,
        transactional: bool,
    ) -> MultiShapeResult<Self> {
        let shapes = build_shapes(options.shapes, factory)?;
        let keys: Vec<ShapeKey> = shapes.keys().cloned().collect();
        let delivery = if transactional {
            Delivery::Transactional(Reassembly::new(keys.iter().cloned()))
        } else {
            Delivery::Direct
        };

        let stream = Self {
            inner: Arc::new(Inner {
                shapes,
                started: AtomicBool::new(false),
                ledger: Mutex::new(LsnLedger::new(keys)),
                monitor: Arc::new(LagMonitor::new(options.check_for_updates_after)),
                subscribers: SubscriberRegistry::new(),
                delivery,
                shape_subscriptions: Mutex::new(Vec::new()),
            }),
        };
        if options.start {
            stream.start()?;
        }
        Ok(stream)
    }

    pub(crate) fn delivery(&self) -> &Delivery {
        &self.inner.delivery
    }

    /// Subscribes to every shape.
    ///
    /// Fails if called twice, or if any shape stream was already started
    /// elsewhere; in that case nothing is subscribed.
    pub fn start(&self) -> MultiShapeResult<()> {
        self.inner.start()
    }

    /// Returns true once started.
    pub fn has_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Registers a callback for every published batch, starting the stream
    /// if needed.
    pub fn subscribe<F, Fut>(&self, callback: F) -> MultiShapeResult<Subscription>
    where
        F: Fn(Arc<[MultiShapeMessage]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
    {
        self.register(callback, None)
    }

    /// Like [`subscribe`](Self::subscribe), also receiving transport and
    /// protocol errors.
    pub fn subscribe_with_errors<F, Fut, E>(
        &self,
        callback: F,
        on_error: E,
    ) -> MultiShapeResult<Subscription>
    where
        F: Fn(Arc<[MultiShapeMessage]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
        E: Fn(&MultiShapeError) + Send + Sync + 'static,
    {
        self.register(callback, Some(Arc::new(on_error) as ErrorCallback))
    }

    fn register<F, Fut>(
        &self,
        callback: F,
        on_error: Option<ErrorCallback>,
    ) -> MultiShapeResult<Subscription>
    where
        F: Fn(Arc<[MultiShapeMessage]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
    {
        let subscription = self.inner.subscribers.subscribe(callback, on_error);
        if !self.has_started() {
            match self.start() {
                Ok(()) | Err(MultiShapeError::AlreadyStarted) => {}
                Err(err) => {
                    subscription.unsubscribe();
                    return Err(err);
                }
            }
        }
        Ok(subscription)
    }

    /// Removes every subscriber. Shapes keep streaming.
    pub fn unsubscribe_all(&self) {
        self.inner.subscribers.clear();
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Replaces the hook receiving failed subscriber callbacks.
    pub fn set_failure_hook<H>(&self, hook: H)
    where
        H: Fn(crate::SubscriberFailure) + Send + Sync + 'static,
    {
        self.inner.subscribers.set_failure_hook(Arc::new(hook) as FailureHook);
    }

    /// The underlying shape streams, by key.
    pub fn shapes(&self) -> impl Iterator<Item = (&ShapeKey, &Arc<dyn ShapeStream>)> + '_ {
        self.inner
            .shapes
            .iter()
            .map(|(key, entry)| (key, &entry.stream))
    }

    /// Looks up one shape stream.
    pub fn shape(&self, key: &str) -> Option<&Arc<dyn ShapeStream>> {
        self.inner.shapes.get(key).map(|entry| &entry.stream)
    }

    /// LSN state of one shape.
    pub fn shape_lsns(&self, key: &ShapeKey) -> Option<ShapeLsns> {
        self.inner.ledger.lock().get(key)
    }

    /// Delay between new data and the lag check.
    pub fn check_for_updates_after(&self) -> Duration {
        self.inner.monitor.delay()
    }

    /// Returns true while a lag check is armed or running.
    pub fn is_checking_for_updates(&self) -> bool {
        self.inner.monitor.is_pending()
    }

    /// Oldest sync time over shapes that have synced, in epoch milliseconds.
    ///
    /// `None` until some shape has synced.
    pub fn last_synced_at(&self) -> Option<u64> {
        self.inner
            .shapes
            .values()
            .filter_map(|entry| entry.stream.last_synced_at())
            .min()
    }

    /// Time since [`last_synced_at`](Self::last_synced_at).
    pub fn last_synced(&self) -> Option<Duration> {
        self.last_synced_at()
            .map(|at| Duration::from_millis(now_millis().saturating_sub(at)))
    }

    /// True if every shape is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.shapes.values().all(|entry| entry.stream.is_connected())
    }

    /// True if any shape is still loading.
    pub fn is_loading(&self) -> bool {
        self.inner.shapes.values().any(|entry| entry.stream.is_loading())
    }

    /// True if every shape is up to date. Vacuously true with no shapes.
    pub fn is_up_to_date(&self) -> bool {
        self.inner.is_up_to_date()
    }
}

impl std::fmt::Debug for MultiShapeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiShapeStream")
            .field("shapes", &self.inner.shapes.keys().collect::<Vec<_>>())
            .field("started", &self.has_started())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn build_shapes(
    sources: BTreeMap<ShapeKey, ShapeSource>,
    factory: Option<&dyn ShapeStreamFactory>,
) -> MultiShapeResult<BTreeMap<ShapeKey, ShapeEntry>> {
    let mut shapes = BTreeMap::new();
    for (key, source) in sources {
        let entry = match source {
            ShapeSource::Stream(stream) => Ok(ShapeEntry {
                stream,
                owned: false,
            }),
            ShapeSource::Options(options) => match factory {
                Some(factory) => factory.build(&key, &options).map(|stream| ShapeEntry {
                    stream,
                    owned: true,
                }),
                None => Err(MultiShapeError::MissingFactory(key.clone())),
            },
        };
        match entry {
            Ok(entry) => {
                shapes.insert(key, entry);
            }
            Err(err) => {
                for entry in shapes.values().filter(|entry| entry.owned) {
                    entry.stream.close();
                }
                return Err(err);
            }
        }
    }
    Ok(shapes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShapeOptions;
    use crate::shape::MockShapeStream;
    use serde_json::json;
    use shapesync_protocol::{ChangeMessage, ControlMessage, Headers, LsnMark, Operation};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockFactory {
        built: Mutex<Vec<Arc<MockShapeStream>>>,
    }

    impl ShapeStreamFactory for MockFactory {
        fn build(
            &self,
            key: &ShapeKey,
            options: &ShapeOptions,
        ) -> MultiShapeResult<Arc<dyn ShapeStream>> {
            if options.table.is_empty() {
                return Err(MultiShapeError::Build {
                    shape: key.clone(),
                    message: "no table".into(),
                });
            }
            let stream = Arc::new(MockShapeStream::new());
            self.built.lock().push(Arc::clone(&stream));
            Ok(stream)
        }
    }

    fn two_mocks() -> (Arc<MockShapeStream>, Arc<MockShapeStream>, MultiShapeOptions) {
        let low = Arc::new(MockShapeStream::new());
        let high = Arc::new(MockShapeStream::new());
        let options = MultiShapeOptions::new()
            .with_stream("low", Arc::clone(&low) as Arc<dyn ShapeStream>)
            .with_stream("high", Arc::clone(&high) as Arc<dyn ShapeStream>);
        (low, high, options)
    }

    fn insert(id: &str, lsn: u64) -> Message {
        ChangeMessage::new(Operation::Insert, id, json!({"id": id}))
            .with_lsn(Lsn::new(lsn))
            .with_op_position(0)
            .with_last(true)
            .into()
    }

    fn collect(stream: &MultiShapeStream) -> Arc<Mutex<Vec<MultiShapeMessage>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        stream
            .subscribe(move |batch: Arc<[MultiShapeMessage]>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().extend(batch.iter().cloned());
                    Ok::<(), SubscriberError>(())
                }
            })
            .unwrap();
        seen
    }

    #[tokio::test]
    async fn publishes_tagged_messages_and_tracks_lsns() {
        let (low, _high, options) = two_mocks();
        let stream = MultiShapeStream::new(options).unwrap();
        let seen = collect(&stream);

        low.emit(vec![insert("1", 7), ControlMessage::up_to_date(Lsn::new(7)).into()])
            .await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|message| message.shape.as_str() == "low"));
        assert_eq!(seen[0].as_change().unwrap().key, "1");

        let lsns = stream.shape_lsns(&"low".into()).unwrap();
        assert_eq!(lsns.last_data_lsn, LsnMark::At(Lsn::new(7)));
        assert_eq!(lsns.last_up_to_date_lsn, LsnMark::At(Lsn::new(7)));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (_low, _high, options) = two_mocks();
        let stream = MultiShapeStream::new(options).unwrap();
        assert!(stream.has_started());
        assert!(matches!(stream.start(), Err(MultiShapeError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn started_shape_is_rejected_before_subscribing() {
        let fresh = Arc::new(MockShapeStream::new());
        let options = MultiShapeOptions::new()
            .with_stream("a", Arc::clone(&fresh) as Arc<dyn ShapeStream>)
            .with_stream("b", Arc::new(MockShapeStream::started()));

        let err = MultiShapeStream::new(options).unwrap_err();
        assert!(matches!(err, MultiShapeError::ShapeAlreadyStarted(ref key) if key.as_str() == "b"));
        assert!(err.is_usage_error());
        assert_eq!(fresh.handler_count(), 0);
    }

    #[test]
    fn options_without_factory_are_rejected() {
        let options = MultiShapeOptions::new()
            .with_options("a", ShapeOptions::new("http://localhost/v1/shape", "issues"));
        assert!(matches!(
            MultiShapeStream::new(options),
            Err(MultiShapeError::MissingFactory(_))
        ));
    }

    #[test]
    fn failed_build_closes_streams_already_built() {
        let factory = MockFactory::default();
        let options = MultiShapeOptions::new()
            .with_options("a", ShapeOptions::new("http://localhost/v1/shape", "issues"))
            .with_options("b", ShapeOptions::new("http://localhost/v1/shape", ""));

        let err = MultiShapeStream::with_factory(options, &factory).unwrap_err();
        assert!(matches!(err, MultiShapeError::Build { .. }));
        assert!(factory.built.lock().iter().all(|stream| stream.is_closed()));
    }

    #[tokio::test]
    async fn subscribe_starts_an_unstarted_stream() {
        let (low, _high, options) = two_mocks();
        let stream = MultiShapeStream::new(options.with_start(false)).unwrap();
        assert!(!stream.has_started());
        assert_eq!(low.handler_count(), 0);

        let _seen = collect(&stream);
        assert!(stream.has_started());
        assert_eq!(low.handler_count(), 1);

        let _more = collect(&stream);
        assert_eq!(stream.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn subscribe_reports_start_failure() {
        let options = MultiShapeOptions::new()
            .with_stream("a", Arc::new(MockShapeStream::started()))
            .with_start(false);
        let stream = MultiShapeStream::new(options).unwrap();
        let result = stream.subscribe(|_batch: Arc<[MultiShapeMessage]>| async {
            Ok::<(), SubscriberError>(())
        });
        assert!(matches!(result, Err(MultiShapeError::ShapeAlreadyStarted(_))));
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_shape_is_refreshed() {
        let (low, high, options) = two_mocks();
        let stream = MultiShapeStream::new(options).unwrap();
        high.set_refresh_response(Lsn::new(10));

        low.emit(vec![insert("1", 10), ControlMessage::up_to_date(Lsn::new(10)).into()])
            .await;
        assert!(stream.is_checking_for_updates());
        assert_eq!(high.refresh_count(), 0);

        tokio::time::sleep(stream.check_for_updates_after() + Duration::from_millis(10)).await;
        assert_eq!(high.refresh_count(), 1);
        assert_eq!(low.refresh_count(), 0);
        assert_eq!(
            stream.shape_lsns(&"high".into()).unwrap().last_up_to_date_lsn,
            LsnMark::At(Lsn::new(10))
        );
        assert!(!stream.is_checking_for_updates());
    }

    #[tokio::test(start_paused = true)]
    async fn lag_check_is_debounced() {
        let (low, high, options) = two_mocks();
        let _stream = MultiShapeStream::new(options).unwrap();

        low.emit(vec![insert("1", 10)]).await;
        low.emit(vec![insert("2", 11)]).await;
        low.emit(vec![insert("3", 12)]).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(high.refresh_count(), 1);
        assert_eq!(low.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn data_during_refresh_triggers_another_check() {
        let (low, high, options) = two_mocks();
        let stream = MultiShapeStream::new(
            options.with_check_for_updates_after(Duration::from_millis(100)),
        )
        .unwrap();
        stream
            .subscribe(|_batch: Arc<[MultiShapeMessage]>| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<(), SubscriberError>(())
            })
            .unwrap();
        high.set_refresh_response(Lsn::new(10));

        low.emit(vec![insert("1", 10)]).await;
        // The refresh of high starts at 100ms and is still publishing at 120ms.
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(high.refresh_count(), 1);
        assert!(stream.is_checking_for_updates());

        high.set_refresh_response(Lsn::new(20));
        low.emit(vec![insert("2", 20)]).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(high.refresh_count(), 2);
        assert_eq!(
            stream.shape_lsns(&"high".into()).unwrap().last_up_to_date_lsn,
            LsnMark::At(Lsn::new(20))
        );
        assert!(!stream.is_checking_for_updates());
    }

    #[tokio::test]
    async fn malformed_batch_is_reported_not_published() {
        let (low, _high, options) = two_mocks();
        let stream = MultiShapeStream::new(options).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (seen_sink, error_sink) = (Arc::clone(&seen), Arc::clone(&errors));
        stream
            .subscribe_with_errors(
                move |batch: Arc<[MultiShapeMessage]>| {
                    let seen = Arc::clone(&seen_sink);
                    async move {
                        seen.fetch_add(batch.len(), Ordering::SeqCst);
                        Ok::<(), SubscriberError>(())
                    }
                },
                move |err: &MultiShapeError| error_sink.lock().push(err.to_string()),
            )
            .unwrap();

        let bad = ControlMessage {
            headers: Headers::new()
                .with("control", "up-to-date")
                .with("global_last_seen_lsn", "not-a-number"),
        };
        low.emit(vec![insert("1", 3), bad.into()]).await;

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("low"));
        assert!(stream.shape_lsns(&"low".into()).unwrap().last_data_lsn.is_unset());
    }

    #[tokio::test]
    async fn transport_errors_reach_every_error_handler() {
        let (_low, high, options) = two_mocks();
        let stream = MultiShapeStream::new(options).unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let sink = Arc::clone(&errors);
            stream
                .subscribe_with_errors(
                    |_batch: Arc<[MultiShapeMessage]>| async { Ok::<(), SubscriberError>(()) },
                    move |err: &MultiShapeError| {
                        if let MultiShapeError::Shape { shape, source } = err {
                            sink.lock().push((shape.clone(), source.clone()));
                        }
                    },
                )
                .unwrap();
        }

        let failure = ShapeError::Fetch {
            status: 500,
            message: "internal".into(),
        };
        high.fail(failure.clone());

        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|(shape, source)| shape.as_str() == "high" && *source == failure));
    }

    #[tokio::test]
    async fn unsubscribe_all_halts_delivery() {
        let (low, _high, options) = two_mocks();
        let stream = MultiShapeStream::new(options).unwrap();
        let seen = collect(&stream);

        low.emit(vec![insert("1", 1)]).await;
        stream.unsubscribe_all();
        low.emit(vec![insert("2", 2)]).await;

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[test]
    fn status_with_no_shapes() {
        let stream = MultiShapeStream::new(MultiShapeOptions::new()).unwrap();
        assert!(stream.is_up_to_date());
        assert!(stream.is_connected());
        assert!(!stream.is_loading());
        assert_eq!(stream.last_synced_at(), None);
        assert_eq!(stream.last_synced(), None);
    }

    #[tokio::test]
    async fn status_reduces_over_shapes() {
        let (low, high, options) = two_mocks();
        let stream = MultiShapeStream::new(options).unwrap();
        assert!(stream.is_loading());
        assert!(!stream.is_up_to_date());
        assert_eq!(stream.last_synced_at(), None);

        low.emit_up_to_date(Lsn::new(1)).await;
        low.set_last_synced_at(Some(2_000));
        assert!(stream.is_loading());
        assert!(!stream.is_up_to_date());
        assert!(!stream.is_connected());
        assert_eq!(stream.last_synced_at(), Some(2_000));

        high.emit_up_to_date(Lsn::new(1)).await;
        high.set_last_synced_at(Some(1_000));
        assert!(!stream.is_loading());
        assert!(stream.is_up_to_date());
        assert!(stream.is_connected());
        assert_eq!(stream.last_synced_at(), Some(1_000));
        assert!(stream.last_synced().is_some());

        high.set_connected(false);
        assert!(!stream.is_connected());
    }

    #[tokio::test]
    async fn drop_closes_owned_streams_only() {
        let factory = MockFactory::default();
        let shared = Arc::new(MockShapeStream::new());
        let options = MultiShapeOptions::new()
            .with_options("owned", ShapeOptions::new("http://localhost/v1/shape", "issues"))
            .with_stream("shared", Arc::clone(&shared) as Arc<dyn ShapeStream>);

        let stream = MultiShapeStream::with_factory(options, &factory).unwrap();
        assert!(stream.shape("owned").is_some());
        assert_eq!(shared.handler_count(), 1);

        let clone = stream.clone();
        drop(stream);
        assert_eq!(shared.handler_count(), 1);
        drop(clone);

        assert_eq!(shared.handler_count(), 0);
        assert!(!shared.is_closed());
        assert!(factory.built.lock().iter().all(|stream| stream.is_closed()));
    }
}
