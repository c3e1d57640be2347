//! Shape stream abstraction.
//!
//! The transport that polls a single shape lives outside this crate. The
//! coordinator only relies on the [`ShapeStream`] trait below.

use crate::config::ShapeOptions;
use crate::error::{MultiShapeResult, ShapeError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use shapesync_protocol::{ControlMessage, Lsn, Message, ShapeKey};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Handler invoked with each batch a shape delivers.
///
/// The stream awaits the returned future before delivering its next batch.
pub type BatchHandler = Arc<dyn Fn(Vec<Message>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler invoked with transport errors.
pub type ShapeErrorHandler = Arc<dyn Fn(ShapeError) + Send + Sync>;

/// Deregisters a handler. Calling it more than once has no effect.
pub struct Unsubscribe(Mutex<Option<Box<dyn FnOnce() + Send>>>);

impl Unsubscribe {
    /// Wraps a deregistration function.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Mutex::new(Some(Box::new(f))))
    }

    /// A handle with nothing to deregister.
    pub fn noop() -> Self {
        Self(Mutex::new(None))
    }

    /// Runs the deregistration function the first time it is called.
    pub fn call(&self) {
        let f = self.0.lock().take();
        if let Some(f) = f {
            f();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("pending", &self.0.lock().is_some())
            .finish()
    }
}

/// One shape's change feed.
///
/// Messages within a batch, and batches in succession, preserve the shape's
/// log order.
#[async_trait]
pub trait ShapeStream: Send + Sync {
    /// Registers handlers, starting the stream if it has not started yet.
    fn subscribe(&self, on_batch: BatchHandler, on_error: ShapeErrorHandler) -> Unsubscribe;

    /// Returns true once the stream has started polling.
    fn has_started(&self) -> bool;

    /// Aborts the in-flight request and issues a fresh one immediately.
    async fn force_disconnect_and_refresh(&self);

    /// Returns true while the transport is connected.
    fn is_connected(&self) -> bool;

    /// Returns true until the first up-to-date message arrives.
    fn is_loading(&self) -> bool;

    /// Returns true after an up-to-date message, until new data arrives.
    fn is_up_to_date(&self) -> bool;

    /// Epoch milliseconds of the last up-to-date message.
    fn last_synced_at(&self) -> Option<u64>;

    /// Tears the stream down.
    ///
    /// Only called for streams the coordinator built itself.
    fn close(&self) {}
}

/// Builds unstarted shape streams from options.
pub trait ShapeStreamFactory: Send + Sync {
    /// Builds the stream for `key`. The stream must not start polling until
    /// it is subscribed to.
    fn build(&self, key: &ShapeKey, options: &ShapeOptions)
        -> MultiShapeResult<Arc<dyn ShapeStream>>;
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Liveness flags of a shape transport.
///
/// Transports call [`ShapeStatus::observe`] with each batch before handing
/// it to handlers, so handlers already see the updated flags.
#[derive(Debug, Default)]
pub struct ShapeStatus {
    connected: AtomicBool,
    up_to_date: AtomicBool,
    synced: AtomicBool,
    last_synced_at: Mutex<Option<u64>>,
}

impl ShapeStatus {
    /// Creates a disconnected, loading status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the flags for a batch about to be delivered.
    pub fn observe(&self, batch: &[Message]) {
        self.connected.store(true, Ordering::SeqCst);
        if batch.iter().any(Message::is_change) {
            self.up_to_date.store(false, Ordering::SeqCst);
        }
        let ends_up_to_date = batch
            .last()
            .and_then(Message::as_control)
            .is_some_and(ControlMessage::is_up_to_date);
        if ends_up_to_date {
            self.up_to_date.store(true, Ordering::SeqCst);
            self.synced.store(true, Ordering::SeqCst);
            *self.last_synced_at.lock() = Some(now_millis());
        }
    }

    /// Sets the connected flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Overrides the last sync time.
    pub fn set_last_synced_at(&self, at: Option<u64>) {
        *self.last_synced_at.lock() = at;
    }

    /// See [`ShapeStream::is_connected`].
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// See [`ShapeStream::is_loading`].
    pub fn is_loading(&self) -> bool {
        !self.synced.load(Ordering::SeqCst)
    }

    /// See [`ShapeStream::is_up_to_date`].
    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date.load(Ordering::SeqCst)
    }

    /// See [`ShapeStream::last_synced_at`].
    pub fn last_synced_at(&self) -> Option<u64> {
        *self.last_synced_at.lock()
    }
}

type Handlers = Vec<(u64, BatchHandler, ShapeErrorHandler)>;

/// Handlers registered with a shape transport.
#[derive(Default)]
pub struct ShapeHandlers {
    entries: Arc<Mutex<Handlers>>,
    next_id: AtomicU64,
}

impl ShapeHandlers {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler pair; the returned handle removes it.
    pub fn register(&self, on_batch: BatchHandler, on_error: ShapeErrorHandler) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push((id, on_batch, on_error));

        let entries = Arc::downgrade(&self.entries);
        Unsubscribe::new(move || {
            if let Some(entries) = entries.upgrade() {
                entries.lock().retain(|(entry_id, _, _)| *entry_id != id);
            }
        })
    }

    /// Delivers a batch to every handler in registration order, awaiting each.
    pub async fn deliver(&self, batch: Vec<Message>) {
        let handlers: Vec<BatchHandler> = self
            .entries
            .lock()
            .iter()
            .map(|(_, on_batch, _)| Arc::clone(on_batch))
            .collect();
        for on_batch in handlers {
            on_batch(batch.clone()).await;
        }
    }

    /// Reports a transport error to every handler.
    pub fn fail(&self, error: &ShapeError) {
        let handlers: Vec<ShapeErrorHandler> = self
            .entries
            .lock()
            .iter()
            .map(|(_, _, on_error)| Arc::clone(on_error))
            .collect();
        for on_error in handlers {
            on_error(error.clone());
        }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// A shape stream driven by hand, for testing.
///
/// Batches are pushed with [`MockShapeStream::emit`]; the liveness flags
/// follow them the way a real transport's would.
#[derive(Default)]
pub struct MockShapeStream {
    started: AtomicBool,
    closed: AtomicBool,
    status: ShapeStatus,
    handlers: ShapeHandlers,
    refreshes: AtomicUsize,
    refresh_response: Mutex<Option<Lsn>>,
}

impl MockShapeStream {
    /// Creates an unstarted mock stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock stream that reports itself as already started.
    pub fn started() -> Self {
        let stream = Self::new();
        stream.started.store(true, Ordering::SeqCst);
        stream
    }

    /// Delivers a batch to every handler, in registration order.
    pub async fn emit(&self, batch: Vec<Message>) {
        self.status.observe(&batch);
        self.handlers.deliver(batch).await;
    }

    /// Delivers an up-to-date control at `lsn`.
    pub async fn emit_up_to_date(&self, lsn: Lsn) {
        self.emit(vec![ControlMessage::up_to_date(lsn).into()]).await;
    }

    /// Reports a transport error to every handler.
    pub fn fail(&self, error: ShapeError) {
        self.handlers.fail(&error);
    }

    /// Answers every forced refresh with an up-to-date at `lsn`.
    pub fn set_refresh_response(&self, lsn: Lsn) {
        *self.refresh_response.lock() = Some(lsn);
    }

    /// Sets the connected flag.
    pub fn set_connected(&self, connected: bool) {
        self.status.set_connected(connected);
    }

    /// Sets the last sync time.
    pub fn set_last_synced_at(&self, at: Option<u64>) {
        self.status.set_last_synced_at(at);
    }

    /// Number of forced refreshes so far.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShapeStream for MockShapeStream {
    fn subscribe(&self, on_batch: BatchHandler, on_error: ShapeErrorHandler) -> Unsubscribe {
        self.started.store(true, Ordering::SeqCst);
        self.handlers.register(on_batch, on_error)
    }

    fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn force_disconnect_and_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let response = *self.refresh_response.lock();
        if let Some(lsn) = response {
            self.emit_up_to_date(lsn).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    fn is_loading(&self) -> bool {
        self.status.is_loading()
    }

    fn is_up_to_date(&self) -> bool {
        self.status.is_up_to_date()
    }

    fn last_synced_at(&self) -> Option<u64> {
        self.status.last_synced_at()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.status.set_connected(false);
        self.handlers.clear();
    }
}
