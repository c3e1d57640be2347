//! Simulated change source and shape streams.
//!
//! [`SimulatedSource`] is an in-memory table with a commit log. Every
//! committed transaction gets a fresh LSN. A [`SimulatedShapeStream`] serves
//! one filtered view of it the way a shape endpoint does: an initial
//! snapshot, then live long polls that answer only when matching rows
//! change, when the live timeout expires, or when a refresh is forced.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use shapesync_engine::{
    BatchHandler, MultiShapeError, MultiShapeResult, ShapeError, ShapeErrorHandler, ShapeHandlers,
    ShapeOptions, ShapeStatus, ShapeStream, ShapeStreamFactory, Unsubscribe,
};
use shapesync_protocol::{ChangeMessage, ControlMessage, Lsn, Message, Operation, ShapeKey};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// Errors from the simulated source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimulationError {
    /// A row has no usable `id` field.
    #[error("row has no string or integer `id` field")]
    MissingId,

    /// Insert of a row that exists.
    #[error("row {0} already exists")]
    DuplicateRow(String),

    /// Update or delete of a row that does not exist.
    #[error("row {0} does not exist")]
    UnknownRow(String),

    /// A `where` clause outside the supported grammar.
    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    /// A shape asked for a table the source does not hold.
    #[error("unknown table {0}")]
    UnknownTable(String),
}

/// Result type for simulation operations.
pub type SimulationResult<T> = Result<T, SimulationError>;

/// Timing of the simulated source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    /// How long a live poll waits for matching changes before answering
    /// with a bare up-to-date.
    pub live_timeout: Duration,
    /// Distance between consecutive transaction LSNs.
    pub lsn_step: u64,
}

impl SimulationConfig {
    /// Sets the live poll timeout.
    pub fn with_live_timeout(mut self, timeout: Duration) -> Self {
        self.live_timeout = timeout;
        self
    }

    /// Sets the LSN distance between transactions.
    pub fn with_lsn_step(mut self, step: u64) -> Self {
        self.lsn_step = step.max(1);
        self
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            live_timeout: Duration::from_secs(20),
            lsn_step: 1,
        }
    }
}

/// Comparison operator of a [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `=`
    Eq,
    /// `!=` or `<>`
    Ne,
}

impl Comparison {
    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "<" => Some(Comparison::Lt),
            "<=" => Some(Comparison::Le),
            ">" => Some(Comparison::Gt),
            ">=" => Some(Comparison::Ge),
            "=" => Some(Comparison::Eq),
            "!=" | "<>" => Some(Comparison::Ne),
            _ => None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "=",
            Comparison::Ne => "!=",
        }
    }

    fn holds(&self, left: i64, right: i64) -> bool {
        match self {
            Comparison::Lt => left < right,
            Comparison::Le => left <= right,
            Comparison::Gt => left > right,
            Comparison::Ge => left >= right,
            Comparison::Eq => left == right,
            Comparison::Ne => left != right,
        }
    }
}

/// Row filter of a simulated shape.
///
/// Grammar: `<column> <op> <integer>`, tokens separated by whitespace, with
/// `op` one of `<`, `<=`, `>`, `>=`, `=`, `!=`, `<>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Predicate {
    /// Every row.
    #[default]
    All,
    /// Rows whose integer column compares true against a constant.
    Compare {
        /// Column name.
        column: String,
        /// Operator.
        op: Comparison,
        /// Right-hand constant.
        value: i64,
    },
}

impl Predicate {
    /// Parses an optional `where` clause; `None` or blank selects every row.
    pub fn parse(clause: Option<&str>) -> SimulationResult<Self> {
        match clause.map(str::trim) {
            None | Some("") => Ok(Predicate::All),
            Some(clause) => clause.parse(),
        }
    }

    /// Returns true if the row belongs to the shape.
    ///
    /// A missing or non-integer column never matches.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Compare { column, op, value } => row
                .get(column)
                .and_then(Value::as_i64)
                .is_some_and(|left| op.holds(left, *value)),
        }
    }
}

impl FromStr for Predicate {
    type Err = SimulationError;

    fn from_str(clause: &str) -> SimulationResult<Self> {
        let invalid = || SimulationError::InvalidPredicate(clause.to_string());
        let tokens: Vec<&str> = clause.split_whitespace().collect();
        let [column, symbol, value] = tokens.as_slice() else {
            return Err(invalid());
        };

        let mut chars = column.chars();
        let identifier = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !identifier {
            return Err(invalid());
        }

        Ok(Predicate::Compare {
            column: (*column).to_string(),
            op: Comparison::from_symbol(symbol).ok_or_else(invalid)?,
            value: value.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => f.write_str("true"),
            Predicate::Compare { column, op, value } => {
                write!(f, "{column} {} {value}", op.symbol())
            }
        }
    }
}

/// One write of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Adds a new row.
    Insert(Value),
    /// Replaces an existing row.
    Update(Value),
    /// Removes a row by id.
    Delete(String),
}

/// Extracts the `id` of a row as a string.
pub fn row_id(row: &Value) -> SimulationResult<String> {
    match row.get("id") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(id)) if id.is_u64() || id.is_i64() => Ok(id.to_string()),
        _ => Err(SimulationError::MissingId),
    }
}

#[derive(Debug, Clone)]
struct RowChange {
    id: String,
    old: Option<Value>,
    new: Option<Value>,
}

#[derive(Debug, Clone)]
struct Commit {
    lsn: Lsn,
    changes: Vec<RowChange>,
}

impl Commit {
    /// The part of the transaction visible to one shape.
    fn messages_for(&self, predicate: &Predicate) -> Vec<Message> {
        let mut changes = Vec::new();
        for (position, change) in self.changes.iter().enumerate() {
            let was = change.old.as_ref().is_some_and(|row| predicate.matches(row));
            let is = change.new.as_ref().is_some_and(|row| predicate.matches(row));
            let (operation, value) = match (&change.old, &change.new) {
                (_, Some(new)) if is && !was => (Operation::Insert, new),
                (_, Some(new)) if is => (Operation::Update, new),
                (Some(old), _) if was => (Operation::Delete, old),
                _ => continue,
            };
            changes.push(
                ChangeMessage::new(operation, change.id.clone(), value.clone())
                    .with_lsn(self.lsn)
                    .with_op_position(position as u64),
            );
        }

        let count = changes.len();
        changes
            .into_iter()
            .enumerate()
            .map(|(index, change)| {
                if index + 1 == count {
                    change.with_last(true).into()
                } else {
                    change.into()
                }
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct SourceState {
    rows: BTreeMap<String, Value>,
    log: Vec<Commit>,
    head: Lsn,
}

/// In-memory table with a transaction log.
#[derive(Debug)]
pub struct SimulatedSource {
    table: String,
    config: SimulationConfig,
    state: Mutex<SourceState>,
    head: watch::Sender<Lsn>,
}

impl SimulatedSource {
    /// Creates an empty source for `table` with default timing.
    pub fn new(table: impl Into<String>) -> Self {
        Self::with_config(table, SimulationConfig::default())
    }

    /// Creates an empty source with the given timing.
    pub fn with_config(table: impl Into<String>, config: SimulationConfig) -> Self {
        let (head, _) = watch::channel(Lsn::ZERO);
        Self {
            table: table.into(),
            config,
            state: Mutex::new(SourceState::default()),
            head,
        }
    }

    /// Table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Timing configuration.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// LSN of the latest transaction, zero before any.
    pub fn head(&self) -> Lsn {
        self.state.lock().head
    }

    /// Current rows, ordered by id.
    pub fn rows(&self) -> Vec<Value> {
        self.state.lock().rows.values().cloned().collect()
    }

    /// Looks up one row.
    pub fn row(&self, id: &str) -> Option<Value> {
        self.state.lock().rows.get(id).cloned()
    }

    /// Applies a transaction atomically and returns its LSN.
    ///
    /// Nothing is applied if any write fails. An empty transaction returns
    /// the current head without committing.
    pub fn commit(&self, writes: Vec<Write>) -> SimulationResult<Lsn> {
        let mut state = self.state.lock();
        if writes.is_empty() {
            return Ok(state.head);
        }

        let mut rows = state.rows.clone();
        let mut changes = Vec::with_capacity(writes.len());
        for write in writes {
            let change = match write {
                Write::Insert(row) => {
                    let id = row_id(&row)?;
                    if rows.contains_key(&id) {
                        return Err(SimulationError::DuplicateRow(id));
                    }
                    rows.insert(id.clone(), row.clone());
                    RowChange {
                        id,
                        old: None,
                        new: Some(row),
                    }
                }
                Write::Update(row) => {
                    let id = row_id(&row)?;
                    let old = rows
                        .insert(id.clone(), row.clone())
                        .ok_or_else(|| SimulationError::UnknownRow(id.clone()))?;
                    RowChange {
                        id,
                        old: Some(old),
                        new: Some(row),
                    }
                }
                Write::Delete(id) => {
                    let old = rows
                        .remove(&id)
                        .ok_or_else(|| SimulationError::UnknownRow(id.clone()))?;
                    RowChange {
                        id,
                        old: Some(old),
                        new: None,
                    }
                }
            };
            changes.push(change);
        }

        let lsn = Lsn::new(state.head.as_u64() + self.config.lsn_step);
        state.rows = rows;
        state.head = lsn;
        debug!(table = %self.table, %lsn, writes = changes.len(), "transaction committed");
        state.log.push(Commit { lsn, changes });
        self.head.send_replace(lsn);
        Ok(lsn)
    }

    /// Inserts one row in its own transaction.
    pub fn insert(&self, row: Value) -> SimulationResult<Lsn> {
        self.commit(vec![Write::Insert(row)])
    }

    /// Replaces one row in its own transaction.
    pub fn update(&self, row: Value) -> SimulationResult<Lsn> {
        self.commit(vec![Write::Update(row)])
    }

    /// Deletes one row in its own transaction.
    pub fn delete(&self, id: impl Into<String>) -> SimulationResult<Lsn> {
        self.commit(vec![Write::Delete(id.into())])
    }

    /// Matching rows as snapshot inserts, and the head they reflect.
    ///
    /// Snapshot rows carry no `lsn` and no `op_position`.
    pub fn snapshot(&self, predicate: &Predicate) -> (Vec<Message>, Lsn) {
        let state = self.state.lock();
        let rows = state
            .rows
            .iter()
            .filter(|(_, row)| predicate.matches(row))
            .map(|(id, row)| ChangeMessage::new(Operation::Insert, id.clone(), row.clone()).into())
            .collect();
        (rows, state.head)
    }

    /// Matching changes committed after `after`, and the current head.
    pub fn changes_since(&self, after: Lsn, predicate: &Predicate) -> (Vec<Message>, Lsn) {
        let state = self.state.lock();
        let start = state.log.partition_point(|commit| commit.lsn <= after);
        let messages = state.log[start..]
            .iter()
            .flat_map(|commit| commit.messages_for(predicate))
            .collect();
        (messages, state.head)
    }

    fn watch_head(&self) -> watch::Receiver<Lsn> {
        self.head.subscribe()
    }
}

/// State shared between a stream and its poll task.
struct Feed {
    key: ShapeKey,
    source: Arc<SimulatedSource>,
    predicate: Predicate,
    status: ShapeStatus,
    handlers: ShapeHandlers,
    aborted: Mutex<bool>,
}

impl Feed {
    /// Answers a poll: `changes` followed by an up-to-date at `head`.
    async fn respond(&self, mut changes: Vec<Message>, head: Lsn) {
        changes.push(ControlMessage::up_to_date(head).into());
        {
            let aborted = self.aborted.lock();
            if *aborted {
                return;
            }
            self.status.observe(&changes);
        }
        debug!(shape = %self.key, messages = changes.len(), %head, "poll answered");
        self.handlers.deliver(changes).await;
    }

    async fn poll(
        self: Arc<Self>,
        mut refreshes: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
        abort: Arc<Notify>,
    ) {
        let mut head_changes = self.source.watch_head();
        let (snapshot, mut cursor) = self.source.snapshot(&self.predicate);
        self.respond(snapshot, cursor).await;

        loop {
            let (changes, head) = self.source.changes_since(cursor, &self.predicate);
            if !changes.is_empty() {
                cursor = head;
                self.respond(changes, head).await;
                continue;
            }

            tokio::select! {
                biased;

                _ = abort.notified() => break,
                Some(ack) = refreshes.recv() => {
                    let (changes, head) = self.source.changes_since(cursor, &self.predicate);
                    cursor = head;
                    self.respond(changes, head).await;
                    let _ = ack.send(());
                }
                changed = head_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.source.config().live_timeout) => {
                    let (changes, head) = self.source.changes_since(cursor, &self.predicate);
                    cursor = head;
                    self.respond(changes, head).await;
                }
            }
        }
        debug!(shape = %self.key, "poll loop stopped");
    }
}

struct Poller {
    refresh: mpsc::UnboundedSender<oneshot::Sender<()>>,
    abort: Arc<Notify>,
    task: JoinHandle<()>,
}

/// A shape stream over a [`SimulatedSource`].
///
/// Polling starts on the first subscription (or [`start`](Self::start)) and
/// runs on the current tokio runtime.
pub struct SimulatedShapeStream {
    feed: Arc<Feed>,
    started: AtomicBool,
    refreshes: AtomicUsize,
    poller: Mutex<Option<Poller>>,
}

impl SimulatedShapeStream {
    /// Creates an unstarted stream over rows matching `predicate`.
    pub fn new(key: impl Into<ShapeKey>, source: Arc<SimulatedSource>, predicate: Predicate) -> Self {
        Self {
            feed: Arc::new(Feed {
                key: key.into(),
                source,
                predicate,
                status: ShapeStatus::new(),
                handlers: ShapeHandlers::new(),
                aborted: Mutex::new(false),
            }),
            started: AtomicBool::new(false),
            refreshes: AtomicUsize::new(0),
            poller: Mutex::new(None),
        }
    }

    /// Creates an unstarted stream from shape options.
    pub fn from_options(
        key: impl Into<ShapeKey>,
        source: Arc<SimulatedSource>,
        options: &ShapeOptions,
    ) -> SimulationResult<Self> {
        if options.table != source.table() {
            return Err(SimulationError::UnknownTable(options.table.clone()));
        }
        let predicate = Predicate::parse(options.where_clause.as_deref())?;
        Ok(Self::new(key, source, predicate))
    }

    /// Shape key.
    pub fn key(&self) -> &ShapeKey {
        &self.feed.key
    }

    /// Row filter.
    pub fn predicate(&self) -> &Predicate {
        &self.feed.predicate
    }

    /// Starts polling without a handler, as another consumer would.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let (refresh, refreshes) = mpsc::unbounded_channel();
        let abort = Arc::new(Notify::new());
        let task = tokio::spawn(Arc::clone(&self.feed).poll(refreshes, Arc::clone(&abort)));
        *self.poller.lock() = Some(Poller {
            refresh,
            abort,
            task,
        });
        debug!(shape = %self.feed.key, predicate = %self.feed.predicate, "shape stream started");
    }

    /// Stops polling, as an abort signal would. The stream reports itself
    /// disconnected from then on.
    pub fn abort(&self) {
        {
            let mut aborted = self.feed.aborted.lock();
            *aborted = true;
            self.feed.status.set_connected(false);
        }
        if let Some(poller) = self.poller.lock().take() {
            poller.abort.notify_one();
        }
    }

    /// Returns true once aborted or closed.
    pub fn is_aborted(&self) -> bool {
        *self.feed.aborted.lock()
    }

    /// Reports a transport error to every handler.
    pub fn inject_error(&self, error: ShapeError) {
        self.feed.handlers.fail(&error);
    }

    /// Number of forced refreshes so far.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.feed.handlers.len()
    }
}

#[async_trait]
impl ShapeStream for SimulatedShapeStream {
    fn subscribe(&self, on_batch: BatchHandler, on_error: ShapeErrorHandler) -> Unsubscribe {
        let unsubscribe = self.feed.handlers.register(on_batch, on_error);
        self.start();
        unsubscribe
    }

    fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn force_disconnect_and_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let sender = self
            .poller
            .lock()
            .as_ref()
            .map(|poller| poller.refresh.clone());
        let Some(sender) = sender else {
            return;
        };
        let (ack, answered) = oneshot::channel();
        if sender.send(ack).is_ok() {
            let _ = answered.await;
        }
    }

    fn is_connected(&self) -> bool {
        self.feed.status.is_connected()
    }

    fn is_loading(&self) -> bool {
        self.feed.status.is_loading()
    }

    fn is_up_to_date(&self) -> bool {
        self.feed.status.is_up_to_date()
    }

    fn last_synced_at(&self) -> Option<u64> {
        self.feed.status.last_synced_at()
    }

    fn close(&self) {
        self.abort();
        self.feed.handlers.clear();
    }
}

impl Drop for SimulatedShapeStream {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.task.abort();
        }
    }
}

impl fmt::Debug for SimulatedShapeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedShapeStream")
            .field("key", &self.feed.key)
            .field("predicate", &self.feed.predicate)
            .field("started", &self.has_started())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Builds [`SimulatedShapeStream`]s over one source.
///
/// Built streams stay reachable through [`stream`](Self::stream) so tests
/// can abort them or inject errors.
pub struct SimulatedShapeFactory {
    source: Arc<SimulatedSource>,
    built: Mutex<BTreeMap<ShapeKey, Arc<SimulatedShapeStream>>>,
}

impl SimulatedShapeFactory {
    /// Creates a factory over `source`.
    pub fn new(source: Arc<SimulatedSource>) -> Self {
        Self {
            source,
            built: Mutex::new(BTreeMap::new()),
        }
    }

    /// The stream most recently built for `key`.
    pub fn stream(&self, key: &str) -> Option<Arc<SimulatedShapeStream>> {
        self.built.lock().get(key).cloned()
    }
}

impl ShapeStreamFactory for SimulatedShapeFactory {
    fn build(
        &self,
        key: &ShapeKey,
        options: &ShapeOptions,
    ) -> MultiShapeResult<Arc<dyn ShapeStream>> {
        let stream = SimulatedShapeStream::from_options(key.clone(), Arc::clone(&self.source), options)
            .map_err(|err| MultiShapeError::Build {
                shape: key.clone(),
                message: err.to_string(),
            })?;
        let stream = Arc::new(stream);
        self.built.lock().insert(key.clone(), Arc::clone(&stream));
        Ok(stream)
    }
}
