//! Subscriber registry and fan-out.

use crate::error::{MultiShapeError, SubscriberError, SubscriberFailure};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use shapesync_protocol::MultiShapeMessage;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::task::JoinError;
use tracing::{debug, error};
use uuid::Uuid;

/// Callback receiving published batches.
pub type BatchCallback = Arc<
    dyn Fn(Arc<[MultiShapeMessage]>) -> BoxFuture<'static, Result<(), SubscriberError>>
        + Send
        + Sync,
>;

/// Callback receiving transport and protocol errors.
pub type ErrorCallback = Arc<dyn Fn(&MultiShapeError) + Send + Sync>;

/// Hook receiving subscriber callbacks that failed or panicked.
pub type FailureHook = Arc<dyn Fn(SubscriberFailure) + Send + Sync>;

/// Identifier of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscriber {
    id: SubscriptionId,
    on_batch: BatchCallback,
    on_error: Option<ErrorCallback>,
}

type Entries = Mutex<Vec<Subscriber>>;

/// A registered subscriber.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    entries: Weak<Entries>,
}

impl Subscription {
    /// Returns the subscription id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Removes this subscriber. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(entries) = self.entries.upgrade() {
            entries.lock().retain(|subscriber| subscriber.id != self.id);
        }
    }
}

/// Logs failures with `tracing`. Used until another hook is installed.
pub fn log_failure(failure: SubscriberFailure) {
    error!(subscription = %failure.id(), error = %failure, "subscriber callback failed");
}

/// Ordered set of subscribers.
pub(crate) struct SubscriberRegistry {
    entries: Arc<Entries>,
    failure_hook: RwLock<FailureHook>,
}

impl SubscriberRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            failure_hook: RwLock::new(Arc::new(log_failure) as FailureHook),
        }
    }

    pub(crate) fn subscribe<F, Fut>(&self, callback: F, on_error: Option<ErrorCallback>) -> Subscription
    where
        F: Fn(Arc<[MultiShapeMessage]>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
    {
        let id = SubscriptionId::generate();
        let on_batch: BatchCallback = Arc::new(move |batch| callback(batch).boxed());
        self.entries.lock().push(Subscriber {
            id,
            on_batch,
            on_error,
        });
        debug!(subscription = %id, "subscriber registered");
        Subscription {
            id,
            entries: Arc::downgrade(&self.entries),
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn set_failure_hook(&self, hook: FailureHook) {
        *self.failure_hook.write() = hook;
    }

    /// Hands an error to every subscriber that registered an error callback.
    pub(crate) fn broadcast_error(&self, err: &MultiShapeError) {
        let callbacks: Vec<ErrorCallback> = self
            .entries
            .lock()
            .iter()
            .filter_map(|subscriber| subscriber.on_error.clone())
            .collect();
        for on_error in callbacks {
            on_error(err);
        }
    }

    /// Delivers a batch to every subscriber and waits for all of them.
    ///
    /// Each callback runs in its own task. A callback that errors or panics
    /// does not affect delivery to the others; its failure goes to the
    /// failure hook after the fan-out completes.
    pub(crate) async fn publish(&self, batch: Vec<MultiShapeMessage>) {
        let batch: Arc<[MultiShapeMessage]> = batch.into();
        let targets: Vec<(SubscriptionId, BatchCallback)> = self
            .entries
            .lock()
            .iter()
            .map(|subscriber| (subscriber.id, Arc::clone(&subscriber.on_batch)))
            .collect();
        if targets.is_empty() {
            return;
        }

        let (ids, tasks): (Vec<_>, Vec<_>) = targets
            .into_iter()
            .map(|(id, on_batch)| (id, tokio::spawn(on_batch(Arc::clone(&batch)))))
            .unzip();

        let failures: Vec<SubscriberFailure> = ids
            .into_iter()
            .zip(join_all(tasks).await)
            .filter_map(|(id, outcome)| failure(id, outcome))
            .collect();

        if !failures.is_empty() {
            let hook = self.failure_hook.read().clone();
            for failure in failures {
                hook(failure);
            }
        }
    }
}

/// Turns a finished callback task into the failure to report, if any.
///
/// A cancelled task is not a subscriber failure; it only happens while the
/// runtime shuts down.
fn failure(
    id: SubscriptionId,
    outcome: Result<Result<(), SubscriberError>, JoinError>,
) -> Option<SubscriberFailure> {
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(source)) => Some(SubscriberFailure::Failed { id, source }),
        Err(join_error) if join_error.is_panic() => Some(SubscriberFailure::Panicked {
            id,
            message: panic_message(join_error.into_panic()),
        }),
        Err(join_error) => {
            debug!(subscriber = %id, error = %join_error, "subscriber task cancelled");
            None
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
