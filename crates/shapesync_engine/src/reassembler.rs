//! Cross-shape transaction reassembly.
//!
//! One source transaction may touch rows in several shapes, and each shape
//! reports at its own pace. Messages are buffered by LSN and a transaction is
//! released only once every shape has confirmed it is complete through that
//! LSN, so consumers see each transaction whole and in log order.

use crate::error::{MultiShapeError, MultiShapeResult};
use shapesync_protocol::{headers, Lsn, LsnMark, Message, MultiShapeMessage, ShapeKey};
use std::collections::BTreeMap;

/// What a buffered message contributes, decided before anything is mutated.
enum Effect {
    /// Change at an LSN; `completes` when it closes its transaction for the
    /// shape while the coordinator is up to date.
    Change { lsn: Lsn, completes: bool },
    /// Up-to-date control at an LSN.
    UpToDate(Lsn),
    /// Other control messages are not forwarded.
    Drop,
}

/// Buffers tagged messages and releases whole transactions.
///
/// # Invariants
///
/// - Per-shape complete LSNs only move forward
/// - Released LSNs are strictly increasing across calls
/// - A malformed batch leaves the buffer untouched
#[derive(Debug, Clone, Default)]
pub struct TransactionReassembler {
    complete: BTreeMap<ShapeKey, LsnMark>,
    pending: BTreeMap<Lsn, Vec<MultiShapeMessage>>,
}

impl TransactionReassembler {
    /// Creates a reassembler with every shape at the sentinel.
    pub fn new<I: IntoIterator<Item = ShapeKey>>(keys: I) -> Self {
        Self {
            complete: keys.into_iter().map(|key| (key, LsnMark::Unset)).collect(),
            pending: BTreeMap::new(),
        }
    }

    /// Returns a shape's complete LSN.
    pub fn complete_lsn(&self, key: &ShapeKey) -> Option<LsnMark> {
        self.complete.get(key).copied()
    }

    /// Lowest complete LSN across shapes; `None` with no shapes.
    pub fn watermark(&self) -> Option<LsnMark> {
        LsnMark::min_of(self.complete.values().copied())
    }

    /// LSNs currently held back.
    pub fn buffered_lsns(&self) -> Vec<Lsn> {
        self.pending.keys().copied().collect()
    }

    /// Number of messages currently held back.
    pub fn buffered_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Checks that [`accept`](Self::accept) would take `batch` without
    /// changing anything.
    pub fn validate(batch: &[MultiShapeMessage]) -> MultiShapeResult<()> {
        batch
            .iter()
            .try_for_each(|message| classify(message, false).map(|_| ()))
    }

    /// Buffers a batch and returns every transaction now safe to release.
    ///
    /// `all_up_to_date` is whether every shape of the coordinator reported
    /// up-to-date when the batch arrived; a change's `last` marker only
    /// completes its LSN in that state.
    pub fn accept(
        &mut self,
        batch: Vec<MultiShapeMessage>,
        all_up_to_date: bool,
    ) -> MultiShapeResult<Vec<MultiShapeMessage>> {
        let effects = batch
            .iter()
            .map(|message| classify(message, all_up_to_date))
            .collect::<MultiShapeResult<Vec<_>>>()?;

        for (message, effect) in batch.into_iter().zip(effects) {
            match effect {
                Effect::Change { lsn, completes } => {
                    if completes {
                        self.mark_complete(&message.shape, lsn);
                    }
                    self.pending.entry(lsn).or_default().push(message);
                }
                Effect::UpToDate(lsn) => self.mark_complete(&message.shape, lsn),
                Effect::Drop => {}
            }
        }

        Ok(self.release())
    }

    fn mark_complete(&mut self, shape: &ShapeKey, lsn: Lsn) {
        if let Some(mark) = self.complete.get_mut(shape) {
            mark.advance(lsn);
        }
    }

    fn release(&mut self) -> Vec<MultiShapeMessage> {
        let Some(watermark) = self.watermark().and_then(|mark| mark.lsn()) else {
            return Vec::new();
        };
        let ready = match watermark.as_u64().checked_add(1) {
            Some(next) => {
                let held = self.pending.split_off(&Lsn::new(next));
                std::mem::replace(&mut self.pending, held)
            }
            None => std::mem::take(&mut self.pending),
        };

        let mut released = Vec::with_capacity(ready.values().map(Vec::len).sum());
        for (_, mut messages) in ready {
            order_by_op_position(&mut messages);
            released.extend(messages);
        }
        released
    }
}

fn classify(message: &MultiShapeMessage, all_up_to_date: bool) -> MultiShapeResult<Effect> {
    let protocol = |source| MultiShapeError::protocol(&message.shape, source);
    match &message.message {
        Message::Change(change) => {
            let lsn = change.lsn_or_zero().map_err(protocol)?;
            Ok(Effect::Change {
                lsn,
                completes: all_up_to_date && change.headers.last(),
            })
        }
        Message::Control(control) if control.is_up_to_date() => {
            let lsn = control
                .headers
                .global_last_seen_lsn()
                .map_err(protocol)?
                .ok_or_else(|| {
                    protocol(shapesync_protocol::ProtocolError::MissingHeader(
                        headers::GLOBAL_LAST_SEEN_LSN,
                    ))
                })?;
            Ok(Effect::UpToDate(lsn))
        }
        Message::Control(_) => Ok(Effect::Drop),
    }
}

/// Sorts the messages of one transaction by `op_position`.
///
/// Messages without a position keep their slot; the others are sorted stably
/// into the remaining slots.
fn order_by_op_position(messages: &mut [MultiShapeMessage]) {
    let slots: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, message)| message.headers().op_position().is_some())
        .map(|(slot, _)| slot)
        .collect();
    if slots.len() < 2 {
        return;
    }

    let mut positioned: Vec<MultiShapeMessage> =
        slots.iter().map(|&slot| messages[slot].clone()).collect();
    positioned.sort_by_key(|message| message.headers().op_position());
    for (slot, message) in slots.into_iter().zip(positioned) {
        messages[slot] = message;
    }
}
