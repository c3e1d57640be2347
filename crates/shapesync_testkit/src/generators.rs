//! Property-based test generators using proptest.
//!
//! Provides strategies for LSN sequences, messages and write scripts that
//! keep the invariants the engine relies on: LSNs never go backwards within
//! a shape, and scripts only touch rows that exist.

use crate::fixtures::issue;
use crate::simulation::{SimulatedSource, SimulationResult, Write};
use proptest::prelude::*;
use serde_json::json;
use shapesync_protocol::{ChangeMessage, ControlMessage, Lsn, Message, Operation};

/// Strategy for arbitrary LSNs.
pub fn lsn_strategy() -> impl Strategy<Value = Lsn> {
    any::<u64>().prop_map(Lsn::new)
}

/// Strategy for strictly increasing LSN sequences starting above zero.
pub fn increasing_lsns_strategy(max_len: usize) -> impl Strategy<Value = Vec<Lsn>> {
    prop::collection::vec(1u64..1_000, 0..=max_len).prop_map(|gaps| {
        gaps.into_iter()
            .scan(0u64, |lsn, gap| {
                *lsn += gap;
                Some(Lsn::new(*lsn))
            })
            .collect()
    })
}

/// Strategy for issue priorities straddling the default threshold of 10.
pub fn priority_strategy() -> impl Strategy<Value = i64> {
    0i64..=20
}

/// Strategy for a shape's feed: change messages at increasing LSNs, each
/// transaction followed by an up-to-date control.
pub fn shape_feed_strategy(max_transactions: usize) -> impl Strategy<Value = Vec<Message>> {
    (
        increasing_lsns_strategy(max_transactions),
        prop::collection::vec(1usize..4, max_transactions),
    )
        .prop_map(|(lsns, sizes)| {
            let mut feed = Vec::new();
            for (lsn, size) in lsns.into_iter().zip(sizes) {
                for position in 0..size {
                    let id = format!("{}-{position}", lsn.as_u64());
                    feed.push(
                        ChangeMessage::new(Operation::Insert, id.clone(), json!({ "id": id }))
                            .with_lsn(lsn)
                            .with_op_position(position as u64)
                            .with_last(position + 1 == size)
                            .into(),
                    );
                }
                feed.push(ControlMessage::up_to_date(lsn).into());
            }
            feed
        })
}

/// One step of a write script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Inserts the row, or updates it if it exists.
    Upsert {
        /// Row id.
        id: u64,
        /// New priority.
        priority: i64,
    },
    /// Deletes the row if it exists.
    Delete {
        /// Row id.
        id: u64,
    },
    /// Moves two rows in one transaction.
    Swap {
        /// First row id.
        first: u64,
        /// Second row id.
        second: u64,
        /// Priority given to both.
        priority: i64,
    },
}

/// Strategy for write scripts over `rows` distinct ids.
pub fn script_strategy(rows: u64, max_len: usize) -> impl Strategy<Value = Vec<ScriptStep>> {
    let rows = rows.max(1);
    let step = prop_oneof![
        3 => (0..rows, priority_strategy())
            .prop_map(|(id, priority)| ScriptStep::Upsert { id, priority }),
        1 => (0..rows).prop_map(|id| ScriptStep::Delete { id }),
        1 => (0..rows, 0..rows, priority_strategy()).prop_map(|(first, second, priority)| {
            ScriptStep::Swap {
                first,
                second,
                priority,
            }
        }),
    ];
    prop::collection::vec(step, 0..=max_len)
}

fn upsert(source: &SimulatedSource, id: u64, priority: i64) -> Write {
    let row = issue(id, priority, &format!("issue {id}"));
    if source.row(&id.to_string()).is_some() {
        Write::Update(row)
    } else {
        Write::Insert(row)
    }
}

/// Applies a step as one transaction, turning it into writes valid for the
/// source's current rows.
pub fn apply_step(source: &SimulatedSource, step: &ScriptStep) -> SimulationResult<Lsn> {
    let writes = match *step {
        ScriptStep::Upsert { id, priority } => vec![upsert(source, id, priority)],
        ScriptStep::Delete { id } => {
            if source.row(&id.to_string()).is_some() {
                vec![Write::Delete(id.to_string())]
            } else {
                Vec::new()
            }
        }
        ScriptStep::Swap {
            first,
            second,
            priority,
        } if first != second => vec![
            upsert(source, first, priority),
            upsert(source, second, 20 - priority),
        ],
        ScriptStep::Swap { first, priority, .. } => vec![upsert(source, first, priority)],
    };
    source.commit(writes)
}
