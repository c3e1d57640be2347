//! Per-shape LSN bookkeeping.

use shapesync_protocol::{Lsn, LsnMark, ShapeKey};
use std::collections::BTreeMap;

/// LSN state for one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShapeLsns {
    /// Highest LSN of any change message seen.
    pub last_data_lsn: LsnMark,
    /// Highest `global_last_seen_lsn` of any control message seen.
    pub last_up_to_date_lsn: LsnMark,
}

impl ShapeLsns {
    /// Returns true if the shape has not confirmed it caught up to `lsn`.
    pub fn is_behind(&self, lsn: LsnMark) -> bool {
        self.last_up_to_date_lsn < lsn
    }
}

/// LSN ledger across all shapes of a coordinator.
///
/// # Invariants
///
/// - Every mark only moves forward
/// - The set of shapes is fixed at construction
#[derive(Debug, Clone, Default)]
pub struct LsnLedger {
    shapes: BTreeMap<ShapeKey, ShapeLsns>,
}

impl LsnLedger {
    /// Creates a ledger with every shape at the sentinel.
    pub fn new<I: IntoIterator<Item = ShapeKey>>(keys: I) -> Self {
        Self {
            shapes: keys
                .into_iter()
                .map(|key| (key, ShapeLsns::default()))
                .collect(),
        }
    }

    /// Returns the state of one shape.
    pub fn get(&self, key: &ShapeKey) -> Option<ShapeLsns> {
        self.shapes.get(key).copied()
    }

    /// Records the highest data LSN of a batch. Returns true if it advanced.
    pub fn observe_data(&mut self, key: &ShapeKey, lsn: Lsn) -> bool {
        self.shapes
            .get_mut(key)
            .is_some_and(|state| state.last_data_lsn.advance(lsn))
    }

    /// Records the highest up-to-date LSN of a batch. Returns true if it advanced.
    pub fn observe_up_to_date(&mut self, key: &ShapeKey, lsn: Lsn) -> bool {
        self.shapes
            .get_mut(key)
            .is_some_and(|state| state.last_up_to_date_lsn.advance(lsn))
    }

    /// Highest data LSN over all shapes.
    pub fn max_data_lsn(&self) -> LsnMark {
        LsnMark::max_of(self.shapes.values().map(|state| state.last_data_lsn)).unwrap_or_default()
    }

    /// Shapes whose up-to-date LSN trails the highest data LSN.
    pub fn lagging_shapes(&self) -> Vec<ShapeKey> {
        let max_data_lsn = self.max_data_lsn();
        self.shapes
            .iter()
            .filter(|(_, state)| state.is_behind(max_data_lsn))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of shapes tracked.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Returns true if no shapes are tracked.
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ledger() -> LsnLedger {
        LsnLedger::new([ShapeKey::from("low"), ShapeKey::from("high")])
    }

    #[test]
    fn starts_at_sentinel() {
        let ledger = ledger();
        let state = ledger.get(&"low".into()).unwrap();
        assert!(state.last_data_lsn.is_unset());
        assert!(state.last_up_to_date_lsn.is_unset());
        assert_eq!(ledger.max_data_lsn(), LsnMark::Unset);
        assert!(ledger.lagging_shapes().is_empty());
    }

    #[test]
    fn observe_is_monotone() {
        let mut ledger = ledger();
        let low = ShapeKey::from("low");

        assert!(ledger.observe_data(&low, Lsn::new(10)));
        assert!(!ledger.observe_data(&low, Lsn::new(8)));
        assert_eq!(
            ledger.get(&low).unwrap().last_data_lsn,
            LsnMark::At(Lsn::new(10))
        );

        assert!(ledger.observe_up_to_date(&low, Lsn::new(12)));
        assert!(!ledger.observe_up_to_date(&low, Lsn::new(12)));
    }

    #[test]
    fn unknown_shape_is_ignored() {
        let mut ledger = ledger();
        assert!(!ledger.observe_data(&"missing".into(), Lsn::new(1)));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn lagging_shapes_trail_max_data() {
        let mut ledger = ledger();
        let low = ShapeKey::from("low");
        let high = ShapeKey::from("high");

        ledger.observe_data(&low, Lsn::new(20));
        ledger.observe_up_to_date(&low, Lsn::new(20));
        ledger.observe_up_to_date(&high, Lsn::new(15));
        assert_eq!(ledger.max_data_lsn(), LsnMark::At(Lsn::new(20)));
        assert_eq!(ledger.lagging_shapes(), vec![high.clone()]);

        ledger.observe_up_to_date(&high, Lsn::new(21));
        assert!(ledger.lagging_shapes().is_empty());
    }

    #[test]
    fn empty_ledger() {
        let ledger = LsnLedger::new(std::iter::empty());
        assert!(ledger.is_empty());
        assert_eq!(ledger.max_data_lsn(), LsnMark::Unset);
        assert!(ledger.lagging_shapes().is_empty());
    }

    proptest! {
        #[test]
        fn marks_never_decrease(
            events in prop::collection::vec((any::<bool>(), any::<bool>(), 0u64..1_000), 0..100)
        ) {
            let mut ledger = ledger();
            let keys = [ShapeKey::from("low"), ShapeKey::from("high")];
            for (first, data, lsn) in events {
                let key = &keys[usize::from(first)];
                let before = ledger.get(key).unwrap();
                if data {
                    ledger.observe_data(key, Lsn::new(lsn));
                } else {
                    ledger.observe_up_to_date(key, Lsn::new(lsn));
                }
                let after = ledger.get(key).unwrap();
                prop_assert!(after.last_data_lsn >= before.last_data_lsn);
                prop_assert!(after.last_up_to_date_lsn >= before.last_up_to_date_lsn);
            }
        }
    }
}
