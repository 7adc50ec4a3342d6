//! Diff calculation for slot notifications.
//!
//! Computes the difference between the stored snapshot of a target and a
//! freshly fetched one. The `appeared` set is the only source of
//! notifications; nothing re-derives it later.

use std::collections::BTreeSet;

use crate::models::{Slot, Snapshot};

/// Partition of two snapshots by structural slot equality.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotDiff {
    /// In current but not in previous
    pub appeared: BTreeSet<Slot>,
    /// In previous but not in current
    pub disappeared: BTreeSet<Slot>,
    /// In both
    pub unchanged: BTreeSet<Slot>,
    /// No previous snapshot existed; current becomes the baseline
    pub baseline: bool,
}

impl SlotDiff {
    /// Check if there are any changes.
    pub fn has_changes(&self) -> bool {
        !self.appeared.is_empty() || !self.disappeared.is_empty()
    }

    /// Get the total number of changes.
    pub fn change_count(&self) -> usize {
        self.appeared.len() + self.disappeared.len()
    }
}

/// Calculate the diff between the previous and current snapshot.
///
/// With no previous snapshot the result is a baseline: nothing appeared,
/// nothing disappeared, and every current slot counts as unchanged.
pub fn diff(previous: Option<&Snapshot>, current: &Snapshot) -> SlotDiff {
    let Some(previous) = previous else {
        return SlotDiff {
            unchanged: current.slots.clone(),
            baseline: true,
            ..SlotDiff::default()
        };
    };

    SlotDiff {
        appeared: current.slots.difference(&previous.slots).cloned().collect(),
        disappeared: previous.slots.difference(&current.slots).cloned().collect(),
        unchanged: current.slots.intersection(&previous.slots).cloned().collect(),
        baseline: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn make_slot(day: u32, hour: u32) -> Slot {
        Slot::new(
            NaiveDate::from_ymd_opt(2026, 2, day).unwrap(),
            NaiveTime::from_hms_opt(hour, 0, 0),
            "Madrid",
        )
    }

    fn snap(slots: &[Slot]) -> Snapshot {
        Snapshot::new(slots.iter().cloned())
    }

    #[test]
    fn test_first_poll_is_baseline() {
        let curr = snap(&[make_slot(1, 9), make_slot(1, 10), make_slot(2, 9)]);

        let result = diff(None, &curr);
        assert!(result.baseline);
        assert!(result.appeared.is_empty());
        assert!(result.disappeared.is_empty());
        assert_eq!(result.unchanged.len(), 3);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_no_changes() {
        let prev = snap(&[make_slot(1, 9), make_slot(2, 9)]);
        let curr = prev.clone();

        let result = diff(Some(&prev), &curr);
        assert!(!result.has_changes());
        assert_eq!(result.change_count(), 0);
        assert_eq!(result.unchanged.len(), 2);
    }

    #[test]
    fn test_mixed_changes() {
        let (a, b, c) = (make_slot(1, 9), make_slot(1, 10), make_slot(1, 11));
        let prev = snap(&[a.clone(), b.clone()]);
        let curr = snap(&[b.clone(), c.clone()]);

        let result = diff(Some(&prev), &curr);
        assert_eq!(result.appeared, BTreeSet::from([c]));
        assert_eq!(result.disappeared, BTreeSet::from([a]));
        assert_eq!(result.unchanged, BTreeSet::from([b]));
    }

    #[test]
    fn test_partition_is_disjoint() {
        let prev = snap(&[make_slot(1, 9), make_slot(2, 9), make_slot(3, 9)]);
        let curr = snap(&[make_slot(2, 9), make_slot(3, 9), make_slot(4, 9)]);

        let result = diff(Some(&prev), &curr);
        assert!(result.appeared.is_disjoint(&result.disappeared));
        assert!(result.appeared.is_disjoint(&result.unchanged));
        assert!(result.disappeared.is_disjoint(&result.unchanged));
    }

    #[test]
    fn test_full_to_empty() {
        let prev = snap(&[make_slot(1, 9), make_slot(2, 9)]);
        let curr = snap(&[]);

        let result = diff(Some(&prev), &curr);
        assert!(result.appeared.is_empty());
        assert_eq!(result.disappeared.len(), 2);
    }

    #[test]
    fn test_empty_to_full() {
        let prev = snap(&[]);
        let curr = snap(&[make_slot(1, 9)]);

        let result = diff(Some(&prev), &curr);
        assert!(!result.baseline);
        assert_eq!(result.appeared.len(), 1);
    }

    #[test]
    fn test_diff_is_pure() {
        let prev = snap(&[make_slot(1, 9)]);
        let curr = snap(&[make_slot(1, 9), make_slot(5, 12)]);

        let first = diff(Some(&prev), &curr);
        let second = diff(Some(&prev), &curr);
        assert_eq!(first, second);
        assert_eq!(prev.len(), 1);
        assert_eq!(curr.len(), 2);
    }

    #[test]
    fn test_same_snapshot_after_restart_is_quiet() {
        let stored = snap(&[make_slot(1, 9), make_slot(2, 10)]);
        let refetched = snap(&[make_slot(2, 10), make_slot(1, 9)]);

        let result = diff(Some(&stored), &refetched);
        assert!(result.appeared.is_empty());
        assert!(result.disappeared.is_empty());
    }
}
