//! Slot and snapshot data structures.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// One bookable appointment unit advertised by the portal.
///
/// Identity is structural: two slots with identical attributes are the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    /// Appointment day
    pub date: NaiveDate,

    /// Appointment time, when the portal advertises one
    #[serde(default)]
    pub time: Option<NaiveTime>,

    /// Office or site where the appointment takes place
    pub location: String,

    /// Target-specific attributes (desk, procedure code, ...)
    #[serde(default)]
    pub qualifiers: BTreeMap<String, String>,
}

impl Slot {
    /// Create a slot without qualifiers.
    pub fn new(date: NaiveDate, time: Option<NaiveTime>, location: impl Into<String>) -> Self {
        Self {
            date,
            time,
            location: location.into(),
            qualifiers: BTreeMap::new(),
        }
    }

    /// Add a qualifier, builder style.
    pub fn with_qualifier(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.qualifiers.insert(key.into(), value.into());
        self
    }

    /// Human-readable time, `--:--` when the portal gives only a day.
    pub fn time_label(&self) -> String {
        self.time
            .map(|t| t.format("%H:%M").to_string())
            .unwrap_or_else(|| "--:--".to_string())
    }

    /// Qualifiers rendered as `key=value` pairs in key order.
    pub fn qualifiers_label(&self) -> String {
        self.qualifiers
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether the slot's day lies inside the optional inclusive range.
    pub fn within(&self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
        from.is_none_or(|f| self.date >= f) && to.is_none_or(|t| self.date <= t)
    }
}

/// All slots observed for a target at one fetch instant.
///
/// Backed by an ordered set, so a snapshot never holds duplicates and
/// serializes deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the portal was queried
    pub fetched_at: DateTime<Utc>,

    /// Distinct slots advertised at that time
    pub slots: BTreeSet<Slot>,
}

impl Snapshot {
    /// Build a snapshot stamped with the current time.
    pub fn new(slots: impl IntoIterator<Item = Slot>) -> Self {
        Self::at(Utc::now(), slots)
    }

    /// Build a snapshot with an explicit timestamp.
    pub fn at(fetched_at: DateTime<Utc>, slots: impl IntoIterator<Item = Slot>) -> Self {
        Self {
            fetched_at,
            slots: slots.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, slot: &Slot) -> bool {
        self.slots.contains(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_structural_identity() {
        let a = Slot::new(day(2), NaiveTime::from_hms_opt(9, 30, 0), "Madrid").with_qualifier("desk", "4");
        let b = Slot::new(day(2), NaiveTime::from_hms_opt(9, 30, 0), "Madrid").with_qualifier("desk", "4");
        let c = Slot::new(day(2), NaiveTime::from_hms_opt(9, 30, 0), "Madrid").with_qualifier("desk", "5");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_snapshot_drops_duplicates() {
        let slot = Slot::new(day(2), None, "Madrid");
        let snapshot = Snapshot::new(vec![slot.clone(), slot.clone(), slot]);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_within_range() {
        let slot = Slot::new(day(10), None, "Sevilla");
        assert!(slot.within(None, None));
        assert!(slot.within(Some(day(10)), Some(day(10))));
        assert!(!slot.within(Some(day(11)), None));
        assert!(!slot.within(None, Some(day(9))));
    }

    #[test]
    fn test_labels() {
        let slot = Slot::new(day(2), NaiveTime::from_hms_opt(8, 5, 0), "Madrid")
            .with_qualifier("procedure", "TIE")
            .with_qualifier("desk", "4");
        assert_eq!(slot.time_label(), "08:05");
        assert_eq!(slot.qualifiers_label(), "desk=4, procedure=TIE");
        assert_eq!(Slot::new(day(2), None, "Madrid").time_label(), "--:--");
    }
}
