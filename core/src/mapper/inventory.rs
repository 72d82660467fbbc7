use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use fortress_common::network::target::{MacAddr, Target};
use parking_lot::RwLock;

/// Every target the mapper has ever seen, keyed by hardware address.
/// Records are merged, never removed.
#[derive(Debug, Default)]
pub struct Inventory {
    targets: RwLock<HashMap<MacAddr, Target>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a batch of sightings and returns the updated records, in the
    /// order of the batch.
    pub fn upsert(&self, sightings: &[Target]) -> Vec<Target> {
        let mut targets = self.targets.write();
        sightings
            .iter()
            .map(|sighting| {
                targets
                    .entry(sighting.id)
                    .and_modify(|known| known.observe(sighting))
                    .or_insert_with(|| sighting.clone())
                    .clone()
            })
            .collect()
    }

    pub fn get(&self, id: MacAddr) -> Option<Target> {
        self.targets.read().get(&id).cloned()
    }

    /// Targets seen within `max_age`, strongest signal first.
    pub fn active(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<Target> {
        let mut active: Vec<Target> = self
            .targets
            .read()
            .values()
            .filter(|t| !t.is_stale(now, max_age))
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.signal_dbm
                .unwrap_or(i32::MIN)
                .cmp(&a.signal_dbm.unwrap_or(i32::MIN))
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });
        active
    }

    /// All targets, oldest first.
    pub fn history(&self) -> Vec<Target> {
        let mut all: Vec<Target> = self.targets.read().values().cloned().collect();
        all.sort_by_key(|t| t.first_seen);
        all
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(last_octet: u8) -> Target {
        Target::new(MacAddr(0, 0x11, 0x22, 0x33, 0x44, last_octet))
    }

    #[test]
    fn upsert_merges_repeated_sightings() {
        let inventory = Inventory::new();
        inventory.upsert(&[target(1).with_name("lab-ap")]);
        let merged = inventory.upsert(&[target(1).with_signal(-40), target(2)]);

        assert_eq!(inventory.len(), 2);
        assert_eq!(merged[0].name.as_deref(), Some("lab-ap"));
        assert_eq!(merged[0].signal_dbm, Some(-40));
    }

    #[test]
    fn stale_targets_leave_active_but_stay_in_history() {
        let inventory = Inventory::new();
        let mut old = target(1);
        old.first_seen -= Duration::hours(3);
        old.last_seen -= Duration::hours(2);
        inventory.upsert(&[old, target(2).with_signal(-70), target(3).with_signal(-30)]);

        let active = inventory.active(Utc::now(), Duration::hours(1));
        let ids: Vec<u8> = active.iter().map(|t| t.id.5).collect();
        assert_eq!(ids, vec![3, 2]);

        let history = inventory.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id.5, 1);
    }
}
