//! Throttled bulk-reopen coordinators, one per altered table.
//!
//! After a schema change every region of the table must be closed and
//! reopened to pick up the new descriptor. The reopener limits how many
//! regions are in flight at once so an alter on a large table does not take
//! the whole table offline.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::region::RegionInfo;

/// Progress of one table's reopen operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReopenProgress {
    pub reopened: usize,
    pub total: usize,
    pub done: bool,
}

struct ReopenInner {
    waiting: BTreeSet<RegionInfo>,
    in_flight: BTreeSet<RegionInfo>,
    reopened: usize,
    total: usize,
}

pub struct ThrottledReopener {
    table: String,
    max_in_flight: usize,
    inner: Mutex<ReopenInner>,
}

impl ThrottledReopener {
    fn new(table: String, max_in_flight: usize) -> Self {
        Self {
            table,
            max_in_flight: max_in_flight.max(1),
            inner: Mutex::new(ReopenInner {
                waiting: BTreeSet::new(),
                in_flight: BTreeSet::new(),
                reopened: 0,
                total: 0,
            }),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn add_regions(&self, regions: impl IntoIterator<Item = RegionInfo>) {
        let mut inner = self.inner.lock().unwrap();
        for region in regions {
            if inner.waiting.insert(region) {
                inner.total += 1;
            }
        }
    }

    /// Regions to close for reopen now, bounded by the in-flight cap. The
    /// returned regions move from waiting to in flight.
    pub fn next_batch(&self) -> Vec<RegionInfo> {
        let mut inner = self.inner.lock().unwrap();
        let room = self.max_in_flight.saturating_sub(inner.in_flight.len());
        let batch: Vec<RegionInfo> = inner.waiting.iter().take(room).cloned().collect();
        for region in &batch {
            inner.waiting.remove(region);
            inner.in_flight.insert(region.clone());
        }
        batch
    }

    /// A region of this table came back open; returns updated progress.
    pub fn notify_region_reopened(&self, region: &RegionInfo) -> ReopenProgress {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_flight.remove(region) {
            inner.reopened += 1;
            tracing::debug!(
                table = %self.table,
                region = %region,
                reopened = inner.reopened,
                total = inner.total,
                "region reopened"
            );
        }
        ReopenProgress {
            reopened: inner.reopened,
            total: inner.total,
            done: inner.reopened >= inner.total && inner.waiting.is_empty(),
        }
    }

    pub fn progress(&self) -> ReopenProgress {
        let inner = self.inner.lock().unwrap();
        ReopenProgress {
            reopened: inner.reopened,
            total: inner.total,
            done: inner.reopened >= inner.total && inner.waiting.is_empty(),
        }
    }
}

/// Registry of reopeners keyed by table name.
pub struct ReopenerRegistry {
    max_in_flight: usize,
    tables: Mutex<HashMap<String, Arc<ThrottledReopener>>>,
}

impl ReopenerRegistry {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Create a reopener for the table, or return the existing one.
    pub fn create(&self, table: &str) -> Arc<ThrottledReopener> {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_insert_with(|| {
                Arc::new(ThrottledReopener::new(table.to_string(), self.max_in_flight))
            })
            .clone()
    }

    pub fn get(&self, table: &str) -> Option<Arc<ThrottledReopener>> {
        self.tables.lock().unwrap().get(table).cloned()
    }

    pub fn delete(&self, table: &str) {
        if self.tables.lock().unwrap().remove(table).is_some() {
            tracing::debug!(table = %table, "removed reopener");
        } else {
            tracing::debug!(table = %table, "tried to delete a reopener that does not exist");
        }
    }

    /// Forward an open acknowledgment to the reopener of the region's table,
    /// if one is active.
    pub fn notify_region_reopened(&self, region: &RegionInfo) -> Option<ReopenProgress> {
        self.get(&region.table)
            .map(|reopener| reopener.notify_region_reopened(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: &[u8], id: u64) -> RegionInfo {
        RegionInfo::new("users", start.to_vec(), Vec::new(), id)
    }

    #[test]
    fn create_is_idempotent() {
        let registry = ReopenerRegistry::new(2);
        let a = registry.create("users");
        let b = registry.create("users");
        assert!(Arc::ptr_eq(&a, &b));
        registry.delete("users");
        assert!(registry.get("users").is_none());
    }

    #[test]
    fn batches_respect_the_throttle() {
        let registry = ReopenerRegistry::new(2);
        let reopener = registry.create("users");
        reopener.add_regions((0..5).map(|i| region(&[b'a' + i as u8], i)));

        let first = reopener.next_batch();
        assert_eq!(first.len(), 2);
        // Nothing reopened yet, so no room for more.
        assert!(reopener.next_batch().is_empty());

        let progress = reopener.notify_region_reopened(&first[0]);
        assert_eq!(progress.reopened, 1);
        assert!(!progress.done);
        assert_eq!(reopener.next_batch().len(), 1);
    }

    #[test]
    fn completion_reported_after_last_region() {
        let registry = ReopenerRegistry::new(8);
        let reopener = registry.create("users");
        let regions: Vec<RegionInfo> = (0..3).map(|i| region(&[b'a' + i as u8], i)).collect();
        reopener.add_regions(regions.clone());
        assert_eq!(reopener.next_batch().len(), 3);

        for (i, r) in regions.iter().enumerate() {
            let progress = registry.notify_region_reopened(r).expect("reopener exists");
            assert_eq!(progress.done, i == regions.len() - 1);
        }
    }

    #[test]
    fn unknown_table_notification_is_ignored() {
        let registry = ReopenerRegistry::new(2);
        assert!(registry.notify_region_reopened(&region(b"a", 1)).is_none());
    }
}
