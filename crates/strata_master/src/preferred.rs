//! Preferred assignment: time-bounded region holds for restarting servers.
//!
//! When a server goes down for a planned restart, its regions are held for it
//! instead of being rebalanced away. The store keeps two structures under one
//! lock, a per-server map of held regions and a reverse index for quick
//! "is this region held" checks, plus a deadline queue driving expiry. The
//! two structures and the queue move together: consuming or expiring a hold
//! removes it everywhere.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::manager::ShutdownSignal;
use crate::region::RegionInfo;
use crate::server::ServerAddress;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HoldEntry {
    deadline: Instant,
    region: RegionInfo,
    server: ServerAddress,
}

#[derive(Default)]
struct PreferredInner {
    by_server: HashMap<ServerAddress, BTreeSet<RegionInfo>>,
    held: BTreeSet<RegionInfo>,
}

pub struct PreferredAssignmentStore {
    inner: Mutex<PreferredInner>,
    queue: Mutex<BinaryHeap<Reverse<HoldEntry>>>,
    queue_changed: Notify,
    hold_period: Duration,
}

impl PreferredAssignmentStore {
    pub fn new(hold_period: Duration) -> Self {
        Self {
            inner: Mutex::new(PreferredInner::default()),
            queue: Mutex::new(BinaryHeap::new()),
            queue_changed: Notify::new(),
            hold_period,
        }
    }

    /// Hold `region` for `server` until the configured period elapses.
    pub fn add(&self, server: &ServerAddress, region: RegionInfo, now: Instant) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .by_server
                .entry(server.clone())
                .or_default()
                .insert(region.clone());
            inner.held.insert(region.clone());
        }
        self.queue.lock().unwrap().push(Reverse(HoldEntry {
            deadline: now + self.hold_period,
            region,
            server: server.clone(),
        }));
        self.queue_changed.notify_waiters();
    }

    pub fn add_all(
        &self,
        server: &ServerAddress,
        regions: impl IntoIterator<Item = RegionInfo>,
        now: Instant,
    ) {
        for region in regions {
            self.add(server, region, now);
        }
    }

    /// Drop the hold of `region` for `server` from the map, the reverse
    /// index, and the deadline queue. Returns true when a hold existed.
    pub fn remove(&self, server: &ServerAddress, region: &RegionInfo) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let mut removed = false;
            let mut server_drained = false;
            if let Some(regions) = inner.by_server.get_mut(server) {
                removed = regions.remove(region);
                server_drained = regions.is_empty();
            }
            if server_drained {
                inner.by_server.remove(server);
            }
            if removed {
                // The reverse index only loses the region when this server
                // actually held it; another server's hold stays intact.
                inner.held.remove(region);
            }
            removed
        };
        if removed {
            self.queue
                .lock()
                .unwrap()
                .retain(|Reverse(e)| !(&e.server == server && &e.region == region));
        }
        removed
    }

    pub fn has_holds_for(&self, server: &ServerAddress) -> bool {
        self.inner.lock().unwrap().by_server.contains_key(server)
    }

    pub fn holds_for(&self, server: &ServerAddress) -> Vec<RegionInfo> {
        self.inner
            .lock()
            .unwrap()
            .by_server
            .get(server)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True when any server currently holds `region`.
    pub fn is_held(&self, region: &RegionInfo) -> bool {
        self.inner.lock().unwrap().held.contains(region)
    }

    /// Expire every hold whose deadline has passed. Returns the holds that
    /// were actually dropped; holds consumed earlier by assignment are gone
    /// already and do not reappear here.
    pub fn expire_due(&self, now: Instant) -> Vec<(ServerAddress, RegionInfo)> {
        let mut expired = Vec::new();
        loop {
            let entry = {
                let mut queue = self.queue.lock().unwrap();
                let due = queue
                    .peek()
                    .map(|Reverse(e)| e.deadline <= now)
                    .unwrap_or(false);
                if due {
                    queue.pop().map(|Reverse(e)| e)
                } else {
                    None
                }
            };
            let Some(entry) = entry else { break };
            if self.remove(&entry.server, &entry.region) {
                tracing::info!(
                    region = %entry.region,
                    server = %entry.server,
                    "preferred assignment hold expired"
                );
                expired.push((entry.server, entry.region));
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.lock().unwrap().peek().map(|Reverse(e)| e.deadline)
    }

    pub fn held_count(&self) -> usize {
        self.inner.lock().unwrap().held.len()
    }

    pub fn map_entry_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .by_server
            .values()
            .map(|set| set.len())
            .sum()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub(crate) fn wake(&self) {
        self.queue_changed.notify_waiters();
    }
}

/// Expiry handler: blocks on the deadline queue, bounded by the thread wake
/// frequency so it observes shutdown promptly.
pub(crate) fn spawn_expiry_handler(
    store: Arc<PreferredAssignmentStore>,
    shutdown: Arc<ShutdownSignal>,
    wake: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("preferred assignment expiry handler started");
        while !shutdown.is_closed() {
            let now = Instant::now();
            let wait = store
                .next_deadline()
                .map(|d| d.saturating_duration_since(now))
                .unwrap_or(wake)
                .min(wake);
            let notified = store.queue_changed.notified();
            let _ = tokio::time::timeout(wait, notified).await;
            if shutdown.is_closed() {
                break;
            }
            store.expire_due(Instant::now());
        }
        tracing::debug!("preferred assignment expiry handler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: &[u8], id: u64) -> RegionInfo {
        RegionInfo::new("users", start.to_vec(), Vec::new(), id)
    }

    fn server(host: &str) -> ServerAddress {
        ServerAddress::new(host, 6020)
    }

    #[test]
    fn add_then_remove_leaves_everything_empty() {
        let store = PreferredAssignmentStore::new(Duration::from_secs(60));
        let s = server("a");
        let r = region(b"a", 1);
        store.add(&s, r.clone(), Instant::now());
        assert!(store.has_holds_for(&s));
        assert!(store.is_held(&r));
        assert!(store.remove(&s, &r));
        assert!(!store.has_holds_for(&s));
        assert!(!store.is_held(&r));
        assert_eq!(store.held_count(), 0);
        assert_eq!(store.map_entry_count(), 0);
        assert_eq!(store.queue_len(), 0);
    }

    #[test]
    fn reverse_index_matches_map() {
        let store = PreferredAssignmentStore::new(Duration::from_secs(60));
        let now = Instant::now();
        store.add_all(&server("a"), [region(b"a", 1), region(b"b", 2)], now);
        store.add(&server("b"), region(b"c", 3), now);
        assert_eq!(store.held_count(), store.map_entry_count());
        assert_eq!(store.queue_len(), store.held_count());
        store.remove(&server("a"), &region(b"b", 2));
        assert_eq!(store.held_count(), store.map_entry_count());
        assert_eq!(store.queue_len(), store.held_count());
    }

    #[test]
    fn expiry_drops_due_holds_only() {
        let store = PreferredAssignmentStore::new(Duration::from_millis(10));
        let s = server("a");
        let start = Instant::now();
        store.add(&s, region(b"a", 1), start);
        store.add(&s, region(b"b", 2), start);

        assert!(store.expire_due(start).is_empty());
        let expired = store.expire_due(start + Duration::from_millis(11));
        assert_eq!(expired.len(), 2);
        assert_eq!(store.held_count(), 0);
        assert_eq!(store.queue_len(), 0);
    }

    #[test]
    fn consumed_hold_does_not_reexpire() {
        let store = PreferredAssignmentStore::new(Duration::from_millis(10));
        let s = server("a");
        let start = Instant::now();
        let r = region(b"a", 1);
        store.add(&s, r.clone(), start);
        // The assignment engine consumes the hold before the deadline.
        assert!(store.remove(&s, &r));
        let expired = store.expire_due(start + Duration::from_millis(11));
        assert!(expired.is_empty());
    }

    #[test]
    fn next_deadline_tracks_earliest_entry() {
        let store = PreferredAssignmentStore::new(Duration::from_millis(50));
        assert!(store.next_deadline().is_none());
        let start = Instant::now();
        store.add(&server("a"), region(b"b", 2), start + Duration::from_millis(5));
        store.add(&server("a"), region(b"a", 1), start);
        assert_eq!(store.next_deadline(), Some(start + Duration::from_millis(50)));
    }
}
