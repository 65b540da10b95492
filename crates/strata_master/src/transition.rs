//! Transition table: the process-wide map of regions between stable catalog
//! states, mirrored into the coordination service.
//!
//! A single lock guards both the map and the mirror, so concurrent heartbeats
//! observe one total order of mirror updates. This lock is the outermost lock
//! in the manager; the only locks that may be taken while holding it are the
//! preferred-assignment lock and per-record state locks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::coordination::{unassigned_path, CoordinationSession, TransitionEvent};
use crate::region::{LifecycleState, RegionInfo, RegionState};

/// Point-in-time view of one transition entry.
#[derive(Clone, Debug)]
pub struct RegionStateView {
    pub name: String,
    pub state: LifecycleState,
    pub server_name: Option<String>,
}

impl fmt::Display for RegionStateView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name={}, state={}", self.name, self.state)
    }
}

pub struct TransitionTable {
    inner: Mutex<BTreeMap<String, Arc<RegionState>>>,
    session: Arc<dyn CoordinationSession>,
}

impl TransitionTable {
    pub fn new(session: Arc<dyn CoordinationSession>) -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            session,
        }
    }

    /// Insert or replace an entry. An unassigned region also gets its mirror
    /// node written with the offline event, telling servers it is claimable.
    pub fn insert(&self, state: Arc<RegionState>) {
        let name = state.region_name_string();
        let mut map = self.inner.lock().unwrap();
        if state.is_unassigned() {
            self.write_offline_mirror(state.info());
        }
        map.insert(name, state);
    }

    /// Remove the entry and its mirror node.
    pub fn remove(&self, info: &RegionInfo) -> Option<Arc<RegionState>> {
        let mut map = self.inner.lock().unwrap();
        let removed = map.remove(&info.region_name_string());
        self.delete_mirror(info);
        removed
    }

    /// Remove whichever entry carries the given raw region name. Returns true
    /// when an entry was dropped.
    pub fn remove_by_name(&self, region_name: &[u8]) -> bool {
        let mut map = self.inner.lock().unwrap();
        let found = map
            .iter()
            .find(|(_, s)| s.region_name() == region_name)
            .map(|(k, s)| (k.clone(), s.info().clone()));
        match found {
            Some((key, info)) => {
                map.remove(&key);
                self.delete_mirror(&info);
                tracing::debug!(region = %key, "cleared region from transition");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegionState>> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Consistent point-in-time copy, in region-name order.
    pub fn snapshot(&self) -> BTreeMap<String, RegionStateView> {
        let map = self.inner.lock().unwrap();
        map.iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    RegionStateView {
                        name: name.clone(),
                        state: state.state(),
                        server_name: state.server_name(),
                    },
                )
            })
            .collect()
    }

    /// Take the table lock directly. The assignment engine iterates and
    /// mutates entries under one hold; mirror writes are legal while the
    /// guard is live because they do not touch the map.
    pub(crate) fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<RegionState>>> {
        self.inner.lock().unwrap()
    }

    /// Write the offline-event mirror node for a region. Failures are logged
    /// and the in-memory transition proceeds; the mirror is reconciled from
    /// the table on master restart.
    pub(crate) fn write_offline_mirror(&self, info: &RegionInfo) {
        let path = unassigned_path(&info.encoded_name());
        let payload = TransitionEvent::offline().encode();
        if let Err(err) = self.session.upsert(&path, &payload) {
            tracing::error!(
                region = %info,
                path = %path,
                error = ?err,
                "failed to write unassigned mirror node"
            );
        } else {
            tracing::debug!(region = %info, path = %path, "wrote unassigned mirror node");
        }
    }

    pub(crate) fn delete_mirror(&self, info: &RegionInfo) {
        let path = unassigned_path(&info.encoded_name());
        if let Err(err) = self.session.delete(&path) {
            tracing::error!(
                region = %info,
                path = %path,
                error = ?err,
                "failed to delete mirror node"
            );
        }
    }
}
