//! Catalog tracking: where root lives and which meta regions are online.
//!
//! Reads dominate heavily here (every catalog resolution goes through the
//! meta map), so the map sits behind a reader-writer lock while the expected
//! count is a plain atomic maintained by the root scanner.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;

use crate::keys;
use crate::manager::ShutdownSignal;
use crate::region::RegionInfo;
use crate::server::ServerAddress;

/// An online meta region and the server currently hosting it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaRegion {
    pub server: ServerAddress,
    pub info: RegionInfo,
}

impl MetaRegion {
    pub fn new(server: ServerAddress, info: RegionInfo) -> Self {
        Self { server, info }
    }

    pub fn start_key(&self) -> &[u8] {
        &self.info.start_key
    }

    pub fn region_name(&self) -> Vec<u8> {
        self.info.region_name()
    }
}

impl fmt::Display for MetaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{region: {}, server: {}}}", self.info, self.server)
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not all meta regions are online (resolving {table:?})")]
    NotAllMetaRegionsOnline { table: Option<String> },

    #[error("no meta region found for row {row}")]
    MetaRegionNotFound { row: String },
}

pub struct CatalogTracker {
    root: Mutex<Option<ServerAddress>>,
    root_changed: Condvar,
    online_metas: RwLock<BTreeMap<Vec<u8>, MetaRegion>>,
    expected_meta_regions: AtomicUsize,
}

impl Default for CatalogTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogTracker {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(None),
            root_changed: Condvar::new(),
            online_metas: RwLock::new(BTreeMap::new()),
            expected_meta_regions: AtomicUsize::new(0),
        }
    }

    pub fn root_region_location(&self) -> Option<ServerAddress> {
        self.root.lock().unwrap().clone()
    }

    /// Record the root location and wake every waiter.
    pub fn set_root_location(&self, addr: ServerAddress) {
        let mut root = self.root.lock().unwrap();
        *root = Some(addr);
        self.root_changed.notify_all();
    }

    pub fn clear_root_location(&self) {
        let mut root = self.root.lock().unwrap();
        *root = None;
    }

    /// Block until the root location is known or shutdown is requested.
    /// Wakes every `wake` period to re-check shutdown.
    pub fn wait_for_root_region_location(
        &self,
        shutdown: &ShutdownSignal,
        wake: Duration,
    ) -> Option<ServerAddress> {
        let mut root = self.root.lock().unwrap();
        while !shutdown.is_stopping() && root.is_none() {
            let (guard, _timeout) = self.root_changed.wait_timeout(root, wake).unwrap();
            root = guard;
        }
        root.clone()
    }

    pub fn expected_meta_regions(&self) -> usize {
        self.expected_meta_regions.load(Ordering::SeqCst)
    }

    pub fn set_expected_meta_regions(&self, count: usize) {
        self.expected_meta_regions.store(count, Ordering::SeqCst);
    }

    pub fn increment_expected_meta_regions(&self) {
        self.expected_meta_regions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn put_meta_region_online(&self, meta: MetaRegion) {
        let mut metas = self.online_metas.write().unwrap();
        metas.insert(meta.info.start_key.clone(), meta);
    }

    pub fn offline_meta_region_with_start_key(&self, start_key: &[u8]) -> Option<MetaRegion> {
        let removed = self.online_metas.write().unwrap().remove(start_key);
        if removed.is_some() {
            tracing::info!(
                start_key = %String::from_utf8_lossy(start_key),
                "meta region removed from online set"
            );
        }
        removed
    }

    pub fn online_meta_regions(&self) -> BTreeMap<Vec<u8>, MetaRegion> {
        self.online_metas.read().unwrap().clone()
    }

    pub fn num_online_meta_regions(&self) -> usize {
        self.online_metas.read().unwrap().len()
    }

    pub fn is_meta_region_online(&self, start_key: &[u8]) -> bool {
        self.online_metas.read().unwrap().contains_key(start_key)
    }

    /// Meta regions currently hosted by `server`.
    pub fn meta_regions_on_server(&self, server: &ServerAddress) -> Vec<MetaRegion> {
        self.online_metas
            .read()
            .unwrap()
            .values()
            .filter(|m| &m.server == server)
            .cloned()
            .collect()
    }

    /// Start keys of the meta regions hosted by `server`.
    pub fn meta_start_keys_on_server(&self, server: &ServerAddress) -> Vec<Vec<u8>> {
        self.meta_regions_on_server(server)
            .into_iter()
            .map(|m| m.info.start_key)
            .collect()
    }

    pub fn is_meta_server_online(&self, server: &ServerAddress) -> bool {
        self.online_metas
            .read()
            .unwrap()
            .values()
            .any(|m| &m.server == server)
    }

    /// Root located and every expected meta region online.
    pub fn all_meta_regions_online(&self) -> bool {
        let online = self.online_metas.read().unwrap().len();
        self.root_region_location().is_some() && online == self.expected_meta_regions()
    }

    /// True while metas are being reassigned; user-region assignment pauses.
    pub fn reassigning_metas(&self) -> bool {
        self.num_online_meta_regions() < self.expected_meta_regions()
    }

    /// The meta region whose start key is the greatest key at or below `row`.
    /// Rows of the meta table itself resolve to root.
    pub fn meta_region_for_row(&self, row: &[u8]) -> Result<MetaRegion, CatalogError> {
        if !self.all_meta_regions_online() {
            return Err(CatalogError::NotAllMetaRegionsOnline { table: None });
        }
        if keys::is_meta_table_row(row) {
            let Some(root) = self.root_region_location() else {
                return Err(CatalogError::NotAllMetaRegionsOnline {
                    table: Some(keys::ROOT_TABLE_NAME.to_string()),
                });
            };
            return Ok(MetaRegion::new(root, RegionInfo::root()));
        }
        let metas = self.online_metas.read().unwrap();
        metas
            .range(..=row.to_vec())
            .next_back()
            .map(|(_, m)| m.clone())
            .ok_or_else(|| CatalogError::MetaRegionNotFound {
                row: String::from_utf8_lossy(row).into_owned(),
            })
    }

    /// The meta region that should carry the row for `new_region`. With a
    /// single online meta the answer is that meta regardless of key.
    pub fn first_meta_region_for_region(&self, new_region: &RegionInfo) -> Option<MetaRegion> {
        let metas = self.online_metas.read().unwrap();
        match metas.len() {
            0 => None,
            1 => metas.values().next().cloned(),
            _ => {
                let name = new_region.region_name();
                metas
                    .range(..=name)
                    .next_back()
                    .or_else(|| metas.iter().next())
                    .map(|(_, m)| m.clone())
            }
        }
    }

    /// Every meta region holding rows of `table`, ordered by start key.
    /// Resolving the meta table itself needs only root; user tables need the
    /// full meta quorum.
    pub fn meta_regions_for_table(&self, table: &str) -> Result<Vec<MetaRegion>, CatalogError> {
        if table == keys::META_TABLE_NAME {
            let Some(root) = self.root_region_location() else {
                return Err(CatalogError::NotAllMetaRegionsOnline {
                    table: Some(keys::ROOT_TABLE_NAME.to_string()),
                });
            };
            return Ok(vec![MetaRegion::new(root, RegionInfo::root())]);
        }
        if !self.all_meta_regions_online() {
            return Err(CatalogError::NotAllMetaRegionsOnline {
                table: Some(table.to_string()),
            });
        }
        let metas = self.online_metas.read().unwrap();
        let first_key = if metas.len() == 1 {
            metas.keys().next().cloned()
        } else if metas.contains_key(table.as_bytes()) {
            Some(table.as_bytes().to_vec())
        } else {
            metas
                .range(..table.as_bytes().to_vec())
                .next_back()
                .map(|(k, _)| k.clone())
                .or_else(|| metas.keys().next().cloned())
        };
        let Some(first_key) = first_key else {
            return Err(CatalogError::NotAllMetaRegionsOnline {
                table: Some(table.to_string()),
            });
        };
        Ok(metas.range(first_key..).map(|(_, m)| m.clone()).collect())
    }
}
