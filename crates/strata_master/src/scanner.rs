//! Root and meta scanner tasks.
//!
//! The scanners themselves only orchestrate: reading catalog rows off disk
//! and over the wire belongs to the `CatalogAccess` collaborator. Each pass
//! refreshes what the manager believes about the catalog, and any region
//! discovered without a live assignment is put up for assignment.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::catalog::MetaRegion;
use crate::manager::RegionManager;
use crate::region::RegionInfo;
use crate::server::ServerAddress;

/// One catalog row as seen by a scan: the region it describes and the server
/// the catalog believes hosts it, if any.
#[derive(Clone, Debug)]
pub struct RegionScanRecord {
    pub info: RegionInfo,
    pub assigned_server: Option<ServerAddress>,
}

/// A row write against a catalog region.
#[derive(Clone, Debug)]
pub struct CatalogRow {
    pub row_key: Vec<u8>,
    pub family: &'static str,
    pub qualifier: &'static str,
    pub value: Vec<u8>,
}

impl CatalogRow {
    /// The `info:regioninfo` row recording a region descriptor.
    pub fn region_info(row_key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            row_key,
            family: "info",
            qualifier: "regioninfo",
            value,
        }
    }
}

/// Blocking access to catalog region contents and region stores.
pub trait CatalogAccess: Send + Sync {
    /// Scan the root region: one record per meta region.
    fn scan_root(&self) -> anyhow::Result<Vec<RegionScanRecord>>;

    /// Scan one meta region: one record per user region it tracks.
    fn scan_meta(&self, meta: &MetaRegion) -> anyhow::Result<Vec<RegionScanRecord>>;

    /// Create the on-disk representation of a new region and close it so it
    /// is flushed.
    fn create_region_storage(&self, info: &RegionInfo) -> anyhow::Result<()>;

    /// Write a row into the named catalog region.
    fn put_region_row(&self, meta_region_name: &[u8], row: CatalogRow) -> anyhow::Result<()>;
}

impl RegionManager {
    /// Fold one root scan into catalog state: the row count is the expected
    /// meta region count, assigned metas go online, unassigned ones are put
    /// up for assignment.
    pub fn apply_root_scan(&self, records: Vec<RegionScanRecord>) {
        self.set_num_meta_regions(records.len());
        for record in records {
            match record.assigned_server {
                Some(server) => {
                    self.catalog()
                        .put_meta_region_online(MetaRegion::new(server, record.info));
                }
                None => self.set_unassigned(&record.info, false),
            }
        }
    }

    /// Fold one meta scan in: user regions without a live assignment and not
    /// already moving are put up for assignment.
    pub fn apply_meta_scan(&self, records: Vec<RegionScanRecord>) {
        for record in records {
            if record.assigned_server.is_none()
                && !self.region_is_in_transition(&record.info.region_name_string())
            {
                self.set_unassigned(&record.info, false);
            }
        }
    }
}

pub(crate) fn spawn_root_scanner(
    manager: Arc<RegionManager>,
    access: Arc<dyn CatalogAccess>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("root scanner started");
        let mut ticker = tokio::time::interval(manager.config().catalog_scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = manager.rescan.notified() => {}
            }
            if manager.scanners_stopped() {
                break;
            }
            // Root must be hosted somewhere before its rows can be read.
            if manager.root_region_location().is_none() {
                continue;
            }
            match access.scan_root() {
                Ok(records) => {
                    let metas = records.len();
                    manager.apply_root_scan(records);
                    manager.mark_root_scan_complete();
                    tracing::debug!(metas, "root scan complete");
                }
                Err(err) => tracing::warn!(error = ?err, "root catalog scan failed"),
            }
        }
        tracing::debug!("root scanner stopped");
    })
}

pub(crate) fn spawn_meta_scanner(
    manager: Arc<RegionManager>,
    access: Arc<dyn CatalogAccess>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("meta scanner started");
        let mut ticker = tokio::time::interval(manager.config().catalog_scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = manager.rescan.notified() => {}
            }
            if manager.scanners_stopped() {
                break;
            }

            let mut to_scan: Vec<MetaRegion> =
                manager.catalog().online_meta_regions().into_values().collect();
            let had_full_quorum = manager.all_meta_regions_online();
            to_scan.append(&mut manager.pending_meta_scans.lock().unwrap());

            let mut scanned = 0usize;
            for meta in to_scan {
                match access.scan_meta(&meta) {
                    Ok(records) => {
                        manager.apply_meta_scan(records);
                        scanned += 1;
                    }
                    Err(err) => {
                        tracing::warn!(meta = %meta, error = ?err, "meta region scan failed")
                    }
                }
            }
            if scanned > 0 {
                tracing::debug!(scanned, "meta scan pass complete");
            }
            if had_full_quorum {
                manager.mark_meta_scan_complete();
            }
        }
        tracing::debug!("meta scanner stopped");
    })
}
