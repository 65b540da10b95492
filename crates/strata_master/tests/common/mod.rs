//! Shared fixtures for integration tests: an in-memory coordination session,
//! a fixed fleet topology, and an in-memory catalog.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use strata_master::{
    CatalogAccess, CatalogRow, CoordinationSession, FleetView, MetaRegion, RegionInfo,
    RegionManager, RegionManagerConfig, RegionScanRecord, ServerAddress, ServerInfo, ServerLoad,
};

/// Coordination session that records every node and operation in memory.
#[derive(Default)]
pub struct RecordingSession {
    pub nodes: Mutex<BTreeMap<String, Vec<u8>>>,
    pub root_writes: Mutex<Vec<ServerAddress>>,
}

impl CoordinationSession for RecordingSession {
    fn upsert(&self, path: &str, payload: &[u8]) -> anyhow::Result<()> {
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), payload.to_vec());
        Ok(())
    }

    fn delete(&self, path: &str) -> anyhow::Result<()> {
        self.nodes.lock().unwrap().remove(path);
        Ok(())
    }

    fn write_root_location(&self, addr: &ServerAddress) -> anyhow::Result<()> {
        self.root_writes.lock().unwrap().push(addr.clone());
        Ok(())
    }

    fn clear(&self) {}

    fn close(&self) {}
}

/// Fleet with a fixed load topology.
pub struct FixedFleet {
    pub tiers: BTreeMap<ServerLoad, BTreeSet<String>>,
    pub can_assign_user_regions: bool,
    pub operations_pending: bool,
}

impl FixedFleet {
    pub fn new(entries: &[(u32, &str)]) -> Self {
        let mut tiers: BTreeMap<ServerLoad, BTreeSet<String>> = BTreeMap::new();
        for (regions, name) in entries {
            tiers
                .entry(ServerLoad::new(*regions, 0))
                .or_default()
                .insert(format!("{name},6020,1"));
        }
        Self {
            tiers,
            can_assign_user_regions: true,
            operations_pending: false,
        }
    }
}

impl FleetView for FixedFleet {
    fn num_servers(&self) -> usize {
        self.tiers.values().map(|s| s.len()).sum()
    }

    fn load_to_servers(&self) -> BTreeMap<ServerLoad, BTreeSet<String>> {
        self.tiers.clone()
    }

    fn average_load(&self) -> f64 {
        let n = self.num_servers();
        if n == 0 {
            return 0.0;
        }
        let total: u64 = self
            .tiers
            .iter()
            .map(|(load, servers)| load.regions as u64 * servers.len() as u64)
            .sum();
        total as f64 / n as f64
    }

    fn can_assign_user_regions(&self) -> bool {
        self.can_assign_user_regions
    }

    fn operations_pending(&self) -> bool {
        self.operations_pending
    }
}

/// In-memory catalog access recording region creations and row writes.
#[derive(Default)]
pub struct MemoryCatalog {
    pub root_rows: Mutex<Vec<RegionScanRecord>>,
    pub meta_rows: Mutex<Vec<RegionScanRecord>>,
    pub created: Mutex<Vec<RegionInfo>>,
    pub rows: Mutex<Vec<(Vec<u8>, CatalogRow)>>,
}

impl CatalogAccess for MemoryCatalog {
    fn scan_root(&self) -> anyhow::Result<Vec<RegionScanRecord>> {
        Ok(self.root_rows.lock().unwrap().clone())
    }

    fn scan_meta(&self, _meta: &MetaRegion) -> anyhow::Result<Vec<RegionScanRecord>> {
        Ok(self.meta_rows.lock().unwrap().clone())
    }

    fn create_region_storage(&self, info: &RegionInfo) -> anyhow::Result<()> {
        self.created.lock().unwrap().push(info.clone());
        Ok(())
    }

    fn put_region_row(&self, meta_region_name: &[u8], row: CatalogRow) -> anyhow::Result<()> {
        self.rows
            .lock()
            .unwrap()
            .push((meta_region_name.to_vec(), row));
        Ok(())
    }
}

pub fn server(name: &str, regions: u32) -> ServerInfo {
    ServerInfo::new(
        format!("{name},6020,1"),
        ServerAddress::new(name, 6020),
        ServerLoad::new(regions, 0),
    )
}

pub fn user_region(i: u32) -> RegionInfo {
    RegionInfo::new(
        "users",
        format!("k{i:03}").into_bytes(),
        Vec::new(),
        i as u64,
    )
}

pub fn manager_with(
    fleet: FixedFleet,
    session: Arc<RecordingSession>,
    config: RegionManagerConfig,
) -> Arc<RegionManager> {
    RegionManager::new(config, Arc::new(fleet), session, None)
}

/// Drive the root region through cold start onto `owner` and out of
/// transition, so user-region scenarios start from a settled catalog.
pub fn settle_root(manager: &RegionManager, owner: &ServerInfo) {
    let root = RegionInfo::root();
    let root_name = root.region_name_string();
    let mut out = Vec::new();
    manager.assign_regions(owner, &[], &mut out);
    assert!(
        out.iter()
            .any(|m| matches!(m, strata_master::RegionMessage::Open(r) if r.is_root())),
        "expected cold start to offer root to {}",
        owner.server_name
    );
    manager.set_open(&root_name);
    manager.set_root_region_location(owner.address.clone());
    manager.remove_region(&root);
}
