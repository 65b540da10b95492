//! Queued administrative operations delivered piggy-backed on heartbeats.
//!
//! Four single-level queues (split, compact, major-compact, flush) and two
//! two-level queues for per-column-family compactions, all keyed by region
//! name. Delivery is at-most-once from the master's side; the region server
//! is expected to be idempotent.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::region::RegionInfo;
use crate::server::{ServerAddress, ServerInfo};
use crate::RegionMessage;

/// Region-wide operations a caller can queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableAction {
    Split,
    Compact,
    MajorCompact,
    Flush,
}

/// Column-family-scoped operations; only compactions make sense per family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfTableAction {
    Compact,
    MajorCompact,
}

type ActionMap = Mutex<BTreeMap<Vec<u8>, (RegionInfo, ServerAddress)>>;
type CfActionMap = Mutex<BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, (RegionInfo, ServerAddress)>>>;

#[derive(Default)]
pub struct ActionQueues {
    to_split: ActionMap,
    to_compact: ActionMap,
    to_major_compact: ActionMap,
    to_flush: ActionMap,
    cfs_to_compact: CfActionMap,
    cfs_to_major_compact: CfActionMap,
}

impl ActionQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_action(
        &self,
        region_name: &[u8],
        info: RegionInfo,
        server: ServerAddress,
        op: TableAction,
    ) {
        tracing::debug!(region = %info, op = ?op, "queueing region operation");
        let map = match op {
            TableAction::Split => &self.to_split,
            TableAction::Compact => &self.to_compact,
            TableAction::MajorCompact => &self.to_major_compact,
            TableAction::Flush => &self.to_flush,
        };
        map.lock()
            .unwrap()
            .insert(region_name.to_vec(), (info, server));
    }

    pub fn start_cf_action(
        &self,
        region_name: &[u8],
        family: &[u8],
        info: RegionInfo,
        server: ServerAddress,
        op: CfTableAction,
    ) {
        tracing::debug!(
            region = %info,
            family = %String::from_utf8_lossy(family),
            op = ?op,
            "queueing column family operation"
        );
        let map = match op {
            CfTableAction::Compact => &self.cfs_to_compact,
            CfTableAction::MajorCompact => &self.cfs_to_major_compact,
        };
        map.lock()
            .unwrap()
            .entry(region_name.to_vec())
            .or_default()
            .insert(family.to_vec(), (info, server));
    }

    /// Drop every queued operation for a region, e.g. when it closes or
    /// splits before delivery.
    pub fn end_actions(&self, region_name: &[u8]) {
        self.to_split.lock().unwrap().remove(region_name);
        self.to_compact.lock().unwrap().remove(region_name);
        self.to_major_compact.lock().unwrap().remove(region_name);
        self.to_flush.lock().unwrap().remove(region_name);
        self.cfs_to_compact.lock().unwrap().remove(region_name);
        self.cfs_to_major_compact.lock().unwrap().remove(region_name);
    }

    /// Emit every operation destined for the reporting server and drop it
    /// from its queue.
    pub fn apply_actions(&self, info: &ServerInfo, out: &mut Vec<RegionMessage>) {
        let addr = &info.address;
        self.drain_matching(&self.to_compact, addr, out, RegionMessage::Compact);
        self.drain_matching(&self.to_split, addr, out, RegionMessage::Split);
        self.drain_matching(&self.to_flush, addr, out, RegionMessage::Flush);
        self.drain_matching(&self.to_major_compact, addr, out, RegionMessage::MajorCompact);
        self.drain_cf_matching(&self.cfs_to_compact, addr, out, |region, family| {
            RegionMessage::CfCompact { region, family }
        });
        self.drain_cf_matching(&self.cfs_to_major_compact, addr, out, |region, family| {
            RegionMessage::CfMajorCompact { region, family }
        });
    }

    /// Pending-operation counts, used by status reporting.
    pub fn queue_lengths(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            ("split", self.to_split.lock().unwrap().len()),
            ("compact", self.to_compact.lock().unwrap().len()),
            ("major_compact", self.to_major_compact.lock().unwrap().len()),
            ("flush", self.to_flush.lock().unwrap().len()),
            ("cf_compact", self.cfs_to_compact.lock().unwrap().len()),
            (
                "cf_major_compact",
                self.cfs_to_major_compact.lock().unwrap().len(),
            ),
        ])
    }

    fn drain_matching(
        &self,
        map: &ActionMap,
        addr: &ServerAddress,
        out: &mut Vec<RegionMessage>,
        make: fn(RegionInfo) -> RegionMessage,
    ) {
        let mut map = map.lock().unwrap();
        map.retain(|_, (region, server)| {
            if server == addr {
                tracing::debug!(region = %region, server = %addr, "dispatching region operation");
                out.push(make(region.clone()));
                false
            } else {
                true
            }
        });
    }

    fn drain_cf_matching(
        &self,
        map: &CfActionMap,
        addr: &ServerAddress,
        out: &mut Vec<RegionMessage>,
        make: fn(RegionInfo, Vec<u8>) -> RegionMessage,
    ) {
        let mut map = map.lock().unwrap();
        map.retain(|_, families| {
            families.retain(|family, (region, server)| {
                if server == addr {
                    tracing::debug!(
                        region = %region,
                        family = %String::from_utf8_lossy(family),
                        server = %addr,
                        "dispatching column family operation"
                    );
                    out.push(make(region.clone(), family.clone()));
                    false
                } else {
                    true
                }
            });
            !families.is_empty()
        });
    }
}
