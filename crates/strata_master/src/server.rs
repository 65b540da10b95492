//! Region server identity, load, and the fleet-view seam.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Network address of a region server.
///
/// Server identity is compared by address, not by the full server name: the
/// name carries a start code that changes across restarts, while placement
/// decisions care about the process endpoint.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Load reported by a region server on each heartbeat.
///
/// Ordering is by region count first, then request rate, which defines the
/// load tiers the assignment engine and balancer reason about.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ServerLoad {
    pub regions: u32,
    pub requests: u64,
}

impl ServerLoad {
    pub fn new(regions: u32, requests: u64) -> Self {
        Self { regions, requests }
    }
}

impl fmt::Display for ServerLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "regions={}, requests={}", self.regions, self.requests)
    }
}

/// Identity and load of the server behind one heartbeat.
#[derive(Clone, Debug)]
pub struct ServerInfo {
    /// Full server name including the start code, e.g. `host,port,startcode`.
    pub server_name: String,
    pub address: ServerAddress,
    /// Host name used for locality matching; may differ from `address.host`.
    pub hostname: String,
    pub load: ServerLoad,
}

impl ServerInfo {
    pub fn new(server_name: impl Into<String>, address: ServerAddress, load: ServerLoad) -> Self {
        let hostname = address.host.clone();
        Self {
            server_name: server_name.into(),
            address,
            hostname,
            load,
        }
    }
}

/// Read-only view of the server fleet maintained by the server manager.
///
/// The region manager never tracks liveness itself; every fleet-wide fact the
/// assignment engine needs is answered through this seam so tests can supply
/// a fixed topology.
pub trait FleetView: Send + Sync {
    /// Number of live region servers.
    fn num_servers(&self) -> usize;

    /// Snapshot of load tiers: every live server bucketed under its reported
    /// load, tiers ordered lightest first.
    fn load_to_servers(&self) -> BTreeMap<ServerLoad, BTreeSet<String>>;

    /// Fleet-wide average region count.
    fn average_load(&self) -> f64;

    /// False while the cluster is still warming up and user regions must not
    /// be handed out yet.
    fn can_assign_user_regions(&self) -> bool;

    /// True while the shutdown processor still has queued server work; the
    /// balancer stays quiet until the queue drains.
    fn operations_pending(&self) -> bool;
}
