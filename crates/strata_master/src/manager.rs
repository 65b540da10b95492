//! The region manager: master-side control plane tying together the
//! transition table, catalog tracking, preferred assignment, balancer,
//! action queues, and reopeners.
//!
//! Heartbeat entry points are synchronous; the RPC layer owns threading and
//! guarantees mutual exclusion while the assignment engine runs. Background
//! work (catalog scanners, hold expiry) runs as spawned tasks started by
//! `start` and joined by `stop`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::actions::{ActionQueues, CfTableAction, TableAction};
use crate::balancer::{LoadBalancer, LoadBalancerConfig};
use crate::catalog::{CatalogTracker, MetaRegion};
use crate::coordination::{self, CoordinationSession};
use crate::preferred::{self, PreferredAssignmentStore};
use crate::region::{IllegalTransition, LifecycleState, RegionInfo, RegionState};
use crate::reopen::{ReopenProgress, ReopenerRegistry, ThrottledReopener};
use crate::scanner::{self, CatalogAccess, CatalogRow};
use crate::server::{FleetView, ServerAddress, ServerInfo};
use crate::transition::{RegionStateView, TransitionTable};
use crate::RegionMessage;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

pub(crate) fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

pub(crate) fn env_i32(name: &str) -> Option<i32> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Manager-wide configuration.
#[derive(Clone, Debug)]
pub struct RegionManagerConfig {
    /// Cap on regions assigned to one server per heartbeat.
    pub max_assign_per_heartbeat: usize,
    pub balancer: LoadBalancerConfig,
    /// How long a region is held for a server across a planned restart.
    pub region_hold_period: Duration,
    /// Retry budget for root-location coordination writes.
    pub coordination_retries: usize,
    /// Base pause between retried coordination writes.
    pub coordination_pause: Duration,
    /// Wake period for blocking waits, so they observe shutdown.
    pub thread_wake_frequency: Duration,
    /// Window after master start during which the locality mapping applies.
    pub locality_apply_window: Duration,
    /// Window during which a region waits for its preferred host to check in.
    /// Must not exceed the apply window.
    pub locality_hold_window: Duration,
    /// Catalog rescan period for the root and meta scanners.
    pub catalog_scan_interval: Duration,
    /// Cap on regions concurrently closed for reopen per table.
    pub reopen_max_in_flight: usize,
}

impl Default for RegionManagerConfig {
    fn default() -> Self {
        Self {
            max_assign_per_heartbeat: 10,
            balancer: LoadBalancerConfig::default(),
            region_hold_period: Duration::from_millis(60_000),
            coordination_retries: 5,
            coordination_pause: Duration::from_millis(2_000),
            thread_wake_frequency: Duration::from_millis(10_000),
            locality_apply_window: Duration::from_millis(300_000),
            locality_hold_window: Duration::from_millis(120_000),
            catalog_scan_interval: Duration::from_millis(60_000),
            reopen_max_in_flight: 8,
        }
    }
}

impl RegionManagerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.balancer = LoadBalancerConfig::from_env();
        if let Some(v) = env_usize("STRATA_ASSIGN_PER_HEARTBEAT") {
            cfg.max_assign_per_heartbeat = v;
        }
        if let Some(v) = env_u64("STRATA_REGION_HOLD_PERIOD_MS") {
            cfg.region_hold_period = Duration::from_millis(v);
        }
        if let Some(v) = env_usize("STRATA_COORD_RETRIES") {
            cfg.coordination_retries = v;
        }
        if let Some(v) = env_u64("STRATA_COORD_PAUSE_MS") {
            cfg.coordination_pause = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("STRATA_THREAD_WAKE_MS") {
            cfg.thread_wake_frequency = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("STRATA_LOCALITY_APPLY_MS") {
            cfg.locality_apply_window = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("STRATA_LOCALITY_HOLD_MS") {
            cfg.locality_hold_window = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("STRATA_CATALOG_SCAN_MS") {
            cfg.catalog_scan_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_usize("STRATA_REOPEN_MAX_IN_FLIGHT") {
            cfg.reopen_max_in_flight = v;
        }
        cfg
    }
}

/// Shutdown lifecycle shared by the manager and its background tasks.
///
/// `requested` stops new work from being scheduled; `closed` is the final
/// state every loop observes before exiting.
#[derive(Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.is_shutdown_requested() || self.is_closed()
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Handles of the background tasks started by `RegionManager::start`.
pub struct ManagerTasks {
    pub root_scanner: JoinHandle<()>,
    pub meta_scanner: JoinHandle<()>,
    pub expiry_handler: JoinHandle<()>,
}

pub(crate) struct LocalityState {
    pub mapping: Option<HashMap<String, String>>,
    pub quick_start: Option<HashSet<String>>,
}

pub struct RegionManager {
    config: RegionManagerConfig,
    pub(crate) transition: TransitionTable,
    catalog: CatalogTracker,
    pub(crate) preferred: Arc<PreferredAssignmentStore>,
    actions: ActionQueues,
    reopeners: ReopenerRegistry,
    pub(crate) balancer: LoadBalancer,
    pub(crate) fleet: Arc<dyn FleetView>,
    session: Arc<dyn CoordinationSession>,
    shutdown: Arc<ShutdownSignal>,
    pub(crate) master_start: Instant,
    pub(crate) locality: Mutex<LocalityState>,
    scanners_stopped: AtomicBool,
    root_scan_done: AtomicBool,
    meta_scan_done: AtomicBool,
    pub(crate) rescan: Notify,
    pub(crate) pending_meta_scans: Mutex<Vec<MetaRegion>>,
}

impl RegionManager {
    /// Build the manager and schedule the root region for assignment, the
    /// way a freshly started master begins life.
    pub fn new(
        config: RegionManagerConfig,
        fleet: Arc<dyn FleetView>,
        session: Arc<dyn CoordinationSession>,
        locality_mapping: Option<HashMap<String, String>>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            transition: TransitionTable::new(session.clone()),
            catalog: CatalogTracker::new(),
            preferred: Arc::new(PreferredAssignmentStore::new(config.region_hold_period)),
            actions: ActionQueues::new(),
            reopeners: ReopenerRegistry::new(config.reopen_max_in_flight),
            balancer: LoadBalancer::new(config.balancer),
            fleet,
            session,
            shutdown: Arc::new(ShutdownSignal::new()),
            master_start: Instant::now(),
            locality: Mutex::new(LocalityState {
                quick_start: locality_mapping.as_ref().map(|_| HashSet::new()),
                mapping: locality_mapping,
            }),
            scanners_stopped: AtomicBool::new(false),
            root_scan_done: AtomicBool::new(false),
            meta_scan_done: AtomicBool::new(false),
            rescan: Notify::new(),
            pending_meta_scans: Mutex::new(Vec::new()),
            config,
        });
        manager.reassign_root_region();
        manager
    }

    pub fn config(&self) -> &RegionManagerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &CatalogTracker {
        &self.catalog
    }

    pub fn preferred_assignments(&self) -> &PreferredAssignmentStore {
        &self.preferred
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn shutdown_handle(&self) -> Arc<ShutdownSignal> {
        self.shutdown.clone()
    }

    // ---- lifecycle ------------------------------------------------------

    /// Spawn the root scanner, meta scanner, and hold-expiry handler.
    pub fn start(self: &Arc<Self>, access: Arc<dyn CatalogAccess>) -> ManagerTasks {
        ManagerTasks {
            root_scanner: scanner::spawn_root_scanner(self.clone(), access.clone()),
            meta_scanner: scanner::spawn_meta_scanner(self.clone(), access),
            expiry_handler: preferred::spawn_expiry_handler(
                self.preferred.clone(),
                self.shutdown.clone(),
                self.config.thread_wake_frequency,
            ),
        }
    }

    /// Stop the scanners so servers hosting catalog regions can shut down.
    pub fn stop_scanners(&self) {
        self.scanners_stopped.store(true, Ordering::SeqCst);
        self.rescan.notify_waiters();
    }

    /// Full stop: close every background task and the coordination session.
    /// In-flight heartbeat handlers complete naturally.
    pub async fn stop(&self, tasks: ManagerTasks) {
        self.shutdown.mark_closed();
        self.stop_scanners();
        self.preferred.wake();
        for (name, handle) in [
            ("root_scanner", tasks.root_scanner),
            ("meta_scanner", tasks.meta_scanner),
            ("expiry_handler", tasks.expiry_handler),
        ] {
            if let Err(err) = handle.await {
                tracing::warn!(task = name, error = ?err, "background task join failed");
            }
        }
        self.session.clear();
        self.session.close();
    }

    pub(crate) fn scanners_stopped(&self) -> bool {
        self.scanners_stopped.load(Ordering::SeqCst) || self.shutdown.is_stopping()
    }

    pub fn is_initial_root_scan_complete(&self) -> bool {
        self.root_scan_done.load(Ordering::SeqCst)
    }

    pub fn is_initial_meta_scan_complete(&self) -> bool {
        self.meta_scan_done.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_root_scan_complete(&self) {
        self.root_scan_done.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_meta_scan_complete(&self) {
        self.meta_scan_done.store(true, Ordering::SeqCst);
    }

    /// Queue a meta region for an out-of-band scan and wake the scanner.
    pub fn add_meta_region_to_scan(&self, meta: MetaRegion) {
        self.pending_meta_scans.lock().unwrap().push(meta);
        self.rescan.notify_waiters();
    }

    // ---- root region ----------------------------------------------------

    /// Clear the root location and its transition entry without scheduling a
    /// reassignment.
    pub fn unset_root_region(&self) {
        let root = RegionInfo::root();
        {
            let mut table = self.transition.lock();
            self.catalog.clear_root_location();
            table.remove(&root.region_name_string());
            self.transition.delete_mirror(&root);
        }
        tracing::info!("root region unset (but not set to be reassigned)");
    }

    /// Unset root and, unless shutdown was requested, put it back into the
    /// transition table as unassigned so the next heartbeat can claim it.
    pub fn reassign_root_region(&self) {
        self.unset_root_region();
        if !self.shutdown.is_shutdown_requested() {
            let root = RegionInfo::root();
            let name = root.region_name_string();
            let mut table = self.transition.lock();
            self.transition.write_offline_mirror(&root);
            table.insert(
                name,
                Arc::new(RegionState::new(root, LifecycleState::Unassigned)),
            );
            tracing::info!("root region inserted into transition table");
        }
    }

    /// Persist the root location with bounded retries, then record it in
    /// memory and wake every waiter. Exhausting the retries requests master
    /// shutdown; the in-memory update still happens so waiters can observe a
    /// consistent view while the master winds down.
    pub fn set_root_region_location(&self, addr: ServerAddress) {
        if !coordination::write_root_location_with_retry(
            self.session.as_ref(),
            &addr,
            self.config.coordination_retries,
            self.config.coordination_pause,
        ) {
            tracing::error!(
                retries = self.config.coordination_retries,
                "failed to write root region location, requesting master shutdown"
            );
            self.shutdown.request_shutdown();
        }
        {
            let _table = self.transition.lock();
            self.transition.delete_mirror(&RegionInfo::root());
        }
        tracing::info!(root = %addr, "root region location set");
        self.catalog.set_root_location(addr);
    }

    pub fn root_region_location(&self) -> Option<ServerAddress> {
        self.catalog.root_region_location()
    }

    /// Block until the root location is known or shutdown is requested.
    pub fn wait_for_root_region_location(&self) -> Option<ServerAddress> {
        self.catalog
            .wait_for_root_region_location(&self.shutdown, self.config.thread_wake_frequency)
    }

    pub fn is_root_server(&self, addr: &ServerAddress) -> bool {
        self.catalog.root_region_location().as_ref() == Some(addr)
    }

    // ---- transition queries and mutators --------------------------------

    pub fn region_is_in_transition(&self, region_name: &str) -> bool {
        self.transition.contains(region_name)
    }

    pub fn region_is_opening(&self, region_name: &str) -> bool {
        self.transition
            .get(region_name)
            .map(|s| s.is_opening())
            .unwrap_or(false)
    }

    pub fn is_unassigned(&self, info: &RegionInfo) -> bool {
        self.transition
            .get(&info.region_name_string())
            .map(|s| s.is_unassigned())
            .unwrap_or(false)
    }

    pub fn is_pending_open(&self, region_name: &str) -> bool {
        self.transition
            .get(region_name)
            .map(|s| s.is_pending_open())
            .unwrap_or(false)
    }

    pub fn is_offlined(&self, region_name: &str) -> bool {
        self.transition
            .get(region_name)
            .map(|s| s.is_offlined())
            .unwrap_or(false)
    }

    /// The server confirmed the region is open.
    pub fn set_open(&self, region_name: &str) {
        if let Some(state) = self.transition.get(region_name) {
            state.set_open();
        }
    }

    /// The close message has been handed to the server.
    pub fn set_pending_close(&self, region_name: &str) {
        if let Some(state) = self.transition.get(region_name) {
            state.set_pending_close();
        }
    }

    /// The server confirmed the region is closed.
    pub fn set_closed(&self, region_name: &str) -> Result<(), IllegalTransition> {
        match self.transition.get(region_name) {
            Some(state) => state.set_closed(),
            None => Ok(()),
        }
    }

    /// Mark a region as closing on `server_name`. If an open was already
    /// routed somewhere, the close follows the open's server.
    pub fn set_closing(
        &self,
        server_name: &str,
        address: Option<&ServerAddress>,
        info: &RegionInfo,
        set_offline: bool,
    ) {
        let name = info.region_name_string();
        let mut table = self.transition.lock();
        let state = table.get(&name).cloned().unwrap_or_else(|| {
            Arc::new(RegionState::new(info.clone(), LifecycleState::Closing))
        });
        state.set_closing(server_name, address, set_offline);
        table.insert(name, state);
    }

    /// Put a region into the unassigned state, creating the transition entry
    /// and mirror node if needed. Without `force`, a region already on the
    /// open path keeps its state.
    pub fn set_unassigned(&self, info: &RegionInfo, force: bool) {
        let name = info.region_name_string();
        let state = {
            let mut table = self.transition.lock();
            match table.get(&name).cloned() {
                Some(state) => state,
                None => {
                    self.transition.write_offline_mirror(info);
                    let state = Arc::new(RegionState::new(
                        info.clone(),
                        LifecycleState::Unassigned,
                    ));
                    table.insert(name, state.clone());
                    state
                }
            }
        };
        if force || (!state.is_pending_open() && !state.is_open()) {
            state.set_unassigned();
        }
    }

    /// Drop a region from the transition table once the catalog owns it
    /// again. A region that closed without being offlined comes straight
    /// back as unassigned so it gets a new home.
    pub fn remove_region(&self, info: &RegionInfo) {
        let name = info.region_name_string();
        let mut table = self.transition.lock();
        let removed = table.remove(&name);
        self.transition.delete_mirror(info);
        if let Some(state) = removed {
            if state.is_closed() && !state.offline_flag() {
                self.transition.write_offline_mirror(info);
                table.insert(
                    name,
                    Arc::new(RegionState::new(info.clone(), LifecycleState::Unassigned)),
                );
            }
        }
    }

    /// Remove whichever transition entry carries the raw region name.
    pub fn clear_from_in_transition(&self, region_name: &[u8]) -> bool {
        self.transition.remove_by_name(region_name)
    }

    pub fn regions_in_transition(&self) -> BTreeMap<String, RegionStateView> {
        self.transition.snapshot()
    }

    /// Transition entries assigned to the named server.
    pub fn regions_in_transition_on_server(
        &self,
        server_name: &str,
    ) -> BTreeMap<String, RegionStateView> {
        self.transition
            .snapshot()
            .into_iter()
            .filter(|(_, view)| view.server_name.as_deref() == Some(server_name))
            .collect()
    }

    /// Regions marked closing on the named server whose close message has
    /// not been handed out yet.
    pub fn marked_to_close(&self, server_name: &str) -> Vec<RegionInfo> {
        let table = self.transition.lock();
        table
            .values()
            .filter(|s| s.is_closing() && s.server_name().as_deref() == Some(server_name))
            .map(|s| s.info().clone())
            .collect()
    }

    // ---- catalog views --------------------------------------------------

    pub fn num_meta_regions(&self) -> usize {
        self.catalog.expected_meta_regions()
    }

    pub fn set_num_meta_regions(&self, count: usize) {
        self.catalog.set_expected_meta_regions(count);
    }

    pub fn increment_num_meta_regions(&self) {
        self.catalog.increment_expected_meta_regions();
    }

    pub fn all_meta_regions_online(&self) -> bool {
        self.catalog.all_meta_regions_online()
    }

    /// Any online meta region currently in transition?
    pub fn meta_regions_in_transition(&self) -> bool {
        self.catalog
            .online_meta_regions()
            .values()
            .any(|m| self.region_is_in_transition(&m.info.region_name_string()))
    }

    /// Does this server host any meta region, online or mid-assignment?
    /// Comparison is by server address; the transition record keeps the
    /// address alongside the full server name precisely for this check.
    pub fn is_meta_server(&self, addr: &ServerAddress) -> bool {
        if self.catalog.is_meta_server_online(addr) {
            return true;
        }
        let table = self.transition.lock();
        table.values().any(|s| {
            s.info().is_meta_table()
                && !s.is_unassigned()
                && s.server_address().as_ref() == Some(addr)
        })
    }

    /// Is the named server mid-transition on the root region?
    pub fn is_root_in_transition_on_server(&self, server_name: &str) -> bool {
        let table = self.transition.lock();
        table.values().any(|s| {
            s.info().is_root()
                && !s.is_unassigned()
                && s.server_name().as_deref() == Some(server_name)
        })
    }

    /// The meta region the named server is transitioning, if any.
    pub fn meta_server_region_info(&self, server_name: &str) -> Option<RegionInfo> {
        let table = self.transition.lock();
        table
            .values()
            .find(|s| {
                s.info().is_meta_table()
                    && !s.is_unassigned()
                    && s.server_name().as_deref() == Some(server_name)
            })
            .map(|s| s.info().clone())
    }

    /// Take a cleanly shut down meta server offline: reassign root if it was
    /// here and mark its meta regions unassigned. Returns true when the
    /// server carried any catalog region.
    pub fn offline_meta_server(&self, addr: &ServerAddress) -> bool {
        let mut has_meta = false;
        if self.is_root_server(addr) {
            tracing::info!(server = %addr, "offlined root server");
            self.reassign_root_region();
            has_meta = true;
        }
        for meta in self.catalog.meta_regions_on_server(addr) {
            tracing::info!(meta = %meta, "offlining meta region");
            self.catalog
                .offline_meta_region_with_start_key(meta.start_key());
            self.set_unassigned(&meta.info, true);
            has_meta = true;
        }
        has_meta
    }

    /// Create a new region: materialize its store, write its row into the
    /// hosting catalog region, and leave it for the next catalog scan to
    /// pick up and assign.
    pub fn create_region(
        &self,
        access: &dyn CatalogAccess,
        info: &RegionInfo,
        meta_region_name: &[u8],
    ) -> anyhow::Result<()> {
        access.create_region_storage(info)?;
        let value = serde_json::to_vec(info)?;
        access.put_region_row(meta_region_name, CatalogRow::region_info(info.region_name(), value))?;
        tracing::info!(region = %info, "created region and recorded it in the catalog");
        Ok(())
    }

    // ---- preferred assignment -------------------------------------------

    /// Hold the regions of a server going down for a planned restart.
    pub fn add_region_server_for_restart(
        &self,
        server: &ServerInfo,
        regions: impl IntoIterator<Item = RegionInfo>,
    ) {
        tracing::debug!(server = %server.server_name, "holding regions of restarting server");
        self.preferred
            .add_all(&server.address, regions, Instant::now());
    }

    pub fn has_preferred_assignment(&self, addr: &ServerAddress) -> bool {
        self.preferred.has_holds_for(addr)
    }

    pub fn add_region_to_preferred_assignment(&self, addr: &ServerAddress, region: RegionInfo) {
        self.preferred.add(addr, region, Instant::now());
    }

    // ---- action queues --------------------------------------------------

    pub fn start_action(
        &self,
        region_name: &[u8],
        info: RegionInfo,
        server: ServerAddress,
        op: TableAction,
    ) {
        self.actions.start_action(region_name, info, server, op);
    }

    pub fn start_cf_action(
        &self,
        region_name: &[u8],
        family: &[u8],
        info: RegionInfo,
        server: ServerAddress,
        op: CfTableAction,
    ) {
        self.actions
            .start_cf_action(region_name, family, info, server, op);
    }

    pub fn end_actions(&self, region_name: &[u8]) {
        self.actions.end_actions(region_name);
    }

    pub fn apply_actions(&self, info: &ServerInfo, out: &mut Vec<RegionMessage>) {
        self.actions.apply_actions(info, out);
    }

    // ---- reopeners ------------------------------------------------------

    pub fn create_throttled_reopener(&self, table: &str) -> Arc<ThrottledReopener> {
        self.reopeners.create(table)
    }

    pub fn throttled_reopener(&self, table: &str) -> Option<Arc<ThrottledReopener>> {
        self.reopeners.get(table)
    }

    pub fn delete_throttled_reopener(&self, table: &str) {
        self.reopeners.delete(table);
    }

    pub fn notify_region_reopened(&self, region: &RegionInfo) -> Option<ReopenProgress> {
        self.reopeners.notify_region_reopened(region)
    }

    // ---- heartbeat entry point ------------------------------------------

    /// Full per-heartbeat processing: drain queued operations for the
    /// reporting server, then run the assignment engine.
    pub fn process_heartbeat(
        &self,
        info: &ServerInfo,
        most_loaded: &[RegionInfo],
    ) -> Vec<RegionMessage> {
        let mut out = Vec::new();
        self.apply_actions(info, &mut out);
        self.assign_regions(info, most_loaded, &mut out);
        out
    }
}
