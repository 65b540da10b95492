//! The assignment engine, invoked once per heartbeat.
//!
//! Candidate selection walks a strict priority ladder: holds for a
//! restarting server bypass everything, then root, then the meta
//! reassignment gate, then the ordinary scan of unassigned regions filtered
//! by warm-up and locality rules. The outbound batch is shaped against the
//! fleet's load tiers so a burst of unassigned regions spreads instead of
//! landing on whichever server heartbeats first.
//!
//! Callers guarantee mutual exclusion while the engine runs; iteration over
//! transition entries still takes the table lock because scanners and other
//! heartbeat handlers mutate entries concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::manager::RegionManager;
use crate::region::{RegionInfo, RegionState};
use crate::server::{ServerInfo, ServerLoad};
use crate::{RegionMessage, OVERLOADED};

/// Locality decision inputs snapshotted at the top of a heartbeat.
struct LocalityWindow {
    active: bool,
    hold_for_best: bool,
    mapping: HashMap<String, String>,
    quick_start: HashSet<String>,
}

fn locality_key(info: &RegionInfo) -> String {
    format!("{}:{}", info.table, info.encoded_name())
}

impl RegionManager {
    /// Decide what the reporting server should do next: open new regions,
    /// shed load, or nothing. Messages are appended to `out` in decision
    /// order.
    pub fn assign_regions(
        &self,
        info: &ServerInfo,
        most_loaded: &[RegionInfo],
        out: &mut Vec<RegionMessage>,
    ) {
        let this_load = info.load;
        let is_single_server = self.fleet.num_servers() == 1;
        let locality = self.snapshot_locality_window(&info.hostname);

        let (candidates, preferred_path) =
            self.regions_awaiting_assignment(info, is_single_server, &locality);

        if candidates.is_empty() {
            // Nothing to hand out. Consider shedding, unless locality mode is
            // still placing regions or server shutdown work is queued.
            if !locality.active && !self.fleet.operations_pending() {
                let to_shed = self.balancer.regions_to_shed(
                    &info.server_name,
                    this_load,
                    self.fleet.average_load(),
                    &self.fleet.load_to_servers(),
                );
                if to_shed > 0 {
                    self.unassign_some_regions(info, to_shed, most_loaded, out);
                }
            }
        } else if is_single_server || locality.active || preferred_path {
            for state in &candidates {
                self.do_region_assignment(state, info, out);
            }
        } else {
            self.assign_to_multiple_servers(this_load, &candidates, info, out);
        }
    }

    /// Evaluate the locality windows against the master's uptime, record the
    /// reporting host in the quick-start set, and drop the mapping for good
    /// once the apply window has elapsed.
    fn snapshot_locality_window(&self, hostname: &str) -> LocalityWindow {
        let mut loc = self.locality.lock().unwrap();
        if loc.mapping.is_none() {
            return LocalityWindow {
                active: false,
                hold_for_best: false,
                mapping: HashMap::new(),
                quick_start: HashSet::new(),
            };
        }
        let running = self.master_start.elapsed();
        let active = running < self.config().locality_apply_window;
        let hold_for_best = running < self.config().locality_hold_window;
        if !active {
            loc.mapping = None;
            loc.quick_start = None;
            return LocalityWindow {
                active: false,
                hold_for_best: false,
                mapping: HashMap::new(),
                quick_start: HashSet::new(),
            };
        }
        if let Some(quick_start) = loc.quick_start.as_mut() {
            quick_start.insert(hostname.to_string());
        }
        LocalityWindow {
            active,
            hold_for_best,
            mapping: loc.mapping.clone().unwrap_or_default(),
            quick_start: loc.quick_start.clone().unwrap_or_default(),
        }
    }

    /// The candidate set for this heartbeat, plus whether the preferred
    /// (restart-hold) path was taken.
    fn regions_awaiting_assignment(
        &self,
        info: &ServerInfo,
        is_single_server: bool,
        locality: &LocalityWindow,
    ) -> (Vec<Arc<RegionState>>, bool) {
        let addr = &info.address;

        // A restarting server gets its held regions back immediately,
        // bypassing locality and balance logic entirely.
        if self.preferred.has_holds_for(addr) {
            let mut to_assign = Vec::new();
            for region in self.preferred.holds_for(addr) {
                if let Some(state) = self.transition.get(&region.region_name_string()) {
                    if state.is_unassigned() {
                        self.preferred.remove(addr, &region);
                        to_assign.push(state);
                    }
                }
            }
            tracing::debug!(
                server = %addr,
                count = to_assign.len(),
                "returning held regions to restarted server"
            );
            return (to_assign, true);
        }

        let is_meta_server = self.is_meta_server(addr);
        let is_root_server = self.is_root_server(addr);

        // Root goes first, and never onto a meta host unless it is the only
        // server left.
        let root_name = RegionInfo::root().region_name_string();
        if let Some(root_state) = self.transition.get(&root_name) {
            if root_state.is_unassigned() {
                let mut to_assign = Vec::new();
                if !is_meta_server || is_single_server {
                    to_assign.push(root_state);
                }
                return (to_assign, false);
            }
        }

        // While metas are being reassigned, servers already carrying catalog
        // regions take no additional load.
        let reassigning_metas = self.catalog().reassigning_metas();
        if reassigning_metas && (is_meta_server || is_root_server) && !is_single_server {
            return (Vec::new(), false);
        }

        let can_assign_user_regions = self.fleet.can_assign_user_regions();
        let mut to_assign = Vec::new();
        let table = self.transition.lock();
        for state in table.values() {
            let region = state.info();
            if reassigning_metas && !region.is_catalog() {
                // User regions wait until every meta region is back online.
                continue;
            }
            if !region.is_catalog() && !can_assign_user_regions {
                tracing::debug!(region = %region, "user region in transition but not enough servers yet");
                continue;
            }
            if self.preferred.is_held(region) {
                // Held for some other server until its hold expires.
                continue;
            }
            if locality.active && !region.is_root() && !region.is_meta_table() {
                if let Some(preferred_host) = locality.mapping.get(&locality_key(region)) {
                    if info.hostname.starts_with(preferred_host.as_str()) {
                        tracing::debug!(
                            region = %region,
                            host = %info.hostname,
                            "locality-preferred assignment"
                        );
                    } else if locality.hold_for_best
                        || locality.quick_start.contains(preferred_host)
                    {
                        continue;
                    }
                }
            }
            if state.is_unassigned() {
                to_assign.push(state.clone());
            }
        }
        (to_assign, false)
    }

    /// Shape the batch against the rest of the fleet: give lighter servers
    /// their fill first, then hand this server as many as it can take before
    /// passing the next-heavier tier, capped per heartbeat.
    fn assign_to_multiple_servers(
        &self,
        this_load: ServerLoad,
        candidates: &[Arc<RegionState>],
        info: &ServerInfo,
        out: &mut Vec<RegionMessage>,
    ) {
        let is_meta_assign = candidates.iter().any(|s| s.info().is_catalog());
        let n_candidates = candidates.len();
        let to_others = self.regions_to_give_other_servers(n_candidates, this_load);
        let n_to_assign = n_candidates.saturating_sub(to_others);
        if n_to_assign == 0 && !is_meta_assign {
            return;
        }
        tracing::debug!(
            server = %info.server_name,
            n_to_assign,
            to_others,
            is_meta_assign,
            "shaping assignment batch"
        );

        let (heavier, n_heavier) = self.next_heaviest_load(this_load);
        // An absent heavier tier behaves as the zero load: this server is
        // the heaviest and advances nothing.
        let heavier = heavier.unwrap_or_default();
        let mut n = 0usize;
        let mut virtual_load = this_load;
        while virtual_load <= heavier && n < n_to_assign {
            virtual_load.regions += 1;
            n += 1;
        }
        if n < n_to_assign {
            n = if n_heavier > 0 {
                n_to_assign.div_ceil(n_heavier)
            } else {
                n_to_assign.div_ceil(self.fleet.num_servers().max(1))
            };
        } else {
            n = n_to_assign;
        }

        // Meta candidates always get at least one slot.
        let count = n.min(self.config().max_assign_per_heartbeat.max(1)).max(1);
        tracing::debug!(server = %info.server_name, count, "assigning regions");
        for state in candidates.iter().take(count) {
            self.do_region_assignment(state, info, out);
        }
    }

    /// How many of the unassigned regions should go to servers more lightly
    /// loaded than this one: fill each lighter server up to this server's
    /// load, saturating at the number available.
    pub(crate) fn regions_to_give_other_servers(
        &self,
        n_unassigned: usize,
        this_load: ServerLoad,
    ) -> usize {
        let mut n = 0usize;
        for (load, servers) in self.fleet.load_to_servers().range(..this_load) {
            let per_server = this_load.regions.saturating_sub(load.regions) as usize;
            n = n.saturating_add(per_server.saturating_mul(servers.len()));
            if n >= n_unassigned {
                return n_unassigned;
            }
        }
        n.min(n_unassigned)
    }

    /// The next load tier above this one and the number of servers that can
    /// share the surplus: peers in this tier plus the first heavier tier.
    pub(crate) fn next_heaviest_load(&self, this_load: ServerLoad) -> (Option<ServerLoad>, usize) {
        let mut n_servers = 0usize;
        let mut heavier = None;
        for (load, servers) in self.fleet.load_to_servers().range(this_load..) {
            n_servers += servers.len();
            if *load == this_load {
                // Do not count the reporting server itself.
                n_servers = n_servers.saturating_sub(1);
                continue;
            }
            heavier = Some(*load);
            break;
        }
        (heavier, n_servers)
    }

    /// Single region assignment: move the record to pending-open, refresh
    /// the mirror node with the offline event (the server will claim it),
    /// ensure the table entry, and emit the open message. All under the
    /// table lock so concurrent heartbeats cannot double-assign.
    fn do_region_assignment(
        &self,
        state: &Arc<RegionState>,
        info: &ServerInfo,
        out: &mut Vec<RegionMessage>,
    ) {
        let name = state.region_name_string();
        tracing::info!(region = %name, server = %info.server_name, "assigning region");
        {
            let mut table = self.transition.lock();
            state.set_pending_open(&info.server_name, &info.address);
            self.transition.write_offline_mirror(state.info());
            table.insert(name, state.clone());
        }
        out.push(RegionMessage::Open(state.info().clone()));
    }

    /// Tell an overloaded server to close some of its most loaded regions.
    /// Catalog regions and regions already in transition are never chosen.
    pub(crate) fn unassign_some_regions(
        &self,
        info: &ServerInfo,
        to_close: usize,
        most_loaded: &[RegionInfo],
        out: &mut Vec<RegionMessage>,
    ) {
        tracing::debug!(
            server = %info.server_name,
            to_close,
            "unassigning regions from overloaded server"
        );
        let mut closed = 0usize;
        let mut skipped = 0usize;
        for region in most_loaded {
            if closed >= to_close {
                break;
            }
            if region.is_root() || region.is_meta_table() {
                continue;
            }
            let name = region.region_name_string();
            if self.region_is_in_transition(&name) {
                skipped += 1;
                continue;
            }
            tracing::debug!(region = %name, "closing region");
            out.push(RegionMessage::Close {
                region: region.clone(),
                reason: Some(OVERLOADED.to_string()),
            });
            self.set_closing(&info.server_name, Some(&info.address), region, false);
            self.set_pending_close(&name);
            closed += 1;
        }
        if skipped > 0 {
            tracing::info!(
                skipped,
                server = %info.server_name,
                "skipped regions already in transition"
            );
        }
    }
}
