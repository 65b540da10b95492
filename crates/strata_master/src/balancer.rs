//! Load balancer: decides how many regions an overloaded server must shed.
//!
//! Equilibrium is the slop band around the fleet average,
//! `[floor(avg * (1 - slop)) - 1, ceil(avg * (1 + slop))]`. A server above
//! the band sheds down to the ceiling of the average; the single most loaded
//! server additionally sheds toward servers sitting below the band.

use std::collections::{BTreeMap, BTreeSet};

use crate::server::ServerLoad;

/// Knobs for the shedding decision.
#[derive(Clone, Copy, Debug)]
pub struct LoadBalancerConfig {
    /// Tolerance band around the average, as a fraction of it.
    pub slop: f64,
    /// Upper bound on regions shed per heartbeat; non-positive means
    /// unlimited.
    pub max_regions_to_close: i32,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            slop: 0.3,
            max_regions_to_close: -1,
        }
    }
}

impl LoadBalancerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = crate::manager::env_f64("STRATA_BALANCER_SLOP") {
            cfg.slop = v;
        }
        if let Some(v) = crate::manager::env_i32("STRATA_BALANCER_MAX_CLOSE") {
            cfg.max_regions_to_close = v;
        }
        cfg
    }
}

pub struct LoadBalancer {
    slop: f64,
    max_regions_to_close: i32,
}

impl LoadBalancer {
    /// A non-positive slop is silently widened to 100% tolerance; callers
    /// that want strict validation must reject the config themselves.
    pub fn new(cfg: LoadBalancerConfig) -> Self {
        let slop = if cfg.slop <= 0.0 { 1.0 } else { cfg.slop };
        Self {
            slop,
            max_regions_to_close: cfg.max_regions_to_close,
        }
    }

    /// How many regions the reporting server should shed right now. Zero
    /// means its load is acceptable.
    pub fn regions_to_shed(
        &self,
        server_name: &str,
        load: ServerLoad,
        avg: f64,
        load_to_servers: &BTreeMap<ServerLoad, BTreeSet<String>>,
    ) -> usize {
        let regions = load.regions as f64;
        if regions <= avg.floor() || avg <= 2.0 {
            return 0;
        }

        let mut to_close = self.shed_from_overloaded(server_name, load, avg);
        if to_close == 0 {
            to_close = self.shed_to_lightly_loaded(server_name, load, avg, load_to_servers);
        }
        if self.max_regions_to_close > 0 {
            to_close = to_close.min(self.max_regions_to_close as usize);
        }
        to_close
    }

    fn shed_from_overloaded(&self, server_name: &str, load: ServerLoad, avg: f64) -> usize {
        let avg_plus_slop = (avg * (1.0 + self.slop)).ceil() as i64;
        let regions = load.regions as i64;
        if regions > avg_plus_slop {
            tracing::debug!(
                server = %server_name,
                load = regions,
                avg,
                slop = self.slop,
                "server carrying more than its fair share of regions"
            );
            return (regions - avg.ceil() as i64).max(0) as usize;
        }
        0
    }

    fn shed_to_lightly_loaded(
        &self,
        server_name: &str,
        load: ServerLoad,
        avg: f64,
        load_to_servers: &BTreeMap<ServerLoad, BTreeSet<String>>,
    ) -> usize {
        // Only the most loaded tier sheds toward the lightly loaded.
        let Some((_, heaviest)) = load_to_servers.iter().next_back() else {
            return 0;
        };
        if !heaviest.contains(server_name) {
            return 0;
        }

        let avg_minus_slop = (avg * (1.0 - self.slop)).floor() as i64 - 1;
        let Some((lightest_load, light_servers)) = load_to_servers.iter().next() else {
            return 0;
        };
        let lightest = lightest_load.regions as i64;
        if lightest >= avg_minus_slop {
            return 0;
        }

        let room_below = (avg_minus_slop - lightest) * light_servers.len() as i64;
        let above_avg = load.regions as i64 - avg.floor() as i64;
        let to_close = above_avg.min(room_below).max(0) as usize;
        tracing::debug!(
            server = %server_name,
            lightest,
            to_close,
            "most loaded server shedding toward lightly loaded tier"
        );
        to_close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers(entries: &[(u32, &[&str])]) -> BTreeMap<ServerLoad, BTreeSet<String>> {
        entries
            .iter()
            .map(|(regions, names)| {
                (
                    ServerLoad::new(*regions, 0),
                    names.iter().map(|n| n.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn overloaded_server_sheds_down_to_average() {
        let balancer = LoadBalancer::new(LoadBalancerConfig::default());
        let fleet = tiers(&[(5, &["s1"]), (10, &["s2", "s3"]), (20, &["s5"])]);
        // avg 10, slop 0.3: threshold ceil(13), shed load - ceil(avg).
        let shed = balancer.regions_to_shed("s5", ServerLoad::new(20, 0), 10.0, &fleet);
        assert_eq!(shed, 10);
    }

    #[test]
    fn in_band_server_does_not_shed() {
        let balancer = LoadBalancer::new(LoadBalancerConfig::default());
        let fleet = tiers(&[(9, &["s1"]), (12, &["s2"])]);
        assert_eq!(
            balancer.regions_to_shed("s2", ServerLoad::new(12, 0), 10.0, &fleet),
            0
        );
    }

    #[test]
    fn low_average_disables_balancing() {
        let balancer = LoadBalancer::new(LoadBalancerConfig::default());
        let fleet = tiers(&[(0, &["s1"]), (4, &["s2"])]);
        assert_eq!(
            balancer.regions_to_shed("s2", ServerLoad::new(4, 0), 2.0, &fleet),
            0
        );
    }

    #[test]
    fn most_loaded_sheds_toward_lightly_loaded() {
        let balancer = LoadBalancer::new(LoadBalancerConfig::default());
        // avg 10: band is [floor(7) - 1, ceil(13)] = [6, 13].
        let fleet = tiers(&[(2, &["s1", "s2"]), (12, &["s3"])]);
        // s3 is within the overload ceiling but is the most loaded, and the
        // lightest tier sits below the band: shed min(12 - 10, (6 - 2) * 2).
        let shed = balancer.regions_to_shed("s3", ServerLoad::new(12, 0), 10.0, &fleet);
        assert_eq!(shed, 2);
    }

    #[test]
    fn not_most_loaded_does_not_shed_to_light() {
        let balancer = LoadBalancer::new(LoadBalancerConfig::default());
        let fleet = tiers(&[(2, &["s1"]), (12, &["s2"]), (13, &["s3"])]);
        assert_eq!(
            balancer.regions_to_shed("s2", ServerLoad::new(12, 0), 10.0, &fleet),
            0
        );
    }

    #[test]
    fn close_cap_applies() {
        let balancer = LoadBalancer::new(LoadBalancerConfig {
            slop: 0.3,
            max_regions_to_close: 3,
        });
        let fleet = tiers(&[(5, &["s1"]), (20, &["s2"])]);
        assert_eq!(
            balancer.regions_to_shed("s2", ServerLoad::new(20, 0), 10.0, &fleet),
            3
        );
    }

    #[test]
    fn non_positive_slop_resets_to_full_tolerance() {
        let balancer = LoadBalancer::new(LoadBalancerConfig {
            slop: 0.0,
            max_regions_to_close: -1,
        });
        let fleet = tiers(&[(5, &["s1"]), (18, &["s2"])]);
        // With slop forced to 1.0 the overload threshold is ceil(20); 18 is
        // inside it and s2 is most loaded, lightest 5 < floor(0) - 1 is false.
        assert_eq!(
            balancer.regions_to_shed("s2", ServerLoad::new(18, 0), 10.0, &fleet),
            0
        );
    }
}
