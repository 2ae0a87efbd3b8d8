use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};

/// Which latency statistic of a window feeds the health decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyToUse {
    #[default]
    Average,
    P50,
    P90,
    P95,
    P99,
}

/// Tuning of the health-adaptive ring strategy.
///
/// Every constant of the control loop lives here rather than in code, so a
/// service owner can retune it by publishing new service properties. Missing
/// fields fall back to the defaults below when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyProperties {
    /// Length of one statistics window in milliseconds
    pub update_interval_ms: u64,
    /// Ring points granted to an endpoint of weight 1.0 at full health
    pub points_per_weight: u32,
    /// Health assigned to an endpoint entering fast recovery
    pub initial_recovery_health: f64,
    /// Growth factor of the recovery point budget per window
    pub ramp_factor: f64,
    /// Health above which a recovering endpoint that saw traffic graduates
    pub fast_recovery_exit_health: f64,
    /// Lowest health reachable by stepping down; must stay above zero
    pub health_floor: f64,
    /// Health gained per healthy window
    pub up_step: f64,
    /// Health lost per unhealthy window at severity 1.0
    pub down_step: f64,
    /// Cap on the severity multiplier applied to `down_step`
    pub max_down_step_multiplier: f64,
    /// Latency (ms) at or above which an endpoint is unhealthy
    pub high_latency_ms: f64,
    /// Latency (ms) at or below which an endpoint is healthy
    pub low_latency_ms: f64,
    /// Degrading error rate at or above which an endpoint is unhealthy
    ///
    /// Values above 1.0 disable error based degradation.
    pub high_error_rate: f64,
    /// Degrading error rate at or below which an endpoint is healthy
    pub low_error_rate: f64,
    /// Calls needed in a window before its statistics are trusted
    pub min_call_count: u64,
    pub latency_to_use: LatencyToUse,
    /// Give newly marked-up endpoints full points right away
    pub do_not_slow_start: bool,
    /// Partition average latency (ms) that starts call dropping
    pub high_water_mark_ms: f64,
    /// Partition average latency (ms) below which call dropping recedes
    pub low_water_mark_ms: f64,
    pub global_step_up: f64,
    pub global_step_down: f64,
    /// Partition calls per window needed before dropping may increase
    pub min_cluster_call_count_high_water_mark: u64,
    /// Partition calls per window needed before latency is considered at all
    pub min_cluster_call_count_low_water_mark: u64,
}

impl Default for StrategyProperties {
    fn default() -> Self {
        Self {
            update_interval_ms: 5000,
            points_per_weight: 100,
            initial_recovery_health: 0.01,
            ramp_factor: 2.0,
            fast_recovery_exit_health: 0.5,
            health_floor: 0.01,
            up_step: 0.2,
            down_step: 0.2,
            max_down_step_multiplier: 2.0,
            high_latency_ms: 3000.0,
            low_latency_ms: 500.0,
            high_error_rate: 1.1,
            low_error_rate: 1.1,
            min_call_count: 10,
            latency_to_use: LatencyToUse::Average,
            do_not_slow_start: false,
            high_water_mark_ms: 600.0,
            low_water_mark_ms: 200.0,
            global_step_up: 0.2,
            global_step_down: 0.2,
            min_cluster_call_count_high_water_mark: 10,
            min_cluster_call_count_low_water_mark: 5,
        }
    }
}

impl StrategyProperties {
    pub fn validate(&self, key: &str) -> Result<()> {
        let fail = |reason: &str| Err(DiscoveryError::config_inconsistent(key, reason));

        if self.update_interval_ms == 0 {
            return fail("update_interval_ms must be positive");
        }
        if self.points_per_weight == 0 {
            return fail("points_per_weight must be positive");
        }
        if !(self.health_floor > 0.0 && self.health_floor <= 1.0) {
            return fail("health_floor must be in (0, 1]");
        }
        if !(self.initial_recovery_health > 0.0 && self.initial_recovery_health <= 1.0) {
            return fail("initial_recovery_health must be in (0, 1]");
        }
        if !(self.ramp_factor > 1.0) {
            return fail("ramp_factor must be greater than 1");
        }
        if !(0.0..=1.0).contains(&self.fast_recovery_exit_health) {
            return fail("fast_recovery_exit_health must be in [0, 1]");
        }
        for (name, step) in [
            ("up_step", self.up_step),
            ("down_step", self.down_step),
            ("global_step_up", self.global_step_up),
            ("global_step_down", self.global_step_down),
        ] {
            if !(0.0..=1.0).contains(&step) {
                return Err(DiscoveryError::config_inconsistent(
                    key,
                    format!("{} must be in [0, 1]", name),
                ));
            }
        }
        if !(self.max_down_step_multiplier >= 1.0) {
            return fail("max_down_step_multiplier must be at least 1");
        }
        if self.low_latency_ms > self.high_latency_ms {
            return fail("low_latency_ms exceeds high_latency_ms");
        }
        if self.low_error_rate > self.high_error_rate {
            return fail("low_error_rate exceeds high_error_rate");
        }
        if self.low_water_mark_ms > self.high_water_mark_ms {
            return fail("low_water_mark_ms exceeds high_water_mark_ms");
        }
        if self.min_cluster_call_count_low_water_mark > self.min_cluster_call_count_high_water_mark {
            return fail("min cluster call count low water mark exceeds high water mark");
        }
        Ok(())
    }
}
