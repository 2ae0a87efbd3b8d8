// Copyright 2025 Wayfinder Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Health-adaptive ring strategy.
//!
//! Once per window every endpoint's call statistics are drained and its
//! health in `[health_floor, 1]` is stepped up or down. The endpoint's ring
//! points follow its health and weight. Endpoints joining a live partition,
//! or coming back from a mark-down, slow-start through fast recovery: their
//! point budget starts tiny and multiplies by `ramp_factor` each window until
//! traffic proves them healthy or unhealthy, or they reach full weight.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use wayfinder_common::properties::StrategyProperties;

use crate::control::{ControlCommand, EndpointOverride};
use crate::ring::Ring;
use crate::tracker::{CallTracker, WindowStats};

/// Weights at or below this are standby endpoints.
const WEIGHT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    None,
    /// Slow start with the current point budget
    Fast { points: u32 },
}

/// Health bookkeeping of one endpoint within one partition.
#[derive(Debug)]
pub struct EndpointState {
    /// Weight announced in the endpoint set
    pub weight: f64,
    pub health: f64,
    pub recovery: Recovery,
    pub overrides: EndpointOverride,
    pub last_step: Option<Instant>,
    tracker: Arc<CallTracker>,
}

impl EndpointState {
    fn new(weight: f64, overrides: EndpointOverride) -> Self {
        Self {
            weight,
            health: 1.0,
            recovery: Recovery::None,
            overrides,
            last_step: None,
            tracker: Arc::new(CallTracker::new()),
        }
    }

    pub fn effective_weight(&self) -> f64 {
        self.overrides.weight.unwrap_or(self.weight)
    }

    pub fn tracker(&self) -> &Arc<CallTracker> {
        &self.tracker
    }

    fn is_standby(&self) -> bool {
        self.effective_weight() <= WEIGHT_EPSILON
    }

    fn full_points(&self, props: &StrategyProperties) -> u32 {
        (self.effective_weight() * props.points_per_weight as f64).round() as u32
    }

    /// Ring points this endpoint is entitled to right now.
    pub fn points(&self, props: &StrategyProperties) -> u32 {
        if self.overrides.marked_down || self.is_standby() {
            return 0;
        }
        let full = self.full_points(props);
        let points = match self.recovery {
            Recovery::Fast { points } => points.min(full),
            Recovery::None => (self.health * props.points_per_weight as f64 * self.effective_weight()).round() as u32,
        };
        // Only a mark-down or standby takes an endpoint off the ring
        points.max(1)
    }

    fn enter_recovery(&mut self, props: &StrategyProperties) {
        if props.do_not_slow_start {
            self.health = 1.0;
            self.recovery = Recovery::None;
            return;
        }
        let initial = (props.initial_recovery_health * props.points_per_weight as f64).round() as u32;
        self.recovery = Recovery::Fast {
            points: initial.max(1),
        };
        self.health = props.initial_recovery_health;
    }
}

/// How far a window's statistics are past the high thresholds, at least 1.
fn severity(props: &StrategyProperties, latency_ms: f64, error_rate: f64) -> f64 {
    let ratio = |value: f64, threshold: f64| {
        if threshold > 0.0 {
            value / threshold
        } else if value > 0.0 {
            f64::INFINITY
        } else {
            1.0
        }
    };
    ratio(latency_ms, props.high_latency_ms)
        .max(ratio(error_rate, props.high_error_rate))
        .clamp(1.0, props.max_down_step_multiplier)
}

fn is_high(props: &StrategyProperties, window: &WindowStats) -> bool {
    window.latency_ms(props.latency_to_use) >= props.high_latency_ms
        || window.error_rate() >= props.high_error_rate
}

fn is_low(props: &StrategyProperties, window: &WindowStats) -> bool {
    window.latency_ms(props.latency_to_use) <= props.low_latency_ms
        && window.error_rate() <= props.low_error_rate
}

fn step_down(props: &StrategyProperties, health: f64, window: &WindowStats) -> f64 {
    let severity = severity(
        props,
        window.latency_ms(props.latency_to_use),
        window.error_rate(),
    );
    (health - props.down_step * severity).max(props.health_floor)
}

/// Strategy state of one (service, partition).
#[derive(Debug)]
pub struct PartitionStrategy {
    properties: Arc<StrategyProperties>,
    endpoints: BTreeMap<String, EndpointState>,
    drop_rate: f64,
    initialized: bool,
    last_update: Instant,
    ring: Arc<Ring>,
}

impl PartitionStrategy {
    pub fn new(properties: Arc<StrategyProperties>, now: Instant) -> Self {
        Self {
            properties,
            endpoints: BTreeMap::new(),
            drop_rate: 0.0,
            initialized: false,
            last_update: now,
            ring: Arc::new(Ring::default()),
        }
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    /// Fraction of new requests to fail fast.
    pub fn drop_rate(&self) -> f64 {
        self.drop_rate
    }

    pub fn endpoint(&self, uri: &str) -> Option<&EndpointState> {
        self.endpoints.get(uri)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (&String, &EndpointState)> {
        self.endpoints.iter()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_update)
            >= Duration::from_millis(self.properties.update_interval_ms)
    }

    /// Replaces the endpoint set.
    ///
    /// Endpoints of the first non-empty set start healthy. Later arrivals
    /// slow-start unless they are standby or marked down. Returns whether the
    /// ring changed.
    pub fn set_endpoints(
        &mut self,
        endpoints: &BTreeMap<String, f64>,
        overrides: &HashMap<String, EndpointOverride>,
    ) -> bool {
        self.endpoints.retain(|uri, _| endpoints.contains_key(uri));
        for (uri, weight) in endpoints {
            match self.endpoints.get_mut(uri) {
                Some(existing) => existing.weight = *weight,
                None => {
                    let overrides = overrides.get(uri).copied().unwrap_or_default();
                    let mut state = EndpointState::new(*weight, overrides);
                    if self.initialized && !overrides.marked_down && !state.is_standby() {
                        state.enter_recovery(&self.properties);
                    }
                    self.endpoints.insert(uri.clone(), state);
                }
            }
        }
        if !self.endpoints.is_empty() {
            self.initialized = true;
        }
        self.rebuild_ring()
    }

    /// Applies an operator command. Returns whether the ring changed.
    pub fn apply_control(&mut self, command: &ControlCommand) -> bool {
        let Some(state) = self.endpoints.get_mut(command.uri()) else {
            return false;
        };
        let was_down = state.overrides.marked_down;
        state.overrides.apply(command);
        match command {
            ControlCommand::MarkDown { .. } => state.recovery = Recovery::None,
            ControlCommand::MarkUp { .. } if was_down && !state.is_standby() => {
                state.enter_recovery(&self.properties)
            }
            _ => {}
        }
        self.rebuild_ring()
    }

    /// Closes the current window: steps every endpoint's health, adjusts the
    /// drop rate and rebuilds the ring. Returns whether the ring changed.
    pub fn update(&mut self, now: Instant) -> bool {
        let props = self.properties.clone();
        let mut total_calls = 0u64;
        let mut latency_sum_ms = 0.0;

        for (uri, state) in self.endpoints.iter_mut() {
            let window = state.tracker.take_window();
            total_calls += window.call_count;
            latency_sum_ms += window.average_ms() * window.call_count as f64;

            if state.overrides.marked_down || state.is_standby() {
                continue;
            }
            let before = state.health;
            Self::step_endpoint(&props, state, &window);
            state.last_step = Some(now);
            if state.health != before {
                debug!(
                    "{} health {:.3} -> {:.3} after {} calls ({:?})",
                    uri, before, state.health, window.call_count, state.recovery
                );
            }
        }

        self.update_drop_rate(&props, total_calls, latency_sum_ms);
        self.last_update = now;
        self.rebuild_ring()
    }

    fn step_endpoint(props: &StrategyProperties, state: &mut EndpointState, window: &WindowStats) {
        let full = state.full_points(props).max(1);
        match state.recovery {
            Recovery::Fast { points } => {
                if window.call_count > 0 && is_high(props, window) {
                    let health = points as f64 / full as f64;
                    state.recovery = Recovery::None;
                    state.health = step_down(props, health, window);
                    return;
                }
                let next = ((points as f64 * props.ramp_factor).ceil() as u32).min(full);
                let health = next as f64 / full as f64;
                if next >= full {
                    state.recovery = Recovery::None;
                    state.health = 1.0;
                } else if window.call_count > 0 && health > props.fast_recovery_exit_health {
                    state.recovery = Recovery::None;
                    state.health = health;
                } else {
                    state.recovery = Recovery::Fast { points: next };
                    state.health = health;
                }
            }
            Recovery::None => {
                if window.call_count >= props.min_call_count {
                    if is_high(props, window) {
                        state.health = step_down(props, state.health, window);
                    } else if is_low(props, window) {
                        state.health = (state.health + props.up_step).min(1.0);
                    }
                } else if window.call_count == 0 && state.health <= props.health_floor + f64::EPSILON {
                    state.enter_recovery(props);
                }
            }
        }
    }

    fn update_drop_rate(&mut self, props: &StrategyProperties, total_calls: u64, latency_sum_ms: f64) {
        let average_ms = if total_calls > 0 {
            latency_sum_ms / total_calls as f64
        } else {
            0.0
        };
        let before = self.drop_rate;

        if total_calls < props.min_cluster_call_count_low_water_mark {
            self.drop_rate = (self.drop_rate - props.global_step_down).max(0.0);
        } else if total_calls >= props.min_cluster_call_count_high_water_mark
            && average_ms >= props.high_water_mark_ms
        {
            self.drop_rate = (self.drop_rate + props.global_step_up).min(1.0);
        } else if average_ms <= props.low_water_mark_ms {
            self.drop_rate = (self.drop_rate - props.global_step_down).max(0.0);
        }

        if self.drop_rate != before {
            info!(
                "Drop rate {:.2} -> {:.2} (average latency {:.1}ms over {} calls)",
                before, self.drop_rate, average_ms, total_calls
            );
        }
    }

    fn rebuild_ring(&mut self) -> bool {
        let points: BTreeMap<String, u32> = self
            .endpoints
            .iter()
            .map(|(uri, state)| (uri.clone(), state.points(&self.properties)))
            .filter(|(_, points)| *points > 0)
            .collect();
        if &points == self.ring.points() {
            return false;
        }
        self.ring = Arc::new(Ring::new(points));
        true
    }
}

/// Strategy of one service: one [`PartitionStrategy`] per partition.
#[derive(Debug)]
pub struct AdaptiveStrategy {
    properties: Arc<StrategyProperties>,
    partitions: BTreeMap<u32, PartitionStrategy>,
}

impl AdaptiveStrategy {
    pub fn new(properties: StrategyProperties) -> Self {
        Self {
            properties: Arc::new(properties),
            partitions: BTreeMap::new(),
        }
    }

    pub fn properties(&self) -> &StrategyProperties {
        &self.properties
    }

    pub fn partition(&self, id: u32) -> Option<&PartitionStrategy> {
        self.partitions.get(&id)
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&u32, &PartitionStrategy)> {
        self.partitions.iter()
    }

    /// Replaces the endpoints of `partition`. Returns whether its ring changed.
    pub fn set_partition_endpoints(
        &mut self,
        partition: u32,
        endpoints: &BTreeMap<String, f64>,
        overrides: &HashMap<String, EndpointOverride>,
        now: Instant,
    ) -> bool {
        let properties = self.properties.clone();
        self.partitions
            .entry(partition)
            .or_insert_with(|| PartitionStrategy::new(properties, now))
            .set_endpoints(endpoints, overrides)
    }

    /// Drops partitions outside `keep`. Returns whether any was dropped.
    pub fn retain_partitions(&mut self, keep: &BTreeSet<u32>) -> bool {
        let before = self.partitions.len();
        self.partitions.retain(|id, _| keep.contains(id));
        self.partitions.len() != before
    }

    /// Applies `command` in every partition. Returns whether any ring changed.
    pub fn apply_control(&mut self, command: &ControlCommand) -> bool {
        self.partitions
            .values_mut()
            .fold(false, |changed, p| p.apply_control(command) | changed)
    }

    /// Closes the window of every partition that is due (or all with
    /// `force`). Returns the partitions whose ring changed.
    pub fn update(&mut self, now: Instant, force: bool) -> Vec<u32> {
        self.partitions
            .iter_mut()
            .filter(|(_, p)| force || p.is_due(now))
            .filter_map(|(id, p)| p.update(now).then_some(*id))
            .collect()
    }
}
