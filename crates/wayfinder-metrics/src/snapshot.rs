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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resolution outcomes of one service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    /// Resolutions that returned an endpoint
    pub available: u64,
    /// Resolutions that failed with no eligible endpoint
    pub unavailable: u64,
    /// Resolutions rejected by call dropping
    pub dropped: u64,
    /// Resolutions whose partition key could not be mapped
    pub partition_errors: u64,
    /// Ring rebuilds caused by property updates or window ticks
    pub ring_rebuilds: u64,
    pub avg_resolution_us: u64,
    pub p50_resolution_us: u64,
    pub p99_resolution_us: u64,
}

/// Selection count of one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub uri: String,
    pub selections: u64,
    pub last_selected_ms: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_resolutions: u64,
    pub total_failures: u64,
    pub uptime_ms: u64,
    /// Number of store switches between primary and backup
    pub store_switches: u64,
    pub services: HashMap<String, ServiceMetrics>,
    pub endpoints: HashMap<String, EndpointMetrics>,
}

impl MetricsSnapshot {
    pub fn service(&self, name: &str) -> ServiceMetrics {
        self.services.get(name).cloned().unwrap_or_default()
    }

    pub fn selections(&self, uri: &str) -> u64 {
        self.endpoints.get(uri).map(|e| e.selections).unwrap_or(0)
    }
}
