// Copyright 2025 Sushanth (https://github.com/sushanthpy)
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

//! Refresh policy and the recently-saved suppression window

use evalboard_core::RunStatus;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Expected metric data that a fetch did not return
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "scenario_id", rename_all = "snake_case")]
pub enum Gap {
    MissingRunLevelEntry,
    MissingScenarioMetric(String),
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gap::MissingRunLevelEntry => write!(f, "missing-run-level-entry"),
            Gap::MissingScenarioMetric(id) => write!(f, "missing-scenario-metric({id})"),
        }
    }
}

/// Inputs to the refresh decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshInput {
    pub status: RunStatus,
    pub has_gap: bool,
    pub recently_saved: bool,
    /// Scenario-level records already exist for the run
    pub has_scenario_records: bool,
}

/// Decide whether a gap warrants a recompute round trip.
///
/// Precedence, first match wins:
/// 1. no gap, or a save inside the suppression window: no refresh
/// 2. running or queued: no refresh, results are still being produced
/// 3. pending or paused: refresh only once scenario records exist
/// 4. anything else: refresh
pub fn should_refresh(input: &RefreshInput) -> bool {
    if !input.has_gap || input.recently_saved {
        return false;
    }
    if input.status.is_active() {
        return false;
    }
    if input.status.is_waiting() {
        return input.has_scenario_records;
    }
    true
}

/// Runs saved locally within the last TTL
#[derive(Clone)]
pub struct RecentlySaved {
    cache: Cache<String, ()>,
}

impl RecentlySaved {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    pub fn mark(&self, run_id: &str) {
        self.cache.insert(run_id.to_string(), ());
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.cache.contains_key(run_id)
    }

    pub fn forget(&self, run_id: &str) {
        self.cache.invalidate(run_id);
    }
}

impl fmt::Debug for RecentlySaved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecentlySaved")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
