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

//! Per-run metric cache
//!
//! ```text
//!   Idle ──load──> Loading ──ok──> Ready ──gap──> Refreshing ──> Ready
//!                     │                                  │
//!                     └──err──> Failed        stale data served meanwhile
//! ```
//!
//! Every load rebuilds the run's accumulators from the fetched records, so a
//! repeated fetch never adds to previous totals. Records pushed through
//! [`MetricStore::ingest_records`] are deduplicated by fingerprint.

use crate::backend::{MetricsBackend, MetricsQuery, RefreshRequest};
use crate::coalescer::{BatchLoader, CoalescerStats, RequestCoalescer};
use crate::error::{EngineError, EngineResult};
use crate::refresh::{should_refresh, Gap, RecentlySaved, RefreshInput};
use async_trait::async_trait;
use evalboard_core::keys::resolve_placeholder;
use evalboard_core::{
    build_candidates, resolve, resolve_in_tree, BasicStats, EngineConfig, MetricAccumulator,
    MetricRecord, MetricRequest, RecordScope, RunStatus, StatsMerger, TemporalPoint,
    TemporalSeriesIndex,
};
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The run a load is issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRef {
    pub project_id: String,
    pub run_id: String,
    pub status: RunStatus,
}

impl RunRef {
    pub fn new(project_id: impl Into<String>, run_id: impl Into<String>, status: RunStatus) -> Self {
        Self {
            project_id: project_id.into(),
            run_id: run_id.into(),
            status,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunPhase {
    Idle,
    Loading,
    Ready,
    /// Cached data is still served while the refresh is in flight
    Refreshing,
    Failed(EngineError),
}

/// What a UI selector sees
#[derive(Debug, Clone, PartialEq)]
pub enum MetricState<T> {
    Loading,
    Error(String),
    /// Loaded; `None` means the metric does not exist, which is not an error
    Ready(Option<T>),
}

impl<T> MetricState<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, MetricState::Loading)
    }

    pub fn ready(self) -> Option<T> {
        match self {
            MetricState::Ready(value) => value,
            _ => None,
        }
    }
}

/// A resolved scenario value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Stats(BasicStats),
    Raw(Value),
}

#[derive(Debug, Clone, Default)]
pub struct ValueQuery {
    pub metric_key: Option<String>,
    pub step_key: Option<String>,
    /// Prefix for raw tree lookups of evaluator outputs
    pub evaluator_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StatsQuery {
    pub metric_key: Option<String>,
    pub step_key: Option<String>,
}

impl StatsQuery {
    pub fn metric(metric_key: impl Into<String>) -> Self {
        Self {
            metric_key: Some(metric_key.into()),
            step_key: None,
        }
    }

    pub fn with_step(mut self, step_key: impl Into<String>) -> Self {
        self.step_key = Some(step_key.into());
        self
    }

    fn request(&self) -> MetricRequest<'_> {
        MetricRequest {
            metric_key: self.metric_key.as_deref(),
            metric_path: None,
            step_key: self.step_key.as_deref(),
        }
    }
}

/// Outcome of [`MetricStore::load_run`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Gaps still present after the load (and refresh, if any)
    pub gaps: Vec<Gap>,
    pub refreshed: bool,
    /// Served from cache without a fetch
    pub cached: bool,
}

fn scenario_scope(project_id: &str, run_id: &str) -> String {
    format!("{project_id}:{run_id}")
}

fn split_scope(scope: &str) -> (&str, &str) {
    scope.split_once(':').unwrap_or((scope, ""))
}

/// Loads scenario records. Scope is `project:run`, keys are scenario ids.
pub struct ScenarioMetricsLoader {
    backend: Arc<dyn MetricsBackend>,
}

#[async_trait]
impl BatchLoader for ScenarioMetricsLoader {
    type Value = Vec<MetricRecord>;

    async fn load(
        &self,
        scope: &str,
        _partition: Option<&str>,
        keys: Vec<String>,
    ) -> EngineResult<HashMap<String, Vec<MetricRecord>>> {
        let (project_id, run_id) = split_scope(scope);
        let wanted: HashSet<&String> = keys.iter().collect();
        let response = self
            .backend
            .query_metrics(project_id, MetricsQuery::for_scenarios(keys.clone()))
            .await?;

        let mut grouped: HashMap<String, Vec<MetricRecord>> = HashMap::new();
        for record in MetricRecord::normalize_all(&response.metrics) {
            if !run_id.is_empty() && record.run_id != run_id {
                continue;
            }
            if let Some(scenario_id) = record.scenario_id.clone() {
                if wanted.contains(&scenario_id) {
                    grouped.entry(scenario_id).or_default().push(record);
                }
            }
        }
        Ok(grouped)
    }
}

/// Loads run-level records. Keys are `project:run`, partitioned by project.
pub struct RunMetricsLoader {
    backend: Arc<dyn MetricsBackend>,
}

#[async_trait]
impl BatchLoader for RunMetricsLoader {
    type Value = Vec<MetricRecord>;

    fn partition(&self, _scope: &str, key: &str) -> Option<String> {
        Some(split_scope(key).0.to_string())
    }

    async fn load(
        &self,
        _scope: &str,
        partition: Option<&str>,
        keys: Vec<String>,
    ) -> EngineResult<HashMap<String, Vec<MetricRecord>>> {
        let project_id = partition.unwrap_or_default();
        let run_ids: Vec<String> = keys.iter().map(|k| split_scope(k).1.to_string()).collect();
        let response = self
            .backend
            .query_metrics(project_id, MetricsQuery::for_runs(run_ids))
            .await?;

        let mut grouped: HashMap<String, Vec<MetricRecord>> = HashMap::new();
        for record in MetricRecord::normalize_all(&response.metrics) {
            if record.scope() != RecordScope::Run {
                continue;
            }
            let key = scenario_scope(project_id, &record.run_id);
            if keys.contains(&key) {
                grouped.entry(key).or_default().push(record);
            }
        }
        Ok(grouped)
    }
}

const RUN_SCOPE: &str = "runs";

struct ScenarioCache {
    acc: MetricAccumulator,
    raw: Value,
    /// `raw` lags behind `acc` until the next rebuild
    stale: bool,
}

impl ScenarioCache {
    fn new(merger: StatsMerger) -> Self {
        Self {
            acc: MetricAccumulator::new(merger),
            raw: Value::Null,
            stale: false,
        }
    }

    fn ingest(&mut self, record: &MetricRecord) -> bool {
        let added = self.acc.ingest(record);
        self.stale |= added;
        added
    }
}

struct RunCache {
    project_id: String,
    /// Identifies this cache instance; loads started before an
    /// invalidation carry a stale epoch and are discarded
    epoch: u64,
    phase: RunPhase,
    run_level: MetricAccumulator,
    temporal: TemporalSeriesIndex,
    has_static: bool,
    has_temporal: bool,
    scenarios: HashMap<String, ScenarioCache>,
    /// Scenario ids the last load covered
    covered: BTreeSet<String>,
    gaps: Vec<Gap>,
    loaded_at: Option<Instant>,
}

impl RunCache {
    fn new(project_id: &str, epoch: u64, merger: StatsMerger) -> Self {
        Self {
            project_id: project_id.to_string(),
            epoch,
            phase: RunPhase::Idle,
            run_level: MetricAccumulator::new(merger),
            temporal: TemporalSeriesIndex::new(),
            has_static: false,
            has_temporal: false,
            scenarios: HashMap::new(),
            covered: BTreeSet::new(),
            gaps: Vec::new(),
            loaded_at: None,
        }
    }

    fn has_data(&self) -> bool {
        self.loaded_at.is_some() || self.has_static || self.has_temporal || !self.scenarios.is_empty()
    }

    fn is_temporal(&self) -> bool {
        self.has_temporal && !self.has_static
    }

    fn has_scenario_records(&self) -> bool {
        self.scenarios.values().any(|s| !s.acc.is_empty())
    }

    /// Route one record; returns whether it contributed
    fn ingest(&mut self, record: &MetricRecord, merger: StatsMerger) -> bool {
        match (&record.scenario_id, record.timestamp) {
            (Some(scenario_id), _) => self
                .scenarios
                .entry(scenario_id.clone())
                .or_insert_with(|| ScenarioCache::new(merger))
                .ingest(record),
            (None, Some(_)) => {
                let added = self.temporal.ingest(record);
                self.has_temporal |= added;
                added
            }
            (None, None) => {
                let added = self.run_level.ingest(record);
                self.has_static |= added;
                added
            }
        }
    }

    /// Rebuild the raw tree of every scenario that took new records
    fn rebuild_raw(&mut self) {
        for scenario in self.scenarios.values_mut().filter(|s| s.stale) {
            scenario.raw = scenario.acc.raw_tree();
            scenario.stale = false;
        }
    }

    fn detect_gaps(&self, run_records: usize) -> Vec<Gap> {
        let mut gaps = Vec::new();
        if run_records == 0 {
            gaps.push(Gap::MissingRunLevelEntry);
        }
        for scenario_id in &self.covered {
            let empty = self
                .scenarios
                .get(scenario_id)
                .map_or(true, |s| s.acc.is_empty());
            if empty {
                gaps.push(Gap::MissingScenarioMetric(scenario_id.clone()));
            }
        }
        gaps
    }
}

struct Fetched {
    run_records: Vec<MetricRecord>,
    scenarios: Vec<(String, Vec<MetricRecord>)>,
}

/// Fetches, merges and caches metrics per run
pub struct MetricStore {
    backend: Arc<dyn MetricsBackend>,
    scenario_batches: RequestCoalescer<ScenarioMetricsLoader>,
    run_batches: RequestCoalescer<RunMetricsLoader>,
    runs: RwLock<HashMap<String, RunCache>>,
    scenario_owner: RwLock<HashMap<String, String>>,
    epochs: AtomicU64,
    refreshing: Mutex<HashSet<String>>,
    recently_saved: RecentlySaved,
    merger: StatsMerger,
    freshness: Duration,
}

impl MetricStore {
    pub fn new(backend: Arc<dyn MetricsBackend>, config: &EngineConfig) -> Self {
        let window = config.batch_window();
        Self {
            scenario_batches: RequestCoalescer::new(
                ScenarioMetricsLoader {
                    backend: Arc::clone(&backend),
                },
                window,
            ),
            run_batches: RequestCoalescer::new(
                RunMetricsLoader {
                    backend: Arc::clone(&backend),
                },
                window,
            ),
            backend,
            runs: RwLock::new(HashMap::new()),
            scenario_owner: RwLock::new(HashMap::new()),
            epochs: AtomicU64::new(1),
            refreshing: Mutex::new(HashSet::new()),
            recently_saved: RecentlySaved::new(config.recently_saved_ttl()),
            merger: StatsMerger::new(config.max_category_entries),
            freshness: config.stats_freshness(),
        }
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    /// Load a run and the given scenarios.
    ///
    /// A fresh cache covering every requested scenario is served as is.
    /// Otherwise the run is fetched and rebuilt; a detected gap may trigger
    /// one recompute call followed by one re-fetch.
    pub async fn load_run(&self, run: &RunRef, scenario_ids: &[String]) -> EngineResult<LoadReport> {
        let (epoch, wanted) = {
            let mut runs = self.runs.write();
            let cache = runs
                .entry(run.run_id.clone())
                .or_insert_with(|| RunCache::new(&run.project_id, self.next_epoch(), self.merger));

            let fresh = matches!(cache.phase, RunPhase::Ready)
                && cache.gaps.is_empty()
                && cache.loaded_at.map_or(false, |at| at.elapsed() < self.freshness)
                && scenario_ids.iter().all(|id| cache.covered.contains(id));
            if fresh {
                debug!(run_id = %run.run_id, "Serving run metrics from cache");
                return Ok(LoadReport {
                    gaps: Vec::new(),
                    refreshed: false,
                    cached: true,
                });
            }

            if !cache.has_data() {
                cache.phase = RunPhase::Loading;
            }
            let mut wanted = cache.covered.clone();
            wanted.extend(scenario_ids.iter().cloned());
            (cache.epoch, wanted)
        };

        let fetched = match self.fetch(run, &wanted).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.record_failure(run, epoch, &e);
                return Err(e);
            }
        };

        let Some((gaps, has_scenario_records)) = self.install(run, epoch, &wanted, fetched) else {
            return Ok(LoadReport::default());
        };

        if !gaps.is_empty() {
            info!(run_id = %run.run_id, gaps = ?gaps, "Metric gaps detected");
        }

        let decision = should_refresh(&RefreshInput {
            status: run.status,
            has_gap: !gaps.is_empty(),
            recently_saved: self.recently_saved.contains(&run.run_id),
            has_scenario_records,
        });
        if !decision {
            return Ok(LoadReport {
                gaps,
                refreshed: false,
                cached: false,
            });
        }

        self.refresh(run, epoch, &wanted, gaps).await
    }

    async fn refresh(
        &self,
        run: &RunRef,
        epoch: u64,
        wanted: &BTreeSet<String>,
        gaps: Vec<Gap>,
    ) -> EngineResult<LoadReport> {
        if !self.refreshing.lock().insert(run.run_id.clone()) {
            debug!(run_id = %run.run_id, "Refresh already in flight");
            return Ok(LoadReport {
                gaps,
                refreshed: false,
                cached: false,
            });
        }
        self.set_phase(&run.run_id, RunPhase::Refreshing);

        let scenario_id = match gaps.as_slice() {
            [Gap::MissingScenarioMetric(id)] => Some(id.clone()),
            _ => None,
        };
        info!(run_id = %run.run_id, scenario_id = ?scenario_id, "Requesting metric recompute");

        let request = RefreshRequest {
            run_id: run.run_id.clone(),
            scenario_id,
        };
        let outcome = match self.backend.refresh_metrics(&run.project_id, request).await {
            Ok(()) => {
                self.scenario_batches
                    .invalidate(&scenario_scope(&run.project_id, &run.run_id));
                self.fetch(run, wanted).await
            }
            Err(e) => Err(e),
        };

        self.refreshing.lock().remove(&run.run_id);

        match outcome {
            Ok(fetched) => {
                let remaining = self
                    .install(run, epoch, wanted, fetched)
                    .map(|(gaps, _)| gaps)
                    .unwrap_or_default();
                Ok(LoadReport {
                    gaps: remaining,
                    refreshed: true,
                    cached: false,
                })
            }
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "Metric refresh failed; keeping cached data");
                self.set_phase(&run.run_id, RunPhase::Ready);
                Ok(LoadReport {
                    gaps,
                    refreshed: false,
                    cached: false,
                })
            }
        }
    }

    async fn fetch(&self, run: &RunRef, wanted: &BTreeSet<String>) -> EngineResult<Fetched> {
        let run_request = self
            .run_batches
            .submit(RUN_SCOPE, &scenario_scope(&run.project_id, &run.run_id));

        let scope = scenario_scope(&run.project_id, &run.run_id);
        let scenario_requests: Vec<_> = wanted
            .iter()
            .map(|id| {
                let request = self.scenario_batches.submit(&scope, id);
                let id = id.clone();
                async move { request.await.map(|records| (id, records.unwrap_or_default())) }
            })
            .collect();

        let (run_records, scenarios) = tokio::join!(run_request, try_join_all(scenario_requests));
        Ok(Fetched {
            run_records: run_records?.unwrap_or_default(),
            scenarios: scenarios?,
        })
    }

    /// Rebuild the run's cache from fetched records.
    ///
    /// Returns `None` when the run was invalidated while the fetch was in
    /// flight; the late result is dropped.
    fn install(
        &self,
        run: &RunRef,
        epoch: u64,
        wanted: &BTreeSet<String>,
        fetched: Fetched,
    ) -> Option<(Vec<Gap>, bool)> {
        let mut cache = RunCache::new(&run.project_id, epoch, self.merger);
        cache.covered = wanted.clone();
        for record in &fetched.run_records {
            cache.ingest(record, self.merger);
        }
        let mut owned = Vec::new();
        for (scenario_id, records) in &fetched.scenarios {
            cache
                .scenarios
                .entry(scenario_id.clone())
                .or_insert_with(|| ScenarioCache::new(self.merger));
            for record in records {
                cache.ingest(record, self.merger);
            }
            owned.push(scenario_id.clone());
        }
        cache.rebuild_raw();

        let gaps = cache.detect_gaps(fetched.run_records.len());
        let has_scenario_records = cache.has_scenario_records();
        cache.gaps = gaps.clone();
        cache.loaded_at = Some(Instant::now());
        cache.phase = if self.refreshing.lock().contains(&run.run_id) {
            RunPhase::Refreshing
        } else {
            RunPhase::Ready
        };

        let mut runs = self.runs.write();
        if runs.get(&run.run_id).map(|c| c.epoch) != Some(epoch) {
            debug!(run_id = %run.run_id, "Discarding result for invalidated run");
            return None;
        }
        {
            let mut owners = self.scenario_owner.write();
            for scenario_id in owned {
                owners.insert(scenario_id, run.run_id.clone());
            }
        }
        runs.insert(run.run_id.clone(), cache);
        Some((gaps, has_scenario_records))
    }

    fn record_failure(&self, run: &RunRef, epoch: u64, error: &EngineError) {
        let mut runs = self.runs.write();
        if let Some(cache) = runs.get_mut(&run.run_id).filter(|c| c.epoch == epoch) {
            if cache.has_data() {
                warn!(run_id = %run.run_id, error = %error, "Metric fetch failed; serving cached data");
                cache.phase = RunPhase::Ready;
            } else {
                warn!(run_id = %run.run_id, error = %error, "Metric fetch failed");
                cache.phase = RunPhase::Failed(error.clone());
            }
        }
    }

    fn set_phase(&self, run_id: &str, phase: RunPhase) {
        if let Some(cache) = self.runs.write().get_mut(run_id) {
            cache.phase = phase;
        }
    }

    /// Feed already-fetched records into the run's cache.
    ///
    /// Records of other runs are ignored. Returns how many records
    /// contributed; a record seen before contributes nothing.
    pub fn ingest_records(&self, run: &RunRef, records: &[MetricRecord]) -> usize {
        let mut runs = self.runs.write();
        let cache = runs
            .entry(run.run_id.clone())
            .or_insert_with(|| RunCache::new(&run.project_id, self.next_epoch(), self.merger));

        let mut owners = self.scenario_owner.write();
        let mut added = 0;
        for record in records.iter().filter(|r| r.run_id == run.run_id) {
            if let Some(scenario_id) = &record.scenario_id {
                owners.insert(scenario_id.clone(), run.run_id.clone());
            }
            if cache.ingest(record, self.merger) {
                added += 1;
            }
        }
        cache.rebuild_raw();
        if added > 0 && matches!(cache.phase, RunPhase::Idle | RunPhase::Loading) {
            cache.phase = RunPhase::Ready;
        }
        added
    }

    /// Resolve a scenario value against the current cache
    pub fn get_value(&self, scenario_id: &str, path: &str, query: &ValueQuery) -> Option<MetricValue> {
        let run_id = self.scenario_owner.read().get(scenario_id).cloned()?;
        let runs = self.runs.read();
        let scenario = runs.get(&run_id)?.scenarios.get(scenario_id)?;

        let path = path.trim();
        let step_key = query.step_key.as_deref();
        let request = MetricRequest {
            metric_key: query.metric_key.as_deref(),
            metric_path: Some(path).filter(|p| !p.is_empty()),
            step_key,
        };
        let flat = scenario.acc.flat();
        if let Some(stats) = resolve(flat, &build_candidates(&request)) {
            return Some(MetricValue::Stats(stats.clone()));
        }
        if let Some((_, stats)) = resolve_placeholder(flat, path, step_key) {
            return Some(MetricValue::Stats(stats.clone()));
        }

        let tree_path = if path.is_empty() {
            query.metric_key.as_deref()?
        } else {
            path
        };
        resolve_in_tree(&scenario.raw, tree_path, query.evaluator_key.as_deref())
            .cloned()
            .map(MetricValue::Raw)
    }

    /// Run-level stats; temporal runs prefer their latest snapshot
    pub fn get_run_level_stats(&self, run_id: &str, query: &StatsQuery) -> Option<BasicStats> {
        let runs = self.runs.read();
        let cache = runs.get(run_id)?;
        let from_static =
            || resolve(cache.run_level.flat(), &build_candidates(&query.request())).cloned();
        let from_temporal = || latest_in(&cache.temporal, query).map(|p| p.stats.clone());

        if cache.is_temporal() {
            from_temporal().or_else(from_static)
        } else {
            from_static().or_else(from_temporal)
        }
    }

    pub fn get_latest_temporal(&self, run_id: &str, query: &StatsQuery) -> Option<BasicStats> {
        let runs = self.runs.read();
        latest_in(&runs.get(run_id)?.temporal, query).map(|p| p.stats.clone())
    }

    /// Snapshot at or before `timestamp` (epoch ms); latest when `None`
    pub fn get_temporal_as_of(
        &self,
        run_id: &str,
        query: &StatsQuery,
        timestamp: Option<i64>,
    ) -> Option<BasicStats> {
        let runs = self.runs.read();
        let temporal = &runs.get(run_id)?.temporal;
        let key = temporal.find_key(query.metric_key.as_deref()?, query.step_key.as_deref())?;
        temporal.as_of(key, timestamp).map(|p| p.stats.clone())
    }

    /// Full series for a metric, ordered by timestamp
    pub fn temporal_series(&self, run_id: &str, query: &StatsQuery) -> Vec<TemporalPoint> {
        let runs = self.runs.read();
        let Some(cache) = runs.get(run_id) else {
            return Vec::new();
        };
        query
            .metric_key
            .as_deref()
            .and_then(|metric| cache.temporal.find_key(metric, query.step_key.as_deref()))
            .and_then(|key| cache.temporal.series(key))
            .map(<[TemporalPoint]>::to_vec)
            .unwrap_or_default()
    }

    /// Timestamped run-level records seen and no static aggregate
    pub fn is_temporal(&self, run_id: &str) -> bool {
        self.runs.read().get(run_id).map_or(false, RunCache::is_temporal)
    }

    pub fn phase(&self, run_id: &str) -> RunPhase {
        self.runs
            .read()
            .get(run_id)
            .map_or(RunPhase::Idle, |c| c.phase.clone())
    }

    pub fn value_state(
        &self,
        scenario_id: &str,
        path: &str,
        query: &ValueQuery,
    ) -> MetricState<MetricValue> {
        let owner = self.scenario_owner.read().get(scenario_id).cloned();
        let phase = owner.map_or(RunPhase::Idle, |run_id| self.phase(&run_id));
        self.state_for(phase, || self.get_value(scenario_id, path, query))
    }

    pub fn run_stats_state(&self, run_id: &str, query: &StatsQuery) -> MetricState<BasicStats> {
        self.state_for(self.phase(run_id), || self.get_run_level_stats(run_id, query))
    }

    fn state_for<T>(&self, phase: RunPhase, read: impl FnOnce() -> Option<T>) -> MetricState<T> {
        match phase {
            RunPhase::Idle | RunPhase::Loading => MetricState::Loading,
            RunPhase::Failed(e) => MetricState::Error(e.to_string()),
            RunPhase::Ready | RunPhase::Refreshing => MetricState::Ready(read()),
        }
    }

    /// Drop a run's cache; in-flight results for it are discarded
    pub fn invalidate(&self, run_id: &str) {
        let removed = self.runs.write().remove(run_id);
        self.scenario_owner.write().retain(|_, owner| owner != run_id);
        if let Some(cache) = removed {
            self.scenario_batches
                .invalidate(&scenario_scope(&cache.project_id, run_id));
        }
        debug!(run_id, "Invalidated run metrics");
    }

    /// Drop one scenario; the next load of its run re-fetches it
    pub fn invalidate_scenario(&self, scenario_id: &str) {
        let Some(run_id) = self.scenario_owner.write().remove(scenario_id) else {
            return;
        };
        let mut runs = self.runs.write();
        if let Some(cache) = runs.get_mut(&run_id) {
            cache.scenarios.remove(scenario_id);
            cache.loaded_at = None;
            self.scenario_batches
                .invalidate(&scenario_scope(&cache.project_id, &run_id));
        }
        debug!(scenario_id, run_id = %run_id, "Invalidated scenario metrics");
    }

    /// Record a local write; gaps for this run are tolerated for the TTL
    pub fn mark_saved(&self, run_id: &str) {
        self.recently_saved.mark(run_id);
    }

    pub fn recently_saved(&self, run_id: &str) -> bool {
        self.recently_saved.contains(run_id)
    }

    pub fn coalescer_stats(&self) -> (CoalescerStats, CoalescerStats) {
        (self.run_batches.stats(), self.scenario_batches.stats())
    }
}

fn latest_in<'t>(temporal: &'t TemporalSeriesIndex, query: &StatsQuery) -> Option<&'t TemporalPoint> {
    let key = temporal.find_key(query.metric_key.as_deref()?, query.step_key.as_deref())?;
    temporal.latest(key)
}
