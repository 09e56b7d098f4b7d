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

//! MetricStore behaviour against a scripted in-memory backend

use async_trait::async_trait;
use evalboard_core::{EngineConfig, MetricRecord, RunStatus};
use evalboard_engine::{
    EngineError, EngineResult, EvalEngine, Gap, LoadReport, MetricState, MetricValue, MetricsBackend,
    MetricsQuery, MetricsResponse, RawTestcase, RefreshRequest, RunPhase, RunRef, StatsQuery,
    TestcasesResponse, ValueQuery,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct ScriptedBackend {
    records: Mutex<Vec<Value>>,
    /// Records that appear once a recompute is requested
    after_refresh: Mutex<Vec<Value>>,
    failing_projects: Mutex<HashSet<String>>,
    testcases: Mutex<Vec<RawTestcase>>,
    queries: AtomicUsize,
    testcase_queries: AtomicUsize,
    refreshes: Mutex<Vec<RefreshRequest>>,
}

impl ScriptedBackend {
    fn with_records(records: Vec<Value>) -> Arc<Self> {
        let backend = Self::default();
        *backend.records.lock() = records;
        Arc::new(backend)
    }

    fn refresh_count(&self) -> usize {
        self.refreshes.lock().len()
    }
}

#[async_trait]
impl MetricsBackend for ScriptedBackend {
    async fn query_metrics(
        &self,
        project_id: &str,
        query: MetricsQuery,
    ) -> EngineResult<MetricsResponse> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing_projects.lock().contains(project_id) {
            return Err(EngineError::transport("connection refused"));
        }

        let records = self.records.lock();
        let metrics = records
            .iter()
            .filter(|r| {
                let scenario = r["scenario_id"].as_str();
                match (&query.scenario_ids, &query.run_ids) {
                    (Some(ids), _) => scenario.map_or(false, |s| ids.iter().any(|id| id == s)),
                    (None, Some(ids)) => {
                        scenario.is_none()
                            && ids.iter().any(|id| Some(id.as_str()) == r["run_id"].as_str())
                    }
                    (None, None) => false,
                }
            })
            .cloned()
            .collect();
        Ok(MetricsResponse { metrics })
    }

    async fn refresh_metrics(&self, _project_id: &str, request: RefreshRequest) -> EngineResult<()> {
        self.refreshes.lock().push(request);
        let recomputed: Vec<Value> = self.after_refresh.lock().drain(..).collect();
        self.records.lock().extend(recomputed);
        Ok(())
    }

    async fn query_testcases(
        &self,
        _project_id: &str,
        testcase_ids: Vec<String>,
    ) -> EngineResult<TestcasesResponse> {
        self.testcase_queries.fetch_add(1, Ordering::SeqCst);
        let testcases = self
            .testcases
            .lock()
            .iter()
            .filter(|tc| testcase_ids.contains(&tc.id))
            .cloned()
            .collect();
        Ok(TestcasesResponse { testcases })
    }
}

fn engine(backend: &Arc<ScriptedBackend>) -> EvalEngine {
    engine_with(backend, EngineConfig::default())
}

fn engine_with(backend: &Arc<ScriptedBackend>, config: EngineConfig) -> EvalEngine {
    let backend: Arc<dyn MetricsBackend> = backend.clone();
    EvalEngine::with_backend(backend, &config)
}

fn scenario_record(run: &str, scenario: &str, data: Value) -> Value {
    json!({"run_id": run, "scenario_id": scenario, "data": data})
}

fn run_record(run: &str, data: Value) -> Value {
    json!({"run_id": run, "data": data})
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_running_run_with_gap_never_refreshes() {
    let backend = ScriptedBackend::with_records(vec![scenario_record(
        "run-1",
        "s1",
        json!({"judge": {"score": 0.5}}),
    )]);
    let engine = engine(&backend);

    let run = RunRef::new("p1", "run-1", RunStatus::Running);
    let report = engine.store.load_run(&run, &ids(&["s1", "s2"])).await.unwrap();

    assert!(report.gaps.contains(&Gap::MissingRunLevelEntry));
    assert!(report.gaps.contains(&Gap::MissingScenarioMetric("s2".to_string())));
    assert!(!report.refreshed);
    assert_eq!(backend.refresh_count(), 0);
    assert!(matches!(engine.store.phase("run-1"), RunPhase::Ready));
}

#[tokio::test]
async fn test_completed_run_with_gap_refreshes_once() {
    let backend = ScriptedBackend::with_records(vec![scenario_record(
        "run-1",
        "s1",
        json!({"judge": {"score": 0.5}}),
    )]);
    backend
        .after_refresh
        .lock()
        .push(run_record("run-1", json!({"invocation": {"costs.total": {"count": 4, "sum": 2.0}}})));
    let engine = engine(&backend);

    let run = RunRef::new("p1", "run-1", RunStatus::Completed);
    let report = engine.store.load_run(&run, &ids(&["s1"])).await.unwrap();

    assert!(report.refreshed);
    assert!(report.gaps.is_empty());
    assert_eq!(backend.refresh_count(), 1);
    assert_eq!(backend.refreshes.lock()[0].scenario_id, None);

    let cost = engine
        .store
        .get_run_level_stats("run-1", &StatsQuery::metric("totalCost").with_step("invocation"))
        .unwrap();
    assert_eq!(cost.count, Some(4.0));
    assert_eq!(cost.sum, Some(2.0));
}

#[tokio::test]
async fn test_persisting_gap_does_not_loop() {
    let backend = ScriptedBackend::with_records(vec![run_record(
        "run-1",
        json!({"invocation": {"duration": 1.0}}),
    )]);
    let engine = engine(&backend);

    let run = RunRef::new("p1", "run-1", RunStatus::Failed);
    let report = engine.store.load_run(&run, &ids(&["s9"])).await.unwrap();

    assert_eq!(backend.refresh_count(), 1);
    assert_eq!(
        backend.refreshes.lock()[0].scenario_id.as_deref(),
        Some("s9")
    );
    assert!(report.refreshed);
    assert_eq!(report.gaps, vec![Gap::MissingScenarioMetric("s9".to_string())]);
}

#[tokio::test]
async fn test_pending_run_refreshes_only_with_scenario_records() {
    let backend = ScriptedBackend::with_records(vec![scenario_record(
        "run-1",
        "s1",
        json!({"judge": {"score": 1}}),
    )]);
    let engine = engine(&backend);

    let with_records = RunRef::new("p1", "run-1", RunStatus::Pending);
    engine.store.load_run(&with_records, &ids(&["s1"])).await.unwrap();
    assert_eq!(backend.refresh_count(), 1);

    let without_records = RunRef::new("p1", "run-2", RunStatus::Paused);
    engine.store.load_run(&without_records, &ids(&["s5"])).await.unwrap();
    assert_eq!(backend.refresh_count(), 1);
}

#[tokio::test]
async fn test_recent_save_suppresses_refresh() {
    let backend = ScriptedBackend::with_records(vec![]);
    let engine = engine(&backend);

    engine.store.mark_saved("run-1");
    let run = RunRef::new("p1", "run-1", RunStatus::Completed);
    let report = engine.store.load_run(&run, &ids(&["s1"])).await.unwrap();

    assert!(!report.gaps.is_empty());
    assert!(!report.refreshed);
    assert_eq!(backend.refresh_count(), 0);
}

#[tokio::test]
async fn test_same_record_ingested_twice_counts_once() {
    let backend = ScriptedBackend::with_records(vec![]);
    let engine = engine(&backend);
    let run = RunRef::new("p1", "run-1", RunStatus::Completed);

    let record = MetricRecord::normalize(&scenario_record(
        "run-1",
        "s1",
        json!({"judge": {"score": {"count": 3, "mean": 0.5}}}),
    ))
    .unwrap();

    assert_eq!(engine.store.ingest_records(&run, &[record.clone()]), 1);
    assert_eq!(engine.store.ingest_records(&run, &[record]), 0);

    let query = ValueQuery {
        step_key: Some("judge".to_string()),
        ..Default::default()
    };
    match engine.store.get_value("s1", "score", &query) {
        Some(MetricValue::Stats(stats)) => {
            assert_eq!(stats.count, Some(3.0));
            assert_eq!(stats.mean, Some(0.5));
        }
        other => panic!("unexpected value: {other:?}"),
    }
}

#[tokio::test]
async fn test_raw_tree_reflects_every_ingested_record() {
    let backend = ScriptedBackend::with_records(vec![]);
    let engine = engine(&backend);
    let run = RunRef::new("p1", "run-1", RunStatus::Completed);

    let records = MetricRecord::normalize_all(&[
        scenario_record("run-1", "s1", json!({"judge": {"score": 1.0}})),
        scenario_record("run-1", "s1", json!({"judge": {"verdict": "pass"}})),
    ]);
    assert_eq!(engine.store.ingest_records(&run, &records), 2);

    let late = MetricRecord::normalize_all(&[scenario_record(
        "run-1",
        "s1",
        json!({"judge": {"notes": "checked"}}),
    )]);
    assert_eq!(engine.store.ingest_records(&run, &late), 1);

    match engine.store.get_value("s1", "judge", &ValueQuery::default()) {
        Some(MetricValue::Raw(node)) => {
            assert_eq!(node["score"], json!(1.0));
            assert_eq!(node["verdict"], json!("pass"));
            assert_eq!(node["notes"], json!("checked"));
        }
        other => panic!("unexpected value: {other:?}"),
    }
}

#[tokio::test]
async fn test_repeated_loads_do_not_double_count() {
    let backend = ScriptedBackend::with_records(vec![
        run_record("run-1", json!({"invocation": {"tokens.total": {"count": 2, "sum": 100}}})),
        scenario_record("run-1", "s1", json!({"judge": {"score": {"count": 1, "mean": 1.0}}})),
        // Same scenario record delivered twice in one response
        scenario_record("run-1", "s1", json!({"judge": {"score": {"count": 1, "mean": 1.0}}})),
    ]);
    let config = EngineConfig {
        stats_freshness_secs: 0,
        ..Default::default()
    };
    let engine = engine_with(&backend, config);
    let run = RunRef::new("p1", "run-1", RunStatus::Completed);

    for _ in 0..2 {
        engine.store.load_run(&run, &ids(&["s1"])).await.unwrap();
    }
    assert_eq!(backend.queries.load(Ordering::SeqCst), 4);

    let tokens = engine
        .store
        .get_run_level_stats("run-1", &StatsQuery::metric("totalTokens"))
        .unwrap();
    assert_eq!(tokens.count, Some(2.0));
    assert_eq!(tokens.sum, Some(100.0));

    let query = ValueQuery {
        metric_key: Some("score".to_string()),
        step_key: Some("judge".to_string()),
        ..Default::default()
    };
    match engine.store.get_value("s1", "", &query) {
        Some(MetricValue::Stats(stats)) => assert_eq!(stats.count, Some(1.0)),
        other => panic!("unexpected value: {other:?}"),
    }
}

#[tokio::test]
async fn test_fresh_cache_is_served_without_fetch() {
    let backend = ScriptedBackend::with_records(vec![
        run_record("run-1", json!({"invocation": {"duration": 2.0}})),
        scenario_record("run-1", "s1", json!({"judge": {"score": 1}})),
    ]);
    let engine = engine(&backend);
    let run = RunRef::new("p1", "run-1", RunStatus::Completed);

    let first = engine.store.load_run(&run, &ids(&["s1"])).await.unwrap();
    let second = engine.store.load_run(&run, &ids(&["s1"])).await.unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(backend.queries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_loads_share_batches() {
    let backend = ScriptedBackend::with_records(vec![
        run_record("run-1", json!({"invocation": {"duration": 2.0}})),
        scenario_record("run-1", "s1", json!({"judge": {"score": 1}})),
    ]);
    let engine = engine(&backend);
    let run = RunRef::new("p1", "run-1", RunStatus::Completed);
    let scenarios = ids(&["s1"]);

    let (a, b) = tokio::join!(
        engine.store.load_run(&run, &scenarios),
        engine.store.load_run(&run, &scenarios),
    );
    a.unwrap();
    b.unwrap();

    // One run-level query and one scenario query
    assert_eq!(backend.queries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_step_scoped_values_do_not_cross_evaluators() {
    let backend = ScriptedBackend::with_records(vec![
        run_record("run-1", json!({"invocation": {"duration": 2.0}})),
        scenario_record(
            "run-1",
            "s1",
            json!({"evalA": {"score": 0.25, "outputs": {"label": "good"}}, "evalB": {"score": 0.75}}),
        ),
        scenario_record(
            "run-1",
            "s2",
            json!({"evalA": {"score": 0.25}, "evalB": {"other": 1.0}}),
        ),
    ]);
    let engine = engine(&backend);
    let run = RunRef::new("p1", "run-1", RunStatus::Completed);
    engine.store.load_run(&run, &ids(&["s1", "s2"])).await.unwrap();

    for (step, expected) in [("evalA", 0.25), ("evalB", 0.75)] {
        let query = ValueQuery {
            step_key: Some(step.to_string()),
            ..Default::default()
        };
        match engine.store.get_value("s1", "score", &query) {
            Some(MetricValue::Stats(stats)) => assert_eq!(stats.mean, Some(expected)),
            other => panic!("unexpected value for {step}: {other:?}"),
        }
    }

    let query = ValueQuery {
        step_key: Some("evalA".to_string()),
        ..Default::default()
    };
    match engine.store.get_value("s1", "outputs", &query) {
        Some(MetricValue::Stats(stats)) => {
            assert_eq!(stats.frequency[0].value, json!("good"));
        }
        other => panic!("placeholder did not resolve: {other:?}"),
    }

    assert_eq!(engine.store.get_value("s1", "missing", &ValueQuery::default()), None);

    // evalB never emitted a score in s2; evalA's must not leak through
    let scoped = |step: &str| ValueQuery {
        step_key: Some(step.to_string()),
        ..Default::default()
    };
    assert_eq!(engine.store.get_value("s2", "score", &scoped("evalB")), None);
    match engine.store.get_value("s2", "score", &scoped("evalA")) {
        Some(MetricValue::Stats(stats)) => assert_eq!(stats.mean, Some(0.25)),
        other => panic!("unexpected value for evalA: {other:?}"),
    }
}

#[tokio::test]
async fn test_temporal_run_prefers_latest_snapshot() {
    let base = 1_700_000_000_000_i64;
    let backend = ScriptedBackend::with_records(vec![
        json!({"run_id": "run-1", "timestamp": base + 10_000, "data": {"invocation": {"duration": {"count": 1, "mean": 1.0}}}}),
        json!({"run_id": "run-1", "timestamp": base + 20_000, "data": {"invocation": {"duration": {"count": 2, "mean": 2.0}}}}),
    ]);
    let engine = engine(&backend);
    let run = RunRef::new("p1", "run-1", RunStatus::Running);
    engine.store.load_run(&run, &[]).await.unwrap();

    assert!(engine.store.is_temporal("run-1"));
    let query = StatsQuery::metric("latency").with_step("invocation");

    let latest = engine.store.get_run_level_stats("run-1", &query).unwrap();
    assert_eq!(latest.mean, Some(2.0));

    let as_of = |ts| engine.store.get_temporal_as_of("run-1", &query, ts).unwrap().mean;
    assert_eq!(as_of(Some(base + 15_000)), Some(1.0));
    assert_eq!(as_of(Some(base + 5_000)), Some(1.0));
    assert_eq!(as_of(Some(base + 25_000)), Some(2.0));
    assert_eq!(as_of(None), Some(2.0));

    assert_eq!(engine.store.temporal_series("run-1", &query).len(), 2);
}

#[tokio::test]
async fn test_transport_failure_is_isolated_per_run() {
    let backend = ScriptedBackend::with_records(vec![run_record(
        "run-ok",
        json!({"invocation": {"duration": 3.0}}),
    )]);
    backend.failing_projects.lock().insert("broken".to_string());
    let engine = engine(&backend);

    let ok = RunRef::new("healthy", "run-ok", RunStatus::Completed);
    let broken = RunRef::new("broken", "run-bad", RunStatus::Completed);

    let (ok_result, broken_result) = tokio::join!(
        engine.store.load_run(&ok, &[]),
        engine.store.load_run(&broken, &[]),
    );

    assert!(ok_result.is_ok());
    assert!(matches!(broken_result, Err(EngineError::Transport(_))));

    let query = StatsQuery::metric("duration");
    assert!(matches!(
        engine.store.run_stats_state("run-bad", &query),
        MetricState::Error(_)
    ));
    match engine.store.run_stats_state("run-ok", &query) {
        MetricState::Ready(Some(stats)) => assert_eq!(stats.mean, Some(3.0)),
        other => panic!("unexpected state: {other:?}"),
    }
}

#[tokio::test]
async fn test_states_before_and_after_load() {
    let backend = ScriptedBackend::with_records(vec![run_record(
        "run-1",
        json!({"invocation": {"duration": 3.0}}),
    )]);
    let engine = engine(&backend);
    let query = StatsQuery::metric("duration");

    assert!(engine.store.run_stats_state("run-1", &query).is_loading());

    let run = RunRef::new("p1", "run-1", RunStatus::Completed);
    engine.store.load_run(&run, &[]).await.unwrap();

    assert_eq!(
        engine
            .store
            .run_stats_state("run-1", &StatsQuery::metric("nonexistent")),
        MetricState::Ready(None)
    );
}

#[tokio::test]
async fn test_invalidate_forces_new_fetch() {
    let backend = ScriptedBackend::with_records(vec![
        run_record("run-1", json!({"invocation": {"duration": 3.0}})),
        scenario_record("run-1", "s1", json!({"judge": {"score": 1}})),
    ]);
    let engine = engine(&backend);
    let run = RunRef::new("p1", "run-1", RunStatus::Completed);

    engine.store.load_run(&run, &ids(&["s1"])).await.unwrap();
    assert_eq!(backend.queries.load(Ordering::SeqCst), 2);

    engine.store.invalidate("run-1");
    assert!(matches!(engine.store.phase("run-1"), RunPhase::Idle));
    assert!(engine.store.get_value("s1", "score", &ValueQuery::default()).is_none());

    engine.store.load_run(&run, &ids(&["s1"])).await.unwrap();
    assert_eq!(backend.queries.load(Ordering::SeqCst), 4);

    engine.store.invalidate_scenario("s1");
    let report = engine.store.load_run(&run, &[]).await.unwrap();
    assert!(!report.cached);
    assert!(engine.store.get_value("s1", "score", &ValueQuery::default()).is_some());
}

#[tokio::test]
async fn test_invalidate_discards_in_flight_load() {
    let backend = ScriptedBackend::with_records(vec![
        run_record("run-1", json!({"invocation": {"duration": 3.0}})),
        scenario_record("run-1", "s1", json!({"judge": {"score": 1}})),
    ]);
    let config = EngineConfig {
        batch_window_ms: 50,
        ..Default::default()
    };
    let engine = engine_with(&backend, config);
    let run = RunRef::new("p1", "run-1", RunStatus::Completed);

    let ids = ids(&["s1"]);
    let (report, _) = tokio::join!(engine.store.load_run(&run, &ids), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.store.invalidate("run-1");
    });

    assert_eq!(report.unwrap(), LoadReport::default());
    assert!(matches!(engine.store.phase("run-1"), RunPhase::Idle));
    assert!(engine.store.get_value("s1", "score", &ValueQuery::default()).is_none());
}

#[tokio::test]
async fn test_settled_loads_leave_no_batch_scopes() {
    let backend = ScriptedBackend::with_records(vec![
        run_record("run-1", json!({"invocation": {"duration": 3.0}})),
        scenario_record("run-1", "s1", json!({"judge": {"score": 1}})),
        run_record("run-2", json!({"invocation": {"duration": 4.0}})),
        scenario_record("run-2", "s2", json!({"judge": {"score": 0}})),
    ]);
    let engine = engine(&backend);

    for (run_id, scenario) in [("run-1", "s1"), ("run-2", "s2")] {
        let run = RunRef::new("p1", run_id, RunStatus::Completed);
        engine.store.load_run(&run, &ids(&[scenario])).await.unwrap();
    }

    let (runs, scenarios) = engine.store.coalescer_stats();
    assert_eq!(runs.batches, 2);
    assert_eq!(runs.scopes, 0);
    assert_eq!(scenarios.scopes, 0);
}

#[tokio::test]
async fn test_testcases_are_batched_and_cached() {
    let backend = ScriptedBackend::with_records(vec![]);
    *backend.testcases.lock() = vec![
        RawTestcase {
            id: "tc-1".to_string(),
            testset_id: Some("ts".to_string()),
            data: json!({"input": "hello"}),
        },
        RawTestcase {
            id: "tc-2".to_string(),
            testset_id: None,
            data: json!({"input": "world"}),
        },
    ];
    let engine = engine(&backend);

    let resolved = engine
        .testcases
        .resolve_many("p1", &ids(&["tc-1", "tc-2", "tc-404"]))
        .await
        .unwrap();
    assert_eq!(resolved[0].as_ref().map(|t| t.id.as_str()), Some("tc-1"));
    assert_eq!(resolved[1].as_ref().map(|t| t.id.as_str()), Some("tc-2"));
    assert!(resolved[2].is_none());
    assert_eq!(backend.testcase_queries.load(Ordering::SeqCst), 1);

    engine.testcases.resolve("p1", "tc-1").await.unwrap();
    assert_eq!(backend.testcase_queries.load(Ordering::SeqCst), 1);
    assert_eq!(engine.testcases.cached(), 2);
}
