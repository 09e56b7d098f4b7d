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

//! Time series of run-level statistics for live evaluations

use crate::keys::canonicalize;
use crate::record::{MetricRecord, RecordScope};
use crate::stats::BasicStats;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One snapshot in a series; never mutated after insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalPoint {
    /// Epoch milliseconds
    pub timestamp: i64,
    pub stats: BasicStats,
}

/// Series key: `"stepKey:canonicalMetricKey"`
pub fn series_key(step_key: &str, metric_key: &str) -> String {
    format!("{}:{}", step_key, canonicalize(metric_key))
}

/// Per-run index of `series key -> points ordered by timestamp`
#[derive(Debug, Clone, Default)]
pub struct TemporalSeriesIndex {
    series: BTreeMap<String, Vec<TemporalPoint>>,
    contributed: HashSet<String>,
}

impl TemporalSeriesIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every leaf of a timestamped run-level record.
    ///
    /// Returns `false` for scenario records, untimestamped records and
    /// records that were already indexed.
    pub fn ingest(&mut self, record: &MetricRecord) -> bool {
        let timestamp = match (record.scope(), record.timestamp) {
            (RecordScope::Run, Some(ts)) => ts,
            _ => return false,
        };
        if !self.contributed.insert(record.fingerprint()) {
            return false;
        }

        let mut added = HashSet::new();
        for (step, metrics) in &record.data {
            for (metric, leaf) in metrics {
                let key = series_key(step, metric);
                if !added.insert(key.clone()) {
                    continue;
                }
                if let Some(stats) = leaf.to_stats() {
                    self.insert(key, TemporalPoint { timestamp, stats });
                }
            }
        }
        true
    }

    /// Insert keeping timestamp order; equal timestamps keep arrival order
    pub fn insert(&mut self, key: String, point: TemporalPoint) {
        let points = self.series.entry(key).or_default();
        let at = points.partition_point(|p| p.timestamp <= point.timestamp);
        points.insert(at, point);
    }

    pub fn latest(&self, key: &str) -> Option<&TemporalPoint> {
        self.series.get(key)?.last()
    }

    /// Last point at or before `timestamp`.
    ///
    /// Falls back to the first point when every point is later, and to the
    /// latest point when no timestamp is given. Only an empty or unknown
    /// series yields `None`.
    pub fn as_of(&self, key: &str, timestamp: Option<i64>) -> Option<&TemporalPoint> {
        let points = self.series.get(key)?;
        let target = match timestamp {
            Some(ts) => ts,
            None => return points.last(),
        };
        let at = points.partition_point(|p| p.timestamp <= target);
        if at == 0 {
            points.first()
        } else {
            points.get(at - 1)
        }
    }

    pub fn series(&self, key: &str) -> Option<&[TemporalPoint]> {
        self.series.get(key).map(Vec::as_slice)
    }

    /// Find the series for a metric, optionally scoped to a step.
    ///
    /// Without a step the first series (in key order) whose metric part
    /// matches is returned.
    pub fn find_key(&self, metric_key: &str, step_key: Option<&str>) -> Option<&str> {
        let canonical = canonicalize(metric_key);
        match step_key {
            Some(step) => {
                let key = format!("{step}:{canonical}");
                self.series.get_key_value(&key).map(|(k, _)| k.as_str())
            }
            None => self
                .series
                .keys()
                .find(|k| k.split_once(':').map_or(false, |(_, m)| m == canonical))
                .map(String::as_str),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.series.keys()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(timestamp: i64, mean: f64) -> TemporalPoint {
        TemporalPoint {
            timestamp,
            stats: BasicStats {
                mean: Some(mean),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_as_of_boundaries() {
        let mut index = TemporalSeriesIndex::new();
        index.insert("judge:score".into(), point(20, 2.0));
        index.insert("judge:score".into(), point(10, 1.0));

        let mean = |p: Option<&TemporalPoint>| p.and_then(|p| p.stats.mean);
        assert_eq!(mean(index.as_of("judge:score", Some(15))), Some(1.0));
        assert_eq!(mean(index.as_of("judge:score", Some(5))), Some(1.0));
        assert_eq!(mean(index.as_of("judge:score", Some(25))), Some(2.0));
        assert_eq!(mean(index.as_of("judge:score", None)), Some(2.0));
        assert_eq!(mean(index.latest("judge:score")), Some(2.0));
        assert!(index.as_of("missing", Some(1)).is_none());
    }

    #[test]
    fn test_ingest_only_timestamped_run_records() {
        let mut index = TemporalSeriesIndex::new();
        let scenario = MetricRecord::normalize(&json!({
            "runId": "r", "scenarioId": "s", "timestamp": 1_700_000_000_000i64,
            "data": {"judge": {"score": 1}}
        }))
        .unwrap();
        let static_run = MetricRecord::normalize(&json!({
            "runId": "r", "data": {"judge": {"score": 1}}
        }))
        .unwrap();
        let live = MetricRecord::normalize(&json!({
            "runId": "r", "timestamp": 1_700_000_000_000i64,
            "data": {"invocation": {"costs.total": {"sum": 2.0, "count": 4}}}
        }))
        .unwrap();

        assert!(!index.ingest(&scenario));
        assert!(!index.ingest(&static_run));
        assert!(index.ingest(&live));
        assert!(!index.ingest(&live));

        assert_eq!(index.find_key("cost", Some("invocation")), Some("invocation:totalCost"));
        assert_eq!(index.find_key("totalCost", None), Some("invocation:totalCost"));
        assert_eq!(index.series("invocation:totalCost").unwrap().len(), 1);
    }
}
