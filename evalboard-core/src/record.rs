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

//! Metric records and boundary normalization
//!
//! Backends return records in several shapes: snake_case or camelCase field
//! names, epoch or RFC 3339 timestamps, nested (`{step: {metric: stats}}`) or
//! flattened (`{"step.metric": stats}`) data. [`MetricRecord::normalize`]
//! turns every accepted shape into one canonical record before any merge or
//! lookup logic runs.

use crate::error::{CoreError, Result};
use crate::stats::BasicStats;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Step key used for leaves reported without a step
pub const DEFAULT_STEP: &str = "_";

/// A single metric leaf: structured stats or a raw scalar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricLeaf {
    Stats(BasicStats),
    Scalar(Value),
}

impl MetricLeaf {
    /// Stats view; scalars are converted to single-observation stats
    pub fn to_stats(&self) -> Option<BasicStats> {
        match self {
            MetricLeaf::Stats(stats) => Some(stats.clone()),
            MetricLeaf::Scalar(value) => BasicStats::from_scalar(value),
        }
    }
}

/// Metric leaves of one step, keyed by dot-joined metric path
pub type StepMetrics = BTreeMap<String, MetricLeaf>;

/// Whether a record belongs to a scenario or to the run as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordScope {
    Scenario,
    Run,
}

/// One normalized unit fetched from the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Backend identifier, when the backend provides one
    pub id: Option<String>,
    pub run_id: String,
    pub scenario_id: Option<String>,
    /// Epoch milliseconds; present for temporal entries
    pub timestamp: Option<i64>,
    /// step key -> metric path -> leaf
    pub data: BTreeMap<String, StepMetrics>,
}

impl MetricRecord {
    pub fn scope(&self) -> RecordScope {
        if self.scenario_id.is_some() {
            RecordScope::Scenario
        } else {
            RecordScope::Run
        }
    }

    pub fn is_temporal(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Deterministic identity used to avoid merging the same record twice
    pub fn fingerprint(&self) -> String {
        if let Some(id) = &self.id {
            return format!("id:{id}");
        }
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(blake3::hash(&canonical).as_bytes())
    }

    /// Normalize one backend record
    pub fn normalize(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| CoreError::InvalidRecord("record is not an object".into()))?;

        let run_id = string_field(object, &["run_id", "runId"])
            .ok_or_else(|| CoreError::InvalidRecord("missing run id".into()))?;
        let scenario_id = string_field(object, &["scenario_id", "scenarioId"]);
        let id = string_field(object, &["id", "metric_id", "metricId"]);

        let timestamp = match first_field(object, &["timestamp", "ts", "created_at", "createdAt"]) {
            Some(raw) => parse_timestamp(raw)?,
            None => None,
        };

        let data = match object.get("data") {
            Some(Value::Object(map)) => normalize_data(map),
            Some(Value::Null) | None => BTreeMap::new(),
            Some(_) => return Err(CoreError::InvalidRecord("data is not an object".into())),
        };

        Ok(Self {
            id,
            run_id,
            scenario_id,
            timestamp,
            data,
        })
    }

    /// Normalize a batch, skipping (and logging) records that do not parse
    pub fn normalize_all<'a>(values: impl IntoIterator<Item = &'a Value>) -> Vec<Self> {
        values
            .into_iter()
            .filter_map(|value| match Self::normalize(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed metric record");
                    None
                }
            })
            .collect()
    }
}

fn first_field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| object.get(*name))
        .find(|value| !value.is_null())
}

fn string_field(object: &Map<String, Value>, names: &[&str]) -> Option<String> {
    match first_field(object, names)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Epoch milliseconds (or seconds, when small) or an RFC 3339 string
pub fn parse_timestamp(value: &Value) -> Result<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            let raw = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| CoreError::InvalidTimestamp(n.to_string()))?;
            // Ten digits or fewer is a seconds value
            Ok(Some(if raw.abs() < 10_000_000_000 { raw * 1000 } else { raw }))
        }
        Value::String(s) => {
            if let Ok(raw) = s.parse::<i64>() {
                return parse_timestamp(&Value::from(raw));
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| Some(dt.timestamp_millis()))
                .map_err(|_| CoreError::InvalidTimestamp(s.clone()))
        }
        other => Err(CoreError::InvalidTimestamp(other.to_string())),
    }
}

fn normalize_data(map: &Map<String, Value>) -> BTreeMap<String, StepMetrics> {
    let mut data: BTreeMap<String, StepMetrics> = BTreeMap::new();

    for (key, value) in map {
        match value {
            Value::Object(inner) if !BasicStats::is_stats_object(inner) => {
                let metrics = data.entry(key.clone()).or_default();
                collect_leaves(inner, "", metrics);
            }
            leaf => {
                // Flattened form: "step.metric.path" -> leaf
                let (step, metric) = match key.split_once('.') {
                    Some((step, metric)) => (step.to_string(), metric.to_string()),
                    None => (DEFAULT_STEP.to_string(), key.clone()),
                };
                if let Some(leaf) = to_leaf(leaf) {
                    data.entry(step).or_default().insert(metric, leaf);
                }
            }
        }
    }

    data.retain(|_, metrics| !metrics.is_empty());
    data
}

fn collect_leaves(map: &Map<String, Value>, prefix: &str, out: &mut StepMetrics) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) if !BasicStats::is_stats_object(inner) => {
                collect_leaves(inner, &path, out);
            }
            leaf => {
                if let Some(leaf) = to_leaf(leaf) {
                    out.insert(path, leaf);
                }
            }
        }
    }
}

fn to_leaf(value: &Value) -> Option<MetricLeaf> {
    match value {
        Value::Object(_) => serde_json::from_value::<BasicStats>(value.clone())
            .ok()
            .map(MetricLeaf::Stats),
        Value::Number(_) | Value::Bool(_) | Value::String(_) => {
            Some(MetricLeaf::Scalar(value.clone()))
        }
        _ => None,
    }
}
