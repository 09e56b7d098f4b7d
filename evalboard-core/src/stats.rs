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

//! Basic statistics model
//!
//! A [`BasicStats`] is the atomic statistical summary the backend reports for
//! one metric. It carries up to three families of fields:
//!
//! - **Numeric**: `count`, `sum`, `mean`, `min`, `max`, `range`
//! - **Categorical**: `frequency`, `unique`, `rank`
//! - **Distribution**: `distribution` buckets and `binSize`
//!
//! Instances are treated as immutable values: merging always builds a new one
//! (see [`crate::merge`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Maximum number of categorical or distribution entries kept after a merge
pub const MAX_CATEGORY_ENTRIES: usize = 20;

/// Field names that mark a JSON object as a stats leaf rather than a subtree
const STATS_FIELDS: &[&str] = &[
    "count",
    "sum",
    "mean",
    "min",
    "max",
    "range",
    "frequency",
    "unique",
    "rank",
    "distribution",
    "binSize",
    "bin_size",
];

/// One `{value, count}` entry of a categorical list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub value: Value,
    #[serde(default)]
    pub count: f64,
}

impl CategoryCount {
    pub fn new(value: impl Into<Value>, count: f64) -> Self {
        Self {
            value: value.into(),
            count,
        }
    }
}

/// One histogram bucket; `value` is the bucket start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub value: f64,
    #[serde(default)]
    pub count: f64,
}

/// Statistical summary of one metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frequency: Vec<CategoryCount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rank: Vec<CategoryCount>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distribution: Vec<Bucket>,
    #[serde(default, alias = "bin_size", skip_serializing_if = "Option::is_none")]
    pub bin_size: Option<f64>,
}

impl BasicStats {
    /// Numeric summary of a single observation
    pub fn from_number(value: f64) -> Self {
        Self {
            count: Some(1.0),
            sum: Some(value),
            mean: Some(value),
            min: Some(value),
            max: Some(value),
            range: Some(0.0),
            ..Default::default()
        }
    }

    /// Categorical summary of a single observation
    pub fn from_category(value: Value) -> Self {
        Self {
            count: Some(1.0),
            frequency: vec![CategoryCount::new(value.clone(), 1.0)],
            unique: vec![value.clone()],
            rank: vec![CategoryCount::new(value, 1.0)],
            ..Default::default()
        }
    }

    /// Convert a raw scalar leaf into stats. Objects, arrays and nulls are not scalars.
    pub fn from_scalar(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(Self::from_number),
            Value::Bool(_) | Value::String(_) => Some(Self::from_category(value.clone())),
            _ => None,
        }
    }

    /// Whether a JSON object looks like a serialized stats leaf
    pub fn is_stats_object(map: &serde_json::Map<String, Value>) -> bool {
        map.keys().any(|k| STATS_FIELDS.contains(&k.as_str()))
    }

    pub fn has_numeric(&self) -> bool {
        self.mean.is_some() || self.sum.is_some() || self.min.is_some() || self.max.is_some()
    }

    pub fn is_categorical(&self) -> bool {
        !self.frequency.is_empty() || !self.unique.is_empty() || !self.rank.is_empty()
    }

    pub fn is_distribution(&self) -> bool {
        !self.distribution.is_empty()
    }

    /// Derive computed fields and enforce list caps.
    ///
    /// - `range` is re-derived from `min`/`max`
    /// - distribution `binSize`, `min` and `max` are imputed from buckets when absent
    /// - `frequency` is sorted by count descending and capped
    /// - `rank` is rebuilt from `frequency` when a frequency list exists
    pub fn finalize(mut self, max_entries: usize) -> Self {
        if !self.distribution.is_empty() {
            self.distribution
                .sort_by(|a, b| a.value.partial_cmp(&b.value).unwrap_or(Ordering::Equal));
            if self.distribution.len() > max_entries {
                let mut kept = self.distribution.clone();
                kept.sort_by(|a, b| b.count.partial_cmp(&a.count).unwrap_or(Ordering::Equal));
                kept.truncate(max_entries);
                kept.sort_by(|a, b| a.value.partial_cmp(&b.value).unwrap_or(Ordering::Equal));
                self.distribution = kept;
            }
            self.impute_distribution_bounds();
        }

        if let (Some(min), Some(max)) = (self.min, self.max) {
            self.range = Some(max - min);
        }

        if !self.frequency.is_empty() {
            sort_by_count_desc(&mut self.frequency);
            self.frequency.truncate(max_entries);
            self.rank = ranked(&self.frequency);
        } else if !self.rank.is_empty() {
            self.rank = ranked(&self.rank);
            self.rank.truncate(max_entries);
        }
        self.unique.truncate(max_entries);

        self
    }

    fn impute_distribution_bounds(&mut self) {
        let (first, last) = match (self.distribution.first(), self.distribution.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return,
        };

        if self.bin_size.is_none() {
            self.bin_size = if self.distribution.len() >= 2 {
                Some(self.distribution[1].value - first.value)
            } else {
                match (self.min, self.max) {
                    (Some(min), Some(max)) if max > min => Some(max - min),
                    _ => None,
                }
            };
        }

        if self.min.is_none() {
            self.min = Some(first.value);
        }
        if self.max.is_none() {
            self.max = Some(last.value + self.bin_size.unwrap_or(0.0));
        }
    }

    /// Most representative scalar: the mean, else the top-ranked category
    pub fn headline(&self) -> Option<Value> {
        if let Some(mean) = self.mean {
            return serde_json::Number::from_f64(mean).map(Value::Number);
        }
        self.rank
            .first()
            .or_else(|| self.frequency.first())
            .map(|entry| entry.value.clone())
    }
}

/// Stable serialization used to compare categorical values
pub fn value_key(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Sort by count descending; equal counts keep their existing order
pub(crate) fn sort_by_count_desc(entries: &mut [CategoryCount]) {
    entries.sort_by(|a, b| b.count.partial_cmp(&a.count).unwrap_or(Ordering::Equal));
}

/// Count descending, ties broken by boolean `true` first
pub(crate) fn ranked(entries: &[CategoryCount]) -> Vec<CategoryCount> {
    let mut out = entries.to_vec();
    out.sort_by(|a, b| {
        b.count
            .partial_cmp(&a.count)
            .unwrap_or(Ordering::Equal)
            .then_with(|| true_first(&a.value, &b.value))
    });
    out
}

fn true_first(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(true), Value::Bool(false)) => Ordering::Less,
        (Value::Bool(false), Value::Bool(true)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
