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

//! Flattening records into lookup structures
//!
//! Every leaf of a record is registered under several spellings so that
//! downstream lookups can use whichever one they have:
//!
//! ```text
//! judge / costs.total  ->  costs.total, totalCost,
//!                          judge.costs.total, judge.totalCost
//! ```
//!
//! Colliding spellings from different records are combined with the
//! [`StatsMerger`]. Within one record the first leaf to claim a spelling
//! keeps it. Un-prefixed spellings never mix two evaluators.

use crate::keys::{canonicalize, FlatMetricsMap};
use crate::merge::StatsMerger;
use crate::record::{MetricLeaf, MetricRecord, DEFAULT_STEP};
use crate::stats::BasicStats;
use serde_json::{Map, Value};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Un-prefixed spellings of a metric; the step-prefixed ones are derived from these
fn bare_spellings(metric: &str) -> Vec<String> {
    let canonical = canonicalize(metric);
    let mut out = vec![metric.to_string()];
    if canonical != metric {
        out.push(canonical);
    }
    out
}

/// Leaf of the merged raw tree
#[derive(Debug, Clone, PartialEq)]
enum RawLeaf {
    Stats(BasicStats),
    Scalar(Value),
}

/// Accumulates records into a flat map and a raw tree, merging each record once.
///
/// An un-prefixed spelling is only present in the flat map while it has a
/// single owner: the default step if it emitted the metric, otherwise the
/// one step that did. Once two named steps emit the same metric the bare
/// spelling is dropped and only the step-prefixed spellings remain.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    merger: StatsMerger,
    flat: FlatMetricsMap,
    /// bare spelling -> step -> merged stats
    owners: BTreeMap<String, BTreeMap<String, BasicStats>>,
    raw: BTreeMap<String, BTreeMap<String, RawLeaf>>,
    contributed: HashSet<String>,
}

impl MetricAccumulator {
    pub fn new(merger: StatsMerger) -> Self {
        Self {
            merger,
            ..Default::default()
        }
    }

    /// Merge a record. Returns `false` if this record already contributed.
    pub fn ingest(&mut self, record: &MetricRecord) -> bool {
        if !self.contributed.insert(record.fingerprint()) {
            return false;
        }

        let mut scoped: BTreeMap<String, BasicStats> = BTreeMap::new();
        let mut bare: BTreeMap<(String, String), BasicStats> = BTreeMap::new();
        for (step, metrics) in &record.data {
            for (metric, leaf) in metrics {
                self.ingest_raw(step, metric, leaf);
                let Some(stats) = leaf.to_stats() else {
                    continue;
                };
                for spelling in bare_spellings(metric) {
                    if step != DEFAULT_STEP {
                        scoped
                            .entry(format!("{step}.{spelling}"))
                            .or_insert_with(|| stats.clone());
                    }
                    bare.entry((spelling, step.clone()))
                        .or_insert_with(|| stats.clone());
                }
            }
        }

        for (key, stats) in scoped {
            let merged = self.merger.merge(self.flat.get(&key), &stats);
            self.flat.insert(key, merged);
        }

        let mut touched = BTreeSet::new();
        for ((spelling, step), stats) in bare {
            let by_step = self.owners.entry(spelling.clone()).or_default();
            let merged = self.merger.merge(by_step.get(&step), &stats);
            by_step.insert(step, merged);
            touched.insert(spelling);
        }
        for spelling in touched {
            match self.bare_owner(&spelling) {
                Some(stats) => {
                    self.flat.insert(spelling, stats);
                }
                None => {
                    self.flat.remove(&spelling);
                }
            }
        }
        true
    }

    fn bare_owner(&self, spelling: &str) -> Option<BasicStats> {
        let by_step = self.owners.get(spelling)?;
        if let Some(stats) = by_step.get(DEFAULT_STEP) {
            return Some(stats.clone());
        }
        match by_step.len() {
            1 => by_step.values().next().cloned(),
            _ => None,
        }
    }

    fn ingest_raw(&mut self, step: &str, metric: &str, leaf: &MetricLeaf) {
        let slot = self
            .raw
            .entry(step.to_string())
            .or_default()
            .entry(metric.to_string());

        match (slot, leaf) {
            (Entry::Vacant(v), MetricLeaf::Stats(s)) => {
                v.insert(RawLeaf::Stats(s.clone()));
            }
            (Entry::Vacant(v), MetricLeaf::Scalar(x)) => {
                v.insert(RawLeaf::Scalar(x.clone()));
            }
            (Entry::Occupied(mut o), MetricLeaf::Scalar(x)) => {
                let next = match o.get() {
                    RawLeaf::Scalar(_) => RawLeaf::Scalar(x.clone()),
                    RawLeaf::Stats(current) => match BasicStats::from_scalar(x) {
                        Some(incoming) => RawLeaf::Stats(self.merger.merge(Some(current), &incoming)),
                        None => return,
                    },
                };
                o.insert(next);
            }
            (Entry::Occupied(mut o), MetricLeaf::Stats(s)) => {
                let current = match o.get() {
                    RawLeaf::Stats(current) => Some(current.clone()),
                    RawLeaf::Scalar(x) => BasicStats::from_scalar(x),
                };
                let merged = self.merger.merge(current.as_ref(), s);
                o.insert(RawLeaf::Stats(merged));
            }
        }
    }

    pub fn flat(&self) -> &FlatMetricsMap {
        &self.flat
    }

    /// Merged nested tree, `{step: {metric: stats-or-scalar}}`
    pub fn raw_tree(&self) -> Value {
        let mut root = Map::new();
        for (step, metrics) in &self.raw {
            let mut step_map = Map::new();
            for (metric, leaf) in metrics {
                let value = match leaf {
                    RawLeaf::Stats(stats) => serde_json::to_value(stats).unwrap_or(Value::Null),
                    RawLeaf::Scalar(value) => value.clone(),
                };
                step_map.insert(metric.clone(), value);
            }
            root.insert(step.clone(), Value::Object(step_map));
        }
        Value::Object(root)
    }

    pub fn contributed(&self) -> usize {
        self.contributed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contributed.is_empty()
    }
}
