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

//! Combining partial statistics
//!
//! Counts and sums are additive, so merging the same source twice doubles
//! them. Callers own the bookkeeping of which records already contributed
//! (see [`crate::flatten::MetricAccumulator`]).

use crate::stats::{value_key, BasicStats, CategoryCount, MAX_CATEGORY_ENTRIES};
use std::collections::{HashMap, HashSet};

/// Merges partial [`BasicStats`] into combined summaries
#[derive(Debug, Clone, Copy)]
pub struct StatsMerger {
    /// Cap applied to categorical and distribution lists
    pub max_entries: usize,
    /// Weight of a `mean` whose input has no `count`
    pub fallback_count: f64,
}

impl Default for StatsMerger {
    fn default() -> Self {
        Self {
            max_entries: MAX_CATEGORY_ENTRIES,
            fallback_count: 1.0,
        }
    }
}

impl StatsMerger {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Self::default()
        }
    }

    /// Merge `incoming` into `current`, producing a new summary
    pub fn merge(&self, current: Option<&BasicStats>, incoming: &BasicStats) -> BasicStats {
        let current = match current {
            Some(current) => current,
            None => return incoming.clone(),
        };

        let mut out = BasicStats {
            count: add_opt(current.count, incoming.count),
            ..Default::default()
        };

        let sum = add_opt(
            self.contributed_sum(current),
            self.contributed_sum(incoming),
        );
        out.sum = sum;
        out.mean = match (sum, out.count) {
            (Some(sum), Some(count)) if count > 0.0 => Some(sum / count),
            _ => None,
        };

        out.min = fold_opt(current.min, incoming.min, f64::min);
        out.max = fold_opt(current.max, incoming.max, f64::max);

        out.frequency = merge_counts(&current.frequency, &incoming.frequency);
        if out.frequency.is_empty() {
            out.rank = merge_counts(&current.rank, &incoming.rank);
        }
        out.unique = union_values(&current.unique, &incoming.unique);

        if incoming.distribution.is_empty() {
            out.distribution = current.distribution.clone();
            out.bin_size = current.bin_size;
        } else {
            out.distribution = incoming.distribution.clone();
            out.bin_size = incoming.bin_size;
        }

        out.finalize(self.max_entries)
    }

    /// Sum an input contributes: explicit `sum`, else `mean * count`, else `mean * fallback`
    fn contributed_sum(&self, stats: &BasicStats) -> Option<f64> {
        if let Some(sum) = stats.sum {
            return Some(sum);
        }
        let mean = stats.mean?;
        Some(mean * stats.count.unwrap_or(self.fallback_count))
    }
}

/// Merge with the default merger
pub fn merge(current: Option<&BasicStats>, incoming: &BasicStats) -> BasicStats {
    StatsMerger::default().merge(current, incoming)
}

fn add_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
    }
}

fn fold_opt(a: Option<f64>, b: Option<f64>, f: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (a, b) => a.or(b),
    }
}

/// Group entries by value and sum counts; first-seen order is the tie order
fn merge_counts(current: &[CategoryCount], incoming: &[CategoryCount]) -> Vec<CategoryCount> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<CategoryCount> = Vec::with_capacity(current.len() + incoming.len());

    for entry in current.iter().chain(incoming) {
        let key = value_key(&entry.value);
        match index.get(&key) {
            Some(&i) => out[i].count += entry.count,
            None => {
                index.insert(key, out.len());
                out.push(entry.clone());
            }
        }
    }

    crate::stats::sort_by_count_desc(&mut out);
    out
}

fn union_values(current: &[serde_json::Value], incoming: &[serde_json::Value]) -> Vec<serde_json::Value> {
    let mut seen = HashSet::new();
    current
        .iter()
        .chain(incoming)
        .filter(|value| seen.insert(value_key(value)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Bucket;
    use proptest::prelude::*;
    use serde_json::json;

    fn numeric(count: f64, mean: f64, min: f64, max: f64) -> BasicStats {
        BasicStats {
            count: Some(count),
            mean: Some(mean),
            min: Some(min),
            max: Some(max),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_into_empty_is_copy() {
        let stats = numeric(4.0, 2.0, 1.0, 3.0);
        assert_eq!(merge(None, &stats), stats);
    }

    #[test]
    fn test_numeric_merge() {
        let a = numeric(2.0, 1.0, 0.5, 1.5);
        let b = BasicStats {
            count: Some(2.0),
            sum: Some(10.0),
            min: Some(4.0),
            max: Some(6.0),
            ..Default::default()
        };

        let merged = merge(Some(&a), &b);
        assert_eq!(merged.count, Some(4.0));
        assert_eq!(merged.sum, Some(12.0));
        assert_eq!(merged.mean, Some(3.0));
        assert_eq!(merged.min, Some(0.5));
        assert_eq!(merged.max, Some(6.0));
        assert_eq!(merged.range, Some(5.5));
    }

    #[test]
    fn test_mean_without_count_uses_fallback() {
        let a = BasicStats {
            mean: Some(4.0),
            ..Default::default()
        };
        let b = numeric(1.0, 2.0, 2.0, 2.0);

        let merged = merge(Some(&a), &b);
        assert_eq!(merged.count, Some(1.0));
        assert_eq!(merged.sum, Some(6.0));
    }

    #[test]
    fn test_mean_unset_without_counts() {
        let a = BasicStats {
            mean: Some(4.0),
            ..Default::default()
        };
        let merged = merge(Some(&a), &a.clone());
        assert_eq!(merged.count, None);
        assert_eq!(merged.mean, None);
        assert_eq!(merged.sum, Some(8.0));
    }

    #[test]
    fn test_frequency_merge() {
        let a = BasicStats {
            frequency: vec![CategoryCount::new(true, 2.0)],
            ..Default::default()
        };
        let b = BasicStats {
            frequency: vec![
                CategoryCount::new(true, 3.0),
                CategoryCount::new(false, 1.0),
            ],
            ..Default::default()
        };

        let merged = merge(Some(&a), &b);
        assert_eq!(
            merged.frequency,
            vec![
                CategoryCount::new(true, 5.0),
                CategoryCount::new(false, 1.0)
            ]
        );
        assert_eq!(merged.rank[0].value, json!(true));
    }

    #[test]
    fn test_unique_union() {
        let a = BasicStats {
            unique: vec![json!("a"), json!("b")],
            ..Default::default()
        };
        let b = BasicStats {
            unique: vec![json!("b"), json!("c")],
            ..Default::default()
        };
        let merged = merge(Some(&a), &b);
        assert_eq!(merged.unique, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_distribution_latest_wins() {
        let a = BasicStats {
            distribution: vec![Bucket { value: 0.0, count: 1.0 }],
            bin_size: Some(1.0),
            ..Default::default()
        };
        let b = BasicStats {
            distribution: vec![
                Bucket { value: 0.0, count: 3.0 },
                Bucket { value: 0.5, count: 4.0 },
            ],
            ..Default::default()
        };

        let merged = merge(Some(&a), &b);
        assert_eq!(merged.distribution.len(), 2);
        assert_eq!(merged.bin_size, Some(0.5));

        let kept = merge(Some(&b), &BasicStats::from_number(0.2));
        assert_eq!(kept.distribution.len(), 2);
    }

    fn arb_stats() -> impl Strategy<Value = BasicStats> {
        (1u32..50, -100.0f64..100.0, proptest::bool::ANY).prop_map(|(count, mean, explicit_sum)| {
            let count = count as f64;
            BasicStats {
                count: Some(count),
                mean: if explicit_sum { None } else { Some(mean) },
                sum: if explicit_sum { Some(mean * count) } else { None },
                ..Default::default()
            }
        })
    }

    proptest! {
        #[test]
        fn prop_count_and_sum_are_order_independent(a in arb_stats(), b in arb_stats(), c in arb_stats()) {
            let left = merge(Some(&merge(Some(&a), &b)), &c);
            let right = merge(Some(&merge(Some(&b), &c)), &a);

            prop_assert_eq!(left.count, right.count);
            let (ls, rs) = (left.sum.unwrap(), right.sum.unwrap());
            prop_assert!((ls - rs).abs() <= 1e-6 * (1.0 + ls.abs()));
        }
    }
}
