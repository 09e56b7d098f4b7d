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

//! Metric key canonicalization and lookup
//!
//! The backend spells the same logical metric in several ways
//! (`costs.total`, `attributes.ag.metrics.costs.cumulative.total`,
//! `totalCost`, ...). Everything that deals with those spellings lives here:
//!
//! - [`canonicalize`] maps any accepted spelling to one canonical name
//! - [`build_candidates`] produces the ordered lookup keys for a request
//! - [`resolve`] / [`resolve_in_tree`] walk flat maps and raw trees
//!
//! ## Step scoping
//!
//! Two evaluators may both emit `score`. When a request names a step, every
//! step-prefixed candidate is tried before any bare one, and suffix matches
//! must belong to that step, so evaluator A never reads evaluator B's value.

use crate::stats::BasicStats;
use serde_json::Value;
use std::collections::BTreeMap;

/// Vendor prefixes stripped before alias lookup
const VENDOR_PREFIXES: &[&str] = &[
    "attributes.ag.metrics.",
    "attributes.ag.data.",
    "attributes.ag.",
    "ag.metrics.",
    "ag.data.",
    "metrics.",
];

/// Aggregation-mode segments that do not change the metric identity
const MODE_SEGMENTS: &[&str] = &["cumulative", "incremental", "acc", "unit"];

/// Lower-cased spelling -> canonical name. Canonical names map to themselves.
const ALIASES: &[(&str, &str)] = &[
    ("totalcost", "totalCost"),
    ("costs.total", "totalCost"),
    ("cost.total", "totalCost"),
    ("total_cost", "totalCost"),
    ("cost", "totalCost"),
    ("costs", "totalCost"),
    ("totaltokens", "totalTokens"),
    ("tokens.total", "totalTokens"),
    ("total_tokens", "totalTokens"),
    ("tokens", "totalTokens"),
    ("prompttokens", "promptTokens"),
    ("tokens.prompt", "promptTokens"),
    ("prompt_tokens", "promptTokens"),
    ("completiontokens", "completionTokens"),
    ("tokens.completion", "completionTokens"),
    ("completion_tokens", "completionTokens"),
    ("duration", "duration"),
    ("duration.total", "duration"),
    ("latency", "duration"),
    ("latency.total", "duration"),
    ("errors", "errors"),
    ("errors.total", "errors"),
    ("error_count", "errors"),
];

/// Terminal segments that name a container rather than a concrete metric
const PLACEHOLDER_SEGMENTS: &[&str] = &["outputs", "output", "data"];

/// Map any accepted spelling of a metric name to its canonical spelling.
///
/// Total and stateless: unknown names come back with vendor prefixes and
/// aggregation-mode segments stripped, and `canonicalize(canonicalize(x))`
/// always equals `canonicalize(x)`.
pub fn canonicalize(key: &str) -> String {
    let stripped = strip_vendor(key.trim());
    match alias_for(&stripped) {
        Some(canonical) => canonical.to_string(),
        None => stripped,
    }
}

fn alias_for(key: &str) -> Option<&'static str> {
    let lower = key.to_ascii_lowercase();
    ALIASES
        .iter()
        .find(|(spelling, _)| *spelling == lower)
        .map(|(_, canonical)| *canonical)
}

fn strip_vendor(key: &str) -> String {
    let mut current = key.to_string();
    loop {
        current = current.trim().to_string();
        let before = current.len();
        for prefix in VENDOR_PREFIXES {
            if current.len() > prefix.len() && current.starts_with(prefix) {
                current = current[prefix.len()..].to_string();
            }
        }
        let segments: Vec<&str> = current.split('.').collect();
        if segments.len() > 1 {
            let kept: Vec<&str> = segments
                .iter()
                .copied()
                .filter(|s| !MODE_SEGMENTS.contains(s))
                .collect();
            if !kept.is_empty() && kept.len() != segments.len() {
                current = kept.join(".");
            }
        }
        if current.len() == before {
            return current;
        }
    }
}

/// A metric lookup request as issued by the UI
#[derive(Debug, Clone, Default)]
pub struct MetricRequest<'a> {
    pub metric_key: Option<&'a str>,
    pub metric_path: Option<&'a str>,
    pub step_key: Option<&'a str>,
}

impl<'a> MetricRequest<'a> {
    pub fn key(metric_key: &'a str) -> Self {
        Self {
            metric_key: Some(metric_key),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step_key: &'a str) -> Self {
        self.step_key = Some(step_key);
        self
    }

    pub fn with_path(mut self, metric_path: &'a str) -> Self {
        self.metric_path = Some(metric_path);
        self
    }
}

/// Ordered lookup keys for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    /// Step the request is scoped to, if any
    pub step_key: Option<String>,
    /// Candidates that carry the step prefix, tried first
    pub scoped: Vec<String>,
    /// Bare candidates, tried after every scoped one
    pub bare: Vec<String>,
}

impl Candidates {
    /// All candidates in priority order
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.scoped.iter().chain(self.bare.iter())
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.scoped.is_empty() && self.bare.is_empty()
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

/// Build ordered lookup candidates.
///
/// Priority: `step.canonical`, `step.raw`, `step.path`, then `canonical`,
/// `raw`, `path` and finally the terminal path segment.
pub fn build_candidates(request: &MetricRequest<'_>) -> Candidates {
    let raw = request
        .metric_key
        .or(request.metric_path)
        .map(str::trim)
        .unwrap_or_default();
    let path = request.metric_path.map(str::trim).unwrap_or(raw);
    let canonical = if raw.is_empty() {
        String::new()
    } else {
        canonicalize(raw)
    };
    let step = request
        .step_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let mut scoped = Vec::new();
    if let Some(step) = &step {
        let prefix = format!("{step}.");
        for key in [canonical.as_str(), raw, path] {
            if key.is_empty() {
                continue;
            }
            if key.starts_with(&prefix) {
                push_unique(&mut scoped, key.to_string());
            } else {
                push_unique(&mut scoped, format!("{prefix}{key}"));
            }
        }
    }

    let mut bare = Vec::new();
    for key in [canonical.as_str(), raw, path] {
        let key = match &step {
            Some(step) => key.strip_prefix(&format!("{step}.")).unwrap_or(key),
            None => key,
        };
        push_unique(&mut bare, key.to_string());
    }
    if let Some(last) = path.rsplit('.').next() {
        push_unique(&mut bare, last.to_string());
    }
    bare.retain(|key| !scoped.contains(key));

    Candidates {
        step_key: step,
        scoped,
        bare,
    }
}

/// Flattened metric lookup structure
pub type FlatMetricsMap = BTreeMap<String, BasicStats>;

fn belongs_to_step(map_key: &str, step: &str) -> bool {
    map_key.starts_with(&format!("{step}.")) || map_key.contains(&format!(".{step}."))
}

/// A bare key that some other step also emits under its own prefix
fn owned_by_other_step(map: &FlatMetricsMap, bare: &str, step: &str) -> bool {
    let suffix = format!(".{bare}");
    map.keys()
        .any(|key| key.ends_with(&suffix) && !belongs_to_step(key, step))
}

/// Resolve candidates against a flat map.
///
/// Exact matches win in candidate order; then dot-suffix matches, which must
/// belong to the requested step when one is given. With a step, a bare exact
/// match is skipped when another step emits the same key.
pub fn resolve<'m>(map: &'m FlatMetricsMap, candidates: &Candidates) -> Option<&'m BasicStats> {
    resolve_entry(map, candidates).map(|(_, stats)| stats)
}

/// Like [`resolve`] but also returns the matching map key
pub fn resolve_entry<'m>(
    map: &'m FlatMetricsMap,
    candidates: &Candidates,
) -> Option<(&'m String, &'m BasicStats)> {
    for candidate in &candidates.scoped {
        if let Some(entry) = map.get_key_value(candidate) {
            return Some(entry);
        }
    }

    for candidate in &candidates.bare {
        if let Some(step) = candidates.step_key.as_deref() {
            if owned_by_other_step(map, candidate, step) {
                continue;
            }
        }
        if let Some(entry) = map.get_key_value(candidate) {
            return Some(entry);
        }
    }

    for candidate in candidates.iter() {
        let suffix = format!(".{candidate}");
        let found = map.iter().find(|(key, _)| {
            key.ends_with(&suffix)
                && candidates
                    .step_key
                    .as_deref()
                    .map_or(true, |step| belongs_to_step(key, step))
        });
        if found.is_some() {
            return found;
        }
    }

    None
}

/// Whether a path ends in a generic container segment such as `outputs`
pub fn is_placeholder_path(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .map_or(false, |last| PLACEHOLDER_SEGMENTS.contains(&last))
}

/// Nearest concrete leaf below a placeholder path.
///
/// For `evaluator.outputs` this finds e.g. `evaluator.outputs.score`,
/// preferring keys scoped to the requested step.
pub fn resolve_placeholder<'m>(
    map: &'m FlatMetricsMap,
    path: &str,
    step_key: Option<&str>,
) -> Option<(&'m String, &'m BasicStats)> {
    if !is_placeholder_path(path) {
        return None;
    }
    let mut prefixes = Vec::new();
    if let Some(step) = step_key {
        if !path.starts_with(&format!("{step}.")) {
            prefixes.push(format!("{step}.{path}."));
        }
    }
    prefixes.push(format!("{path}."));

    for prefix in &prefixes {
        if let Some(entry) = map.range(prefix.clone()..).next().filter(|(k, _)| k.starts_with(prefix.as_str())) {
            return Some(entry);
        }
    }
    if step_key.is_none() {
        let infix = format!(".{path}.");
        return map.iter().find(|(key, _)| key.contains(&infix));
    }
    None
}

/// Walk a raw nested tree along dot-separated segments.
///
/// Keys may themselves contain dots (`costs.total`), so at each level the
/// longest joined run of remaining segments is tried first.
pub fn lookup_path<'t>(tree: &'t Value, segments: &[&str]) -> Option<&'t Value> {
    if segments.is_empty() {
        return Some(tree);
    }
    let object = tree.as_object()?;
    for take in (1..=segments.len()).rev() {
        let key = segments[..take].join(".");
        if let Some(child) = object.get(&key) {
            if let Some(found) = lookup_path(child, &segments[take..]) {
                return Some(found);
            }
        }
    }
    None
}

/// Resolve a path in a raw tree: literal path first, then evaluator-prefixed
pub fn resolve_in_tree<'t>(
    tree: &'t Value,
    path: &str,
    evaluator_key: Option<&str>,
) -> Option<&'t Value> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }
    if let Some(found) = lookup_path(tree, &segments) {
        return Some(found);
    }
    let evaluator = evaluator_key.filter(|k| !k.is_empty())?;
    let mut prefixed = vec![evaluator];
    prefixed.extend(segments);
    lookup_path(tree, &prefixed)
}
