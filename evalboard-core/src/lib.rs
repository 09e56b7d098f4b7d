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

//! Evalboard Core
//!
//! Synchronous building blocks for evaluation-run metrics:
//!
//! - [`stats`]: the [`BasicStats`] summary model
//! - [`merge`]: combining partial summaries ([`StatsMerger`])
//! - [`keys`]: canonical metric names, lookup candidates and resolution
//! - [`record`]: backend record normalization
//! - [`flatten`]: building flat maps and raw trees from records
//! - [`temporal`]: per-run time series for live evaluations
//!
//! Nothing in this crate performs I/O apart from loading a config file.

pub mod config;
pub mod error;
pub mod flatten;
pub mod keys;
pub mod merge;
pub mod record;
pub mod run;
pub mod stats;
pub mod temporal;

pub use config::{BackendConfig, EngineConfig};
pub use error::{CoreError, Result};
pub use flatten::MetricAccumulator;
pub use keys::{
    build_candidates, canonicalize, resolve, resolve_in_tree, Candidates, FlatMetricsMap,
    MetricRequest,
};
pub use merge::{merge, StatsMerger};
pub use record::{MetricLeaf, MetricRecord, RecordScope, StepMetrics, DEFAULT_STEP};
pub use run::RunStatus;
pub use stats::{BasicStats, Bucket, CategoryCount, MAX_CATEGORY_ENTRIES};
pub use temporal::{series_key, TemporalPoint, TemporalSeriesIndex};
