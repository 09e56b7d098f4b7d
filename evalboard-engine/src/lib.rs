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

//! Evalboard Engine
//!
//! Fetches evaluation metrics from a backend, coalescing requests into
//! batches, and keeps a per-run cache with gap detection and refresh.
//!
//! ```ignore
//! let engine = EvalEngine::from_config(&EngineConfig::default().with_env_overrides())?;
//! let run = RunRef::new("project-1", "run-1", RunStatus::Completed);
//! engine.store.load_run(&run, &["scenario-1".to_string()]).await?;
//! let cost = engine.store.get_run_level_stats("run-1", &StatsQuery::metric("totalCost"));
//! ```

pub mod backend;
pub mod coalescer;
pub mod error;
pub mod http;
pub mod refresh;
pub mod store;
pub mod testcases;

pub use backend::{
    MetricsBackend, MetricsQuery, MetricsResponse, RawTestcase, RefreshRequest, TestcasesResponse,
};
pub use coalescer::{BatchLoader, CoalescerStats, RequestCoalescer};
pub use error::{EngineError, EngineResult};
pub use http::HttpMetricsBackend;
pub use refresh::{should_refresh, Gap, RecentlySaved, RefreshInput};
pub use store::{
    LoadReport, MetricState, MetricStore, MetricValue, RunPhase, RunRef, StatsQuery, ValueQuery,
};
pub use testcases::TestcaseResolver;

use evalboard_core::EngineConfig;
use std::sync::Arc;

/// One engine instance per session; all caches live here
pub struct EvalEngine {
    pub store: MetricStore,
    pub testcases: TestcaseResolver,
}

impl EvalEngine {
    /// Engine over the HTTP backend described by `config`
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let backend = HttpMetricsBackend::new(&config.backend)?;
        Ok(Self::with_backend(Arc::new(backend), config))
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>, config: &EngineConfig) -> Self {
        Self {
            store: MetricStore::new(Arc::clone(&backend), config),
            testcases: TestcaseResolver::new(backend, config.batch_window()),
        }
    }
}
