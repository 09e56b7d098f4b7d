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

//! Backend abstraction for metric queries

use crate::error::EngineResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metric query; either scenario ids or run ids are set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_ids: Option<Vec<String>>,
    /// Include timestamped (temporal) run-level records
    #[serde(default)]
    pub timestamps: bool,
}

impl MetricsQuery {
    pub fn for_scenarios(scenario_ids: Vec<String>) -> Self {
        Self {
            scenario_ids: Some(scenario_ids),
            ..Default::default()
        }
    }

    pub fn for_runs(run_ids: Vec<String>) -> Self {
        Self {
            run_ids: Some(run_ids),
            timestamps: true,
            ..Default::default()
        }
    }
}

/// Raw metric records, normalized by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsResponse {
    #[serde(default)]
    pub metrics: Vec<Value>,
}

/// Recompute trigger for a run or one of its scenarios
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
}

/// Testcase as returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTestcase {
    pub id: String,
    #[serde(default, alias = "testsetId")]
    pub testset_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestcasesResponse {
    #[serde(default)]
    pub testcases: Vec<RawTestcase>,
}

/// Remote collaborator that stores and computes evaluation metrics
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn query_metrics(&self, project_id: &str, query: MetricsQuery)
        -> EngineResult<MetricsResponse>;

    /// Best-effort recompute; idempotent from the caller's perspective
    async fn refresh_metrics(&self, project_id: &str, request: RefreshRequest) -> EngineResult<()>;

    async fn query_testcases(
        &self,
        project_id: &str,
        testcase_ids: Vec<String>,
    ) -> EngineResult<TestcasesResponse>;
}
