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

//! Batched testcase lookups

use crate::backend::{MetricsBackend, RawTestcase};
use crate::coalescer::{BatchLoader, CoalescerStats, RequestCoalescer};
use crate::error::EngineResult;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Scope is the project id, keys are testcase ids
pub struct TestcaseLoader {
    backend: Arc<dyn MetricsBackend>,
}

#[async_trait]
impl BatchLoader for TestcaseLoader {
    type Value = RawTestcase;

    async fn load(
        &self,
        scope: &str,
        _partition: Option<&str>,
        keys: Vec<String>,
    ) -> EngineResult<HashMap<String, RawTestcase>> {
        let response = self.backend.query_testcases(scope, keys).await?;
        Ok(response
            .testcases
            .into_iter()
            .map(|tc| (tc.id.clone(), tc))
            .collect())
    }
}

/// Resolves testcase ids, caching every testcase found
pub struct TestcaseResolver {
    batches: RequestCoalescer<TestcaseLoader>,
    cache: DashMap<(String, String), RawTestcase>,
}

impl TestcaseResolver {
    pub fn new(backend: Arc<dyn MetricsBackend>, window: Duration) -> Self {
        Self {
            batches: RequestCoalescer::new(TestcaseLoader { backend }, window),
            cache: DashMap::new(),
        }
    }

    /// Unknown ids resolve to `None`
    pub async fn resolve(&self, project_id: &str, testcase_id: &str) -> EngineResult<Option<RawTestcase>> {
        let key = (project_id.to_string(), testcase_id.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Some(hit.clone()));
        }

        let found = self.batches.submit(project_id, testcase_id).await?;
        if let Some(testcase) = &found {
            self.cache.insert(key, testcase.clone());
        }
        Ok(found)
    }

    /// Resolve several ids with one batched call; order follows the input
    pub async fn resolve_many(
        &self,
        project_id: &str,
        testcase_ids: &[String],
    ) -> EngineResult<Vec<Option<RawTestcase>>> {
        try_join_all(testcase_ids.iter().map(|id| self.resolve(project_id, id))).await
    }

    pub fn invalidate(&self, project_id: &str) {
        self.cache.retain(|(project, _), _| project != project_id);
        self.batches.invalidate(project_id);
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn stats(&self) -> CoalescerStats {
        self.batches.stats()
    }
}
