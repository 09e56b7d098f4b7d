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

//! JSON-over-HTTP metrics backend

use crate::backend::{
    MetricsBackend, MetricsQuery, MetricsResponse, RefreshRequest, TestcasesResponse,
};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use evalboard_core::BackendConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Serialize)]
struct ProjectScoped<'a, T: Serialize> {
    project_id: &'a str,
    #[serde(flatten)]
    body: T,
}

#[derive(Serialize)]
struct TestcaseIds {
    testcase_ids: Vec<String>,
}

/// HTTP backend client
pub struct HttpMetricsBackend {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpMetricsBackend {
    pub fn new(config: &BackendConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            client,
        })
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> EngineResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "POST");

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status,
                body: Arc::from(body),
            });
        }
        Ok(response)
    }

    async fn post_json<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> EngineResult<R> {
        let response = self.post(path, body).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl MetricsBackend for HttpMetricsBackend {
    async fn query_metrics(
        &self,
        project_id: &str,
        query: MetricsQuery,
    ) -> EngineResult<MetricsResponse> {
        self.post_json(
            "/evaluations/metrics/query",
            &ProjectScoped {
                project_id,
                body: query,
            },
        )
        .await
    }

    async fn refresh_metrics(&self, project_id: &str, request: RefreshRequest) -> EngineResult<()> {
        self.post(
            "/evaluations/metrics/refresh",
            &ProjectScoped {
                project_id,
                body: request,
            },
        )
        .await?;
        Ok(())
    }

    async fn query_testcases(
        &self,
        project_id: &str,
        testcase_ids: Vec<String>,
    ) -> EngineResult<TestcasesResponse> {
        self.post_json(
            "/testcases/query",
            &ProjectScoped {
                project_id,
                body: TestcaseIds { testcase_ids },
            },
        )
        .await
    }
}
