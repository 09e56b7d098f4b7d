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

//! Engine configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid:
//!
//! ```toml
//! batch_window_ms = 0
//! recently_saved_ttl_secs = 10
//! stats_freshness_secs = 30
//!
//! [backend]
//! base_url = "http://localhost:8000/api"
//! ```

use crate::error::{CoreError, Result};
use crate::stats::MAX_CATEGORY_ENTRIES;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_API_URL: &str = "EVALBOARD_API_URL";
pub const ENV_API_KEY: &str = "EVALBOARD_API_KEY";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Extra time a batch stays open after the first submit.
    /// 0 dispatches on the next scheduler tick.
    #[serde(default)]
    pub batch_window_ms: u64,

    /// Gaps are tolerated for this long after a local write
    #[serde(default = "default_recently_saved_ttl")]
    pub recently_saved_ttl_secs: u64,

    /// A loaded run younger than this is served without re-fetching
    #[serde(default = "default_stats_freshness")]
    pub stats_freshness_secs: u64,

    /// Cap for categorical and distribution lists after merge
    #[serde(default = "default_max_category_entries")]
    pub max_category_entries: usize,

    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// API root, e.g. "http://localhost:8000/api"
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_recently_saved_ttl() -> u64 {
    10
}

fn default_stats_freshness() -> u64 {
    30
}

fn default_max_category_entries() -> usize {
    MAX_CATEGORY_ENTRIES
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 0,
            recently_saved_ttl_secs: default_recently_saved_ttl(),
            stats_freshness_secs: default_stats_freshness(),
            max_category_entries: default_max_category_entries(),
            backend: BackendConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Apply `EVALBOARD_API_URL` / `EVALBOARD_API_KEY` when set
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            if !url.is_empty() {
                self.backend.base_url = url;
            }
        }
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            if !key.is_empty() {
                self.backend.api_key = Some(key);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.recently_saved_ttl_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "recently_saved_ttl_secs must be greater than 0".into(),
            ));
        }
        if self.max_category_entries == 0 {
            return Err(CoreError::InvalidConfig(
                "max_category_entries must be greater than 0".into(),
            ));
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(CoreError::InvalidConfig("backend.base_url is empty".into()));
        }
        Ok(())
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn recently_saved_ttl(&self) -> Duration {
        Duration::from_secs(self.recently_saved_ttl_secs)
    }

    pub fn stats_freshness(&self) -> Duration {
        Duration::from_secs(self.stats_freshness_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.recently_saved_ttl_secs, 10);
        assert_eq!(config.max_category_entries, 20);
        assert_eq!(config.batch_window(), Duration::ZERO);
        assert!(config.backend.api_key.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            stats_freshness_secs = 5

            [backend]
            base_url = "https://evals.example.com/api"
            api_key = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.stats_freshness(), Duration::from_secs(5));
        assert_eq!(config.backend.base_url, "https://evals.example.com/api");
        assert_eq!(config.backend.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validation_rejects_zero_ttl() {
        assert!(matches!(
            EngineConfig::from_toml_str("recently_saved_ttl_secs = 0"),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evalboard.toml");
        std::fs::write(&path, "batch_window_ms = 5\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.batch_window(), Duration::from_millis(5));
    }
}
