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

//! Evaluation run status

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an evaluation run as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl RunStatus {
    /// Parse backend spellings leniently (`EVALUATION_STARTED`, `success`, ...)
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let normalized = normalized
            .strip_prefix("evaluation_")
            .unwrap_or(&normalized);
        match normalized {
            "pending" | "initialized" | "created" => RunStatus::Pending,
            "queued" | "scheduled" => RunStatus::Queued,
            "running" | "started" | "in_progress" | "evaluating" => RunStatus::Running,
            "paused" | "halted" => RunStatus::Paused,
            "completed" | "finished" | "success" | "succeeded" | "finished_with_errors" => {
                RunStatus::Completed
            }
            "failed" | "failure" | "error" | "errors" => RunStatus::Failed,
            "cancelled" | "canceled" | "aborted" => RunStatus::Cancelled,
            _ => RunStatus::Unknown,
        }
    }

    /// Whether the run is still producing scenario results
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Queued)
    }

    /// Whether the run is waiting; invocations may already be done
    pub fn is_waiting(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_spellings() {
        assert_eq!(RunStatus::parse("EVALUATION_STARTED"), RunStatus::Running);
        assert_eq!(RunStatus::parse("success"), RunStatus::Completed);
        assert_eq!(RunStatus::parse("EVALUATION_FINISHED_WITH_ERRORS"), RunStatus::Completed);
        assert_eq!(RunStatus::parse("in-progress"), RunStatus::Running);
        assert_eq!(RunStatus::parse("paused"), RunStatus::Paused);
        assert_eq!(RunStatus::parse("???"), RunStatus::Unknown);
    }

    #[test]
    fn test_status_classes() {
        assert!(RunStatus::Running.is_active());
        assert!(!RunStatus::Pending.is_active());
        assert!(RunStatus::Pending.is_waiting());
        assert!(RunStatus::Cancelled.is_terminal());
    }
}
