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

//! Engine error types

use std::sync::Arc;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine.
///
/// One batch failure is delivered to every waiter of that batch, so the
/// error is `Clone` and keeps only rendered messages.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The request never produced a response
    #[error("Transport error: {0}")]
    Transport(Arc<str>),

    /// The backend answered with a non-success status
    #[error("Backend returned HTTP {status}: {body}")]
    Status { status: u16, body: Arc<str> },

    /// The response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(Arc<str>),

    /// The batch task ended without delivering a result
    #[error("Batch cancelled before completion")]
    BatchCancelled,

    #[error("Configuration error: {0}")]
    Config(Arc<str>),
}

impl EngineError {
    pub fn transport(message: impl Into<String>) -> Self {
        EngineError::Transport(Arc::from(message.into()))
    }

    pub fn decode(message: impl Into<String>) -> Self {
        EngineError::Decode(Arc::from(message.into()))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            EngineError::decode(e.to_string())
        } else {
            EngineError::transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::decode(e.to_string())
    }
}

impl From<evalboard_core::CoreError> for EngineError {
    fn from(e: evalboard_core::CoreError) -> Self {
        EngineError::Config(Arc::from(e.to_string()))
    }
}
