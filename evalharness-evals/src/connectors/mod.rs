// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Built-in connectors

pub mod http;
pub mod openai;

pub use http::HttpConnector;
pub use openai::OpenAIConnector;

use crate::EvalError;
use evalharness_core::ConnectorConfig;
use parking_lot::RwLock;
use std::sync::Arc;

/// Backend binding produced by `configure`
pub(crate) struct BackendBinding {
    pub config: ConnectorConfig,
    pub token: Option<String>,
    pub client: reqwest::Client,
}

impl BackendBinding {
    pub fn new(adapter_id: &str, config: ConnectorConfig) -> Result<Self, EvalError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EvalError::Initialization {
                id: adapter_id.to_string(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        let token = config.resolve_token();

        Ok(Self {
            config,
            token,
            client,
        })
    }

    /// Error for a failed call against this binding's endpoint
    pub fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Backend {
            endpoint: self.config.uri.clone(),
            message: message.into(),
        }
    }

    pub fn transport_error(&self, e: reqwest::Error) -> EvalError {
        if e.is_timeout() {
            self.error(format!(
                "request timed out after {}s",
                self.config.timeout_secs
            ))
        } else {
            self.error(e.to_string())
        }
    }

    pub fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Binding slot shared by a connector's concurrent calls
///
/// Each call takes a snapshot; `configure` swaps the slot for later calls.
#[derive(Default)]
pub(crate) struct BindingSlot {
    inner: RwLock<Option<Arc<BackendBinding>>>,
}

impl BindingSlot {
    pub fn replace(&self, binding: BackendBinding) {
        *self.inner.write() = Some(Arc::new(binding));
    }

    pub fn current(&self, adapter_id: &str) -> Result<Arc<BackendBinding>, EvalError> {
        self.inner
            .read()
            .clone()
            .ok_or_else(|| EvalError::NotConfigured(adapter_id.to_string()))
    }

    pub fn config(&self) -> Option<ConnectorConfig> {
        self.inner.read().as_ref().map(|b| b.config.clone())
    }
}

/// Non-success responses become backend errors carrying status and body
pub(crate) async fn check_status(
    binding: &BackendBinding,
    response: reqwest::Response,
) -> Result<reqwest::Response, EvalError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(binding.error(format!("HTTP {}: {}", status, body)))
}
