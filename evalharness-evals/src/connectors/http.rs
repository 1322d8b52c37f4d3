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

//! Connector for applications exposing a plain JSON conversation endpoint
//!
//! Sends `{"message": <prompt>}` and expects `{"data": <response text>}`.

use super::{check_status, BackendBinding, BindingSlot};
use crate::{Connector, EvalError};
use async_trait::async_trait;
use evalharness_core::{ConnectorConfig, ConnectorResponse, Prompt};
use serde_json::{json, Value};
use tracing::{debug, error};

pub struct HttpConnector {
    binding: BindingSlot,
}

impl HttpConnector {
    pub const ADAPTER_ID: &'static str = "http-connector";

    pub fn new() -> Self {
        Self {
            binding: BindingSlot::default(),
        }
    }

    async fn send(
        &self,
        binding: &BackendBinding,
        prompt: &Prompt,
    ) -> Result<ConnectorResponse, EvalError> {
        let body = json!({ "message": prompt.to_text() });

        let request = binding.authorize(binding.client.post(&binding.config.uri).json(&body));
        let response = request
            .send()
            .await
            .map_err(|e| binding.transport_error(e))?;
        let response = check_status(binding, response).await?;

        let data: Value = response
            .json()
            .await
            .map_err(|e| binding.error(format!("invalid JSON body: {}", e)))?;

        let text = data
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| binding.error("response is missing string field 'data'"))?;

        let mut response = ConnectorResponse::new(text);
        if !binding.config.model.is_empty() {
            response = response.with_model(binding.config.model.clone());
        }
        Ok(response)
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn adapter_id(&self) -> &str {
        Self::ADAPTER_ID
    }

    fn configure(&self, config: ConnectorConfig) -> Result<(), EvalError> {
        debug!(
            "[HttpConnector] Configuring endpoint {} (model '{}')",
            config.uri, config.model
        );
        self.binding
            .replace(BackendBinding::new(Self::ADAPTER_ID, config)?);
        Ok(())
    }

    fn current_config(&self) -> Option<ConnectorConfig> {
        self.binding.config()
    }

    async fn get_response(&self, prompt: &Prompt) -> Result<ConnectorResponse, EvalError> {
        let binding = self.binding.current(Self::ADAPTER_ID)?;
        self.send(&binding, prompt).await.map_err(|e| {
            error!(
                "[HttpConnector] Failed to process prompt (endpoint {}, model '{}'): {}",
                binding.config.uri, binding.config.model, e
            );
            e
        })
    }
}
