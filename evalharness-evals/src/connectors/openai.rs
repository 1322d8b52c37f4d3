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

//! Connector for OpenAI-compatible chat-completion and embedding APIs

use super::{check_status, BackendBinding, BindingSlot};
use crate::{Connector, EvalError};
use async_trait::async_trait;
use evalharness_core::{ChatMessage, ConnectorConfig, ConnectorResponse, Prompt};
use serde_json::{json, Map, Value};
use tracing::{debug, error};

/// Config params forwarded verbatim to `/chat/completions`
const SAMPLING_PARAMS: &[&str] = &[
    "temperature",
    "top_p",
    "max_tokens",
    "seed",
    "stop",
    "presence_penalty",
    "frequency_penalty",
];

pub struct OpenAIConnector {
    binding: BindingSlot,
}

impl OpenAIConnector {
    pub const ADAPTER_ID: &'static str = "openai-connector";

    pub fn new() -> Self {
        Self {
            binding: BindingSlot::default(),
        }
    }

    fn endpoint(config: &ConnectorConfig, path: &str) -> String {
        format!("{}/{}", config.uri.trim_end_matches('/'), path)
    }

    fn build_messages(config: &ConnectorConfig, prompt: &Prompt) -> Vec<ChatMessage> {
        match prompt {
            Prompt::Chat(messages) => messages.clone(),
            Prompt::Text(text) => {
                let mut messages = Vec::with_capacity(2);
                if let Some(system) = config.param_str("system_prompt") {
                    messages.push(ChatMessage::system(system));
                }
                messages.push(ChatMessage::user(text.clone()));
                messages
            }
        }
    }

    fn build_request(config: &ConnectorConfig, prompt: &Prompt) -> Value {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(config.model));
        body.insert(
            "messages".to_string(),
            json!(Self::build_messages(config, prompt)),
        );

        for key in SAMPLING_PARAMS {
            if let Some(value) = config.params.get(*key) {
                body.insert(key.to_string(), value.clone());
            }
        }

        // "json_object" shorthand or a full response_format object
        match config.params.get("response_format") {
            Some(Value::String(kind)) => {
                body.insert("response_format".to_string(), json!({ "type": kind }));
            }
            Some(format @ Value::Object(_)) => {
                body.insert("response_format".to_string(), format.clone());
            }
            _ => {}
        }

        Value::Object(body)
    }

    async fn complete(
        &self,
        binding: &BackendBinding,
        prompt: &Prompt,
    ) -> Result<ConnectorResponse, EvalError> {
        let config = &binding.config;
        let request = Self::build_request(config, prompt);

        let response = binding
            .authorize(
                binding
                    .client
                    .post(Self::endpoint(config, "chat/completions"))
                    .json(&request),
            )
            .send()
            .await
            .map_err(|e| binding.transport_error(e))?;
        let response = check_status(binding, response).await?;

        let response_data: Value = response
            .json()
            .await
            .map_err(|e| binding.error(format!("invalid JSON body: {}", e)))?;

        let content = response_data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| binding.error("missing choices[0].message.content"))?;

        let model = response_data["model"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| config.model.clone());

        Ok(ConnectorResponse::new(content).with_model(model))
    }

    async fn embed_batch(
        &self,
        binding: &BackendBinding,
        texts: &[String],
    ) -> Result<Vec<Vec<f64>>, EvalError> {
        let config = &binding.config;
        let embedding_model = config
            .param_str("embedding_model")
            .unwrap_or(config.model.as_str());

        let request = json!({
            "model": embedding_model,
            "input": texts,
        });

        let response = binding
            .authorize(
                binding
                    .client
                    .post(Self::endpoint(config, "embeddings"))
                    .json(&request),
            )
            .send()
            .await
            .map_err(|e| binding.transport_error(e))?;
        let response = check_status(binding, response).await?;

        let response_data: Value = response
            .json()
            .await
            .map_err(|e| binding.error(format!("invalid JSON body: {}", e)))?;

        let embeddings: Vec<Vec<f64>> = response_data["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["embedding"].as_array())
                    .map(|vector| vector.iter().filter_map(Value::as_f64).collect())
                    .collect()
            })
            .unwrap_or_default();

        if embeddings.len() != texts.len() {
            return Err(binding.error(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }
}

impl Default for OpenAIConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for OpenAIConnector {
    fn adapter_id(&self) -> &str {
        Self::ADAPTER_ID
    }

    fn configure(&self, config: ConnectorConfig) -> Result<(), EvalError> {
        debug!(
            "[OpenAIConnector] Configuring model '{}' at {}",
            config.model, config.uri
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
        self.complete(&binding, prompt).await.map_err(|e| {
            error!(
                "[OpenAIConnector] Chat completion failed (endpoint {}, model '{}'): {}",
                binding.config.uri, binding.config.model, e
            );
            e
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EvalError> {
        let binding = self.binding.current(Self::ADAPTER_ID)?;
        self.embed_batch(&binding, texts).await.map_err(|e| {
            error!(
                "[OpenAIConnector] Embedding request failed (endpoint {}, model '{}'): {}",
                binding.config.uri, binding.config.model, e
            );
            e
        })
    }
}
