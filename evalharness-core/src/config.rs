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

//! Configuration for metrics, connectors and batch runs
//!
//! Configuration is read from a TOML document. Each metric lives under
//! `[metrics.<id>]` and may carry one connector configuration:
//!
//! ```toml
//! [runner]
//! max_concurrent = 8
//!
//! [metrics.llmjudge]
//! params = { judge_models = ["judge-a", "judge-b"] }
//!
//! [metrics.llmjudge.connector_configurations]
//! connector_adapter = "openai-connector"
//! model = "judge-a"
//! uri = "http://localhost:8000/v1"
//! token_env = "JUDGE_API_KEY"
//! ```

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Default timeout applied to every outbound connector call
pub const DEFAULT_CONNECTOR_TIMEOUT_SECS: u64 = 30;

/// Source of metric configurations, looked up by metric id
pub trait ConfigStore: Send + Sync {
    /// Fetch the configuration of a metric
    fn metric_config(&self, metric_id: &str) -> CoreResult<MetricConfig>;

    /// Ids of every configured metric
    fn metric_ids(&self) -> Vec<String>;
}

/// Identifies a connector adapter and the backend it talks to
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorConfig {
    /// Registry id of the connector adapter (e.g. "openai-connector")
    pub connector_adapter: String,

    /// Backend model identifier
    #[serde(default)]
    pub model: String,

    /// Backend endpoint
    #[serde(default)]
    pub uri: String,

    /// Inline credential. Prefer `token_env` outside of tests.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,

    /// Name of the environment variable holding the credential
    #[serde(default)]
    pub token_env: Option<String>,

    /// Timeout for a single backend call
    #[serde(default = "default_connector_timeout")]
    pub timeout_secs: u64,

    /// Backend-specific parameters (sampling parameters, system prompt, ...)
    #[serde(default)]
    pub params: Map<String, Value>,
}

fn default_connector_timeout() -> u64 {
    DEFAULT_CONNECTOR_TIMEOUT_SECS
}

impl ConnectorConfig {
    pub fn new(connector_adapter: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            connector_adapter: connector_adapter.into(),
            model: model.into(),
            uri: String::new(),
            token: None,
            token_env: None,
            timeout_secs: DEFAULT_CONNECTOR_TIMEOUT_SECS,
            params: Map::new(),
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Copy of this configuration pointing at another model of the same backend
    pub fn for_model(&self, model: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.model = model.into();
        config
    }

    /// Credential to present to the backend, if any
    ///
    /// An inline token wins over `token_env`.
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(token) = &self.token {
            return Some(token.clone());
        }
        let var = self.token_env.as_ref()?;
        match std::env::var(var) {
            Ok(token) if !token.is_empty() => Some(token),
            _ => {
                tracing::warn!(
                    "Environment variable {} for connector '{}' is not set",
                    var,
                    self.connector_adapter
                );
                None
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

// Hand-written so credentials never reach the logs.
impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("connector_adapter", &self.connector_adapter)
            .field("model", &self.model)
            .field("uri", &self.uri)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_env", &self.token_env)
            .field("timeout_secs", &self.timeout_secs)
            .field("params", &self.params)
            .finish()
    }
}

/// Configuration of one metric adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricConfig {
    /// Metric id. Filled from the table key when loaded from TOML.
    #[serde(default)]
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Connector backing the metric, if it needs one
    #[serde(default)]
    pub connector_configurations: Option<ConnectorConfig>,

    /// Metric-specific parameters
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl MetricConfig {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ..Default::default()
        }
    }

    pub fn with_connector(mut self, connector: ConnectorConfig) -> Self {
        self.connector_configurations = Some(connector);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Settings for the batch runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerSettings {
    /// Maximum number of records evaluated at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Timeout for one record evaluation in seconds
    #[serde(default = "default_record_timeout")]
    pub timeout_secs: u64,

    /// Whether to cache per-record results
    #[serde(default)]
    pub enable_cache: bool,

    /// Cache TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_record_timeout() -> u64 {
    60
}

fn default_cache_ttl() -> u64 {
    3600
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_record_timeout(),
            enable_cache: false,
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

/// Top-level harness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub metrics: BTreeMap<String, MetricConfig>,
}

impl HarnessConfig {
    /// Load configuration from a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let mut config: HarnessConfig = toml::from_str(content)?;
        for (id, metric) in config.metrics.iter_mut() {
            if metric.id.is_empty() {
                metric.id = id.clone();
            }
            if metric.name.is_empty() {
                metric.name = id.clone();
            }
        }
        Ok(config)
    }

    /// Add or replace a metric configuration
    pub fn insert_metric(&mut self, config: MetricConfig) {
        self.metrics.insert(config.id.clone(), config);
    }

    pub fn with_metric(mut self, config: MetricConfig) -> Self {
        self.insert_metric(config);
        self
    }
}

impl ConfigStore for HarnessConfig {
    fn metric_config(&self, metric_id: &str) -> CoreResult<MetricConfig> {
        self.metrics
            .get(metric_id)
            .cloned()
            .ok_or_else(|| CoreError::ConfigNotFound(metric_id.to_string()))
    }

    fn metric_ids(&self) -> Vec<String> {
        self.metrics.keys().cloned().collect()
    }
}
