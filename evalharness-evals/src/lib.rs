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

//! # Evalharness Evaluation Engine
//!
//! A pluggable engine for scoring language-model outputs against reference
//! answers.
//!
//! ## Features
//!
//! - **Trait-based adapters**: every metric implements [`Metric`], every
//!   backend implements [`Connector`]
//! - **Adapter registry**: metrics and connectors are resolved by symbolic id
//! - **Built-in metrics**: LLM-as-judge ensemble, BERTScore-style embedding
//!   similarity, ROUGE
//! - **Batch runner**: bounded parallel evaluation with per-record isolation
//!
//! ## Example
//!
//! ```rust,ignore
//! use evalharness_core::{EvaluationRecord, HarnessConfig};
//! use evalharness_evals::{AdapterRegistry, BatchRunner};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = HarnessConfig::from_path("harness.toml").unwrap();
//!     let runner = BatchRunner::new(config.runner.clone());
//!     let registry = AdapterRegistry::with_builtin_adapters(Arc::new(config));
//!
//!     let metric = registry.load_metric("llmjudge").unwrap();
//!     let records = vec![EvaluationRecord::new("2+2?", "4", "four")];
//!     let report = runner.run(metric, records).await.unwrap();
//!     println!("{}", serde_json::to_string_pretty(&report.aggregate).unwrap());
//! }
//! ```

use async_trait::async_trait;
use evalharness_core::{
    AggregateResult, ConnectorConfig, ConnectorResponse, CoreError, EvaluationDetail,
    EvaluationRecord, MetricConfig, Prompt,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub mod aggregate;
pub mod cache;
pub mod connectors;
pub mod metrics;
pub mod registry;
pub mod runner;

pub use cache::{CacheKey, CacheStats, EvalCache};
pub use connectors::{HttpConnector, OpenAIConnector};
pub use evalharness_core::RunnerSettings as EvalConfig;
pub use metrics::{BertScore, LLMJudge, RougeMetric};
pub use registry::{AdapterHandle, AdapterKind, AdapterRegistry, LoadContext, LoadedAdapter};
pub use runner::{BatchReport, BatchRunner, RecordFailure};

/// Connectors owned by a metric, keyed by logical name
pub type ConnectorMap = BTreeMap<String, Arc<dyn Connector>>;

/// Contract every backend adapter implements
#[async_trait]
pub trait Connector: Send + Sync {
    /// Registry id of this adapter (e.g. "openai-connector")
    fn adapter_id(&self) -> &str;

    /// Bind backend identity and credentials
    ///
    /// Calling again replaces the binding for subsequent calls; calls already
    /// in flight finish against the previous binding.
    fn configure(&self, config: ConnectorConfig) -> Result<(), EvalError>;

    /// Configuration currently bound, if any
    fn current_config(&self) -> Option<ConnectorConfig>;

    /// Issue one backend call and return the extracted response text
    async fn get_response(&self, prompt: &Prompt) -> Result<ConnectorResponse, EvalError>;

    /// Embed a batch of texts
    ///
    /// Only backends serving embeddings override this.
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f64>>, EvalError> {
        Err(EvalError::Backend {
            endpoint: self.adapter_id().to_string(),
            message: "embeddings are not supported by this connector".to_string(),
        })
    }
}

/// Contract every metric adapter implements
#[async_trait]
pub trait Metric: Send + Sync {
    /// Metric id, also the key of its configuration and of its aggregate
    fn id(&self) -> &str;

    /// Load and configure the connectors named by `config`
    ///
    /// The default loads the single connector configuration under the name
    /// `"metric"`, or nothing when the metric has no connector.
    fn get_metric_connectors(
        &self,
        registry: &AdapterRegistry,
        config: &MetricConfig,
    ) -> Result<ConnectorMap, EvalError> {
        registry::load_metric_connectors(self.id(), registry, config)
    }

    /// Merge parameter overrides into the runtime parameters
    fn update_metric_params(&self, params: Map<String, Value>);

    /// Runtime parameters that shape the per-record result
    ///
    /// Part of the cache key, so metrics reading params must report them.
    fn params_snapshot(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Score one record
    async fn get_individual_result(
        &self,
        record: &EvaluationRecord,
    ) -> Result<EvaluationDetail, EvalError>;

    /// Reduce the evaluated results of a batch into one summary
    async fn get_results(&self, records: &[EvaluationRecord]) -> Result<AggregateResult, EvalError>;

    /// Score `record` and attach the detail to it
    async fn evaluate_record(&self, record: &mut EvaluationRecord) -> Result<(), EvalError> {
        let detail = self.get_individual_result(record).await?;
        record.attach_result(detail)?;
        Ok(())
    }
}

/// Errors that can occur while loading adapters or evaluating
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Metric configuration not found: {0}")]
    ConfigNotFound(String),

    #[error("Failed to load connector '{adapter}': {reason}")]
    ConnectorLoad { adapter: String, reason: String },

    #[error("No {kind} adapter registered under '{id}'")]
    NotFound { kind: AdapterKind, id: String },

    #[error("A {kind} adapter is already registered under '{id}'")]
    DuplicateAdapter { kind: AdapterKind, id: String },

    #[error("Failed to initialize '{id}': {reason}")]
    Initialization { id: String, reason: String },

    #[error("Connector '{0}' has not been configured")]
    NotConfigured(String),

    #[error("Backend error from {endpoint}: {message}")]
    Backend { endpoint: String, message: String },

    #[error("Invalid judge output: {0}")]
    Parse(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Aggregation error: {0}")]
    Aggregation(String),

    #[error("Evaluation timeout")]
    Timeout,

    #[error(transparent)]
    Core(CoreError),
}

impl From<CoreError> for EvalError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::ConfigNotFound(id) => EvalError::ConfigNotFound(id),
            other => EvalError::Core(other),
        }
    }
}

/// Merge `overrides` into `params`, replacing existing keys
pub(crate) fn merge_params(params: &mut Map<String, Value>, overrides: Map<String, Value>) {
    for (key, value) in overrides {
        params.insert(key, value);
    }
}
