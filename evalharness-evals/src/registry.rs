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

//! Adapter registry and loader
//!
//! Resolves a symbolic adapter id plus a capability kind to a ready-to-use
//! instance. Factories are registered up front (see
//! [`AdapterRegistry::with_builtin_adapters`]) and more can be added at
//! runtime, so a new metric or connector never requires touching this module.

use crate::connectors::{HttpConnector, OpenAIConnector};
use crate::metrics::{BertScore, LLMJudge, RougeMetric};
use crate::{Connector, ConnectorMap, EvalError, Metric};
use evalharness_core::{ConfigStore, MetricConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Capability an adapter provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Metric,
    Connector,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::Metric => f.pad("metric"),
            AdapterKind::Connector => f.pad("connector"),
        }
    }
}

type MetricFactory =
    Arc<dyn Fn(&LoadContext<'_>) -> Result<Arc<dyn Metric>, EvalError> + Send + Sync>;
type ConnectorFactory =
    Arc<dyn Fn(&LoadContext<'_>) -> Result<Arc<dyn Connector>, EvalError> + Send + Sync>;

#[derive(Clone)]
enum Factory {
    Metric(MetricFactory),
    Connector(ConnectorFactory),
}

fn metric_factory<F>(factory: F) -> Factory
where
    F: Fn(&LoadContext<'_>) -> Result<Arc<dyn Metric>, EvalError> + Send + Sync + 'static,
{
    Factory::Metric(Arc::new(factory))
}

fn connector_factory<F>(factory: F) -> Factory
where
    F: Fn(&LoadContext<'_>) -> Result<Arc<dyn Connector>, EvalError> + Send + Sync + 'static,
{
    Factory::Connector(Arc::new(factory))
}

#[derive(Clone)]
struct AdapterEntry {
    description: String,
    factory: Factory,
}

/// What a factory can reach while building an adapter
pub struct LoadContext<'a> {
    registry: &'a AdapterRegistry,
    configs: &'a dyn ConfigStore,
}

impl<'a> LoadContext<'a> {
    /// Registry, for metrics that load their own connectors
    pub fn registry(&self) -> &'a AdapterRegistry {
        self.registry
    }

    pub fn configs(&self) -> &'a dyn ConfigStore {
        self.configs
    }

    /// Look up the configuration of a metric by id
    pub fn metric_config(&self, metric_id: &str) -> Result<MetricConfig, EvalError> {
        Ok(self.configs.metric_config(metric_id)?)
    }
}

/// A freshly loaded adapter instance
pub enum LoadedAdapter {
    Metric(Arc<dyn Metric>),
    Connector(Arc<dyn Connector>),
}

impl LoadedAdapter {
    pub fn kind(&self) -> AdapterKind {
        match self {
            LoadedAdapter::Metric(_) => AdapterKind::Metric,
            LoadedAdapter::Connector(_) => AdapterKind::Connector,
        }
    }

    pub fn into_metric(self) -> Option<Arc<dyn Metric>> {
        match self {
            LoadedAdapter::Metric(metric) => Some(metric),
            LoadedAdapter::Connector(_) => None,
        }
    }

    pub fn into_connector(self) -> Option<Arc<dyn Connector>> {
        match self {
            LoadedAdapter::Connector(connector) => Some(connector),
            LoadedAdapter::Metric(_) => None,
        }
    }
}

/// Identity of a registered adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHandle {
    pub id: String,
    pub kind: AdapterKind,
    pub description: String,
}

/// Registry mapping (kind, id) to adapter factories
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<(AdapterKind, String), AdapterEntry>>,
    configs: Arc<dyn ConfigStore>,
}

impl AdapterRegistry {
    /// Create an empty registry backed by `configs`
    pub fn new(configs: Arc<dyn ConfigStore>) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            configs,
        }
    }

    /// Create a registry holding every built-in metric and connector
    pub fn with_builtin_adapters(configs: Arc<dyn ConfigStore>) -> Self {
        let registry = Self::new(configs);

        registry.insert(
            AdapterKind::Metric,
            BertScore::ID,
            "Embedding similarity (precision, recall, F1) against the target",
            metric_factory(|ctx| Ok(Arc::new(BertScore::load(ctx)?))),
        );
        registry.insert(
            AdapterKind::Metric,
            LLMJudge::ID,
            "Ensemble of LLM judges scoring the response against the target",
            metric_factory(|ctx| Ok(Arc::new(LLMJudge::load(ctx)?))),
        );
        registry.insert(
            AdapterKind::Metric,
            RougeMetric::ID,
            "ROUGE-1 and ROUGE-L overlap against the target",
            metric_factory(|ctx| Ok(Arc::new(RougeMetric::load(ctx)?))),
        );
        registry.insert(
            AdapterKind::Connector,
            OpenAIConnector::ADAPTER_ID,
            "OpenAI-compatible chat completions and embeddings endpoint",
            connector_factory(|_| Ok(Arc::new(OpenAIConnector::new()))),
        );
        registry.insert(
            AdapterKind::Connector,
            HttpConnector::ADAPTER_ID,
            "JSON endpoint taking {\"message\"} and answering {\"data\"}",
            connector_factory(|_| Ok(Arc::new(HttpConnector::new()))),
        );

        registry
    }

    fn insert(&self, kind: AdapterKind, id: &str, description: &str, factory: Factory) {
        self.adapters.write().insert(
            (kind, id.to_string()),
            AdapterEntry {
                description: description.to_string(),
                factory,
            },
        );
    }

    fn register(
        &self,
        kind: AdapterKind,
        id: &str,
        description: &str,
        factory: Factory,
    ) -> Result<(), EvalError> {
        let mut adapters = self.adapters.write();
        let key = (kind, id.to_string());
        if adapters.contains_key(&key) {
            return Err(EvalError::DuplicateAdapter {
                kind,
                id: id.to_string(),
            });
        }

        info!("[AdapterRegistry] Registering {} adapter: {}", kind, id);
        adapters.insert(
            key,
            AdapterEntry {
                description: description.to_string(),
                factory,
            },
        );
        Ok(())
    }

    /// Register a metric factory under `id`
    pub fn register_metric<F>(&self, id: &str, description: &str, factory: F) -> Result<(), EvalError>
    where
        F: Fn(&LoadContext<'_>) -> Result<Arc<dyn Metric>, EvalError> + Send + Sync + 'static,
    {
        self.register(AdapterKind::Metric, id, description, metric_factory(factory))
    }

    /// Register a connector factory under `id`
    pub fn register_connector<F>(
        &self,
        id: &str,
        description: &str,
        factory: F,
    ) -> Result<(), EvalError>
    where
        F: Fn(&LoadContext<'_>) -> Result<Arc<dyn Connector>, EvalError> + Send + Sync + 'static,
    {
        self.register(
            AdapterKind::Connector,
            id,
            description,
            connector_factory(factory),
        )
    }

    /// Remove an adapter
    pub fn unregister(&self, kind: AdapterKind, id: &str) -> Result<(), EvalError> {
        self.adapters
            .write()
            .remove(&(kind, id.to_string()))
            .map(|_| info!("[AdapterRegistry] Unregistered {} adapter: {}", kind, id))
            .ok_or_else(|| EvalError::NotFound {
                kind,
                id: id.to_string(),
            })
    }

    pub fn contains(&self, kind: AdapterKind, id: &str) -> bool {
        self.adapters.read().contains_key(&(kind, id.to_string()))
    }

    /// Registered adapters of `kind`, sorted by id
    pub fn list(&self, kind: AdapterKind) -> Vec<AdapterHandle> {
        let adapters = self.adapters.read();
        let mut handles: Vec<AdapterHandle> = adapters
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((k, id), entry)| AdapterHandle {
                id: id.clone(),
                kind: *k,
                description: entry.description.clone(),
            })
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    pub fn configs(&self) -> &Arc<dyn ConfigStore> {
        &self.configs
    }

    /// Resolve `id` to a new adapter instance of `kind`
    pub fn load(
        &self,
        id: &str,
        kind: AdapterKind,
    ) -> Result<(LoadedAdapter, AdapterHandle), EvalError> {
        // Factories may call back into the registry, so the lock is released first.
        let entry = {
            let adapters = self.adapters.read();
            adapters.get(&(kind, id.to_string())).cloned()
        }
        .ok_or_else(|| EvalError::NotFound {
            kind,
            id: id.to_string(),
        })?;

        let ctx = LoadContext {
            registry: self,
            configs: self.configs.as_ref(),
        };

        let loaded = match &entry.factory {
            Factory::Metric(factory) => factory(&ctx).map(LoadedAdapter::Metric),
            Factory::Connector(factory) => factory(&ctx).map(LoadedAdapter::Connector),
        }
        .map_err(|e| {
            error!(
                "[AdapterRegistry] Failed to load {} adapter '{}': {}",
                kind, id, e
            );
            match e {
                EvalError::ConfigNotFound(_)
                | EvalError::ConnectorLoad { .. }
                | EvalError::Initialization { .. } => e,
                other => EvalError::Initialization {
                    id: id.to_string(),
                    reason: other.to_string(),
                },
            }
        })?;

        let handle = AdapterHandle {
            id: id.to_string(),
            kind,
            description: entry.description,
        };
        Ok((loaded, handle))
    }

    /// Load a metric by id
    pub fn load_metric(&self, id: &str) -> Result<Arc<dyn Metric>, EvalError> {
        let (adapter, _) = self.load(id, AdapterKind::Metric)?;
        adapter.into_metric().ok_or_else(|| EvalError::NotFound {
            kind: AdapterKind::Metric,
            id: id.to_string(),
        })
    }

    /// Load an unconfigured connector by id
    pub fn load_connector(&self, id: &str) -> Result<Arc<dyn Connector>, EvalError> {
        let (adapter, _) = self.load(id, AdapterKind::Connector)?;
        adapter.into_connector().ok_or_else(|| EvalError::NotFound {
            kind: AdapterKind::Connector,
            id: id.to_string(),
        })
    }
}

/// Load and configure the connector of a single-connector metric
///
/// Returns an empty map when the metric has no connector configuration.
pub fn load_metric_connectors(
    metric_id: &str,
    registry: &AdapterRegistry,
    config: &MetricConfig,
) -> Result<ConnectorMap, EvalError> {
    let mut connectors = ConnectorMap::new();

    let Some(connector_config) = config
        .connector_configurations
        .as_ref()
        .filter(|c| !c.connector_adapter.is_empty())
    else {
        return Ok(connectors);
    };

    info!(
        "[{}] Loading connector with model '{}' and adapter '{}'",
        metric_id, connector_config.model, connector_config.connector_adapter
    );

    let connector = configure_connector(registry, connector_config.clone()).map_err(|e| {
        error!(
            "[{}] There was an error retrieving metric connectors: {}",
            metric_id, e
        );
        e
    })?;
    connectors.insert("metric".to_string(), connector);

    info!("[{}] Successfully loaded all metric connectors.", metric_id);
    Ok(connectors)
}

/// Load a connector through the registry and bind `config` to it
pub(crate) fn configure_connector(
    registry: &AdapterRegistry,
    config: evalharness_core::ConnectorConfig,
) -> Result<Arc<dyn Connector>, EvalError> {
    let adapter = config.connector_adapter.clone();
    let connector = registry
        .load_connector(&adapter)
        .map_err(|e| EvalError::ConnectorLoad {
            adapter: adapter.clone(),
            reason: e.to_string(),
        })?;
    connector
        .configure(config)
        .map_err(|e| EvalError::ConnectorLoad {
            adapter,
            reason: e.to_string(),
        })?;
    Ok(connector)
}
