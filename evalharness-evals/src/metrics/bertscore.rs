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

//! BERTScore-style embedding similarity
//!
//! Precision is the mean, over candidate tokens, of the best cosine match in
//! the reference; recall is the symmetric quantity. The scorer behind the
//! metric is built on first use and shared by every later evaluation.

use super::{f1_score, record_detail, tokenize};
use crate::aggregate::mean_at;
use crate::registry::{AdapterRegistry, LoadContext};
use crate::{Connector, ConnectorMap, EvalError, Metric};
use async_trait::async_trait;
use evalharness_core::{AggregateResult, EvaluationDetail, EvaluationRecord, MetricConfig};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Precision, recall and F1 of one candidate against one reference
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SimilarityScore {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Scores a candidate text against a reference text
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    async fn score(&self, candidate: &str, reference: &str) -> Result<SimilarityScore, EvalError>;
}

/// Builds the scorer from the metric's connectors on first use
pub type ScorerFactory =
    Box<dyn Fn(&ConnectorMap) -> Result<Arc<dyn SimilarityScorer>, EvalError> + Send + Sync>;

/// Box a closure as a [`ScorerFactory`]
pub fn scorer_factory<F>(factory: F) -> ScorerFactory
where
    F: Fn(&ConnectorMap) -> Result<Arc<dyn SimilarityScorer>, EvalError> + Send + Sync + 'static,
{
    Box::new(factory)
}

/// Greedy cosine matching over token embeddings from a connector
pub struct EmbeddingSimilarityScorer {
    connector: Arc<dyn Connector>,
}

impl EmbeddingSimilarityScorer {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl SimilarityScorer for EmbeddingSimilarityScorer {
    async fn score(&self, candidate: &str, reference: &str) -> Result<SimilarityScore, EvalError> {
        let cand_tokens = tokenize(candidate);
        let ref_tokens = tokenize(reference);

        if cand_tokens.is_empty() || ref_tokens.is_empty() {
            return Ok(SimilarityScore::default());
        }

        let cand_embeddings = self.connector.embed(&cand_tokens).await?;
        let ref_embeddings = self.connector.embed(&ref_tokens).await?;

        Ok(greedy_match(&cand_embeddings, &ref_embeddings))
    }
}

fn greedy_match(candidate: &[Vec<f64>], reference: &[Vec<f64>]) -> SimilarityScore {
    if candidate.is_empty() || reference.is_empty() {
        return SimilarityScore::default();
    }

    let best_mean = |from: &[Vec<f64>], to: &[Vec<f64>]| {
        from.iter()
            .map(|a| {
                to.iter()
                    .map(|b| cosine_similarity(a, b))
                    .fold(f64::NEG_INFINITY, f64::max)
            })
            .sum::<f64>()
            / from.len() as f64
    };

    let precision = best_mean(candidate, reference);
    let recall = best_mean(reference, candidate);

    SimilarityScore {
        precision,
        recall,
        f1: f1_score(precision, recall),
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();

    if norm_a < 1e-10 || norm_b < 1e-10 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

fn embedding_scorer(connectors: &ConnectorMap) -> Result<Arc<dyn SimilarityScorer>, EvalError> {
    let connector = connectors
        .get("metric")
        .cloned()
        .ok_or_else(|| EvalError::Initialization {
            id: BertScore::ID.to_string(),
            reason: "no metric connector available for embeddings".to_string(),
        })?;
    Ok(Arc::new(EmbeddingSimilarityScorer::new(connector)))
}

/// Embedding-similarity metric
///
/// Takes no runtime params: overrides passed to `update_metric_params` are
/// logged and dropped.
pub struct BertScore {
    config: MetricConfig,
    connectors: ConnectorMap,
    build_scorer: ScorerFactory,
    scorer: OnceCell<Arc<dyn SimilarityScorer>>,
}

impl BertScore {
    pub const ID: &'static str = "bertscore";

    pub fn load(ctx: &LoadContext<'_>) -> Result<Self, EvalError> {
        let config = ctx.metric_config(Self::ID)?;
        Self::from_config(ctx.registry(), config)
    }

    /// Build the metric and its connectors; the scorer waits for first use
    pub fn from_config(registry: &AdapterRegistry, config: MetricConfig) -> Result<Self, EvalError> {
        let mut metric = Self::with_scorer_factory(config, Box::new(embedding_scorer));
        metric.connectors = metric
            .get_metric_connectors(registry, &metric.config)
            .map_err(|e| {
                error!(
                    "[BertScore] There was an error initializing the BertScore: {}",
                    e
                );
                e
            })?;
        Ok(metric)
    }

    /// Metric without connectors whose scorer comes from `factory`
    pub fn with_scorer_factory(config: MetricConfig, factory: ScorerFactory) -> Self {
        Self {
            config,
            connectors: ConnectorMap::new(),
            build_scorer: factory,
            scorer: OnceCell::new(),
        }
    }

    pub fn connectors(&self) -> &ConnectorMap {
        &self.connectors
    }

    async fn scorer(&self) -> Result<&Arc<dyn SimilarityScorer>, EvalError> {
        self.scorer
            .get_or_try_init(|| async {
                info!("[BertScore] Initializing similarity scorer");
                (self.build_scorer)(&self.connectors)
            })
            .await
    }
}

#[async_trait]
impl Metric for BertScore {
    fn id(&self) -> &str {
        Self::ID
    }

    fn update_metric_params(&self, params: Map<String, Value>) {
        if !params.is_empty() {
            debug!(
                "[BertScore] Ignoring params, none are read: {:?}",
                params.keys().collect::<Vec<_>>()
            );
        }
    }

    async fn get_individual_result(
        &self,
        record: &EvaluationRecord,
    ) -> Result<EvaluationDetail, EvalError> {
        let scorer = self.scorer().await.map_err(|e| {
            error!("[BertScore] There was an error initializing the scorer: {}", e);
            e
        })?;

        let score = scorer
            .score(&record.predicted_response, &record.target)
            .await
            .map_err(|e| {
                error!(
                    "[BertScore] There was an error evaluating the individual result: {}",
                    e
                );
                EvalError::Evaluation(e.to_string())
            })?;

        let mut detail = record_detail(record);
        detail.insert("bertscore".to_string(), json!(score));
        Ok(detail)
    }

    async fn get_results(&self, records: &[EvaluationRecord]) -> Result<AggregateResult, EvalError> {
        let mut result = AggregateResult::new();
        result.insert(
            Self::ID.to_string(),
            json!({ "f1": mean_at("BertScore", records, &["bertscore", "f1"]) }),
        );
        Ok(result)
    }
}
