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

//! Built-in metrics

pub mod bertscore;
pub mod llmjudge;
pub mod rouge;

pub use bertscore::{
    scorer_factory, BertScore, EmbeddingSimilarityScorer, ScorerFactory, SimilarityScore,
    SimilarityScorer,
};
pub use llmjudge::{JudgeVerdict, LLMJudge};
pub use rouge::{RougeMetric, RougeScore};

use evalharness_core::{EvaluationDetail, EvaluationRecord};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::debug;

/// Tokenize text into lowercase words with punctuation trimmed from both ends
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    tokenize_with(text, false)
}

/// Like [`tokenize`], keeping letter case when `case_sensitive` is set
pub(crate) fn tokenize_with(text: &str, case_sensitive: bool) -> Vec<String> {
    text.split_whitespace()
        .map(|s| s.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|s| !s.is_empty())
        .map(|s| {
            if case_sensitive {
                s.to_string()
            } else {
                s.to_lowercase()
            }
        })
        .collect()
}

/// Detail fields every built-in metric reports
pub(crate) fn record_detail(record: &EvaluationRecord) -> EvaluationDetail {
    let mut detail = EvaluationDetail::new();
    detail.insert("prompt".to_string(), json!(record.prompt));
    detail.insert(
        "predicted_value".to_string(),
        json!(record.predicted_response),
    );
    detail.insert("target".to_string(), json!(record.target));
    detail
}

/// Harmonic mean of precision and recall
pub(crate) fn f1_score(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

/// Runtime parameters shared by concurrent evaluations
pub(crate) struct MetricParams {
    metric_id: &'static str,
    inner: RwLock<Map<String, Value>>,
}

impl MetricParams {
    pub fn new(metric_id: &'static str, initial: Map<String, Value>) -> Self {
        Self {
            metric_id,
            inner: RwLock::new(initial),
        }
    }

    pub fn merge(&self, overrides: Map<String, Value>) {
        if overrides.is_empty() {
            return;
        }
        debug!(
            "[{}] Updating metric params: {:?}",
            self.metric_id,
            overrides.keys().collect::<Vec<_>>()
        );
        crate::merge_params(&mut self.inner.write(), overrides);
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.inner.read().get(key).and_then(Value::as_bool)
    }

    /// Copy of the current params
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.read().clone()
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}
