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

//! ROUGE overlap metric
//!
//! Needs no connector: ROUGE-1 counts clipped unigram overlap and ROUGE-L
//! uses the longest common subsequence of the two token streams. Tokens are
//! lowercased unless the `case_sensitive` param is `true`.

use super::{f1_score, record_detail, tokenize, tokenize_with, MetricParams};
use crate::aggregate::mean_at;
use crate::registry::LoadContext;
use crate::{EvalError, Metric};
use async_trait::async_trait;
use evalharness_core::{AggregateResult, EvaluationDetail, EvaluationRecord, MetricConfig};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Precision, recall and F1 of one ROUGE variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RougeScore {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

pub struct RougeMetric {
    config: MetricConfig,
    params: MetricParams,
}

impl RougeMetric {
    pub const ID: &'static str = "rouge";

    pub fn load(ctx: &LoadContext<'_>) -> Result<Self, EvalError> {
        Ok(Self::from_config(ctx.metric_config(Self::ID)?))
    }

    pub fn from_config(config: MetricConfig) -> Self {
        let params = MetricParams::new(Self::ID, config.params.clone());
        Self { config, params }
    }

    pub fn config(&self) -> &MetricConfig {
        &self.config
    }

    /// ROUGE-1 with clipped counts
    pub fn rouge_1(reference: &str, candidate: &str) -> RougeScore {
        unigram_overlap(&tokenize(reference), &tokenize(candidate))
    }

    /// ROUGE-L from the longest common subsequence
    pub fn rouge_l(reference: &str, candidate: &str) -> RougeScore {
        subsequence_overlap(&tokenize(reference), &tokenize(candidate))
    }

    fn case_sensitive(&self) -> bool {
        self.params.get_bool("case_sensitive").unwrap_or(false)
    }
}

impl RougeScore {
    /// Score from `matched` tokens out of the candidate and reference lengths
    fn from_matches(matched: usize, candidate_len: usize, reference_len: usize) -> Self {
        if candidate_len == 0 || reference_len == 0 {
            return Self::default();
        }
        let precision = matched as f64 / candidate_len as f64;
        let recall = matched as f64 / reference_len as f64;
        Self {
            precision,
            recall,
            f1: f1_score(precision, recall),
        }
    }
}

fn unigram_overlap(reference: &[String], candidate: &[String]) -> RougeScore {
    let mut available: HashMap<&str, usize> = HashMap::new();
    for token in reference {
        *available.entry(token.as_str()).or_default() += 1;
    }

    // Each reference token can be matched at most as often as it occurs
    let matched = candidate
        .iter()
        .filter(|token| match available.get_mut(token.as_str()) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        })
        .count();

    RougeScore::from_matches(matched, candidate.len(), reference.len())
}

fn subsequence_overlap(reference: &[String], candidate: &[String]) -> RougeScore {
    let matched = lcs_length(reference, candidate);
    RougeScore::from_matches(matched, candidate.len(), reference.len())
}

/// LCS length over a single DP row
fn lcs_length(a: &[String], b: &[String]) -> usize {
    // row[j]: LCS of the rows of `a` seen so far against b[..j]
    let mut row = vec![0usize; b.len() + 1];
    for x in a {
        let mut upper_left = 0;
        for (j, y) in b.iter().enumerate() {
            let upper = row[j + 1];
            row[j + 1] = if x == y {
                upper_left + 1
            } else {
                upper.max(row[j])
            };
            upper_left = upper;
        }
    }
    row[b.len()]
}

#[async_trait]
impl Metric for RougeMetric {
    fn id(&self) -> &str {
        Self::ID
    }

    fn update_metric_params(&self, params: Map<String, Value>) {
        self.params.merge(params);
    }

    fn params_snapshot(&self) -> Map<String, Value> {
        self.params.snapshot()
    }

    async fn get_individual_result(
        &self,
        record: &EvaluationRecord,
    ) -> Result<EvaluationDetail, EvalError> {
        let case_sensitive = self.case_sensitive();
        let reference = tokenize_with(&record.target, case_sensitive);
        let candidate = tokenize_with(&record.predicted_response, case_sensitive);
        let rouge_1 = unigram_overlap(&reference, &candidate);
        let rouge_l = subsequence_overlap(&reference, &candidate);

        let mut detail = record_detail(record);
        detail.insert(
            "rouge".to_string(),
            json!({ "rouge_1": rouge_1, "rouge_l": rouge_l }),
        );
        Ok(detail)
    }

    async fn get_results(&self, records: &[EvaluationRecord]) -> Result<AggregateResult, EvalError> {
        let mut result = AggregateResult::new();
        result.insert(
            Self::ID.to_string(),
            json!({
                "rouge_1_f1": mean_at("Rouge", records, &["rouge", "rouge_1", "f1"]),
                "rouge_l_f1": mean_at("Rouge", records, &["rouge", "rouge_l", "f1"]),
            }),
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric() -> RougeMetric {
        RougeMetric::from_config(MetricConfig::new(RougeMetric::ID))
    }

    #[test]
    fn test_rouge_1_identical() {
        let score = RougeMetric::rouge_1("the cat sat on the mat", "the cat sat on the mat");
        assert!((score.f1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rouge_1_partial_overlap() {
        let score = RougeMetric::rouge_1("the cat sat on the mat", "the dog sat");
        assert!((score.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((score.recall - 2.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_rouge_1_clips_repeats() {
        let score = RougeMetric::rouge_1("the cat", "the the the");
        assert!((score.precision - 1.0 / 3.0).abs() < 1e-9);
        assert!((score.recall - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_rouge_l_partial() {
        let score = RougeMetric::rouge_l("the cat sat on the mat", "the cat on mat");
        assert!((score.precision - 1.0).abs() < 1e-9);
        assert!((score.recall - 4.0 / 6.0).abs() < 1e-9);
        assert!((score.f1 - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(RougeMetric::rouge_1("", "text"), RougeScore::default());
        assert_eq!(RougeMetric::rouge_l("text", ""), RougeScore::default());
    }

    #[test]
    fn test_lcs_length() {
        let a: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["a", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(lcs_length(&a, &b), 3);
        assert_eq!(lcs_length(&b, &a), 3);
        assert_eq!(lcs_length(&a, &[]), 0);
    }

    #[tokio::test]
    async fn test_case_sensitive_param() {
        let metric = metric();
        let record = EvaluationRecord::new("q", "paris", "Paris");

        let detail = metric.get_individual_result(&record).await.unwrap();
        assert_eq!(detail["rouge"]["rouge_1"]["f1"], json!(1.0));

        let mut params = Map::new();
        params.insert("case_sensitive".to_string(), json!(true));
        metric.update_metric_params(params);

        let detail = metric.get_individual_result(&record).await.unwrap();
        assert_eq!(detail["rouge"]["rouge_1"]["f1"], json!(0.0));
        assert_eq!(detail["rouge"]["rouge_l"]["f1"], json!(0.0));
    }

    #[tokio::test]
    async fn test_individual_result_detail() {
        let record = EvaluationRecord::new("q", "Paris is the capital", "The capital is Paris");
        let detail = metric().get_individual_result(&record).await.unwrap();

        assert_eq!(detail["predicted_value"], json!("Paris is the capital"));
        assert_eq!(detail["target"], json!("The capital is Paris"));
        assert_eq!(detail["rouge"]["rouge_1"]["f1"], json!(1.0));
    }

    #[tokio::test]
    async fn test_results_empty_is_zero() {
        let results = metric().get_results(&[]).await.unwrap();
        assert_eq!(
            Value::Object(results),
            json!({"rouge": {"rouge_1_f1": 0.0, "rouge_l_f1": 0.0}})
        );
    }

    #[tokio::test]
    async fn test_no_connectors() {
        let metric = metric();
        let registry = crate::AdapterRegistry::with_builtin_adapters(std::sync::Arc::new(
            evalharness_core::HarnessConfig::default(),
        ));
        let connectors = metric
            .get_metric_connectors(&registry, metric.config())
            .unwrap();
        assert!(connectors.is_empty());
    }
}
