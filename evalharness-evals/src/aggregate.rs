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

//! Reduction of per-record scores into batch statistics

use evalharness_core::{EvaluationDetail, EvaluationRecord};
use serde_json::Value;
use tracing::warn;

/// Arithmetic mean, `0.0` for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Numeric values found at `path` in each record's evaluated result
///
/// Records that are unevaluated, lack the path, or hold a non-numeric value
/// are skipped with a warning.
pub fn collect_scores(component: &str, records: &[EvaluationRecord], path: &[&str]) -> Vec<f64> {
    let mut scores = Vec::with_capacity(records.len());

    for record in records {
        let Some(result) = record.evaluated_result() else {
            warn!(
                "[{}] Record {} has no evaluated result, skipping",
                component, record.id
            );
            continue;
        };

        match lookup(result, path).and_then(Value::as_f64) {
            Some(score) => scores.push(score),
            None => warn!(
                "[{}] Record {} has no numeric '{}', skipping",
                component,
                record.id,
                path.join(".")
            ),
        }
    }

    scores
}

fn lookup<'a>(result: &'a EvaluationDetail, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(result.get(*first)?, |value, key| value.get(*key))
}

/// Mean of the values at `path` across `records`
pub fn mean_at(component: &str, records: &[EvaluationRecord], path: &[&str]) -> f64 {
    mean(&collect_scores(component, records, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluated(detail: Value) -> EvaluationRecord {
        let mut record = EvaluationRecord::new("p", "r", "t");
        let Value::Object(map) = detail else {
            panic!("detail must be an object");
        };
        record.attach_result(map).unwrap();
        record
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[8.0, 6.0]), 7.0);
        assert_eq!(mean(&[6.0, 8.0, 10.0]), 8.0);
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(7.666_666, 2), 7.67);
        assert_eq!(round_to(2.0 / 3.0, 2), 0.67);
        assert_eq!(round_to(5.0, 2), 5.0);
    }

    #[test]
    fn test_collect_scores_skips_bad_records() {
        let records = vec![
            evaluated(json!({"llmjudge": {"score": 8.0}})),
            evaluated(json!({"llmjudge": {"score": "high"}})),
            evaluated(json!({"other": 1})),
            EvaluationRecord::new("p", "r", "t"),
            evaluated(json!({"llmjudge": {"score": 6}})),
        ];

        let scores = collect_scores("test", &records, &["llmjudge", "score"]);
        assert_eq!(scores, vec![8.0, 6.0]);
        assert_eq!(mean_at("test", &records, &["llmjudge", "score"]), 7.0);
    }

    #[test]
    fn test_mean_at_empty() {
        assert_eq!(mean_at("test", &[], &["score"]), 0.0);
    }
}
