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

//! Evaluation records

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use uuid::Uuid;

/// Per-record evaluation detail attached by a metric
pub type EvaluationDetail = Map<String, Value>;

/// Batch summary keyed by metric name, e.g. `{"llmjudge": {"average_score": 7.0}}`
pub type AggregateResult = Map<String, Value>;

/// One (prompt, predicted response, target) unit of evaluation work
///
/// `evaluated_result` can be attached only once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Prompt sent to the system under test
    pub prompt: String,

    /// Response produced by the system under test
    pub predicted_response: String,

    /// Reference answer
    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    evaluated_result: Option<EvaluationDetail>,
}

impl EvaluationRecord {
    pub fn new(
        prompt: impl Into<String>,
        predicted_response: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            predicted_response: predicted_response.into(),
            target: target.into(),
            evaluated_result: None,
        }
    }

    pub fn evaluated_result(&self) -> Option<&EvaluationDetail> {
        self.evaluated_result.as_ref()
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluated_result.is_some()
    }

    /// Attach the metric's detail to this record
    pub fn attach_result(&mut self, detail: EvaluationDetail) -> CoreResult<()> {
        if self.evaluated_result.is_some() {
            return Err(CoreError::AlreadyEvaluated(self.id.to_string()));
        }
        self.evaluated_result = Some(detail);
        Ok(())
    }
}

/// Parse records from JSON lines. Blank lines are ignored.
pub fn parse_records(content: &str) -> CoreResult<Vec<EvaluationRecord>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|e| CoreError::RecordParse {
                line: idx + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

/// Load records from a JSON-lines file
pub fn load_records(path: impl AsRef<Path>) -> CoreResult<Vec<EvaluationRecord>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_records(&content)
}
