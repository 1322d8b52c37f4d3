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

//! LLM-as-judge ensemble
//!
//! Every record is sent to all configured judge models at once. Each judge
//! must answer with `{"score": <int>, "explanation": <string>}`, optionally
//! preceded by a `<think>...</think>` reasoning trace. The record's score is
//! the mean of the judges that answered validly; judges that fail are
//! reported but never abort their siblings.

use super::{record_detail, MetricParams};
use crate::aggregate::{mean, mean_at, round_to};
use crate::registry::{configure_connector, AdapterRegistry, LoadContext};
use crate::{ConnectorMap, EvalError, Metric};
use async_trait::async_trait;
use evalharness_core::{
    AggregateResult, ChatMessage, ConnectorConfig, EvaluationDetail, EvaluationRecord,
    MetricConfig, Prompt,
};
use futures::future::join_all;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

const DEFAULT_SYSTEM_PROMPT: &str = "You are an impartial evaluator. Compare the response \
with the target answer and reply only with a JSON object of the form \
{\"score\": <integer from 0 to 10>, \"explanation\": <string>}.";

const DEFAULT_PROMPT_TEMPLATE: &str = "Target answer:\n{target}\n\n\
Response to evaluate:\n{text}\n\n\
Score how well the response matches the target answer.";

/// Verdict a judge must return, nothing more and nothing less
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JudgeVerdict {
    pub score: i64,
    pub explanation: String,
}

/// Sampling defaults for judge calls, applied when the config leaves them out
fn with_judge_defaults(mut config: ConnectorConfig) -> ConnectorConfig {
    let defaults = [
        ("temperature", json!(1.0)),
        ("top_p", json!(1.0)),
        ("max_tokens", json!(4096)),
        ("response_format", json!("json_object")),
    ];
    for (key, value) in defaults {
        config.params.entry(key).or_insert(value);
    }
    config
}

/// Judge models named by `params.judge_models`, else the connector's model
fn judge_models(config: &MetricConfig, connector: &ConnectorConfig) -> Vec<String> {
    let mut models: Vec<String> = Vec::new();
    if let Some(Value::Array(listed)) = config.params.get("judge_models") {
        for model in listed.iter().filter_map(Value::as_str) {
            if !model.is_empty() && !models.iter().any(|m| m == model) {
                models.push(model.to_string());
            }
        }
    }
    if models.is_empty() && !connector.model.is_empty() {
        models.push(connector.model.clone());
    }
    models
}

/// Verdict read from the first `{` of `text`, ignoring whatever follows it
fn first_verdict(text: &str) -> Result<JudgeVerdict, EvalError> {
    let missing = || EvalError::Parse("no JSON object after the reasoning trace".to_string());
    let start = text.find('{').ok_or_else(missing)?;

    serde_json::Deserializer::from_str(&text[start..])
        .into_iter::<JudgeVerdict>()
        .next()
        .ok_or_else(missing)?
        .map_err(|e| EvalError::Parse(e.to_string()))
}

pub struct LLMJudge {
    config: MetricConfig,
    params: MetricParams,
    judges: ConnectorMap,
    placeholder: Regex,
}

impl LLMJudge {
    pub const ID: &'static str = "llmjudge";

    pub fn load(ctx: &LoadContext<'_>) -> Result<Self, EvalError> {
        let config = ctx.metric_config(Self::ID)?;
        Self::from_config(ctx.registry(), config)
    }

    /// Build the metric with one configured connector per judge model
    pub fn from_config(registry: &AdapterRegistry, config: MetricConfig) -> Result<Self, EvalError> {
        let mut metric = Self::with_judges(config, ConnectorMap::new())?;
        let judges = metric
            .get_metric_connectors(registry, &metric.config)
            .map_err(|e| {
                error!(
                    "[LLMJudge] There was an error initializing the LLMJudge: {}",
                    e
                );
                e
            })?;

        if judges.is_empty() {
            let err = EvalError::Initialization {
                id: Self::ID.to_string(),
                reason: "no judge connector configured".to_string(),
            };
            error!("[LLMJudge] {}", err);
            return Err(err);
        }

        metric.judges = judges;
        Ok(metric)
    }

    /// Build the metric around already configured judges, keyed by model
    pub fn with_judges(config: MetricConfig, judges: ConnectorMap) -> Result<Self, EvalError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| EvalError::Initialization {
                id: Self::ID.to_string(),
                reason: e.to_string(),
            })
        };

        let params = MetricParams::new(Self::ID, config.params.clone());
        Ok(Self {
            config,
            params,
            judges,
            placeholder: compile(r"\{(text|target)\}")?,
        })
    }

    pub fn judge_models(&self) -> Vec<&str> {
        self.judges.keys().map(String::as_str).collect()
    }

    pub fn judges(&self) -> &ConnectorMap {
        &self.judges
    }

    /// Evaluator payload for one record
    pub fn build_prompt(&self, record: &EvaluationRecord) -> Prompt {
        let system = self
            .params
            .get_string("system_prompt")
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let template = self
            .params
            .get_string("prompt_template")
            .unwrap_or_else(|| DEFAULT_PROMPT_TEMPLATE.to_string());

        // Single pass, so placeholders inside the substituted texts stay literal
        let user = self
            .placeholder
            .replace_all(&template, |caps: &Captures| match &caps[1] {
                "text" => record.predicted_response.clone(),
                _ => record.target.clone(),
            })
            .into_owned();

        Prompt::Chat(vec![ChatMessage::system(system), ChatMessage::user(user)])
    }

    /// Extract the verdict from a judge reply
    ///
    /// A reasoning trace must open the reply; the verdict is the first JSON
    /// object after `</think>` and anything following it is ignored. Without
    /// a trace the whole reply must be the object.
    pub fn parse_verdict(&self, reply: &str) -> Result<JudgeVerdict, EvalError> {
        let trimmed = reply.trim();

        if let Some(rest) = trimmed.strip_prefix(THINK_OPEN) {
            let (_, after) = rest.split_once(THINK_CLOSE).ok_or_else(|| {
                EvalError::Parse("reasoning trace is missing its closing tag".to_string())
            })?;
            return first_verdict(after);
        }

        serde_json::from_str(trimmed).map_err(|e| {
            if trimmed.contains(THINK_OPEN) {
                EvalError::Parse("reasoning trace must open the reply".to_string())
            } else {
                EvalError::Parse(e.to_string())
            }
        })
    }

    async fn ask_judge(
        &self,
        model: &str,
        judge: &dyn crate::Connector,
        prompt: &Prompt,
    ) -> Result<JudgeVerdict, EvalError> {
        let response = judge.get_response(prompt).await?;
        debug!(
            "[LLMJudge] Judge '{}' answered ({} chars)",
            model,
            response.response.len()
        );
        self.parse_verdict(&response.response)
    }
}

#[async_trait]
impl Metric for LLMJudge {
    fn id(&self) -> &str {
        Self::ID
    }

    fn get_metric_connectors(
        &self,
        registry: &AdapterRegistry,
        config: &MetricConfig,
    ) -> Result<ConnectorMap, EvalError> {
        let mut judges = ConnectorMap::new();

        let Some(base) = config
            .connector_configurations
            .as_ref()
            .filter(|c| !c.connector_adapter.is_empty())
        else {
            return Ok(judges);
        };
        let base = with_judge_defaults(base.clone());

        let models = judge_models(config, &base);
        if models.is_empty() {
            return Err(EvalError::ConnectorLoad {
                adapter: base.connector_adapter.clone(),
                reason: "no judge model configured".to_string(),
            });
        }

        for model in models {
            info!(
                "[LLMJudge] Loading connector with model '{}' and adapter '{}'",
                model, base.connector_adapter
            );
            let judge = configure_connector(registry, base.for_model(&model)).map_err(|e| {
                error!(
                    "[LLMJudge] There was an error retrieving metric connectors: {}",
                    e
                );
                e
            })?;
            judges.insert(model, judge);
        }

        info!("[LLMJudge] Successfully loaded all metric connectors.");
        Ok(judges)
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
        let prompt = self.build_prompt(record);

        let calls = self.judges.iter().map(|(model, judge)| {
            let prompt = &prompt;
            async move { (model, self.ask_judge(model, judge.as_ref(), prompt).await) }
        });
        let outcomes = join_all(calls).await;

        let mut scores = Vec::with_capacity(outcomes.len());
        let mut verdicts = Map::new();
        let mut failed = Map::new();
        for (model, outcome) in outcomes {
            match outcome {
                Ok(verdict) => {
                    scores.push(verdict.score as f64);
                    verdicts.insert(model.clone(), json!(verdict));
                }
                Err(e) => {
                    warn!(
                        "[LLMJudge] Judge '{}' failed on record {}: {}",
                        model, record.id, e
                    );
                    failed.insert(model.clone(), json!(e.to_string()));
                }
            }
        }

        if scores.is_empty() {
            let err = EvalError::Evaluation(format!(
                "no judge returned a valid verdict ({} of {} failed)",
                failed.len(),
                self.judges.len()
            ));
            error!(
                "[LLMJudge] There was an error evaluating the individual result: {}",
                err
            );
            return Err(err);
        }

        let mut detail = record_detail(record);
        detail.insert("llm_score".to_string(), json!(round_to(mean(&scores), 2)));
        detail.insert("judges".to_string(), Value::Object(verdicts));
        detail.insert("failed_judges".to_string(), Value::Object(failed));
        Ok(detail)
    }

    async fn get_results(&self, records: &[EvaluationRecord]) -> Result<AggregateResult, EvalError> {
        let mut result = AggregateResult::new();
        result.insert(
            Self::ID.to_string(),
            json!({ "average_score": mean_at("LLMJudge", records, &["llm_score"]) }),
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Connector;
    use evalharness_core::{ConnectorResponse, HarnessConfig};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    /// Judge answering with a fixed reply
    struct ScriptedJudge {
        reply: Result<String, String>,
        seen: Mutex<Vec<Prompt>>,
    }

    impl ScriptedJudge {
        fn new(reply: Result<String, String>) -> Self {
            Self {
                reply,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn replying(reply: &str) -> Arc<dyn Connector> {
            Arc::new(Self::new(Ok(reply.to_string())))
        }

        fn failing(message: &str) -> Arc<dyn Connector> {
            Arc::new(Self::new(Err(message.to_string())))
        }
    }

    #[async_trait]
    impl Connector for ScriptedJudge {
        fn adapter_id(&self) -> &str {
            "scripted"
        }

        fn configure(&self, _config: ConnectorConfig) -> Result<(), EvalError> {
            Ok(())
        }

        fn current_config(&self) -> Option<ConnectorConfig> {
            None
        }

        async fn get_response(&self, prompt: &Prompt) -> Result<ConnectorResponse, EvalError> {
            self.seen.lock().push(prompt.clone());
            match &self.reply {
                Ok(text) => Ok(ConnectorResponse::new(text.clone())),
                Err(message) => Err(EvalError::Backend {
                    endpoint: "scripted".to_string(),
                    message: message.clone(),
                }),
            }
        }
    }

    fn verdict(score: i64) -> String {
        format!(r#"{{"score": {}, "explanation": "judged {}"}}"#, score, score)
    }

    fn judge_with(judges: Vec<(&str, Arc<dyn Connector>)>) -> LLMJudge {
        let map = judges
            .into_iter()
            .map(|(model, judge)| (model.to_string(), judge))
            .collect();
        LLMJudge::with_judges(MetricConfig::new(LLMJudge::ID), map).unwrap()
    }

    fn bare() -> LLMJudge {
        judge_with(Vec::new())
    }

    #[test]
    fn test_parse_bare_and_think_wrapped() {
        let metric = bare();
        let bare_reply = r#"{"score": 7, "explanation": "close"}"#;
        let wrapped = "<think>the target says four\n{not json}</think>\n{\"score\": 7, \"explanation\": \"close\"}";

        assert_eq!(metric.parse_verdict(bare_reply).unwrap().score, 7);
        assert_eq!(metric.parse_verdict(wrapped).unwrap().score, 7);
        assert_eq!(metric.parse_verdict(&format!("  \n{}", wrapped)).unwrap().score, 7);

        // Text after the verdict is ignored, braces included
        let trailing = "<think>hmm</think>\n{\"score\": 7, \"explanation\": \"close\"}\nScale used: {0..10}";
        let second_object = "<think>draft {\"score\": 3}</think>{\"score\": 7, \"explanation\": \"ok\"} {\"note\": 1}";
        assert_eq!(metric.parse_verdict(trailing).unwrap().score, 7);
        let verdict = metric.parse_verdict(second_object).unwrap();
        assert_eq!(verdict.score, 7);
        assert_eq!(verdict.explanation, "ok");

        // The tag may appear inside a bare verdict
        let quoted = r#"{"score": 7, "explanation": "no <think> needed"}"#;
        assert_eq!(
            metric.parse_verdict(quoted).unwrap().explanation,
            "no <think> needed"
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let metric = bare();
        let cases = [
            "not json at all",
            r#"{"score": 7}"#,
            r#"{"score": 7, "explanation": "x", "confidence": 0.9}"#,
            r#"{"score": 7.5, "explanation": "x"}"#,
            r#"{"score": "7", "explanation": "x"}"#,
            r#"<think>never closed {"score": 7, "explanation": "x"}"#,
            "<think>done</think> no object here",
            r#"Sure! <think>hmm</think>{"score": 7, "explanation": "x"}"#,
        ];
        for reply in cases {
            assert!(
                matches!(metric.parse_verdict(reply), Err(EvalError::Parse(_))),
                "expected parse failure for {:?}",
                reply
            );
        }
    }

    #[tokio::test]
    async fn test_mean_of_judges() {
        let metric = judge_with(vec![
            ("judge-a", ScriptedJudge::replying(&verdict(6))),
            ("judge-b", ScriptedJudge::replying(&verdict(8))),
            ("judge-c", ScriptedJudge::replying(&verdict(10))),
        ]);
        let record = EvaluationRecord::new("2+2?", "4", "four");
        let detail = metric.get_individual_result(&record).await.unwrap();

        assert_eq!(detail["llm_score"], json!(8.0));
        assert_eq!(detail["judges"]["judge-b"]["explanation"], json!("judged 8"));
        assert_eq!(detail["failed_judges"], json!({}));
    }

    #[tokio::test]
    async fn test_score_rounded_to_two_decimals() {
        let metric = judge_with(vec![
            ("a", ScriptedJudge::replying(&verdict(7))),
            ("b", ScriptedJudge::replying(&verdict(7))),
            ("c", ScriptedJudge::replying(&verdict(8))),
        ]);
        let record = EvaluationRecord::new("q", "r", "t");
        let detail = metric.get_individual_result(&record).await.unwrap();
        assert_eq!(detail["llm_score"], json!(7.33));
    }

    #[tokio::test]
    async fn test_partial_judge_failure_is_tolerated() {
        let metric = judge_with(vec![
            ("good", ScriptedJudge::replying(&verdict(7))),
            ("chatty", ScriptedJudge::replying("I think it deserves a 9")),
            ("down", ScriptedJudge::failing("HTTP 503")),
        ]);
        let record = EvaluationRecord::new("q", "r", "t");
        let detail = metric.get_individual_result(&record).await.unwrap();

        assert_eq!(detail["llm_score"], json!(7.0));
        let failed = detail["failed_judges"].as_object().unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed["down"].as_str().unwrap().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_only_judge_malformed_fails_record() {
        let metric = judge_with(vec![(
            "judge-a",
            ScriptedJudge::replying("```json\n{\"score\": 7}\n```"),
        )]);
        let record = EvaluationRecord::new("q", "r", "t");
        let err = metric.get_individual_result(&record).await.unwrap_err();
        assert!(matches!(err, EvalError::Evaluation(_)));
    }

    #[tokio::test]
    async fn test_no_judges_fails_record() {
        let record = EvaluationRecord::new("q", "r", "t");
        let err = bare().get_individual_result(&record).await.unwrap_err();
        assert!(matches!(err, EvalError::Evaluation(_)));
    }

    /// Replies only once every judge of the record has been called
    struct GatedJudge {
        gate: Arc<Barrier>,
    }

    #[async_trait]
    impl Connector for GatedJudge {
        fn adapter_id(&self) -> &str {
            "gated"
        }

        fn configure(&self, _config: ConnectorConfig) -> Result<(), EvalError> {
            Ok(())
        }

        fn current_config(&self) -> Option<ConnectorConfig> {
            None
        }

        async fn get_response(&self, _prompt: &Prompt) -> Result<ConnectorResponse, EvalError> {
            self.gate.wait().await;
            Ok(ConnectorResponse::new(verdict(5)))
        }
    }

    #[tokio::test]
    async fn test_judges_are_queried_concurrently() {
        let gate = Arc::new(Barrier::new(3));
        let judges: Vec<(&str, Arc<dyn Connector>)> = ["a", "b", "c"]
            .into_iter()
            .map(|m| {
                (
                    m,
                    Arc::new(GatedJudge { gate: gate.clone() }) as Arc<dyn Connector>,
                )
            })
            .collect();
        let metric = judge_with(judges);
        let record = EvaluationRecord::new("q", "r", "t");

        let detail = tokio::time::timeout(
            Duration::from_secs(5),
            metric.get_individual_result(&record),
        )
        .await
        .expect("judges were called one after another")
        .unwrap();
        assert_eq!(detail["llm_score"], json!(5.0));
    }

    #[tokio::test]
    async fn test_results_average() {
        let metric = bare();
        let mut records = Vec::new();
        for score in [8.0, 6.0] {
            let mut record = EvaluationRecord::new("q", "r", "t");
            let mut detail = EvaluationDetail::new();
            detail.insert("llm_score".to_string(), json!(score));
            record.attach_result(detail).unwrap();
            records.push(record);
        }
        records.push(EvaluationRecord::new("q", "unscored", "t"));

        let results = metric.get_results(&records).await.unwrap();
        assert_eq!(Value::Object(results), json!({"llmjudge": {"average_score": 7.0}}));

        let empty = metric.get_results(&[]).await.unwrap();
        assert_eq!(Value::Object(empty), json!({"llmjudge": {"average_score": 0.0}}));
    }

    #[tokio::test]
    async fn test_prompt_substitution_and_param_update() {
        let judge = Arc::new(ScriptedJudge::new(Ok(verdict(9))));
        let metric = judge_with(vec![("a", judge.clone() as Arc<dyn Connector>)]);

        let mut params = Map::new();
        params.insert("system_prompt".to_string(), json!("be strict"));
        params.insert(
            "prompt_template".to_string(),
            json!("got={text} want={target}"),
        );
        metric.update_metric_params(params);

        let record = EvaluationRecord::new("q", "says {target}", "four");
        metric.get_individual_result(&record).await.unwrap();

        let seen = judge.seen.lock();
        assert_eq!(
            seen[0],
            Prompt::Chat(vec![
                ChatMessage::system("be strict"),
                ChatMessage::user("got=says {target} want=four"),
            ])
        );
    }

    #[test]
    fn test_from_config_builds_one_judge_per_model() {
        let config = MetricConfig::new(LLMJudge::ID)
            .with_param("judge_models", json!(["judge-a", "judge-b", "judge-a"]))
            .with_connector(
                ConnectorConfig::new("http-connector", "judge-a")
                    .with_uri("http://localhost:9/judge")
                    .with_param("temperature", json!(0.2)),
            );
        let registry =
            AdapterRegistry::with_builtin_adapters(Arc::new(HarnessConfig::default()));

        let metric = LLMJudge::from_config(&registry, config).unwrap();
        assert_eq!(metric.judge_models(), vec!["judge-a", "judge-b"]);

        let bound = metric.judges()["judge-b"].current_config().unwrap();
        assert_eq!(bound.model, "judge-b");
        assert_eq!(bound.params["temperature"], json!(0.2));
        assert_eq!(bound.params["top_p"], json!(1.0));
        assert_eq!(bound.params["max_tokens"], json!(4096));
        assert_eq!(bound.params["response_format"], json!("json_object"));
    }

    #[test]
    fn test_from_config_defaults_to_connector_model() {
        let config = MetricConfig::new(LLMJudge::ID)
            .with_connector(ConnectorConfig::new("http-connector", "only-judge"));
        let registry =
            AdapterRegistry::with_builtin_adapters(Arc::new(HarnessConfig::default()));

        let metric = LLMJudge::from_config(&registry, config).unwrap();
        assert_eq!(metric.judge_models(), vec!["only-judge"]);
    }

    #[test]
    fn test_from_config_requires_a_judge() {
        let registry =
            AdapterRegistry::with_builtin_adapters(Arc::new(HarnessConfig::default()));

        let err = LLMJudge::from_config(&registry, MetricConfig::new(LLMJudge::ID))
            .err()
            .unwrap();
        assert!(matches!(err, EvalError::Initialization { .. }));

        let unknown = MetricConfig::new(LLMJudge::ID)
            .with_connector(ConnectorConfig::new("missing-connector", "m"));
        let err = LLMJudge::from_config(&registry, unknown).err().unwrap();
        assert!(matches!(err, EvalError::ConnectorLoad { .. }));
    }
}
