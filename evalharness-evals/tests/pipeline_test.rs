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

//! End-to-end runs: registry -> metric -> connectors -> batch runner

use async_trait::async_trait;
use evalharness_core::{
    AggregateResult, ConnectorConfig, ConnectorResponse, EvaluationDetail, EvaluationRecord,
    HarnessConfig, MetricConfig, Prompt,
};
use evalharness_evals::aggregate::mean_at;
use evalharness_evals::registry::load_metric_connectors;
use evalharness_evals::{
    AdapterKind, AdapterRegistry, BatchRunner, Connector, ConnectorMap, EvalConfig, EvalError,
    Metric,
};
use mockito::Matcher;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn chat_reply(model: &str, content: &str) -> String {
    json!({
        "model": model,
        "choices": [{"message": {"role": "assistant", "content": content}}]
    })
    .to_string()
}

#[tokio::test]
async fn test_llmjudge_over_openai_connector() {
    let mut server = mockito::Server::new_async().await;
    let judge_a = server
        .mock("POST", "/v1/chat/completions")
        .match_body(Matcher::PartialJson(json!({"model": "judge-a"})))
        .with_status(200)
        .with_body(chat_reply(
            "judge-a",
            r#"{"score": 6, "explanation": "partially right"}"#,
        ))
        .expect(2)
        .create_async()
        .await;
    let judge_b = server
        .mock("POST", "/v1/chat/completions")
        .match_body(Matcher::PartialJson(json!({
            "model": "judge-b",
            "temperature": 1.0,
            "max_tokens": 4096
        })))
        .with_status(200)
        .with_body(chat_reply(
            "judge-b",
            "<think>compare numbers</think>{\"score\": 8, \"explanation\": \"right\"}",
        ))
        .expect(2)
        .create_async()
        .await;

    let config = HarnessConfig::default().with_metric(
        MetricConfig::new("llmjudge")
            .with_param("judge_models", json!(["judge-a", "judge-b"]))
            .with_connector(
                ConnectorConfig::new("openai-connector", "judge-a")
                    .with_uri(format!("{}/v1", server.url()))
                    .with_token("sk-test"),
            ),
    );
    let registry = AdapterRegistry::with_builtin_adapters(Arc::new(config));
    let metric = registry.load_metric("llmjudge").unwrap();

    let records = vec![
        EvaluationRecord::new("2+2?", "4", "four"),
        EvaluationRecord::new("3+3?", "six", "6"),
    ];
    let report = BatchRunner::new(EvalConfig::default())
        .run(metric, records)
        .await
        .unwrap();

    judge_a.assert_async().await;
    judge_b.assert_async().await;

    assert!(report.failures.is_empty());
    for record in &report.records {
        let detail = record.evaluated_result().unwrap();
        assert_eq!(detail["llm_score"], json!(7.0));
        assert_eq!(detail["judges"]["judge-a"]["score"], json!(6));
    }
    assert_eq!(
        Value::Object(report.aggregate),
        json!({"llmjudge": {"average_score": 7.0}})
    );
}

#[tokio::test]
async fn test_llmjudge_backend_down_fails_records_only() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1/chat/completions")
        .with_status(503)
        .with_body("unavailable")
        .create_async()
        .await;

    let config = HarnessConfig::default().with_metric(
        MetricConfig::new("llmjudge").with_connector(
            ConnectorConfig::new("openai-connector", "judge-a")
                .with_uri(format!("{}/v1", server.url())),
        ),
    );
    let registry = AdapterRegistry::with_builtin_adapters(Arc::new(config));
    let metric = registry.load_metric("llmjudge").unwrap();

    let report = BatchRunner::new(EvalConfig::default())
        .run(metric, vec![EvaluationRecord::new("q", "a", "t")])
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.contains("no judge returned a valid verdict"));
    assert_eq!(
        Value::Object(report.aggregate),
        json!({"llmjudge": {"average_score": 0.0}})
    );
}

/// Connector answering with the upper-cased prompt
#[derive(Default)]
struct ShoutConnector {
    config: RwLock<Option<ConnectorConfig>>,
}

#[async_trait]
impl Connector for ShoutConnector {
    fn adapter_id(&self) -> &str {
        "shout-connector"
    }

    fn configure(&self, config: ConnectorConfig) -> Result<(), EvalError> {
        *self.config.write() = Some(config);
        Ok(())
    }

    fn current_config(&self) -> Option<ConnectorConfig> {
        self.config.read().clone()
    }

    async fn get_response(&self, prompt: &Prompt) -> Result<ConnectorResponse, EvalError> {
        let model = self
            .current_config()
            .map(|c| c.model)
            .ok_or_else(|| EvalError::NotConfigured("shout-connector".to_string()))?;
        Ok(ConnectorResponse::new(prompt.to_text().to_uppercase()).with_model(model))
    }
}

/// Scores 1.0 when the connector's rendering of the response equals the target
struct ExactMatch {
    connectors: ConnectorMap,
}

#[async_trait]
impl Metric for ExactMatch {
    fn id(&self) -> &str {
        "exact"
    }

    fn update_metric_params(&self, _params: Map<String, Value>) {}

    async fn get_individual_result(
        &self,
        record: &EvaluationRecord,
    ) -> Result<EvaluationDetail, EvalError> {
        let connector = self
            .connectors
            .get("metric")
            .ok_or_else(|| EvalError::Evaluation("no connector".to_string()))?;
        let rendered = connector
            .get_response(&Prompt::from(record.predicted_response.as_str()))
            .await?;

        let mut detail = EvaluationDetail::new();
        let hit = rendered.response == record.target;
        detail.insert("score".to_string(), json!(if hit { 1.0 } else { 0.0 }));
        Ok(detail)
    }

    async fn get_results(&self, records: &[EvaluationRecord]) -> Result<AggregateResult, EvalError> {
        let mut result = AggregateResult::new();
        result.insert(
            "exact".to_string(),
            json!({ "accuracy": mean_at("ExactMatch", records, &["score"]) }),
        );
        Ok(result)
    }
}

#[tokio::test]
async fn test_runtime_registered_adapters() {
    let config = HarnessConfig::default().with_metric(
        MetricConfig::new("exact").with_connector(ConnectorConfig::new("shout-connector", "v1")),
    );
    let registry = AdapterRegistry::with_builtin_adapters(Arc::new(config));

    registry
        .register_connector("shout-connector", "Upper-cases prompts", |_| {
            Ok(Arc::new(ShoutConnector::default()) as Arc<dyn Connector>)
        })
        .unwrap();
    registry
        .register_metric("exact", "Exact match after rendering", |ctx| {
            let config = ctx.metric_config("exact")?;
            let connectors = load_metric_connectors("exact", ctx.registry(), &config)?;
            Ok(Arc::new(ExactMatch { connectors }) as Arc<dyn Metric>)
        })
        .unwrap();

    assert!(registry
        .list(AdapterKind::Metric)
        .iter()
        .any(|h| h.id == "exact"));

    let metric = registry.load_metric("exact").unwrap();
    let records = vec![
        EvaluationRecord::new("q", "paris", "PARIS"),
        EvaluationRecord::new("q", "lyon", "PARIS"),
        EvaluationRecord::new("q", "rome", "ROME"),
        EvaluationRecord::new("q", "oslo", "BERLIN"),
    ];
    let report = BatchRunner::new(EvalConfig::default())
        .run(metric, records)
        .await
        .unwrap();

    assert_eq!(
        Value::Object(report.aggregate),
        json!({"exact": {"accuracy": 0.5}})
    );
}

#[tokio::test]
async fn test_missing_metric_config_fails_fast() {
    let registry = AdapterRegistry::with_builtin_adapters(Arc::new(HarnessConfig::default()));

    let err = registry.load_metric("bertscore").err().unwrap();
    assert!(matches!(err, EvalError::ConfigNotFound(ref id) if id == "bertscore"));

    let err = registry.load_metric("no-such-metric").err().unwrap();
    assert!(matches!(err, EvalError::NotFound { kind: AdapterKind::Metric, .. }));
}
