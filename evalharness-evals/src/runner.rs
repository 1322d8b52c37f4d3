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

//! Batch runner
//!
//! Evaluates a batch of records with one metric: bounded parallelism, a
//! timeout per record, failures isolated to their record, optional caching
//! and cooperative cancellation. The batch aggregate is computed over the
//! records that were scored.

use crate::cache::{CacheStats, EvalCache};
use crate::{EvalConfig, EvalError, Metric};
use chrono::{DateTime, Utc};
use evalharness_core::{AggregateResult, EvaluationRecord};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A record that could not be scored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// Position of the record in the submitted batch
    pub index: usize,
    pub record_id: Uuid,
    pub error: String,
}

/// Outcome of one batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub metric_id: String,
    pub aggregate: AggregateResult,
    /// Records in submission order; scored ones carry their result
    pub records: Vec<EvaluationRecord>,
    pub failures: Vec<RecordFailure>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn evaluated_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_evaluated()).count()
    }
}

type TaskOutput = (usize, EvaluationRecord, Result<(), EvalError>);

pub struct BatchRunner {
    config: EvalConfig,
    cache: Option<Arc<EvalCache>>,
}

impl BatchRunner {
    pub fn new(config: EvalConfig) -> Self {
        let cache = config
            .enable_cache
            .then(|| Arc::new(EvalCache::new(config.cache_ttl_secs)));
        Self { config, cache }
    }

    /// Share a cache between runners
    pub fn with_cache(mut self, cache: Arc<EvalCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    pub async fn run(
        &self,
        metric: Arc<dyn Metric>,
        records: Vec<EvaluationRecord>,
    ) -> Result<BatchReport, EvalError> {
        self.run_with_cancel(metric, records, CancellationToken::new())
            .await
    }

    /// Run the batch until done or until `cancel` fires
    ///
    /// On cancellation in-flight evaluations are aborted; records already
    /// scored keep their result and the report is marked cancelled.
    pub async fn run_with_cancel(
        &self,
        metric: Arc<dyn Metric>,
        records: Vec<EvaluationRecord>,
        cancel: CancellationToken,
    ) -> Result<BatchReport, EvalError> {
        let started_at = Utc::now();
        let metric_id = metric.id().to_string();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        info!(
            "[BatchRunner] Evaluating {} records with metric '{}' (max_concurrent={}, timeout={}s)",
            records.len(),
            metric_id,
            self.config.max_concurrent,
            self.config.timeout_secs
        );

        let mut slots = records;
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();

        for (index, record) in slots.iter().enumerate() {
            if record.is_evaluated() {
                continue;
            }

            let mut record = record.clone();
            let metric = Arc::clone(&metric);
            let semaphore = Arc::clone(&semaphore);
            let cache = self.cache.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    let err = EvalError::Evaluation("runner semaphore closed".to_string());
                    return (index, record, Err(err));
                };

                let outcome = AssertUnwindSafe(evaluate_one(
                    metric.as_ref(),
                    &mut record,
                    cache.as_deref(),
                    timeout,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(EvalError::Evaluation("evaluation task panicked".to_string()))
                });

                (index, record, outcome)
            });
        }

        let mut failures = Vec::new();
        let mut cancelled = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    warn!(
                        "[BatchRunner] Cancelled with {} evaluations in flight",
                        tasks.len()
                    );
                    cancelled = true;
                    tasks.abort_all();
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((index, record, Ok(())))) => slots[index] = record,
                    Some(Ok((index, record, Err(e)))) => {
                        error!(
                            "[BatchRunner] Record {} ({}) failed: {}",
                            index, record.id, e
                        );
                        failures.push(RecordFailure {
                            index,
                            record_id: record.id,
                            error: e.to_string(),
                        });
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => error!("[BatchRunner] Evaluation task failed: {}", e),
                }
            }
        }

        failures.sort_by_key(|f| f.index);

        let evaluated: Vec<EvaluationRecord> =
            slots.iter().filter(|r| r.is_evaluated()).cloned().collect();
        let aggregate = metric.get_results(&evaluated).await.map_err(|e| {
            error!(
                "[BatchRunner] There was an error retrieving results for '{}': {}",
                metric_id, e
            );
            e
        })?;

        info!(
            "[BatchRunner] Metric '{}' finished: {} evaluated, {} failed{}",
            metric_id,
            evaluated.len(),
            failures.len(),
            if cancelled { " (cancelled)" } else { "" }
        );

        Ok(BatchReport {
            metric_id,
            aggregate,
            records: slots,
            failures,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

async fn evaluate_one(
    metric: &dyn Metric,
    record: &mut EvaluationRecord,
    cache: Option<&EvalCache>,
    timeout: Duration,
) -> Result<(), EvalError> {
    let key = cache.map(|c| c.compute_key(metric.id(), &metric.params_snapshot(), &*record));

    if let (Some(cache), Some(key)) = (cache, &key) {
        if let Some(detail) = cache.get(key).await {
            record.attach_result(detail)?;
            return Ok(());
        }
    }

    let detail = tokio::time::timeout(timeout, metric.get_individual_result(&*record))
        .await
        .map_err(|_| EvalError::Timeout)??;

    if let (Some(cache), Some(key)) = (cache, key) {
        cache.set(key, detail.clone()).await;
    }
    record.attach_result(detail)?;
    Ok(())
}
