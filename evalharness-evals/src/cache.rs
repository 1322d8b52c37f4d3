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

//! Caching layer for per-record evaluation details

use evalharness_core::{EvaluationDetail, EvaluationRecord};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache of evaluation details keyed by metric and record content
pub struct EvalCache {
    cache: Cache<CacheKey, EvaluationDetail>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl EvalCache {
    /// Create a new cache with specified TTL in seconds
    pub fn new(ttl_secs: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn compute_key(
        &self,
        metric_id: &str,
        params: &Map<String, Value>,
        record: &EvaluationRecord,
    ) -> CacheKey {
        CacheKey::new(metric_id, params, record)
    }

    pub async fn get(&self, key: &CacheKey) -> Option<EvaluationDetail> {
        match self.cache.get(key).await {
            Some(detail) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(detail)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, key: CacheKey, detail: EvaluationDetail) {
        self.cache.insert(key, detail).await;
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key).await;
    }

    pub async fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.cache.entry_count(),
        }
    }
}

/// Cache key over metric id, metric params and record content
///
/// The record id is left out so identical triples share one entry. Params
/// are part of the key, so a params update never serves details computed
/// under the old ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    metric_hash: u64,
    content_hash: u64,
}

impl CacheKey {
    pub fn new(metric_id: &str, params: &Map<String, Value>, record: &EvaluationRecord) -> Self {
        use std::collections::hash_map::DefaultHasher;

        let mut hasher = DefaultHasher::new();
        metric_id.hash(&mut hasher);
        for (key, value) in params {
            key.hash(&mut hasher);
            value.to_string().hash(&mut hasher);
        }
        let metric_hash = hasher.finish();

        let mut hasher = DefaultHasher::new();
        record.prompt.hash(&mut hasher);
        record.predicted_response.hash(&mut hasher);
        record.target.hash(&mut hasher);
        let content_hash = hasher.finish();

        Self {
            metric_hash,
            content_hash,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entry_count: u64,
}
