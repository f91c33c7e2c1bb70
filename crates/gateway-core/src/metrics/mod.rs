//! Relay metrics pipeline.
//!
//! Every relay attempt produces exactly one [`RelayMetric`]: client relays,
//! fallback posts, and the sync/chain probes (tagged with the `synccheck` /
//! `chaincheck` methods) alike. Recording has three effects:
//!
//! 1. **Service-log update** (cache): per-(chain, node) success/failure
//!    counters and elapsed-time sums, the input the cherry-picker ranks by.
//!    Fallback posts skip this step so the alternative backend never skews
//!    node statistics.
//! 2. **Durable write-behind**: records are buffered in a bounded queue and
//!    bulk-inserted by a background flusher; enqueueing never blocks the
//!    relay path, and overflow drops the oldest non-success records first.
//! 3. **Ambient counters**: Prometheus counters/histograms per
//!    (chain, method, result).
//!
//! Errors anywhere in the pipeline are logged and swallowed; metrics are
//! never allowed to fail a relay.

pub mod sink;

use crate::cache::{keys, RelayCache};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// Method label for sync-check probe metrics.
pub const SYNC_CHECK_METHOD: &str = "synccheck";
/// Method label for chain-check probe metrics.
pub const CHAIN_CHECK_METHOD: &str = "chaincheck";

/// One relay attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMetric {
    pub request_id: Uuid,
    pub application_id: String,
    pub app_public_key: String,
    pub blockchain: String,
    /// Public key of the serving node; `None` for fallback posts.
    pub service_node: Option<String>,
    pub relay_start: DateTime<Utc>,
    /// HTTP-style result code: 200 on success, 500 on node failure.
    pub result: u16,
    pub bytes: usize,
    pub delivered: bool,
    pub fallback: bool,
    pub method: String,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl RelayMetric {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result == 200
    }
}

/// Records relay metrics into the cache, the durable queue, and Prometheus.
#[derive(Clone)]
pub struct MetricsRecorder {
    cache: RelayCache,
    queue: Arc<sink::WriteBehindQueue>,
}

impl MetricsRecorder {
    pub fn new(cache: RelayCache, queue: Arc<sink::WriteBehindQueue>) -> Self {
        Self { cache, queue }
    }

    /// Records one relay attempt. Never blocks, never fails.
    pub async fn record(&self, metric: RelayMetric) {
        let result_label = if metric.is_success() { "success" } else { "failure" };
        counter!(
            "gateway_relays_total",
            "chain" => metric.blockchain.clone(),
            "method" => metric.method.clone(),
            "result" => result_label
        )
        .increment(1);
        histogram!(
            "gateway_relay_duration_ms",
            "chain" => metric.blockchain.clone(),
            "method" => metric.method.clone()
        )
        .record(metric.elapsed.as_secs_f64() * 1000.0);

        if !metric.fallback {
            if let Some(node) = metric.service_node.clone() {
                self.update_service_log(
                    &metric.blockchain,
                    &node,
                    metric.is_success(),
                    metric.elapsed,
                )
                .await;
            }
        }

        self.queue.push(metric);
    }

    /// Feeds the cherry-picker: HINCRBY the per-(chain, node) service log
    /// and refresh its TTL. Elapsed time is stored in integer microseconds
    /// because hash fields are integers.
    async fn update_service_log(&self, chain: &str, node: &str, success: bool, elapsed: Duration) {
        let key = keys::service_log(chain, node);

        if success {
            self.cache.hincrby(&key, keys::FIELD_SUCCESS, 1).await;
            let micros = i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX);
            self.cache.hincrby(&key, keys::FIELD_ELAPSED_SUM, micros).await;
            self.cache.hincrby(&key, keys::FIELD_ELAPSED_COUNT, 1).await;
        } else {
            self.cache.hincrby(&key, keys::FIELD_FAILURE, 1).await;
        }

        self.cache.expire(&key, keys::SERVICE_LOG_TTL).await;
    }
}

#[cfg(test)]
pub(crate) fn test_metric(chain: &str, node: Option<&str>, result: u16) -> RelayMetric {
    RelayMetric {
        request_id: Uuid::new_v4(),
        application_id: "app1".to_string(),
        app_public_key: "apk".to_string(),
        blockchain: chain.to_string(),
        service_node: node.map(str::to_string),
        relay_start: Utc::now(),
        result,
        bytes: 64,
        delivered: result == 200,
        fallback: false,
        method: "eth_blockNumber".to_string(),
        error: None,
        elapsed: Duration::from_millis(120),
    }
}
