//! Durable write-behind for relay metrics.
//!
//! The relay path pushes records into a bounded in-memory queue; a single
//! background flusher drains it in batches and bulk-inserts into the
//! relational `relay` table (schema owned externally). Sink failures are
//! logged and the batch is dropped: durable metrics are best-effort and
//! must never apply back-pressure to relays.

use super::RelayMetric;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("metrics sink unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for SinkError {
    fn from(e: sqlx::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Destination for durable relay records.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn write_batch(&self, batch: &[RelayMetric]) -> Result<(), SinkError>;
}

/// Bounded queue between relay tasks and the flusher.
///
/// `push` is lock-then-release with no awaiting, so it is safe on the relay
/// hot path. When the queue is full the oldest non-success record is evicted
/// first (failure records are the most numerous during incidents and the
/// least valuable individually), falling back to the oldest record overall.
pub struct WriteBehindQueue {
    buffer: Mutex<VecDeque<RelayMetric>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl WriteBehindQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueues a record, evicting per the overflow policy when full.
    pub fn push(&self, metric: RelayMetric) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.capacity {
                let evict = buffer
                    .iter()
                    .position(|queued| !queued.is_success())
                    .unwrap_or(0);
                buffer.remove(evict);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(metric);
        }
        self.notify.notify_one();
    }

    /// Removes and returns up to `max` records from the front.
    pub fn drain(&self, max: usize) -> Vec<RelayMetric> {
        let mut buffer = self.buffer.lock();
        let take = buffer.len().min(max);
        buffer.drain(..take).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Records evicted due to overflow since startup.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Background task draining a [`WriteBehindQueue`] into a [`MetricsSink`].
pub struct MetricsFlusher {
    queue: Arc<WriteBehindQueue>,
    sink: Arc<dyn MetricsSink>,
    batch_size: usize,
    flush_interval: Duration,
}

impl MetricsFlusher {
    #[must_use]
    pub fn new(queue: Arc<WriteBehindQueue>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { queue, sink, batch_size: 500, flush_interval: Duration::from_secs(5) }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Spawns the flusher. It drains on wake-ups and on a steady interval,
    /// and performs a final drain when the shutdown channel fires.
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = self.queue.wait() => {}
                    () = tokio::time::sleep(self.flush_interval) => {}
                    _ = shutdown_rx.recv() => {
                        self.flush_all().await;
                        debug!("metrics flusher shutting down");
                        break;
                    }
                }
                self.flush_all().await;
            }
        })
    }

    async fn flush_all(&self) {
        loop {
            let batch = self.queue.drain(self.batch_size);
            if batch.is_empty() {
                return;
            }
            if let Err(e) = self.sink.write_batch(&batch).await {
                warn!(records = batch.len(), error = %e, "dropping metrics batch");
            }
        }
    }
}

/// Bulk-inserting Postgres sink for the wide `relay` table.
pub struct PgMetricsSink {
    pool: PgPool,
}

impl PgMetricsSink {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricsSink for PgMetricsSink {
    async fn write_batch(&self, batch: &[RelayMetric]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut request_ids = Vec::with_capacity(batch.len());
        let mut application_ids = Vec::with_capacity(batch.len());
        let mut app_public_keys = Vec::with_capacity(batch.len());
        let mut blockchains = Vec::with_capacity(batch.len());
        let mut service_nodes = Vec::with_capacity(batch.len());
        let mut relay_starts = Vec::with_capacity(batch.len());
        let mut results = Vec::with_capacity(batch.len());
        let mut bytes = Vec::with_capacity(batch.len());
        let mut delivered = Vec::with_capacity(batch.len());
        let mut fallbacks = Vec::with_capacity(batch.len());
        let mut methods = Vec::with_capacity(batch.len());
        let mut errors = Vec::with_capacity(batch.len());
        let mut elapsed_ms = Vec::with_capacity(batch.len());

        for metric in batch {
            request_ids.push(metric.request_id);
            application_ids.push(metric.application_id.clone());
            app_public_keys.push(metric.app_public_key.clone());
            blockchains.push(metric.blockchain.clone());
            service_nodes.push(metric.service_node.clone());
            relay_starts.push(metric.relay_start);
            results.push(i32::from(metric.result));
            bytes.push(i64::try_from(metric.bytes).unwrap_or(i64::MAX));
            delivered.push(metric.delivered);
            fallbacks.push(metric.fallback);
            methods.push(metric.method.clone());
            errors.push(metric.error.clone());
            elapsed_ms.push(metric.elapsed.as_secs_f64() * 1000.0);
        }

        sqlx::query(
            "INSERT INTO relay (request_id, application_id, app_public_key, blockchain,
                                service_node, relay_start, result, bytes, delivered,
                                fallback, method, error_text, elapsed_ms)
             SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::text[],
                                  $5::text[], $6::timestamptz[], $7::int4[], $8::int8[],
                                  $9::bool[], $10::bool[], $11::text[], $12::text[],
                                  $13::float8[])",
        )
        .bind(&request_ids)
        .bind(&application_ids)
        .bind(&app_public_keys)
        .bind(&blockchains)
        .bind(&service_nodes)
        .bind(&relay_starts)
        .bind(&results)
        .bind(&bytes)
        .bind(&delivered)
        .bind(&fallbacks)
        .bind(&methods)
        .bind(&errors)
        .bind(&elapsed_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
