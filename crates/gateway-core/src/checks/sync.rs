//! Consensus-driven sync filter.
//!
//! Probes every node in the session for its current block height and admits
//! the nodes within the chain's sync allowance of the highest agreed height.
//! The verified set is published to the cache for five minutes under the
//! session fingerprint; a 60 second probe lock elects exactly one prober per
//! session across the whole gateway fleet.
//!
//! State machine per session fingerprint:
//!
//! ```text
//!   FRESH ──first request──▶ LOCKED (60s lock, probing)
//!      ▲                          │
//!      │                          ▼
//!      └──cache 300s──── PUBLISHED (in-sync set cached)
//! ```
//!
//! Every guard in here fails open: a busy lock, too few successful probes,
//! or a height outlier all return the unfiltered node set. A degraded check
//! must never take the relay path down with it.

use super::{cached_subset, parse_block_height, ProbeContext};
use crate::{
    cache::{keys, RelayCache},
    config::tuner::SessionConfig,
    metrics::{MetricsRecorder, RelayMetric, SYNC_CHECK_METHOD},
    relay::RelaySender,
    types::{Blockchain, NodeSyncLog, SessionNode},
};
use chrono::Utc;
use futures::future::join_all;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

/// Successful probes required before the filter result is trusted.
const MIN_SUCCESSFUL_PROBES: usize = 3;

/// Maximum gap between the two highest reporters. A larger gap means the top
/// node is an outlier and the pass is abandoned.
const MAX_TOP_GAP: u64 = 1;

/// In-sync count below which a consensus challenge relay is dispatched.
const CHALLENGE_THRESHOLD: usize = 5;

/// Filters a session's nodes down to the subset at the chain tip.
#[derive(Clone)]
pub struct SyncChecker {
    cache: RelayCache,
    recorder: MetricsRecorder,
}

impl SyncChecker {
    pub fn new(cache: RelayCache, recorder: MetricsRecorder) -> Self {
        Self { cache, recorder }
    }

    /// Returns the in-sync subset of `nodes`, or `nodes` unchanged whenever
    /// the check cannot complete trustworthily.
    pub async fn filter(
        &self,
        nodes: &[SessionNode],
        blockchain: &Blockchain,
        ctx: &ProbeContext,
        sender: &Arc<dyn RelaySender>,
        probe_config: &SessionConfig,
        consensus_config: &SessionConfig,
    ) -> Vec<SessionNode> {
        let Some(payload) = blockchain.sync_check_payload.clone() else {
            // Chain doesn't define a sync probe; nothing to filter on.
            return nodes.to_vec();
        };
        if nodes.is_empty() {
            return Vec::new();
        }

        let key = keys::synced_nodes(&blockchain.id, &ctx.session_fingerprint);
        if let Some(subset) = cached_subset(&self.cache, &key, nodes).await {
            return subset;
        }

        if !self.cache.try_lock(&keys::probe_lock(&key), keys::PROBE_LOCK_TTL).await {
            debug!(key, "sync-check lock held elsewhere, returning unfiltered set");
            return nodes.to_vec();
        }

        let mut logs =
            self.probe_heights(nodes, &payload, blockchain, ctx, sender, probe_config).await;
        if logs.len() < MIN_SUCCESSFUL_PROBES {
            error!(
                chain = %blockchain.id,
                successful = logs.len(),
                "not enough successful sync probes, failing open"
            );
            return nodes.to_vec();
        }

        logs.sort_by(|a, b| b.block_height.cmp(&a.block_height));
        let top = logs[0].block_height;
        let runner_up = logs[1].block_height;
        if top > runner_up + MAX_TOP_GAP {
            warn!(
                chain = %blockchain.id,
                top,
                runner_up,
                "highest reporter disagrees with the field, failing open"
            );
            return nodes.to_vec();
        }

        let in_sync: Vec<String> = logs
            .iter()
            .filter(|log| log.block_height + blockchain.sync_allowance >= top)
            .map(|log| log.node.public_key.clone())
            .collect();

        info!(
            chain = %blockchain.id,
            top,
            in_sync = in_sync.len(),
            probed = nodes.len(),
            "sync check complete"
        );
        self.cache.set_json(&key, &in_sync, keys::VERIFIED_SET_TTL).await;

        if in_sync.len() < CHALLENGE_THRESHOLD {
            self.spawn_challenge(payload, blockchain, ctx, sender, consensus_config);
        }

        nodes.iter().filter(|node| in_sync.contains(&node.public_key)).cloned().collect()
    }

    async fn probe_heights(
        &self,
        nodes: &[SessionNode],
        payload: &str,
        blockchain: &Blockchain,
        ctx: &ProbeContext,
        sender: &Arc<dyn RelaySender>,
        config: &SessionConfig,
    ) -> Vec<NodeSyncLog> {
        join_all(
            nodes
                .iter()
                .map(|node| self.probe_node(node, payload, blockchain, ctx, sender, config)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    /// Probes one node for its block height. Records exactly one `synccheck`
    /// metric regardless of outcome; failures leave the node in the session
    /// and degrade its service log naturally.
    async fn probe_node(
        &self,
        node: &SessionNode,
        payload: &str,
        blockchain: &Blockchain,
        ctx: &ProbeContext,
        sender: &Arc<dyn RelaySender>,
        config: &SessionConfig,
    ) -> Option<NodeSyncLog> {
        let relay_start = Utc::now();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_millis(config.request_timeout_ms),
            sender.send(
                "",
                &blockchain.id,
                payload.as_bytes(),
                &ctx.aat,
                config,
                Some(node),
                false,
            ),
        )
        .await;
        let elapsed = started.elapsed();

        let (result, error, height) = match outcome {
            Ok(Ok(response)) => match parse_block_height(&response.payload) {
                Some(height) => (200, None, Some(height)),
                None => (500, Some("unparseable sync probe response".to_string()), None),
            },
            Ok(Err(e)) => (500, Some(e.to_string()), None),
            Err(_) => (500, Some("sync probe timed out".to_string()), None),
        };

        self.recorder
            .record(RelayMetric {
                request_id: ctx.request_id,
                application_id: ctx.application_id.clone(),
                app_public_key: ctx.app_public_key.clone(),
                blockchain: blockchain.id.clone(),
                service_node: Some(node.public_key.clone()),
                relay_start,
                result,
                bytes: payload.len(),
                delivered: result == 200,
                fallback: false,
                method: SYNC_CHECK_METHOD.to_string(),
                error,
                elapsed,
            })
            .await;

        height.map(|block_height| NodeSyncLog {
            node: node.clone(),
            chain_id: blockchain.id.clone(),
            block_height,
        })
    }

    /// Dispatches a consensus-mode relay to penalize out-of-sync nodes.
    /// Detached: the result is logged, never awaited by the relay path.
    fn spawn_challenge(
        &self,
        payload: String,
        blockchain: &Blockchain,
        ctx: &ProbeContext,
        sender: &Arc<dyn RelaySender>,
        consensus_config: &SessionConfig,
    ) {
        let sender = Arc::clone(sender);
        let chain_id = blockchain.id.clone();
        let aat = ctx.aat.clone();
        let config = consensus_config.clone();

        tokio::spawn(async move {
            let outcome = tokio::time::timeout(
                Duration::from_millis(config.request_timeout_ms),
                sender.send("", &chain_id, payload.as_bytes(), &aat, &config, None, true),
            )
            .await;

            match outcome {
                Ok(Ok(_)) => info!(chain = %chain_id, "consensus challenge dispatched"),
                Ok(Err(e)) => warn!(chain = %chain_id, error = %e, "consensus challenge failed"),
                Err(_) => warn!(chain = %chain_id, "consensus challenge timed out"),
            }
        });
    }
}
