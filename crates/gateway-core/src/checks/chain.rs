//! Chain-id filter.
//!
//! Companion to the sync checker with the same caching and locking shape:
//! probe every session node with the chain's id query and admit only the
//! nodes whose reported chain id exactly equals the requested one. Catches
//! nodes advertising a chain they do not actually serve.

use super::{cached_subset, normalize_chain_id, parse_chain_id, ProbeContext};
use crate::{
    cache::{keys, RelayCache},
    config::tuner::SessionConfig,
    metrics::{MetricsRecorder, RelayMetric, CHAIN_CHECK_METHOD},
    relay::RelaySender,
    types::{Blockchain, SessionNode},
};
use chrono::Utc;
use futures::future::join_all;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

/// Filters a session's nodes down to those on the declared chain.
#[derive(Clone)]
pub struct ChainChecker {
    cache: RelayCache,
    recorder: MetricsRecorder,
}

impl ChainChecker {
    pub fn new(cache: RelayCache, recorder: MetricsRecorder) -> Self {
        Self { cache, recorder }
    }

    /// Returns the chain-verified subset of `nodes`, failing open to the
    /// unfiltered set when the check cannot complete or verifies nobody.
    pub async fn filter(
        &self,
        nodes: &[SessionNode],
        blockchain: &Blockchain,
        ctx: &ProbeContext,
        sender: &Arc<dyn RelaySender>,
        probe_config: &SessionConfig,
    ) -> Vec<SessionNode> {
        let Some(payload) = blockchain.chain_id_check_payload.clone() else {
            return nodes.to_vec();
        };
        if nodes.is_empty() {
            return Vec::new();
        }

        let Some(expected) = normalize_chain_id(&blockchain.network_id) else {
            warn!(
                chain = %blockchain.id,
                network_id = %blockchain.network_id,
                "unparseable declared chain id, skipping chain check"
            );
            return nodes.to_vec();
        };

        let key = keys::chain_checked_nodes(&blockchain.id, &ctx.session_fingerprint);
        if let Some(subset) = cached_subset(&self.cache, &key, nodes).await {
            return subset;
        }

        if !self.cache.try_lock(&keys::probe_lock(&key), keys::PROBE_LOCK_TTL).await {
            debug!(key, "chain-check lock held elsewhere, returning unfiltered set");
            return nodes.to_vec();
        }

        let verified: Vec<String> = join_all(
            nodes
                .iter()
                .map(|node| self.probe_node(node, &payload, blockchain, ctx, sender, probe_config)),
        )
        .await
        .into_iter()
        .zip(nodes.iter())
        .filter(|(reported, _)| reported.as_deref() == Some(expected.as_str()))
        .map(|(_, node)| node.public_key.clone())
        .collect();

        if verified.is_empty() {
            // Consistent with readers ignoring empty cached sets: a pass
            // that verifies nobody fails open rather than blanking the
            // session.
            error!(chain = %blockchain.id, "chain check verified no nodes, failing open");
            return nodes.to_vec();
        }

        info!(
            chain = %blockchain.id,
            verified = verified.len(),
            probed = nodes.len(),
            "chain check complete"
        );
        self.cache.set_json(&key, &verified, keys::VERIFIED_SET_TTL).await;

        nodes.iter().filter(|node| verified.contains(&node.public_key)).cloned().collect()
    }

    /// Probes one node for its chain id, recording one `chaincheck` metric.
    /// Returns the normalized reported id when the probe answered at all; a
    /// mismatch is an admission failure, not a node failure.
    async fn probe_node(
        &self,
        node: &SessionNode,
        payload: &str,
        blockchain: &Blockchain,
        ctx: &ProbeContext,
        sender: &Arc<dyn RelaySender>,
        config: &SessionConfig,
    ) -> Option<String> {
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

        let (result, error, reported) = match outcome {
            Ok(Ok(response)) => match parse_chain_id(&response.payload) {
                Some(id) => (200, None, Some(id)),
                None => (500, Some("unparseable chain probe response".to_string()), None),
            },
            Ok(Err(e)) => (500, Some(e.to_string()), None),
            Err(_) => (500, Some("chain probe timed out".to_string()), None),
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
                method: CHAIN_CHECK_METHOD.to_string(),
                error,
                elapsed,
            })
            .await;

        reported
    }
}
