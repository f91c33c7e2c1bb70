//! Cherry-picking node selection.
//!
//! Ranks a session's nodes by their recent service logs (rolling success
//! rate and mean latency from the short-TTL cache) and draws one node for
//! each outbound relay.
//!
//! Nodes partition into three tiers by success rate: preferred (≥ 95%),
//! acceptable (≥ 50%), and probationary (the rest, including nodes with too
//! few samples to judge). The draw happens inside the best non-empty tier,
//! weighted by inverse mean latency, so a consistently failing node only
//! receives traffic when nothing better exists, and fast nodes within a tier
//! see proportionally more of it. Candidates are sorted by public key before
//! the draw, which makes equal-weight outcomes deterministic under a seeded
//! or counted random source.

use crate::{
    cache::{keys, RelayCache},
    types::SessionNode,
};
use ahash::AHashSet;
use futures::future::join_all;
use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

/// Samples required before a node's success rate is trusted; below this the
/// node stays probationary.
const MIN_SAMPLES: i64 = 5;

/// Mean latency assumed for nodes without elapsed-time samples. Large enough
/// that any measured node outweighs an unmeasured one inside a tier.
const DEFAULT_LATENCY_MS: f64 = 10_000.0;

const PREFERRED_SUCCESS_RATE: f64 = 0.95;
const ACCEPTABLE_SUCCESS_RATE: f64 = 0.5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PickerError {
    /// Every session node is excluded or the candidate set was empty.
    #[error("no healthy nodes available")]
    NoHealthyNodes,
}

/// Success-rate tiers, ordered best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    Preferred,
    Acceptable,
    Probationary,
}

/// Point-in-time service-log snapshot for one (chain, node) pair.
#[derive(Debug, Clone)]
struct NodeStats {
    success: i64,
    failure: i64,
    avg_latency_ms: f64,
}

impl NodeStats {
    fn from_fields(fields: &HashMap<String, String>) -> Self {
        let read = |field: &str| {
            fields.get(field).and_then(|raw| raw.parse::<i64>().ok()).unwrap_or(0)
        };

        let elapsed_sum = read(keys::FIELD_ELAPSED_SUM);
        let elapsed_count = read(keys::FIELD_ELAPSED_COUNT);
        #[allow(clippy::cast_precision_loss)]
        let avg_latency_ms = if elapsed_count > 0 {
            (elapsed_sum as f64 / elapsed_count as f64) / 1000.0
        } else {
            DEFAULT_LATENCY_MS
        };

        Self { success: read(keys::FIELD_SUCCESS), failure: read(keys::FIELD_FAILURE), avg_latency_ms }
    }

    fn samples(&self) -> i64 {
        self.success + self.failure
    }

    /// `None` until the node has enough samples to be judged.
    #[allow(clippy::cast_precision_loss)]
    fn success_rate(&self) -> Option<f64> {
        if self.samples() < MIN_SAMPLES {
            return None;
        }
        Some(self.success as f64 / self.samples() as f64)
    }

    fn tier(&self) -> Tier {
        match self.success_rate() {
            Some(rate) if rate >= PREFERRED_SUCCESS_RATE => Tier::Preferred,
            Some(rate) if rate >= ACCEPTABLE_SUCCESS_RATE => Tier::Acceptable,
            _ => Tier::Probationary,
        }
    }

    /// Draw weight inside a tier: inverse mean latency, floored at one
    /// millisecond so a lucky zero-latency sample cannot dominate the tier.
    fn weight(&self) -> f64 {
        1.0 / self.avg_latency_ms.max(1.0)
    }
}

/// Service-log driven node selector.
#[derive(Clone)]
pub struct CherryPicker {
    cache: RelayCache,
}

impl CherryPicker {
    pub fn new(cache: RelayCache) -> Self {
        Self { cache }
    }

    /// Picks one node for a relay on `chain_id`, skipping `excluded` public
    /// keys.
    ///
    /// # Errors
    /// Returns [`PickerError::NoHealthyNodes`] when no candidate survives
    /// the exclusion set.
    pub async fn pick(
        &self,
        chain_id: &str,
        nodes: &[SessionNode],
        excluded: &AHashSet<String>,
    ) -> Result<SessionNode, PickerError> {
        let mut candidates: Vec<&SessionNode> =
            nodes.iter().filter(|node| !excluded.contains(&node.public_key)).collect();
        if candidates.is_empty() {
            return Err(PickerError::NoHealthyNodes);
        }
        candidates.sort_by(|a, b| a.public_key.cmp(&b.public_key));

        let stats = join_all(candidates.iter().map(|node| async {
            let fields = self.cache.hgetall(&keys::service_log(chain_id, &node.public_key)).await;
            NodeStats::from_fields(&fields)
        }))
        .await;

        let best_tier = stats.iter().map(NodeStats::tier).min().unwrap_or(Tier::Probationary);
        let pool: Vec<(&SessionNode, &NodeStats)> = candidates
            .iter()
            .zip(stats.iter())
            .filter(|(_, stats)| stats.tier() == best_tier)
            .map(|(node, stats)| (*node, stats))
            .collect();

        let chosen = Self::weighted_draw(&pool);
        trace!(
            chain = chain_id,
            node = %chosen.public_key,
            tier = ?best_tier,
            pool = pool.len(),
            "cherry-picked node"
        );
        Ok(chosen.clone())
    }

    /// Cumulative weighted random draw over the tier pool. The pool is
    /// non-empty by construction; the final element backstops float
    /// round-off.
    fn weighted_draw<'a>(pool: &[(&'a SessionNode, &NodeStats)]) -> &'a SessionNode {
        if pool.len() == 1 {
            return pool[0].0;
        }

        let total: f64 = pool.iter().map(|(_, stats)| stats.weight()).sum();
        let mut remaining = rand::rng().random_range(0.0..total);
        for (node, stats) in pool {
            remaining -= stats.weight();
            if remaining <= 0.0 {
                return node;
            }
        }

        pool[pool.len() - 1].0
    }
}
