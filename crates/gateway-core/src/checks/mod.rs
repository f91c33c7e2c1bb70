//! Session health filters.
//!
//! Before a relay is dispatched, the session's nodes pass through two
//! consensus-driven filters: the [`sync::SyncChecker`] keeps only nodes at
//! the chain tip, and the [`chain::ChainChecker`] keeps only nodes reporting
//! the requested chain id. Both cache their verified subsets under the
//! session fingerprint and elect a single prober fleet-wide through a cache
//! lock; every other request reads the published subset or fails open with
//! the unfiltered node set. Probe failures never surface to clients.

pub mod chain;
pub mod sync;

use crate::{
    cache::RelayCache,
    types::{Aat, SessionNode},
};
use serde_json::Value;
use uuid::Uuid;

/// Request-scoped parameters shared by both checkers.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub request_id: Uuid,
    pub application_id: String,
    pub app_public_key: String,
    pub aat: Aat,
    /// Fingerprint of the session under check; namespaces the cached
    /// verified sets.
    pub session_fingerprint: String,
}

/// Returns the cached verified subset of `nodes` at `key`, or `None` when no
/// usable entry exists. Empty cached sets are ignored so a degenerate probe
/// pass cannot blank out a session.
///
/// The intersection with the live node set keeps the invariant that a cached
/// list is always a subset of the current session.
pub(crate) async fn cached_subset(
    cache: &RelayCache,
    key: &str,
    nodes: &[SessionNode],
) -> Option<Vec<SessionNode>> {
    let verified: Vec<String> = cache.get_json(key).await?;
    if verified.is_empty() {
        return None;
    }

    Some(nodes.iter().filter(|node| verified.contains(&node.public_key)).cloned().collect())
}

/// Extracts a block height from a probe response payload.
///
/// Accepts the JSON-RPC shape `{"result": "0x64"}`, the REST shape
/// `{"height": 100}`, and bare string/number payloads. Heights encode as hex
/// with a `0x` prefix, decimal, or prefixless hex, tried in that order.
#[must_use]
pub(crate) fn parse_block_height(payload: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(payload).ok()?;
    height_from_value(&value)
}

fn height_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::String(raw) => parse_height_str(raw),
        Value::Number(n) => n.as_u64(),
        Value::Object(map) => {
            map.get("result").or_else(|| map.get("height")).and_then(height_from_value)
        }
        _ => None,
    }
}

fn parse_height_str(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    raw.parse::<u64>().ok().or_else(|| u64::from_str_radix(raw, 16).ok())
}

/// Extracts and normalizes a reported chain id to its decimal string form,
/// so `"0x64"`, `"100"`, and `100` all compare equal.
#[must_use]
pub(crate) fn parse_chain_id(payload: &str) -> Option<String> {
    parse_block_height(payload).map(|id| id.to_string())
}

/// Normalizes a configured chain id the same way probe responses are.
#[must_use]
pub(crate) fn normalize_chain_id(raw: &str) -> Option<String> {
    parse_height_str(raw).map(|id| id.to_string())
}
