//! Transient session configurations.
//!
//! Relays, health probes, and consensus challenges run against the same
//! service-node network but with different dispatch parameters. Rather than
//! mutating the process-wide [`PocketConfig`], each dispatch derives a
//! throwaway [`SessionConfig`] tuned for its purpose.

use super::{GatewayConfig, PocketConfig};
use serde::{Deserialize, Serialize};

/// Per-dispatch parameters handed to the relay sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub request_timeout_ms: u64,
    pub consensus_node_count: usize,
    pub accept_disputed_responses: bool,
    pub validate_relay_responses: bool,
    pub reject_self_signed_certificates: bool,
}

impl From<&PocketConfig> for SessionConfig {
    fn from(pocket: &PocketConfig) -> Self {
        Self {
            request_timeout_ms: pocket.request_timeout_ms,
            consensus_node_count: pocket.consensus_node_count,
            accept_disputed_responses: pocket.accept_disputed_responses,
            validate_relay_responses: pocket.validate_relay_responses,
            reject_self_signed_certificates: pocket.reject_self_signed_certificates,
        }
    }
}

/// Base configuration for client relays: the pocket settings unchanged.
#[must_use]
pub fn for_relay(config: &GatewayConfig) -> SessionConfig {
    SessionConfig::from(&config.pocket)
}

/// Probe configuration: dispatch timeout shortened to the probe timeout so a
/// slow node cannot stall the sync/chain check pass; everything else
/// inherited.
#[must_use]
pub fn for_probe(config: &GatewayConfig) -> SessionConfig {
    SessionConfig {
        request_timeout_ms: config.relay.probe_timeout_ms,
        ..SessionConfig::from(&config.pocket)
    }
}

/// Consensus-challenge configuration: five nodes, disputed responses
/// rejected, probe timeout.
#[must_use]
pub fn for_consensus(config: &GatewayConfig) -> SessionConfig {
    SessionConfig {
        request_timeout_ms: config.relay.probe_timeout_ms,
        consensus_node_count: 5,
        accept_disputed_responses: false,
        ..SessionConfig::from(&config.pocket)
    }
}
