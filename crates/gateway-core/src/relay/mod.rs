//! Service-node network client seam.
//!
//! The gateway never talks to service nodes directly; session negotiation
//! and cryptographic relay signing live behind [`RelaySender`], whose
//! interface is fixed by the external network client. The core only decides
//! *which* node a relay targets and *what* dispatch parameters it carries.

use crate::{
    config::tuner::SessionConfig,
    types::{Aat, Application, Session, SessionNode},
};
use async_trait::async_trait;
use thiserror::Error;

/// A successful relay: the upstream JSON-RPC payload, returned to the client
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub payload: String,
}

/// A failed relay, tagged with the offending node when the network client
/// knows it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The dispatch exceeded its configured timeout.
    #[error("relay timed out")]
    Timeout { service_node: Option<String> },

    /// The session this relay was signed against has rolled over; the
    /// orchestrator refreshes the session and continues its loop.
    #[error("session expired")]
    SessionExpired,

    /// The node returned an error or misbehaved.
    #[error("relay failed ({code}): {message}")]
    Node { message: String, code: i64, service_node: Option<String> },

    /// No session could be negotiated with the dispatchers.
    #[error("session dispatch failed: {0}")]
    Dispatch(String),
}

impl RelayError {
    /// The public key of the node the error is attributed to, when known.
    #[must_use]
    pub fn service_node(&self) -> Option<&str> {
        match self {
            Self::Timeout { service_node } | Self::Node { service_node, .. } => {
                service_node.as_deref()
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    #[must_use]
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}

/// Opaque client for the decentralized relay path.
///
/// Implementations own dispatcher selection, AAT signing, and response
/// validation; the orchestrator owns node choice, retries, and metrics.
#[async_trait]
pub trait RelaySender: Send + Sync {
    /// The current session for an (application, chain) pair.
    async fn current_session(
        &self,
        app: &Application,
        chain_id: &str,
    ) -> Result<Session, RelayError>;

    /// Forces a fresh session after [`RelayError::SessionExpired`].
    async fn refresh_session(
        &self,
        app: &Application,
        chain_id: &str,
    ) -> Result<Session, RelayError>;

    /// Sends one relay. A `node` of `None` lets the network client pick;
    /// `consensus` dispatches to `config.consensus_node_count` nodes and
    /// majority-resolves the answer, penalizing dissenters.
    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        method: &str,
        chain_id: &str,
        payload: &[u8],
        aat: &Aat,
        config: &SessionConfig,
        node: Option<&SessionNode>,
        consensus: bool,
    ) -> Result<RelayResponse, RelayError>;
}
