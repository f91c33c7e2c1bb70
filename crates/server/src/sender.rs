//! Static-session relay sender.
//!
//! Deployment seam for the service-node network client. The production
//! gateway links the full network client (dispatcher sessions, AAT-signed
//! relays); this process ships a pass-through implementation that treats the
//! configured dispatcher URLs as a fixed session and POSTs relay payloads
//! straight to each node's service URL. It exercises the entire dispatch
//! pipeline (fingerprinting, sync/chain checks, cherry-picking, retries)
//! against plain JSON-RPC endpoints.

use async_trait::async_trait;
use gateway_core::{
    config::tuner::SessionConfig,
    relay::{RelayError, RelayResponse, RelaySender},
    types::{Aat, Application, Session, SessionNode},
};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Pass-through sender over a fixed node set.
pub struct StaticSessionSender {
    nodes: Vec<SessionNode>,
    client: reqwest::Client,
}

impl StaticSessionSender {
    /// Builds the sender from node endpoint URLs.
    ///
    /// # Errors
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(endpoints: &[String], timeout_ms: u64) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| RelayError::Dispatch(format!("http client: {e}")))?;

        let nodes = endpoints
            .iter()
            .map(|url| SessionNode {
                // A stable pseudo-identity per endpoint; real node keys come
                // from the network client.
                public_key: endpoint_identity(url),
                service_url: url.clone(),
                chains: Vec::new(),
            })
            .collect();

        Ok(Self { nodes, client })
    }
}

fn endpoint_identity(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl RelaySender for StaticSessionSender {
    async fn current_session(
        &self,
        _app: &Application,
        chain_id: &str,
    ) -> Result<Session, RelayError> {
        if self.nodes.is_empty() {
            return Err(RelayError::Dispatch("no endpoints configured".to_string()));
        }
        Ok(Session { key: format!("static-{chain_id}"), nodes: self.nodes.clone() })
    }

    async fn refresh_session(
        &self,
        app: &Application,
        chain_id: &str,
    ) -> Result<Session, RelayError> {
        self.current_session(app, chain_id).await
    }

    async fn send(
        &self,
        _method: &str,
        _chain_id: &str,
        payload: &[u8],
        _aat: &Aat,
        _config: &SessionConfig,
        node: Option<&SessionNode>,
        _consensus: bool,
    ) -> Result<RelayResponse, RelayError> {
        let node = node.or_else(|| self.nodes.first()).ok_or_else(|| {
            RelayError::Dispatch("no endpoints configured".to_string())
        })?;

        let response = self
            .client
            .post(&node.service_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayError::Timeout { service_node: Some(node.public_key.clone()) }
                } else {
                    RelayError::Node {
                        message: e.to_string(),
                        code: -32000,
                        service_node: Some(node.public_key.clone()),
                    }
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| RelayError::Node {
            message: e.to_string(),
            code: -32000,
            service_node: Some(node.public_key.clone()),
        })?;

        if !status.is_success() {
            return Err(RelayError::Node {
                message: format!("endpoint returned HTTP {}", status.as_u16()),
                code: i64::from(status.as_u16()),
                service_node: Some(node.public_key.clone()),
            });
        }

        Ok(RelayResponse { payload: body })
    }
}
