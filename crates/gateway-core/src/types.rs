//! Core type definitions for applications, blockchains, and sessions.
//!
//! # Type Categories
//!
//! - **Portal records**: [`Application`], [`LoadBalancer`], [`Blockchain`]:
//!   immutable configuration fetched from the read-only repositories and
//!   cached for 60 seconds.
//! - **Session types**: [`SessionNode`], [`Session`], [`NodeSyncLog`]: the
//!   time-bounded node assignment handed out by the service-node network.
//!   The core treats nodes as opaque handles keyed by public key.
//! - **Wire helpers**: JSON-RPC method extraction for single and batch
//!   bodies, used for metrics labeling and request validation.
//!
//! Cached records serialize as camelCase JSON, matching the shape the portal
//! database exports.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Application Authentication Token: the credential the gateway uses to sign
/// relays on behalf of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aat {
    pub version: String,
    pub app_pub_key: String,
    pub client_pub_key: String,
    pub signature: String,
}

/// Per-application gateway settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    /// Secret the client must present when `secret_key_required` is set.
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub secret_key_required: bool,
    /// Origins allowed to override the blockchain via the Host header.
    #[serde(default)]
    pub whitelisted_blockchains: Vec<String>,
    #[serde(default)]
    pub whitelisted_origins: Vec<String>,
    #[serde(default)]
    pub whitelisted_user_agents: Vec<String>,
}

/// Immutable application record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub public_key: String,
    #[serde(default)]
    pub free_tier_aat: Option<Aat>,
    #[serde(default)]
    pub gateway_aat: Option<Aat>,
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub settings: AppSettings,
}

impl Application {
    /// The AAT used for every relay of this application: the gateway-owned
    /// token when present, the free-tier token otherwise. Static per
    /// application, chosen once at resolution time.
    #[must_use]
    pub fn relay_aat(&self) -> Option<&Aat> {
        self.gateway_aat.as_ref().or(self.free_tier_aat.as_ref())
    }
}

/// Load balancer record: a named set of application ids, one of which is
/// drawn uniformly at random per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub id: String,
    #[serde(default)]
    pub application_ids: Vec<String>,
}

/// Blockchain descriptor, indexed by hex id and by path alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blockchain {
    /// Hex network identifier, e.g. `0021`.
    pub id: String,
    pub ticker: String,
    pub network_id: String,
    /// Path prefixes and host aliases resolving to this chain.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// JSON-RPC payload probing a node's current block height. Chains
    /// without one skip sync checking entirely.
    #[serde(default)]
    pub sync_check_payload: Option<String>,
    /// Blocks a node may lag the highest reported height and still count as
    /// in sync.
    #[serde(default)]
    pub sync_allowance: u64,
    /// JSON-RPC payload probing a node's reported chain id. Chains without
    /// one skip chain checking.
    #[serde(default)]
    pub chain_id_check_payload: Option<String>,
    #[serde(default)]
    pub log_limit: Option<u64>,
    /// Alternative backend POSTed directly when the decentralized path is
    /// exhausted.
    #[serde(default)]
    pub alt_runtime_url: Option<String>,
}

/// A service node assigned to the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNode {
    pub public_key: String,
    pub service_url: String,
    #[serde(default)]
    pub chains: Vec<String>,
}

/// The time-bounded assignment of nodes to an (application, chain) pair.
/// Lifetime is defined by the external service-node network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: String,
    pub nodes: Vec<SessionNode>,
}

impl Session {
    /// Deterministic fingerprint of this session's node set, used as a cache
    /// namespace for sync/chain check results.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        session_fingerprint(&self.nodes)
    }
}

/// Result of one sync probe against one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSyncLog {
    pub node: SessionNode,
    pub chain_id: String,
    pub block_height: u64,
}

/// Computes the 64-hex session fingerprint: SHA-256 over the canonical JSON
/// of the node set sorted by public key, with the public-key field elided.
///
/// Identical node sets produce identical fingerprints across processes
/// regardless of node ordering; adding or removing a node changes the value,
/// so stale verified-set cache entries become unreachable when the session
/// rolls over.
#[must_use]
pub fn session_fingerprint(nodes: &[SessionNode]) -> String {
    let mut sorted: Vec<&SessionNode> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.public_key.cmp(&b.public_key));

    // serde_json maps are BTree-backed, so object keys serialize sorted and
    // the encoding is canonical without extra work.
    let canonical: Vec<serde_json::Value> = sorted
        .iter()
        .map(|node| {
            serde_json::json!({
                "chains": node.chains,
                "serviceUrl": node.service_url,
            })
        })
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(&canonical).unwrap_or_default());
    hex_digest(&hasher.finalize())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Errors from JSON-RPC body inspection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcBodyError {
    #[error("malformed JSON-RPC body")]
    Malformed,

    #[error("empty JSON-RPC batch")]
    EmptyBatch,
}

/// Extracts the JSON-RPC method from a raw request body.
///
/// Batch bodies report the first element's method; bodies without a string
/// `method` field are malformed. The method is used for metrics labeling and
/// never interpreted by the gateway itself.
pub fn rpc_method(raw: &[u8]) -> Result<String, RpcBodyError> {
    let body: serde_json::Value =
        serde_json::from_slice(raw).map_err(|_| RpcBodyError::Malformed)?;

    let request = match &body {
        serde_json::Value::Array(batch) => batch.first().ok_or(RpcBodyError::EmptyBatch)?,
        serde_json::Value::Object(_) => &body,
        _ => return Err(RpcBodyError::Malformed),
    };

    request
        .get("method")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or(RpcBodyError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(pk: &str, url: &str) -> SessionNode {
        SessionNode {
            public_key: pk.to_string(),
            service_url: url.to_string(),
            chains: vec!["0021".to_string()],
        }
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = vec![node("pk1", "https://a.example"), node("pk2", "https://b.example")];
        let b = vec![node("pk2", "https://b.example"), node("pk1", "https://a.example")];

        assert_eq!(session_fingerprint(&a), session_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_changes_with_membership() {
        let two = vec![node("pk1", "https://a.example"), node("pk2", "https://b.example")];
        let three = vec![
            node("pk1", "https://a.example"),
            node("pk2", "https://b.example"),
            node("pk3", "https://c.example"),
        ];

        assert_ne!(session_fingerprint(&two), session_fingerprint(&three));
    }

    #[test]
    fn test_fingerprint_is_64_hex() {
        let fp = session_fingerprint(&[node("pk1", "https://a.example")]);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_of_empty_set_is_stable() {
        assert_eq!(session_fingerprint(&[]), session_fingerprint(&[]));
    }

    #[test]
    fn test_relay_aat_prefers_gateway_token() {
        let aat = |suffix: &str| Aat {
            version: "0.0.1".to_string(),
            app_pub_key: format!("app-{suffix}"),
            client_pub_key: format!("client-{suffix}"),
            signature: format!("sig-{suffix}"),
        };

        let mut app = Application {
            id: "app1".to_string(),
            public_key: "pk".to_string(),
            free_tier_aat: Some(aat("free")),
            gateway_aat: Some(aat("gateway")),
            chains: vec![],
            settings: AppSettings::default(),
        };
        assert_eq!(app.relay_aat().unwrap().app_pub_key, "app-gateway");

        app.gateway_aat = None;
        assert_eq!(app.relay_aat().unwrap().app_pub_key, "app-free");

        app.free_tier_aat = None;
        assert!(app.relay_aat().is_none());
    }

    #[test]
    fn test_rpc_method_single() {
        let raw = br#"{"method":"eth_blockNumber","params":[],"id":1,"jsonrpc":"2.0"}"#;
        assert_eq!(rpc_method(raw).unwrap(), "eth_blockNumber");
    }

    #[test]
    fn test_rpc_method_batch_uses_first_element() {
        let raw = br#"[{"method":"eth_getBalance","params":[],"id":1,"jsonrpc":"2.0"},
                       {"method":"eth_blockNumber","params":[],"id":2,"jsonrpc":"2.0"}]"#;
        assert_eq!(rpc_method(raw).unwrap(), "eth_getBalance");
    }

    #[test]
    fn test_rpc_method_rejects_malformed_bodies() {
        assert_eq!(rpc_method(b"not json"), Err(RpcBodyError::Malformed));
        assert_eq!(rpc_method(br#""just a string""#), Err(RpcBodyError::Malformed));
        assert_eq!(rpc_method(br#"{"id":1}"#), Err(RpcBodyError::Malformed));
        assert_eq!(rpc_method(b"[]"), Err(RpcBodyError::EmptyBatch));
    }

    #[test]
    fn test_application_record_roundtrip() {
        let json = r#"{
            "id": "app1",
            "publicKey": "pk",
            "gatewayAat": {
                "version": "0.0.1",
                "appPubKey": "pk",
                "clientPubKey": "cpk",
                "signature": "sig"
            },
            "chains": ["0021"],
            "settings": {"secretKeyRequired": false}
        }"#;

        let app: Application = serde_json::from_str(json).unwrap();
        assert_eq!(app.id, "app1");
        assert!(app.free_tier_aat.is_none());
        assert_eq!(app.relay_aat().unwrap().client_pub_key, "cpk");

        let reencoded = serde_json::to_value(&app).unwrap();
        assert_eq!(reencoded["publicKey"], "pk");
    }
}
