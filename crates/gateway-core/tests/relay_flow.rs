//! End-to-end dispatch flow against a scripted service-node network.

use async_trait::async_trait;
use gateway_core::{
    cache::{memory::MemoryCache, RelayCache},
    config::{tuner::SessionConfig, GatewayConfig},
    dispatch::{GatewayError, RelayOrchestrator, RequestContext},
    metrics::{sink::WriteBehindQueue, MetricsRecorder, SYNC_CHECK_METHOD},
    registry::{
        ApplicationRepository, BlockchainRepository, LoadBalancerRepository, Registry,
        RegistryError,
    },
    relay::{RelayError, RelayResponse, RelaySender},
    types::{Aat, AppSettings, Application, Blockchain, LoadBalancer, Session, SessionNode},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

const BODY: &[u8] = br#"{"method":"eth_blockNumber","params":[],"id":1,"jsonrpc":"2.0"}"#;
const UPSTREAM_PAYLOAD: &str = r#"{"jsonrpc":"2.0","id":1,"result":"0xc9f2c9"}"#;

/// Scripted network: fixed session, per-node heights, relay payloads.
struct FakeNetwork {
    nodes: Vec<SessionNode>,
    heights: HashMap<String, u64>,
    relays: AtomicUsize,
    relayed_to: Mutex<Vec<String>>,
}

impl FakeNetwork {
    fn new(heights: &[(&str, u64)]) -> Arc<Self> {
        Arc::new(Self {
            nodes: heights
                .iter()
                .map(|(pk, _)| SessionNode {
                    public_key: (*pk).to_string(),
                    service_url: format!("https://{pk}.example"),
                    chains: vec!["0021".to_string()],
                })
                .collect(),
            heights: heights.iter().map(|(pk, h)| ((*pk).to_string(), *h)).collect(),
            relays: AtomicUsize::new(0),
            relayed_to: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RelaySender for FakeNetwork {
    async fn current_session(
        &self,
        _app: &Application,
        _chain_id: &str,
    ) -> Result<Session, RelayError> {
        Ok(Session { key: "session-1".to_string(), nodes: self.nodes.clone() })
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
        consensus: bool,
    ) -> Result<RelayResponse, RelayError> {
        if consensus {
            return Ok(RelayResponse { payload: "{}".to_string() });
        }
        let node = node.expect("dispatch always targets a node");

        // Sync probes carry the chain's probe payload; everything else is a
        // client relay.
        if payload == br#"{"method":"eth_blockNumber","params":[],"id":1,"jsonrpc":"2.0","probe":true}"# {
            let height = self.heights[&node.public_key];
            return Ok(RelayResponse {
                payload: format!(r#"{{"jsonrpc":"2.0","id":1,"result":"0x{height:x}"}}"#),
            });
        }

        self.relays.fetch_add(1, Ordering::SeqCst);
        self.relayed_to.lock().push(node.public_key.clone());
        Ok(RelayResponse { payload: UPSTREAM_PAYLOAD.to_string() })
    }
}

struct Portal {
    chains: Vec<Blockchain>,
}

#[async_trait]
impl ApplicationRepository for Portal {
    async fn application(&self, id: &str) -> Result<Option<Application>, RegistryError> {
        if id != "app-abc" {
            return Ok(None);
        }
        Ok(Some(Application {
            id: "app-abc".to_string(),
            public_key: "app-pk".to_string(),
            free_tier_aat: Some(Aat {
                version: "0.0.1".to_string(),
                app_pub_key: "app-pk".to_string(),
                client_pub_key: "client-pk".to_string(),
                signature: "sig".to_string(),
            }),
            gateway_aat: None,
            chains: vec!["0021".to_string()],
            settings: AppSettings::default(),
        }))
    }
}

#[async_trait]
impl LoadBalancerRepository for Portal {
    async fn load_balancer(&self, id: &str) -> Result<Option<LoadBalancer>, RegistryError> {
        if id != "abc" {
            return Ok(None);
        }
        Ok(Some(LoadBalancer {
            id: "abc".to_string(),
            application_ids: vec!["app-abc".to_string(), "app-gone".to_string()],
        }))
    }
}

#[async_trait]
impl BlockchainRepository for Portal {
    async fn blockchains(&self) -> Result<Vec<Blockchain>, RegistryError> {
        Ok(self.chains.clone())
    }
}

fn eth_chain(alt_runtime_url: Option<String>) -> Blockchain {
    Blockchain {
        id: "0021".to_string(),
        ticker: "ETH".to_string(),
        network_id: "1".to_string(),
        aliases: vec!["eth-mainnet".to_string()],
        sync_check_payload: Some(
            r#"{"method":"eth_blockNumber","params":[],"id":1,"jsonrpc":"2.0","probe":true}"#
                .to_string(),
        ),
        sync_allowance: 1,
        chain_id_check_payload: None,
        log_limit: None,
        alt_runtime_url,
    }
}

async fn gateway(
    sender: Arc<dyn RelaySender>,
    chains: Vec<Blockchain>,
) -> (RelayOrchestrator, Arc<WriteBehindQueue>) {
    let cache = RelayCache::new(Arc::new(MemoryCache::new()));
    let queue = WriteBehindQueue::new(1024);
    let recorder = MetricsRecorder::new(cache.clone(), Arc::clone(&queue));

    let portal = Arc::new(Portal { chains });
    let registry = Arc::new(
        Registry::new(
            Arc::clone(&portal) as Arc<dyn ApplicationRepository>,
            Arc::clone(&portal) as Arc<dyn LoadBalancerRepository>,
            portal as Arc<dyn BlockchainRepository>,
            cache.clone(),
        )
        .await
        .unwrap(),
    );

    let orchestrator = RelayOrchestrator::new(
        Arc::new(GatewayConfig::default()),
        registry,
        cache,
        recorder,
        sender,
    )
    .unwrap();

    (orchestrator, queue)
}

fn eth_mainnet_ctx() -> RequestContext {
    let mut ctx = RequestContext::new();
    ctx.host = Some("eth-mainnet.gateway.example".to_string());
    ctx
}

#[tokio::test]
async fn relay_through_load_balancer_returns_upstream_payload() {
    let network = FakeNetwork::new(&[("node-a", 100), ("node-b", 100), ("node-c", 90)]);
    let (orchestrator, queue) =
        gateway(Arc::clone(&network) as Arc<dyn RelaySender>, vec![eth_chain(None)]).await;

    let payload = orchestrator
        .relay_by_load_balancer("abc", "", BODY, &eth_mainnet_ctx())
        .await
        .unwrap();

    // The upstream payload comes back byte-for-byte.
    assert_eq!(payload, UPSTREAM_PAYLOAD);

    // The lagging node was filtered out before selection.
    let relayed = network.relayed_to.lock().clone();
    assert_eq!(relayed.len(), 1);
    assert_ne!(relayed[0], "node-c");

    // One synccheck row per probed node plus one relay row.
    let records = queue.drain(100);
    let sync_rows = records.iter().filter(|m| m.method == SYNC_CHECK_METHOD).count();
    let relay_rows = records.iter().filter(|m| m.method == "eth_blockNumber").count();
    assert_eq!(sync_rows, 3);
    assert_eq!(relay_rows, 1);
    assert_eq!(records.len(), sync_rows + relay_rows);
    assert!(records.iter().all(|m| m.application_id == "app-abc"));
}

#[tokio::test]
async fn unknown_load_balancer_is_a_client_error() {
    let network = FakeNetwork::new(&[("node-a", 100)]);
    let (orchestrator, _queue) =
        gateway(network as Arc<dyn RelaySender>, vec![eth_chain(None)]).await;

    let err = orchestrator
        .relay_by_load_balancer("nope", "", BODY, &eth_mainnet_ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnknownLoadBalancer(_)));
    assert_eq!(err.http_status(), 403);
}

/// Network whose nodes all refuse relays, driving traffic to the fallback.
struct DeadNetwork {
    inner: Arc<FakeNetwork>,
}

#[async_trait]
impl RelaySender for DeadNetwork {
    async fn current_session(
        &self,
        app: &Application,
        chain_id: &str,
    ) -> Result<Session, RelayError> {
        self.inner.current_session(app, chain_id).await
    }

    async fn refresh_session(
        &self,
        app: &Application,
        chain_id: &str,
    ) -> Result<Session, RelayError> {
        self.inner.refresh_session(app, chain_id).await
    }

    async fn send(
        &self,
        _method: &str,
        _chain_id: &str,
        _payload: &[u8],
        _aat: &Aat,
        _config: &SessionConfig,
        node: Option<&SessionNode>,
        _consensus: bool,
    ) -> Result<RelayResponse, RelayError> {
        Err(RelayError::Node {
            message: "node refused".to_string(),
            code: -32000,
            service_node: node.map(|n| n.public_key.clone()),
        })
    }
}

/// Serves one canned HTTP response, then closes.
async fn one_shot_http_server(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            drop(stream.read(&mut buf).await);
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            drop(stream.write_all(response.as_bytes()).await);
        }
    });

    format!("http://{addr}/")
}

#[tokio::test]
async fn exhausted_relays_fall_back_to_alt_runtime() {
    let fallback_url = one_shot_http_server(UPSTREAM_PAYLOAD).await;

    let network = Arc::new(DeadNetwork { inner: FakeNetwork::new(&[("node-a", 100)]) });
    let mut chain = eth_chain(Some(fallback_url));
    // Keep the probe path quiet so the test exercises the relay loop only.
    chain.sync_check_payload = None;
    let (orchestrator, queue) = gateway(network as Arc<dyn RelaySender>, vec![chain]).await;

    let payload = orchestrator
        .relay_by_load_balancer("abc", "", BODY, &eth_mainnet_ctx())
        .await
        .unwrap();
    assert_eq!(payload, UPSTREAM_PAYLOAD);

    let records = queue.drain(100);
    // One failed relay per session node, then the fallback success.
    let fallback_rows: Vec<_> = records.iter().filter(|m| m.fallback).collect();
    assert_eq!(fallback_rows.len(), 1);
    assert!(fallback_rows[0].is_success());
    assert!(fallback_rows[0].service_node.is_none());
}
