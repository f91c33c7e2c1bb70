//! Relay orchestration.
//!
//! The [`RelayOrchestrator`] ties the whole dispatch pipeline together:
//! application or load balancer resolution, blockchain and method
//! derivation, sync and chain filtering, cherry-picked node selection, the
//! exclusion-and-retry loop, metrics, and the alt-runtime fallback.
//!
//! Per request:
//!
//! ```text
//! excluded = {}
//! for attempt in 1..=max_relay_attempts:
//!     session = sender.current_session(app, chain)
//!     nodes   = sync.filter(session.nodes) → chain.filter(...)
//!     node    = picker.pick(nodes \ excluded)   // none left → break
//!     send(node) → success: record metric, return payload
//!               → failure: record metric, exclude node,
//!                          refresh session if expired, continue
//! fallback to alt runtime URL, else surface the last error
//! ```
//!
//! Constructor state splits into two groups: the process-wide immutable
//! [`GatewayConfig`] plus long-lived components, and the per-request
//! [`RequestContext`] carrying headers, identity, and the abort flag.

pub mod errors;

pub use errors::GatewayError;

use crate::{
    cache::RelayCache,
    checks::{chain::ChainChecker, sync::SyncChecker, ProbeContext},
    config::{tuner, GatewayConfig},
    metrics::{MetricsRecorder, RelayMetric},
    picker::{CherryPicker, PickerError},
    registry::Registry,
    relay::{RelayError, RelaySender},
    types::{rpc_method, Application, Blockchain},
};
use ahash::AHashSet;
use chrono::Utc;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-request context: the headers the orchestrator recognizes, the request
/// id threaded through metrics, and the caller-disconnect flag.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    /// Host header; its first label may override the blockchain alias.
    pub host: Option<String>,
    pub origin: Option<String>,
    pub user_agent: Option<String>,
    pub content_type: Option<String>,
    /// Secret the client presented, checked against the application's.
    pub secret_key: Option<String>,
    /// Set by the ingress when the caller disconnects; short-circuits
    /// further retries without rolling back recorded metrics.
    pub abort: Arc<AtomicBool>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            host: None,
            origin: None,
            user_agent: None,
            content_type: None,
            secret_key: None,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Debug clients identify themselves via the User-Agent.
    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.user_agent.as_deref().is_some_and(|ua| ua.contains("pocket-debug"))
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }
}

/// The relay dispatcher.
pub struct RelayOrchestrator {
    config: Arc<GatewayConfig>,
    registry: Arc<Registry>,
    picker: CherryPicker,
    sync_checker: SyncChecker,
    chain_checker: ChainChecker,
    recorder: MetricsRecorder,
    sender: Arc<dyn RelaySender>,
    fallback_client: reqwest::Client,
}

impl RelayOrchestrator {
    /// Wires the orchestrator. The fallback HTTP client is built once with
    /// the configured fallback timeout.
    ///
    /// # Errors
    /// Returns an error when the fallback HTTP client cannot be constructed.
    pub fn new(
        config: Arc<GatewayConfig>,
        registry: Arc<Registry>,
        cache: RelayCache,
        recorder: MetricsRecorder,
        sender: Arc<dyn RelaySender>,
    ) -> Result<Self, GatewayError> {
        let fallback_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.relay.fallback_timeout_ms))
            .build()
            .map_err(|e| GatewayError::Internal(format!("fallback client: {e}")))?;

        Ok(Self {
            picker: CherryPicker::new(cache.clone()),
            sync_checker: SyncChecker::new(cache.clone(), recorder.clone()),
            chain_checker: ChainChecker::new(cache, recorder.clone()),
            config,
            registry,
            recorder,
            sender,
            fallback_client,
        })
    }

    /// Relays on behalf of one application of a load balancer, drawn
    /// uniformly at random from the verified subset.
    pub async fn relay_by_load_balancer(
        &self,
        lb_id: &str,
        chain_path: &str,
        raw_body: &[u8],
        ctx: &RequestContext,
    ) -> Result<String, GatewayError> {
        let app = self.registry.resolve_load_balancer(lb_id).await?;
        self.relay_for_app(app, chain_path, raw_body, ctx).await
    }

    /// Relays on behalf of a directly addressed application.
    pub async fn relay_by_application(
        &self,
        app_id: &str,
        chain_path: &str,
        raw_body: &[u8],
        ctx: &RequestContext,
    ) -> Result<String, GatewayError> {
        let app = self.registry.application(app_id).await?;
        self.relay_for_app(app, chain_path, raw_body, ctx).await
    }

    async fn relay_for_app(
        &self,
        app: Application,
        chain_path: &str,
        raw_body: &[u8],
        ctx: &RequestContext,
    ) -> Result<String, GatewayError> {
        let limit = self.config.relay.max_payload_bytes;
        if raw_body.len() > limit {
            return Err(GatewayError::PayloadTooLarge { size: raw_body.len(), limit });
        }

        let method = rpc_method(raw_body).map_err(|_| GatewayError::MalformedBody)?;
        self.check_secret(&app, ctx)?;
        let blockchain = self.resolve_blockchain(&app, chain_path, ctx)?;
        let aat = app
            .relay_aat()
            .ok_or_else(|| GatewayError::Internal(format!("application {} has no AAT", app.id)))?
            .clone();

        if ctx.debug_enabled() {
            debug!(
                request = %ctx.request_id,
                app = %app.id,
                chain = %blockchain.id,
                method = %method,
                origin = ctx.origin.as_deref().unwrap_or(""),
                "relay accepted"
            );
        }

        let relay_config = tuner::for_relay(&self.config);
        let probe_config = tuner::for_probe(&self.config);
        let consensus_config = tuner::for_consensus(&self.config);

        let mut excluded: AHashSet<String> = AHashSet::new();
        let mut last_error: Option<RelayError> = None;

        for attempt in 1..=self.config.relay.max_relay_attempts {
            if ctx.aborted() {
                debug!(request = %ctx.request_id, attempt, "caller gone, abandoning retries");
                break;
            }

            let session = match self.sender.current_session(&app, &blockchain.id).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(request = %ctx.request_id, error = %e, "session dispatch failed");
                    last_error = Some(e);
                    break;
                }
            };

            let probe_ctx = ProbeContext {
                request_id: ctx.request_id,
                application_id: app.id.clone(),
                app_public_key: app.public_key.clone(),
                aat: aat.clone(),
                session_fingerprint: session.fingerprint(),
            };

            let nodes = self
                .sync_checker
                .filter(
                    &session.nodes,
                    &blockchain,
                    &probe_ctx,
                    &self.sender,
                    &probe_config,
                    &consensus_config,
                )
                .await;
            let nodes = self
                .chain_checker
                .filter(&nodes, &blockchain, &probe_ctx, &self.sender, &probe_config)
                .await;

            let node = match self.picker.pick(&blockchain.id, &nodes, &excluded).await {
                Ok(node) => node,
                Err(PickerError::NoHealthyNodes) => break,
            };

            let relay_start = Utc::now();
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                Duration::from_millis(relay_config.request_timeout_ms),
                self.sender.send(
                    chain_path,
                    &blockchain.id,
                    raw_body,
                    &aat,
                    &relay_config,
                    Some(&node),
                    false,
                ),
            )
            .await
            .unwrap_or_else(|_| {
                Err(RelayError::Timeout { service_node: Some(node.public_key.clone()) })
            });
            let elapsed = started.elapsed();

            match outcome {
                Ok(response) => {
                    self.recorder
                        .record(RelayMetric {
                            request_id: ctx.request_id,
                            application_id: app.id.clone(),
                            app_public_key: app.public_key.clone(),
                            blockchain: blockchain.id.clone(),
                            service_node: Some(node.public_key.clone()),
                            relay_start,
                            result: 200,
                            bytes: response.payload.len(),
                            delivered: true,
                            fallback: false,
                            method: method.clone(),
                            error: None,
                            elapsed,
                        })
                        .await;
                    return Ok(response.payload);
                }
                Err(e) => {
                    self.recorder
                        .record(RelayMetric {
                            request_id: ctx.request_id,
                            application_id: app.id.clone(),
                            app_public_key: app.public_key.clone(),
                            blockchain: blockchain.id.clone(),
                            service_node: Some(node.public_key.clone()),
                            relay_start,
                            result: 500,
                            bytes: raw_body.len(),
                            delivered: false,
                            fallback: false,
                            method: method.clone(),
                            error: Some(e.to_string()),
                            elapsed,
                        })
                        .await;

                    debug!(
                        request = %ctx.request_id,
                        attempt,
                        node = %node.public_key,
                        error = %e,
                        "relay attempt failed, excluding node"
                    );
                    excluded.insert(node.public_key.clone());

                    if e.is_session_expired() {
                        if let Err(refresh_err) =
                            self.sender.refresh_session(&app, &blockchain.id).await
                        {
                            warn!(
                                request = %ctx.request_id,
                                error = %refresh_err,
                                "session refresh failed"
                            );
                        }
                    }

                    last_error = Some(e);
                }
            }
        }

        self.fallback_or_error(&app, &blockchain, &method, raw_body, ctx, last_error).await
    }

    /// Enforces the application secret when the application requires it.
    fn check_secret(&self, app: &Application, ctx: &RequestContext) -> Result<(), GatewayError> {
        if !app.settings.secret_key_required {
            return Ok(());
        }

        let expected = app.settings.secret_key.as_deref().unwrap_or(&self.config.secret_key);
        match ctx.secret_key.as_deref() {
            Some(given) if !expected.is_empty() && given == expected => Ok(()),
            _ => Err(GatewayError::SecretKeyMismatch),
        }
    }

    /// Resolves the blockchain: a whitelisted Host alias override wins, the
    /// URL path prefix otherwise.
    fn resolve_blockchain(
        &self,
        app: &Application,
        chain_path: &str,
        ctx: &RequestContext,
    ) -> Result<Arc<Blockchain>, GatewayError> {
        if let Some(host) = &ctx.host {
            let alias = host.split(':').next().unwrap_or(host);
            let alias = alias.split('.').next().unwrap_or(alias);

            let allowed = app.settings.whitelisted_blockchains.is_empty() ||
                app.settings.whitelisted_blockchains.iter().any(|w| w.eq_ignore_ascii_case(alias));
            if allowed {
                if let Ok(chain) = self.registry.blockchain(alias) {
                    return Ok(chain);
                }
            }
        }

        if chain_path.is_empty() {
            return Err(GatewayError::UnknownBlockchain(String::new()));
        }
        self.registry.blockchain(chain_path).map_err(Into::into)
    }

    /// Final resort: POST the raw body to the chain's alt runtime, when one
    /// is declared. The fallback never touches cherry-picker statistics.
    async fn fallback_or_error(
        &self,
        app: &Application,
        blockchain: &Blockchain,
        method: &str,
        raw_body: &[u8],
        ctx: &RequestContext,
        last_error: Option<RelayError>,
    ) -> Result<String, GatewayError> {
        if let Some(url) = &blockchain.alt_runtime_url {
            if !ctx.aborted() {
                let relay_start = Utc::now();
                let started = Instant::now();
                let outcome = self.post_fallback(url, raw_body).await;
                let elapsed = started.elapsed();

                let (result, error) = match &outcome {
                    Ok(_) => (200, None),
                    Err(e) => (500, Some(e.clone())),
                };
                self.recorder
                    .record(RelayMetric {
                        request_id: ctx.request_id,
                        application_id: app.id.clone(),
                        app_public_key: app.public_key.clone(),
                        blockchain: blockchain.id.clone(),
                        service_node: None,
                        relay_start,
                        result,
                        bytes: outcome.as_ref().map_or(raw_body.len(), String::len),
                        delivered: result == 200,
                        fallback: true,
                        method: method.to_string(),
                        error,
                        elapsed,
                    })
                    .await;

                match outcome {
                    Ok(payload) => {
                        info!(request = %ctx.request_id, chain = %blockchain.id, "served by fallback");
                        return Ok(payload);
                    }
                    Err(e) => {
                        warn!(request = %ctx.request_id, url = %url, error = %e, "fallback failed");
                    }
                }
            }
        }

        match last_error {
            Some(e) => Err(GatewayError::Exhausted {
                timed_out: e.is_timeout(),
                last_error: e.to_string(),
            }),
            None => Err(GatewayError::NoHealthyNodes),
        }
    }

    async fn post_fallback(&self, url: &str, raw_body: &[u8]) -> Result<String, String> {
        let response = self
            .fallback_client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(raw_body.to_vec())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("fallback returned HTTP {}", response.status().as_u16()));
        }
        response.text().await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{memory::MemoryCache, RelayCache},
        metrics::sink::WriteBehindQueue,
        registry::{
            ApplicationRepository, BlockchainRepository, LoadBalancerRepository, RegistryError,
        },
        relay::RelayResponse,
        types::{Aat, AppSettings, LoadBalancer, Session, SessionNode},
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    const BODY: &[u8] = br#"{"method":"eth_blockNumber","params":[],"id":1,"jsonrpc":"2.0"}"#;

    struct ScriptedSender {
        nodes: Vec<SessionNode>,
        /// Nodes that fail every send.
        failing: AHashSet<String>,
        /// Nodes that report an expired session.
        expiring: AHashSet<String>,
        relays: AtomicUsize,
        refreshes: AtomicUsize,
        relayed_to: Mutex<Vec<String>>,
    }

    impl ScriptedSender {
        fn new(node_pks: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                nodes: node_pks.iter().map(|pk| node(pk)).collect(),
                failing: AHashSet::new(),
                expiring: AHashSet::new(),
                relays: AtomicUsize::new(0),
                refreshes: AtomicUsize::new(0),
                relayed_to: Mutex::new(Vec::new()),
            })
        }

        fn failing(mut self: Arc<Self>, pks: &[&str]) -> Arc<Self> {
            let inner = Arc::get_mut(&mut self).unwrap();
            inner.failing = pks.iter().map(|pk| (*pk).to_string()).collect();
            self
        }

        fn expiring(mut self: Arc<Self>, pks: &[&str]) -> Arc<Self> {
            let inner = Arc::get_mut(&mut self).unwrap();
            inner.expiring = pks.iter().map(|pk| (*pk).to_string()).collect();
            self
        }
    }

    #[async_trait]
    impl RelaySender for ScriptedSender {
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
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.current_session(app, chain_id).await
        }

        async fn send(
            &self,
            _method: &str,
            _chain_id: &str,
            _payload: &[u8],
            _aat: &Aat,
            _config: &tuner::SessionConfig,
            node: Option<&SessionNode>,
            _consensus: bool,
        ) -> Result<RelayResponse, RelayError> {
            // Consensus challenges carry no target node; acknowledge them.
            let Some(node) = node else {
                return Ok(RelayResponse { payload: "{}".to_string() });
            };
            self.relays.fetch_add(1, Ordering::SeqCst);
            self.relayed_to.lock().push(node.public_key.clone());

            if self.expiring.contains(&node.public_key) {
                return Err(RelayError::SessionExpired);
            }
            if self.failing.contains(&node.public_key) {
                return Err(RelayError::Node {
                    message: "node unavailable".to_string(),
                    code: -32000,
                    service_node: Some(node.public_key.clone()),
                });
            }
            Ok(RelayResponse {
                payload: r#"{"jsonrpc":"2.0","id":1,"result":"0x64"}"#.to_string(),
            })
        }
    }

    struct StaticRepo {
        apps: Vec<Application>,
        lbs: Vec<LoadBalancer>,
        chains: Vec<Blockchain>,
    }

    #[async_trait]
    impl ApplicationRepository for StaticRepo {
        async fn application(&self, id: &str) -> Result<Option<Application>, RegistryError> {
            Ok(self.apps.iter().find(|a| a.id == id).cloned())
        }
    }

    #[async_trait]
    impl LoadBalancerRepository for StaticRepo {
        async fn load_balancer(&self, id: &str) -> Result<Option<LoadBalancer>, RegistryError> {
            Ok(self.lbs.iter().find(|l| l.id == id).cloned())
        }
    }

    #[async_trait]
    impl BlockchainRepository for StaticRepo {
        async fn blockchains(&self) -> Result<Vec<Blockchain>, RegistryError> {
            Ok(self.chains.clone())
        }
    }

    fn node(pk: &str) -> SessionNode {
        SessionNode {
            public_key: pk.to_string(),
            service_url: format!("https://{pk}.example"),
            chains: vec!["0021".to_string()],
        }
    }

    fn app(id: &str) -> Application {
        Application {
            id: id.to_string(),
            public_key: format!("pk-{id}"),
            free_tier_aat: Some(Aat {
                version: "0.0.1".to_string(),
                app_pub_key: format!("pk-{id}"),
                client_pub_key: "cpk".to_string(),
                signature: "sig".to_string(),
            }),
            gateway_aat: None,
            chains: vec!["0021".to_string()],
            settings: AppSettings::default(),
        }
    }

    fn eth_chain() -> Blockchain {
        Blockchain {
            id: "0021".to_string(),
            ticker: "ETH".to_string(),
            network_id: "1".to_string(),
            aliases: vec!["eth-mainnet".to_string()],
            sync_check_payload: None,
            sync_allowance: 1,
            chain_id_check_payload: None,
            log_limit: None,
            alt_runtime_url: None,
        }
    }

    async fn orchestrator_with(
        sender: Arc<ScriptedSender>,
        apps: Vec<Application>,
        chains: Vec<Blockchain>,
    ) -> (RelayOrchestrator, Arc<WriteBehindQueue>) {
        let cache = RelayCache::new(Arc::new(MemoryCache::new()));
        let queue = WriteBehindQueue::new(1024);
        let recorder = MetricsRecorder::new(cache.clone(), Arc::clone(&queue));

        let repo = Arc::new(StaticRepo {
            apps,
            lbs: vec![LoadBalancer {
                id: "lb1".to_string(),
                application_ids: vec!["app1".to_string()],
            }],
            chains,
        });
        let registry = Arc::new(
            Registry::new(
                Arc::clone(&repo) as Arc<dyn ApplicationRepository>,
                Arc::clone(&repo) as Arc<dyn LoadBalancerRepository>,
                repo as Arc<dyn BlockchainRepository>,
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
            sender as Arc<dyn RelaySender>,
        )
        .unwrap();

        (orchestrator, queue)
    }

    #[tokio::test]
    async fn test_happy_path_returns_upstream_payload() {
        let sender = ScriptedSender::new(&["a", "b"]);
        let (orchestrator, queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![eth_chain()]).await;

        let payload = orchestrator
            .relay_by_application("app1", "eth-mainnet", BODY, &RequestContext::new())
            .await
            .unwrap();

        assert_eq!(payload, r#"{"jsonrpc":"2.0","id":1,"result":"0x64"}"#);
        assert_eq!(sender.relays.load(Ordering::SeqCst), 1);

        let records = queue.drain(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "eth_blockNumber");
        assert!(records[0].is_success());
        assert!(!records[0].fallback);
    }

    #[tokio::test]
    async fn test_lb_resolution_relays_for_member_app() {
        let sender = ScriptedSender::new(&["a"]);
        let (orchestrator, _queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![eth_chain()]).await;

        let payload = orchestrator
            .relay_by_load_balancer("lb1", "eth-mainnet", BODY, &RequestContext::new())
            .await
            .unwrap();
        assert!(payload.contains("0x64"));
    }

    #[tokio::test]
    async fn test_failing_node_is_excluded_from_retries() {
        let sender = ScriptedSender::new(&["a", "b", "c"]).failing(&["a", "b", "c"]);
        let (orchestrator, _queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![eth_chain()]).await;

        let err = orchestrator
            .relay_by_application("app1", "eth-mainnet", BODY, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Exhausted { .. }));

        // Three nodes, five allowed attempts: the loop stops when every node
        // has been excluded, and no node is ever retried.
        let relayed = sender.relayed_to.lock().clone();
        assert_eq!(relayed.len(), 3);
        let distinct: AHashSet<String> = relayed.into_iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_surviving_node() {
        let sender = ScriptedSender::new(&["a", "b"]).failing(&["a"]);
        let (orchestrator, queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![eth_chain()]).await;

        let payload = orchestrator
            .relay_by_application("app1", "eth-mainnet", BODY, &RequestContext::new())
            .await
            .unwrap();
        assert!(payload.contains("0x64"));

        // One failure metric and one success metric.
        let records = queue.drain(10);
        assert_eq!(records.len(), 2);
        assert_eq!(records.iter().filter(|m| m.is_success()).count(), 1);
    }

    #[tokio::test]
    async fn test_session_expiry_triggers_refresh_and_retry() {
        let sender = ScriptedSender::new(&["a", "b"]).expiring(&["a"]);
        let (orchestrator, _queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![eth_chain()]).await;

        // Whichever node is hit first, the relay eventually succeeds; when
        // the expiring node was drawn, a refresh must have happened.
        let payload = orchestrator
            .relay_by_application("app1", "eth-mainnet", BODY, &RequestContext::new())
            .await
            .unwrap();
        assert!(payload.contains("0x64"));

        let hit_expiring = sender.relayed_to.lock().contains(&"a".to_string());
        if hit_expiring {
            assert_eq!(sender.refreshes.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let sender = ScriptedSender::new(&["a"]);
        let (orchestrator, _queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![eth_chain()]).await;

        let big = vec![b'x'; 200_000];
        let err = orchestrator
            .relay_by_application("app1", "eth-mainnet", &big, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PayloadTooLarge { .. }));
        assert_eq!(sender.relays.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let sender = ScriptedSender::new(&["a"]);
        let (orchestrator, _queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![eth_chain()]).await;

        let err = orchestrator
            .relay_by_application("app1", "eth-mainnet", b"not json", &RequestContext::new())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::MalformedBody);
    }

    #[tokio::test]
    async fn test_unknown_blockchain() {
        let sender = ScriptedSender::new(&["a"]);
        let (orchestrator, _queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![eth_chain()]).await;

        let err = orchestrator
            .relay_by_application("app1", "not-a-chain", BODY, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownBlockchain(_)));
    }

    #[tokio::test]
    async fn test_host_header_overrides_chain() {
        let sender = ScriptedSender::new(&["a"]);
        let (orchestrator, _queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![eth_chain()]).await;

        let mut ctx = RequestContext::new();
        ctx.host = Some("eth-mainnet.gateway.example:443".to_string());

        // No chain in the path at all; the Host alias carries it.
        let payload = orchestrator.relay_by_application("app1", "", BODY, &ctx).await.unwrap();
        assert!(payload.contains("0x64"));
    }

    #[tokio::test]
    async fn test_non_whitelisted_host_is_ignored() {
        let sender = ScriptedSender::new(&["a"]);
        let mut restricted = app("app1");
        restricted.settings.whitelisted_blockchains = vec!["poly-mainnet".to_string()];
        let (orchestrator, _queue) =
            orchestrator_with(Arc::clone(&sender), vec![restricted], vec![eth_chain()]).await;

        let mut ctx = RequestContext::new();
        ctx.host = Some("eth-mainnet.gateway.example".to_string());

        let err = orchestrator.relay_by_application("app1", "", BODY, &ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownBlockchain(_)));
    }

    #[tokio::test]
    async fn test_secret_key_mismatch() {
        let sender = ScriptedSender::new(&["a"]);
        let mut secured = app("app1");
        secured.settings.secret_key_required = true;
        secured.settings.secret_key = Some("correct".to_string());
        let (orchestrator, _queue) =
            orchestrator_with(Arc::clone(&sender), vec![secured], vec![eth_chain()]).await;

        let mut ctx = RequestContext::new();
        ctx.secret_key = Some("wrong".to_string());
        let err = orchestrator
            .relay_by_application("app1", "eth-mainnet", BODY, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::SecretKeyMismatch);

        ctx.secret_key = Some("correct".to_string());
        assert!(orchestrator.relay_by_application("app1", "eth-mainnet", BODY, &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_short_circuits_retries() {
        let sender = ScriptedSender::new(&["a", "b", "c"]).failing(&["a", "b", "c"]);
        let (orchestrator, _queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![eth_chain()]).await;

        let ctx = RequestContext::new();
        ctx.abort.store(true, Ordering::Relaxed);

        let err = orchestrator
            .relay_by_application("app1", "eth-mainnet", BODY, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::NoHealthyNodes);
        assert_eq!(sender.relays.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_fallback_surfaces_last_error() {
        let sender = ScriptedSender::new(&["a"]).failing(&["a"]);
        let mut chain = eth_chain();
        // Nothing listens here; the fallback POST fails fast.
        chain.alt_runtime_url = Some("http://127.0.0.1:1/".to_string());
        let (orchestrator, queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![chain]).await;

        let err = orchestrator
            .relay_by_application("app1", "eth-mainnet", BODY, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Exhausted { timed_out: false, .. }));

        // One node failure and one fallback failure, both recorded.
        let records = queue.drain(10);
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|m| m.fallback));
    }

    #[tokio::test]
    async fn test_metric_per_attempt_with_probes() {
        let sender = ScriptedSender::new(&["a", "b", "c"]);
        let mut chain = eth_chain();
        chain.sync_check_payload =
            Some(r#"{"method":"eth_blockNumber","params":[],"id":1,"jsonrpc":"2.0"}"#.to_string());
        let (orchestrator, queue) =
            orchestrator_with(Arc::clone(&sender), vec![app("app1")], vec![chain]).await;

        orchestrator
            .relay_by_application("app1", "eth-mainnet", BODY, &RequestContext::new())
            .await
            .unwrap();

        // Scripted nodes answer sync probes with the relay payload, which
        // parses as a height, so all three probe and the relay each record.
        let records = queue.drain(100);
        let sync_probes =
            records.iter().filter(|m| m.method == crate::metrics::SYNC_CHECK_METHOD).count();
        let relays = records.iter().filter(|m| m.method == "eth_blockNumber").count();
        assert_eq!(sync_probes, 3);
        assert_eq!(relays, 1);
        assert_eq!(records.len(), sync_probes + relays);
    }
}
