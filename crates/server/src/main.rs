use anyhow::{Context, Result};
use gateway_core::{
    cache::{memory::MemoryCache, RelayCache},
    config::GatewayConfig,
    dispatch::RelayOrchestrator,
    metrics::{
        sink::{MetricsFlusher, PgMetricsSink, WriteBehindQueue},
        MetricsRecorder,
    },
    registry::{
        postgres::PgRegistry, ApplicationRepository, BlockchainRepository,
        LoadBalancerRepository, Registry,
    },
    relay::RelaySender,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use server::{
    router::{router, AppState},
    sender::StaticSessionSender,
};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc};
use tokio::{signal, sync::broadcast};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes tracing from the logging section, honoring `RUST_LOG` when
/// set.
fn init_logging(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,gateway_core={level},server={level}",
            level = config.logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty().with_target(false)).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(GatewayConfig::load().context("loading configuration")?);
    init_logging(&config);

    if let Err(e) = PrometheusBuilder::new().install() {
        warn!(error = %e, "prometheus exporter disabled");
    }

    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect_lazy(&config.database_url)
        .context("portal database url")?;

    let cache = RelayCache::new(Arc::new(MemoryCache::new()));

    let portal = Arc::new(PgRegistry::new(pool.clone()));
    let registry = Arc::new(
        Registry::new(
            Arc::clone(&portal) as Arc<dyn ApplicationRepository>,
            Arc::clone(&portal) as Arc<dyn LoadBalancerRepository>,
            portal as Arc<dyn BlockchainRepository>,
            cache.clone(),
        )
        .await
        .context("loading blockchain index")?,
    );

    let queue = WriteBehindQueue::new(8192);
    let recorder = MetricsRecorder::new(cache.clone(), Arc::clone(&queue));
    let (shutdown_tx, _) = broadcast::channel(1);
    let flusher = MetricsFlusher::new(queue, Arc::new(PgMetricsSink::new(pool)))
        .spawn(shutdown_tx.subscribe());

    let sender: Arc<dyn RelaySender> = Arc::new(
        StaticSessionSender::new(&config.pocket.dispatchers, config.pocket.request_timeout_ms)
            .context("building relay sender")?,
    );

    let orchestrator = Arc::new(
        RelayOrchestrator::new(
            Arc::clone(&config),
            registry,
            cache,
            recorder,
            sender,
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?,
    );

    let app = router(AppState { orchestrator })
        .layer(RequestBodyLimitLayer::new(config.relay.max_payload_bytes));

    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.bind_port)
        .parse()
        .context("bind address")?;
    let listener = tokio::net::TcpListener::bind(addr).await.context("binding listener")?;
    info!(%addr, process = %config.process_uid, "gateway listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    // Drain buffered metrics before exiting.
    drop(shutdown_tx.send(()));
    drop(flusher.await);
    info!("gateway stopped");
    Ok(())
}
