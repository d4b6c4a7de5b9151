pub mod access_key;
pub mod assemble;
pub mod credential_cache;
pub mod dispatcher;
pub mod forwarder;
pub mod identity_source;
pub mod lookup_retry;
pub mod proxy_error;
pub mod signing;
pub mod source_filter;
pub mod upstream;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use access_key::AccessKeyExtractor;
use assemble::RequestAssembler;
use credential_cache::CredentialCache;
use dispatcher::{router, ProxyDispatcher};
use identity_source::RgwAdminClient;
use signing::RequestSigner;
use source_filter::SourceFilterLayer;

const HEALTH_BODY: &str = "ok";

pub async fn run(config: Config) -> anyhow::Result<()> {
    let signer = RequestSigner::new(config.region.clone());

    let identity_source = RgwAdminClient::new(
        &config.rgw_admin.endpoints,
        &config.rgw_admin.access_keys,
        &config.rgw_admin.secret_keys,
        signer.clone(),
    )
    .context("unable to build rgw admin client")?;

    let cache = Arc::new(CredentialCache::new(
        Arc::new(identity_source),
        config.cache_settings(),
    ));
    let loaded = cache
        .load()
        .await
        .context("unable to load user credentials at startup")?;
    info!("loaded {} access keys", loaded);

    let resolver = config
        .upstream_resolver()
        .context("unable to build upstream resolver")?;
    let source_filter = config
        .source_allowlist()
        .context("unable to parse allowed source subnets")?
        .map(|allowlist| {
            info!("only accepting requests from {:?}", allowlist.subnets());
            SourceFilterLayer::new(Arc::new(allowlist))
        });
    if source_filter.is_none() {
        warn!("no allowed source subnets configured, accepting requests from anywhere");
    }

    let dispatcher = Arc::new(ProxyDispatcher::new(
        AccessKeyExtractor::new(),
        Arc::clone(&cache),
        resolver,
        RequestAssembler::new(signer).with_body_limit(config.max_signed_body_bytes),
    ));
    let app = router(dispatcher, source_filter);
    let health = Router::new().fallback(|| async { HEALTH_BODY });

    let shutdown = CancellationToken::new();
    let refresh = cache.spawn_refresh(config.refresh_interval(), shutdown.clone());

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("unable to bind proxy listener on {}", config.listen_address))?;
    let health_listener = TcpListener::bind(&config.health_address)
        .await
        .with_context(|| format!("unable to bind health listener on {}", config.health_address))?;

    info!("running s3resign proxy on {}", config.listen_address);
    info!("running health check on {}", config.health_address);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let proxy_server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .into_future();
    let health_server = axum::serve(health_listener, health)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    let (proxy_result, health_result) = tokio::join!(proxy_server, health_server);
    shutdown.cancel();
    if let Err(e) = refresh.await {
        error!("credential refresh task failed: {}", e);
    }

    proxy_result.context("proxy listener failed")?;
    health_result.context("health listener failed")?;
    info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
