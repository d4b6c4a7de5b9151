use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, HOST};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::Utc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

use super::access_key::AccessKeyExtractor;
use super::assemble::RequestAssembler;
use super::credential_cache::CredentialCache;
use super::forwarder::{Forwarder, ForwarderTable};
use super::proxy_error::{ProxyError, ProxyErrorCode};
use super::source_filter::SourceFilterLayer;
use super::upstream::{ResolvedUpstream, UpstreamResolver};

/// Drives one inbound request from the `Authorization` header through to the
/// upstream response.
pub struct ProxyDispatcher {
    extractor: AccessKeyExtractor,
    cache: Arc<CredentialCache>,
    resolver: UpstreamResolver,
    assembler: RequestAssembler,
    forwarders: ForwarderTable,
}

impl ProxyDispatcher {
    pub fn new(
        extractor: AccessKeyExtractor,
        cache: Arc<CredentialCache>,
        resolver: UpstreamResolver,
        assembler: RequestAssembler,
    ) -> Self {
        Self {
            extractor,
            cache,
            resolver,
            assembler,
            forwarders: ForwarderTable::new(),
        }
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    pub fn forwarders(&self) -> &ForwarderTable {
        &self.forwarders
    }

    pub fn forwarder_for(&self, upstream: &ResolvedUpstream) -> Arc<Forwarder> {
        self.forwarders.get_or_create(upstream)
    }

    /// Requests without an `Authorization` header go upstream unsigned. A
    /// header that names no known access key is rejected before anything is
    /// sent upstream.
    #[instrument(
        name = "dispatch",
        skip(self, request),
        fields(method = %request.method(), uri = %request.uri())
    )]
    pub async fn handle(&self, request: Request) -> Result<Response, ProxyError> {
        let resource = request.uri().path().to_string();

        let credential = match request.headers().get(AUTHORIZATION) {
            None => {
                debug!("no Authorization header, passing request through anonymously");
                None
            }
            Some(value) => {
                let value = value.to_str().map_err(|_| {
                    ProxyError::with_message(
                        ProxyErrorCode::InvalidRequest,
                        "Authorization header is not valid ASCII",
                    )
                    .resource(resource.as_str())
                })?;
                let access_key_id = self.extractor.find_access_key(value).map_err(|e| {
                    warn!("rejecting request: {}", e);
                    ProxyError::from(e).resource(resource.as_str())
                })?;
                let credential = self.cache.get_signer(&access_key_id).await.map_err(|e| {
                    warn!("rejecting request for access key {}: {}", access_key_id, e);
                    ProxyError::from(e).resource(resource.as_str())
                })?;
                Some(credential)
            }
        };

        let origin_host = origin_host(&request).ok_or_else(|| {
            ProxyError::with_message(ProxyErrorCode::InvalidRequest, "missing Host header")
                .resource(resource.as_str())
        })?;
        let upstream = self.resolver.resolve(&origin_host).map_err(|e| {
            warn!("unable to resolve upstream for {}: {}", origin_host, e);
            ProxyError::from(e).resource(resource.as_str())
        })?;

        let outbound = self
            .assembler
            .assemble_upstream_request(request, &upstream, credential.as_ref(), Utc::now())
            .await
            .map_err(|e| {
                warn!("unable to assemble upstream request: {}", e);
                ProxyError::from(e).resource(resource.as_str())
            })?;

        let forwarder = self.forwarder_for(&upstream);
        let response = forwarder.forward(outbound).await.map_err(|e| {
            warn!("forward to {} failed: {}", upstream, e);
            ProxyError::from(e).resource(resource.as_str())
        })?;

        info!(
            "{} answered {} for {}",
            upstream,
            response.status(),
            resource
        );
        Ok(response)
    }
}

fn origin_host(request: &Request) -> Option<String> {
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
        .map(str::to_string)
}

async fn proxy_handler(
    State(dispatcher): State<Arc<ProxyDispatcher>>,
    request: Request,
) -> Response {
    match dispatcher.handle(request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Every method and path goes through the dispatcher. The source filter, when
/// given, sits in front of it and behind request tracing.
pub fn router(dispatcher: Arc<ProxyDispatcher>, source_filter: Option<SourceFilterLayer>) -> Router {
    let mut app = Router::new().fallback(proxy_handler).with_state(dispatcher);
    if let Some(layer) = source_filter {
        app = app.layer(layer);
    }
    app.layer(TraceLayer::new_for_http())
}
