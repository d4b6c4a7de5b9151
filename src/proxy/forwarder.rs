use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::CONNECTION;
use axum::http::{HeaderMap, HeaderName};
use axum::response::Response;
use dashmap::DashMap;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::upstream::ResolvedUpstream;

const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("request targets {actual}, forwarder is bound to {expected}")]
    WrongUpstream { expected: String, actual: String },
    #[error("upstream request failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
}

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Pooled HTTP(S) client. Connections are pooled per host, so one client
/// serves every upstream.
pub fn build_client() -> UpstreamClient {
    let connector = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Streams requests to one fixed upstream and streams the responses back.
pub struct Forwarder {
    upstream: ResolvedUpstream,
    client: Arc<UpstreamClient>,
}

impl Forwarder {
    pub fn new(upstream: ResolvedUpstream) -> Self {
        Self::with_client(upstream, Arc::new(build_client()))
    }

    pub fn with_client(upstream: ResolvedUpstream, client: Arc<UpstreamClient>) -> Self {
        Self { upstream, client }
    }

    pub fn client(&self) -> &Arc<UpstreamClient> {
        &self.client
    }

    pub fn upstream(&self) -> &ResolvedUpstream {
        &self.upstream
    }

    /// Sends an assembled request upstream. The response body is handed back
    /// as it arrives, chunk by chunk.
    #[instrument(
        name = "forward",
        skip(self, request),
        fields(upstream = %self.upstream, method = %request.method(), path = %request.uri().path())
    )]
    pub async fn forward(&self, mut request: Request) -> Result<Response, ForwardError> {
        let target = request.uri().authority().map(|a| a.as_str()).unwrap_or("");
        if target != self.upstream.host {
            return Err(ForwardError::WrongUpstream {
                expected: self.upstream.host.clone(),
                actual: target.to_string(),
            });
        }

        strip_hop_by_hop(request.headers_mut());
        let response = self.client.request(request).await?;
        debug!("upstream answered {}", response.status());

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// Forwarders keyed by destination, created on first use and kept for the
/// life of the process.
///
/// Every forwarder shares the table's client, so an entry costs the key and
/// two pointers. Hosts are limited only by the resolver rules.
pub struct ForwarderTable {
    client: Arc<UpstreamClient>,
    forwarders: DashMap<ResolvedUpstream, Arc<Forwarder>>,
}

impl Default for ForwarderTable {
    fn default() -> Self {
        Self::with_client(build_client())
    }
}

impl ForwarderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: UpstreamClient) -> Self {
        Self {
            client: Arc::new(client),
            forwarders: DashMap::new(),
        }
    }

    /// Returns the forwarder for `upstream`, creating it if needed. The entry
    /// lock makes the first creator win; concurrent callers get its instance.
    pub fn get_or_create(&self, upstream: &ResolvedUpstream) -> Arc<Forwarder> {
        if let Some(forwarder) = self.forwarders.get(upstream) {
            return Arc::clone(forwarder.value());
        }

        let entry = self
            .forwarders
            .entry(upstream.clone())
            .or_insert_with(|| {
                info!("creating forwarder for {}", upstream);
                Arc::new(Forwarder::with_client(
                    upstream.clone(),
                    Arc::clone(&self.client),
                ))
            });
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.forwarders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwarders.is_empty()
    }
}

/// Removes hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
