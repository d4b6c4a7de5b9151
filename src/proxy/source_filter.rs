use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{ConnectInfo, Request};
use axum::response::{IntoResponse, Response};
use ipnetwork::IpNetwork;
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::proxy_error::ProxyError;

#[derive(Error, Debug)]
#[error("invalid allowed source subnet {subnet:?}: {source}")]
pub struct SubnetParseError {
    pub subnet: String,
    pub source: ipnetwork::IpNetworkError,
}

/// Set of CIDR ranges callers must connect from.
#[derive(Debug, Clone)]
pub struct SourceAllowlist {
    subnets: Vec<IpNetwork>,
}

impl SourceAllowlist {
    pub fn new(subnets: Vec<IpNetwork>) -> Self {
        Self { subnets }
    }

    pub fn parse<S: AsRef<str>>(subnets: &[S]) -> Result<Self, SubnetParseError> {
        subnets
            .iter()
            .map(|subnet| {
                let subnet = subnet.as_ref().trim();
                subnet.parse::<IpNetwork>().map_err(|source| SubnetParseError {
                    subnet: subnet.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    pub fn subnets(&self) -> &[IpNetwork] {
        &self.subnets
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        // IPv4 peers can show up as IPv4-mapped IPv6 on dual-stack sockets.
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.subnets.iter().any(|subnet| subnet.contains(ip))
    }
}

/// Rejects requests whose peer address is outside the allowlist before any
/// other processing happens.
#[derive(Clone)]
pub struct SourceFilter<S> {
    inner: S,
    allowlist: Arc<SourceAllowlist>,
}

impl<S> SourceFilter<S> {
    pub fn new(inner: S, allowlist: Arc<SourceAllowlist>) -> Self {
        Self { inner, allowlist }
    }
}

impl<S> Service<Request> for SourceFilter<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        match peer {
            Some(ip) if self.allowlist.is_allowed(ip) => {
                debug!("source {} allowed", ip);
                // Take the service that was driven to readiness.
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(async move { inner.call(req).await })
            }
            Some(ip) => {
                warn!("source IP not allowed: {}", ip);
                Box::pin(async move {
                    Ok(ProxyError::access_denied(format!("source IP not allowed: {}", ip))
                        .into_response())
                })
            }
            None => {
                warn!("no peer address on request, rejecting");
                Box::pin(async move {
                    Ok(ProxyError::access_denied("source IP unknown").into_response())
                })
            }
        }
    }
}

#[derive(Clone)]
pub struct SourceFilterLayer {
    allowlist: Arc<SourceAllowlist>,
}

impl SourceFilterLayer {
    pub fn new(allowlist: Arc<SourceAllowlist>) -> Self {
        Self { allowlist }
    }
}

impl<S> Layer<S> for SourceFilterLayer {
    type Service = SourceFilter<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SourceFilter::new(inner, self.allowlist.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    fn request_from(addr: Option<&str>) -> Request {
        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        if let Some(addr) = addr {
            req.extensions_mut()
                .insert(ConnectInfo(addr.parse::<SocketAddr>().unwrap()));
        }
        req
    }

    async fn call_filtered(subnets: &[&str], req: Request) -> Response {
        let allowlist = Arc::new(SourceAllowlist::parse(subnets).unwrap());
        let service = tower::service_fn(|_req: Request| async {
            Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
        });
        SourceFilterLayer::new(allowlist)
            .layer(service)
            .oneshot(req)
            .await
            .unwrap()
    }

    #[test]
    fn test_allowlist_contains() {
        let allowlist = SourceAllowlist::parse(&["10.0.0.0/8", "127.0.0.1/32"]).unwrap();
        assert!(allowlist.is_allowed("10.1.2.3".parse().unwrap()));
        assert!(allowlist.is_allowed("127.0.0.1".parse().unwrap()));
        assert!(allowlist.is_allowed("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!allowlist.is_allowed("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_bad_subnet_is_rejected() {
        assert!(SourceAllowlist::parse(&["10.0.0.0/33"]).is_err());
        assert!(SourceAllowlist::parse(&["not-a-subnet"]).is_err());
    }

    #[tokio::test]
    async fn test_allowed_source_reaches_inner_service() {
        let response =
            call_filtered(&["127.0.0.1/32"], request_from(Some("127.0.0.1:5000"))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_foreign_source_is_forbidden() {
        let response =
            call_filtered(&["127.0.0.1/32"], request_from(Some("192.168.1.20:5000"))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_peer_is_forbidden() {
        let response = call_filtered(&["0.0.0.0/0"], request_from(None)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
