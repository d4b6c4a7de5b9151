use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument};
use url::Url;

use super::signing::{RequestSigner, SignError, SigningCredential};

const USER_LIST_PATH: &str = "/admin/metadata/user";
const USER_INFO_PATH: &str = "/admin/user";

#[derive(Error, Debug)]
pub enum IdentitySourceError {
    #[error("identity source is not configured: {0}")]
    Misconfigured(String),
    #[error("invalid admin endpoint {endpoint}: {source}")]
    InvalidEndpoint {
        endpoint: String,
        source: url::ParseError,
    },
    #[error("admin request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        source: reqwest::Error,
    },
    #[error("admin request to {endpoint} returned {status}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },
    #[error("unexpected admin response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        source: serde_json::Error,
    },
    #[error("could not sign admin request: {0}")]
    Signing(#[from] SignError),
    #[error("identity source unavailable: {0}")]
    Unavailable(String),
}

/// Authoritative list of storage users' keys.
///
/// Every successful call returns the complete current `access key -> secret`
/// table. Partial failures fail the whole call.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn load_user_credentials(&self) -> Result<HashMap<String, String>, IdentitySourceError>;
}

/// Fixed in-memory identity source. Used for tests and local runs.
#[derive(Debug, Default)]
pub struct StaticIdentitySource {
    credentials: RwLock<Option<HashMap<String, String>>>,
    calls: AtomicUsize,
}

impl StaticIdentitySource {
    pub fn new(credentials: HashMap<String, String>) -> Self {
        Self {
            credentials: RwLock::new(Some(credentials)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    /// Replaces the table returned by later loads.
    pub fn set(&self, credentials: HashMap<String, String>) {
        if let Ok(mut guard) = self.credentials.write() {
            *guard = Some(credentials);
        }
    }

    /// Makes later loads fail until `set` is called again.
    pub fn fail(&self) {
        if let Ok(mut guard) = self.credentials.write() {
            *guard = None;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentitySource for StaticIdentitySource {
    async fn load_user_credentials(&self) -> Result<HashMap<String, String>, IdentitySourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let guard = self
            .credentials
            .read()
            .map_err(|_| IdentitySourceError::Unavailable("lock poisoned".to_string()))?;
        guard
            .clone()
            .ok_or_else(|| IdentitySourceError::Unavailable("static source set to fail".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RgwUserInfo {
    #[serde(default)]
    keys: Vec<RgwUserKey>,
}

#[derive(Debug, Deserialize)]
struct RgwUserKey {
    access_key: String,
    secret_key: String,
}

#[derive(Debug, Clone)]
struct RgwAdminEndpoint {
    url: Url,
    credential: SigningCredential,
}

/// Ceph RADOS Gateway admin API client.
///
/// Lists every user on every configured endpoint and collects all of their
/// S3 keys.
pub struct RgwAdminClient {
    http: reqwest::Client,
    endpoints: Vec<RgwAdminEndpoint>,
    signer: RequestSigner,
}

impl RgwAdminClient {
    /// `endpoints`, `access_keys` and `secret_keys` are parallel
    /// comma-separated lists, one admin credential per endpoint.
    pub fn new(
        endpoints: &str,
        access_keys: &str,
        secret_keys: &str,
        signer: RequestSigner,
    ) -> Result<Self, IdentitySourceError> {
        let endpoints = split_list(endpoints);
        let access_keys = split_list(access_keys);
        let secret_keys = split_list(secret_keys);

        if endpoints.is_empty() || access_keys.is_empty() || secret_keys.is_empty() {
            return Err(IdentitySourceError::Misconfigured(
                "missing rgw admin endpoint, access key or secret key".to_string(),
            ));
        }
        if endpoints.len() != access_keys.len() || endpoints.len() != secret_keys.len() {
            return Err(IdentitySourceError::Misconfigured(format!(
                "mismatched rgw admin endpoints ({}), access keys ({}) and secret keys ({})",
                endpoints.len(),
                access_keys.len(),
                secret_keys.len()
            )));
        }

        let endpoints = endpoints
            .iter()
            .zip(access_keys.iter().zip(secret_keys.iter()))
            .map(|(endpoint, (access, secret))| {
                let url = Url::parse(endpoint).map_err(|source| {
                    IdentitySourceError::InvalidEndpoint {
                        endpoint: endpoint.to_string(),
                        source,
                    }
                })?;
                Ok(RgwAdminEndpoint {
                    url,
                    credential: SigningCredential::new(*access, *secret),
                })
            })
            .collect::<Result<Vec<_>, IdentitySourceError>>()?;

        Ok(Self {
            http: reqwest::Client::new(),
            endpoints,
            signer,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &RgwAdminEndpoint,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, IdentitySourceError> {
        let mut url = endpoint.url.clone();
        url.set_path(path);
        url.query_pairs_mut().extend_pairs(query);

        let endpoint_name = endpoint.url.to_string();
        let transport = |source| IdentitySourceError::Transport {
            endpoint: endpoint_name.clone(),
            source,
        };

        let uri: Uri = url.as_str().parse().map_err(|_| {
            IdentitySourceError::Misconfigured(format!("unusable admin url {}", url))
        })?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(IdentitySourceError::Misconfigured(format!(
                    "admin url {} has no host",
                    url
                )))
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            HOST,
            HeaderValue::from_str(&host).map_err(|_| {
                IdentitySourceError::Misconfigured(format!("invalid admin host {}", host))
            })?,
        );
        self.signer.sign(
            &endpoint.credential,
            &Method::GET,
            &uri,
            &mut headers,
            b"",
            Utc::now(),
        )?;

        let response = self
            .http
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(IdentitySourceError::Status {
                endpoint: endpoint_name.clone(),
                status,
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        serde_json::from_slice(&body).map_err(|source| IdentitySourceError::Decode {
            endpoint: endpoint_name,
            source,
        })
    }
}

#[async_trait]
impl IdentitySource for RgwAdminClient {
    #[instrument(name = "load_user_credentials", skip(self), fields(endpoints = self.endpoints.len()))]
    async fn load_user_credentials(&self) -> Result<HashMap<String, String>, IdentitySourceError> {
        let mut results = HashMap::new();

        for endpoint in &self.endpoints {
            let users: Vec<String> = self
                .get_json(endpoint, USER_LIST_PATH, &[("format", "json")])
                .await?;
            debug!("found {} users on {}", users.len(), endpoint.url);

            for user in &users {
                let info: RgwUserInfo = self
                    .get_json(endpoint, USER_INFO_PATH, &[("uid", user.as_str()), ("format", "json")])
                    .await?;
                for key in info.keys {
                    results.insert(key.access_key, key.secret_key);
                }
            }
        }

        info!("loaded {} access keys from rgw admin", results.len());
        Ok(results)
    }
}

fn split_list(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect()
}
