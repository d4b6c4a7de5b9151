use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri};
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use thiserror::Error;
use tracing::debug;

use super::signing::{RequestSigner, SignError, SigningCredential};
use super::upstream::ResolvedUpstream;

pub const CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");

pub const DEFAULT_MAX_SIGNED_BODY_BYTES: usize = 64 * 1024 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("invalid upstream uri {0}")]
    InvalidUri(String),
    #[error("invalid upstream host {0}")]
    InvalidHost(String),
    #[error("failed to read request body: {0}")]
    BodyRead(#[source] BoxError),
    #[error("request body exceeds the {limit} byte signing limit")]
    BodyTooLarge { limit: usize },
    #[error("unable to sign request: {0}")]
    Signing(#[from] SignError),
}

/// Builds the outbound request for one upstream, re-signed when a credential
/// is supplied.
#[derive(Debug, Clone)]
pub struct RequestAssembler {
    signer: RequestSigner,
    max_body_bytes: usize,
}

impl RequestAssembler {
    pub fn new(signer: RequestSigner) -> Self {
        Self {
            signer,
            max_body_bytes: DEFAULT_MAX_SIGNED_BODY_BYTES,
        }
    }

    /// Caps how much of a signed request's body is buffered.
    pub fn with_body_limit(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn signer(&self) -> &RequestSigner {
        &self.signer
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Order matters: `Content-Type`/`Content-Md5` go in before signing, the
    /// rest of the original headers only fill gaps afterwards so nothing the
    /// signature covers is ever replaced.
    ///
    /// Without a credential the request is passed through unsigned and the
    /// body is streamed rather than buffered. Signed bodies are buffered up to
    /// `max_body_bytes`.
    pub async fn assemble_upstream_request(
        &self,
        original: Request,
        upstream: &ResolvedUpstream,
        credential: Option<&SigningCredential>,
        now: DateTime<Utc>,
    ) -> Result<Request, AssembleError> {
        let (parts, body) = original.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri_string = format!("{}{}", upstream, path_and_query);
        let uri: Uri = uri_string
            .parse()
            .map_err(|_| AssembleError::InvalidUri(uri_string.clone()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HOST,
            HeaderValue::from_str(&upstream.host)
                .map_err(|_| AssembleError::InvalidHost(upstream.host.clone()))?,
        );
        for name in [CONTENT_TYPE, CONTENT_MD5] {
            for value in parts.headers.get_all(&name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let body = match credential {
            Some(credential) => {
                let bytes = self.read_body(&parts.headers, body).await?;
                self.signer
                    .sign(credential, &parts.method, &uri, &mut headers, &bytes, now)?;
                Body::from(bytes)
            }
            None => {
                debug!("no credential, forwarding {} {} unsigned", parts.method, uri);
                body
            }
        };

        copy_headers_without_overwrite(&mut headers, &parts.headers);

        // Keep the exact length so the body is not re-framed as chunked.
        if let Some(length) = parts.headers.get(CONTENT_LENGTH) {
            headers.insert(CONTENT_LENGTH, length.clone());
        }

        let mut request = Request::new(body);
        *request.method_mut() = parts.method;
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;
        Ok(request)
    }

    async fn read_body(&self, headers: &HeaderMap, body: Body) -> Result<Bytes, AssembleError> {
        let limit = self.max_body_bytes;
        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        if declared.is_some_and(|length| length > limit as u64) {
            return Err(AssembleError::BodyTooLarge { limit });
        }

        match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.is::<LengthLimitError>() => Err(AssembleError::BodyTooLarge { limit }),
            Err(e) => Err(AssembleError::BodyRead(e)),
        }
    }
}

/// Copies every header of `src` whose name is absent from `dst`, with all of
/// its values. Headers already in `dst` are left alone.
pub fn copy_headers_without_overwrite(dst: &mut HeaderMap, src: &HeaderMap) {
    for name in src.keys() {
        if dst.contains_key(name) {
            continue;
        }
        for value in src.get_all(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_keeps_existing_and_adds_missing() {
        let mut dst = HeaderMap::new();
        dst.insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));

        let mut src = HeaderMap::new();
        src.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        src.insert("x-request-id", HeaderValue::from_static("req-1"));

        copy_headers_without_overwrite(&mut dst, &src);

        assert_eq!(dst.get(CONTENT_TYPE).unwrap(), "application/xml");
        assert_eq!(dst.get("x-request-id").unwrap(), "req-1");
    }

    #[test]
    fn test_copy_brings_every_value_of_multi_valued_headers() {
        let mut dst = HeaderMap::new();
        let mut src = HeaderMap::new();
        src.append("x-amz-meta-tag", HeaderValue::from_static("a"));
        src.append("x-amz-meta-tag", HeaderValue::from_static("b"));

        copy_headers_without_overwrite(&mut dst, &src);

        let values: Vec<_> = dst.get_all("x-amz-meta-tag").iter().collect();
        assert_eq!(values, vec!["a", "b"]);
    }
}
