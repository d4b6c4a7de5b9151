use std::collections::BTreeMap;
use std::fmt;

use axum::http::header::{AUTHORIZATION, HOST, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument};

type HmacSha256 = Hmac<Sha256>;

// AWS SigV4 constants
const AWS_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const AWS_REQUEST: &str = "aws4_request";
pub const AWS_SERVICE: &str = "s3";
const SIGNED_HEADERS_SEPARATOR: &str = ";";
pub const X_AMZ_DATE_HEADER: &str = "x-amz-date";
pub const X_AMZ_CONTENT_SHA256_HEADER: &str = "x-amz-content-sha256";
const X_AMZN_TRACE_ID_HEADER: &str = "x-amzn-trace-id";
const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const SCOPE_DATE_FORMAT: &str = "%Y%m%d";

// Everything but the SigV4 unreserved characters gets escaped.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Error, Debug)]
pub enum SignError {
    #[error("request has no host header to sign")]
    MissingHost,
    #[error("header {0} is not valid visible ASCII")]
    InvalidHeaderValue(String),
    #[error("query string is not valid UTF-8")]
    MalformedQuery,
}

/// Access key id and secret for one storage user.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningCredential {
    pub access_key_id: String,
    pub secret_key: String,
}

impl SigningCredential {
    pub fn new(access_key_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_key: secret_key.into(),
        }
    }
}

// Keep the secret out of logs.
impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// AWS Signature Version 4 header signer for the S3 service.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    region: String,
}

impl RequestSigner {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Signs the request in place: adds `x-amz-date`, `x-amz-content-sha256`
    /// and `authorization` to `headers`.
    ///
    /// Every header already present (apart from `authorization`,
    /// `user-agent` and `x-amzn-trace-id`) is covered by the signature, so
    /// callers must add only the headers they want signed before calling.
    #[instrument(
        name = "sign_request",
        skip(self, credential, headers, body),
        fields(
            method = %method,
            uri_path = %uri.path(),
            access_key_id = %credential.access_key_id,
            body_len = body.len()
        )
    )]
    pub fn sign(
        &self,
        credential: &SigningCredential,
        method: &Method,
        uri: &Uri,
        headers: &mut HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignError> {
        if !headers.contains_key(HOST) {
            return Err(SignError::MissingHost);
        }

        let amz_date = now.format(AMZ_DATE_FORMAT).to_string();
        let payload_hash = hex::encode(Sha256::digest(body));

        headers.insert(X_AMZ_DATE_HEADER, header_value(&amz_date)?);
        headers.insert(X_AMZ_CONTENT_SHA256_HEADER, header_value(&payload_hash)?);
        headers.remove(AUTHORIZATION);

        let (canonical_headers, signed_headers) = canonical_headers(headers)?;
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri(uri),
            canonical_query_string(uri)?,
            canonical_headers,
            signed_headers,
            payload_hash
        );
        debug!("canonical_request:\n{}", canonical_request);

        let scope_date = now.format(SCOPE_DATE_FORMAT).to_string();
        let credential_scope = format!(
            "{}/{}/{}/{}",
            scope_date, self.region, AWS_SERVICE, AWS_REQUEST
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            AWS_ALGORITHM,
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = self.signature(credential, &scope_date, &string_to_sign);
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            AWS_ALGORITHM, credential.access_key_id, credential_scope, signed_headers, signature
        );
        headers.insert(AUTHORIZATION, header_value(&authorization)?);

        Ok(())
    }

    fn signature(
        &self,
        credential: &SigningCredential,
        scope_date: &str,
        string_to_sign: &str,
    ) -> String {
        let k_date = hmac_sha256(
            format!("AWS4{}", credential.secret_key).as_bytes(),
            scope_date.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, AWS_SERVICE.as_bytes());
        let k_signing = hmac_sha256(&k_service, AWS_REQUEST.as_bytes());

        hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
    }
}

fn header_value(value: &str) -> Result<HeaderValue, SignError> {
    HeaderValue::from_str(value).map_err(|_| SignError::InvalidHeaderValue(value.to_string()))
}

// S3 signs the path exactly as sent, without a second round of escaping.
fn canonical_uri(uri: &Uri) -> &str {
    match uri.path() {
        "" => "/",
        path => path,
    }
}

fn canonical_query_string(uri: &Uri) -> Result<String, SignError> {
    let Some(query) = uri.query() else {
        return Ok(String::new());
    };

    let mut params = Vec::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.push((encode_query_component(key)?, encode_query_component(value)?));
    }
    params.sort();

    Ok(params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&"))
}

fn encode_query_component(raw: &str) -> Result<String, SignError> {
    let spaced = raw.replace('+', " ");
    let decoded = percent_decode_str(&spaced)
        .decode_utf8()
        .map_err(|_| SignError::MalformedQuery)?;
    Ok(utf8_percent_encode(&decoded, QUERY_ENCODE_SET).to_string())
}

fn canonical_headers(headers: &HeaderMap) -> Result<(String, String), SignError> {
    let mut canonical: BTreeMap<&str, Vec<String>> = BTreeMap::new();

    for (name, value) in headers.iter() {
        if name == AUTHORIZATION || name == USER_AGENT || name.as_str() == X_AMZN_TRACE_ID_HEADER {
            continue;
        }
        let value = value
            .to_str()
            .map_err(|_| SignError::InvalidHeaderValue(name.to_string()))?;
        // Normalize whitespace in header values
        let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
        canonical.entry(name.as_str()).or_default().push(normalized);
    }

    let canonical_headers = canonical
        .iter()
        .map(|(name, values)| format!("{}:{}\n", name, values.join(",")))
        .collect::<String>();
    let signed_headers = canonical
        .keys()
        .copied()
        .collect::<Vec<_>>()
        .join(SIGNED_HEADERS_SEPARATOR);

    Ok((canonical_headers, signed_headers))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
