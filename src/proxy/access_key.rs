use regex::Regex;
use thiserror::Error;
use tracing::debug;

// SigV4: `AWS4-HMAC-SHA256 Credential=<key>/<date>/<region>/s3/aws4_request, ...`
const SIGV4_PATTERN: &str = "Credential=([a-zA-Z0-9]+)";
const SIGV4_SPLITTER: &str = "=";

// SigV2: `AWS <key>:<signature>`
const SIGV2_PATTERN: &str = "AWS ([a-zA-Z0-9]+)";
const SIGV2_SPLITTER: &str = " ";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccessKeyError {
    #[error("no access key found in Authorization header")]
    NoAccessKeyFound,
}

/// One supported encoding of the access key inside an `Authorization` header.
#[derive(Debug, Clone)]
pub struct AccessKeyFormat {
    pattern: Regex,
    splitter: &'static str,
}

impl AccessKeyFormat {
    pub fn new(pattern: Regex, splitter: &'static str) -> Self {
        Self { pattern, splitter }
    }

    fn extract(&self, value: &str) -> Option<String> {
        let found = self.pattern.find(value)?;
        found
            .as_str()
            .split(self.splitter)
            .nth(1)
            .map(str::to_string)
    }
}

/// Pulls the caller's access key id out of an `Authorization` header value.
///
/// Formats are tried in order and the first one whose pattern matches decides
/// the result.
#[derive(Debug, Clone)]
pub struct AccessKeyExtractor {
    formats: Vec<AccessKeyFormat>,
}

impl AccessKeyExtractor {
    pub fn new() -> Self {
        Self::with_formats(vec![
            AccessKeyFormat::new(
                Regex::new(SIGV4_PATTERN).expect("sigv4 access key pattern compiles"),
                SIGV4_SPLITTER,
            ),
            AccessKeyFormat::new(
                Regex::new(SIGV2_PATTERN).expect("sigv2 access key pattern compiles"),
                SIGV2_SPLITTER,
            ),
        ])
    }

    pub fn with_formats(formats: Vec<AccessKeyFormat>) -> Self {
        Self { formats }
    }

    pub fn find_access_key(&self, auth_header: &str) -> Result<String, AccessKeyError> {
        for format in &self.formats {
            if format.pattern.is_match(auth_header) {
                return format
                    .extract(auth_header)
                    .ok_or(AccessKeyError::NoAccessKeyFound);
            }
        }
        debug!("authorization header did not match any access key format");
        Err(AccessKeyError::NoAccessKeyFound)
    }
}

impl Default for AccessKeyExtractor {
    fn default() -> Self {
        Self::new()
    }
}
