use std::fmt;
use std::str::FromStr;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

const RULE_FIELD_SEPARATOR: char = ':';
const SCHEME_SEPARATOR: &str = "://";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("unable to modify host with upstream changes")]
    NoHostMatch,
    #[error("missing valid parameters to format upstream requests")]
    MissingParameters,
    #[error("invalid upstream rule {rule:?}: {reason}")]
    InvalidRule { rule: String, reason: String },
    #[error("invalid upstream endpoint {0:?}")]
    InvalidEndpoint(String),
}

/// `http` or `https`, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn from_insecure(insecure: bool) -> Self {
        if insecure {
            Scheme::Http
        } else {
            Scheme::Https
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical destination of one forwarded request. Also the key of the
/// forwarder table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedUpstream {
    pub scheme: Scheme,
    pub host: String,
}

impl ResolvedUpstream {
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
        }
    }
}

impl fmt::Display for ResolvedUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.scheme, SCHEME_SEPARATOR, self.host)
    }
}

/// Host rewrite rule, written as `matchPattern:replacePattern:replaceWith:levelsDeep`.
///
/// Only applies to hosts with exactly `levels_deep` dots, so overlapping
/// patterns for different depths never compete.
#[derive(Debug, Clone)]
pub struct UpstreamRewriteRule {
    pub match_pattern: Regex,
    pub replace_pattern: Regex,
    pub replace_with: String,
    pub levels_deep: usize,
}

impl UpstreamRewriteRule {
    pub fn new(
        match_pattern: Regex,
        replace_pattern: Regex,
        replace_with: impl Into<String>,
        levels_deep: usize,
    ) -> Self {
        Self {
            match_pattern,
            replace_pattern,
            replace_with: replace_with.into(),
            levels_deep,
        }
    }

    pub fn is_match(&self, host: &str) -> bool {
        self.match_pattern.is_match(host)
    }

    pub fn match_and_replace(&self, host: &str) -> Option<String> {
        if host.matches('.').count() != self.levels_deep {
            return None;
        }
        if !self.is_match(host) {
            return None;
        }
        Some(
            self.replace_pattern
                .replace_all(host, self.replace_with.as_str())
                .into_owned(),
        )
    }
}

impl FromStr for UpstreamRewriteRule {
    type Err = UpstreamError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| UpstreamError::InvalidRule {
            rule: spec.to_string(),
            reason,
        };

        let fields: Vec<&str> = spec.split(RULE_FIELD_SEPARATOR).collect();
        let [pattern, replace_pattern, replace_with, levels] = fields.as_slice() else {
            return Err(invalid(format!(
                "expected 4 fields separated by '{}', got {}",
                RULE_FIELD_SEPARATOR,
                fields.len()
            )));
        };

        let match_pattern =
            Regex::new(pattern).map_err(|e| invalid(format!("bad match pattern: {}", e)))?;
        let replace_pattern = Regex::new(replace_pattern)
            .map_err(|e| invalid(format!("bad replace pattern: {}", e)))?;
        let levels_deep = levels
            .trim()
            .parse::<usize>()
            .map_err(|e| invalid(format!("bad levels value: {}", e)))?;

        Ok(Self::new(
            match_pattern,
            replace_pattern,
            *replace_with,
            levels_deep,
        ))
    }
}

/// Maps the inbound virtual host onto the physical upstream.
///
/// A static override always wins; otherwise the first rule that applies
/// decides. Immutable after construction.
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    scheme: Scheme,
    endpoint_override: Option<ResolvedUpstream>,
    rules: Vec<UpstreamRewriteRule>,
}

impl UpstreamResolver {
    pub fn new(
        scheme: Scheme,
        endpoint_override: Option<ResolvedUpstream>,
        rules: Vec<UpstreamRewriteRule>,
    ) -> Result<Self, UpstreamError> {
        if endpoint_override.is_none() && rules.is_empty() {
            return Err(UpstreamError::MissingParameters);
        }
        if let Some(upstream) = &endpoint_override {
            info!("all requests go to static upstream {}", upstream);
        }

        Ok(Self {
            scheme,
            endpoint_override,
            rules,
        })
    }

    /// Builds a resolver from configuration strings. `endpoint` may carry its
    /// own scheme (`http://host:port`); bare hosts use `scheme`.
    pub fn from_config(
        scheme: Scheme,
        endpoint: Option<&str>,
        rule_specs: &[String],
    ) -> Result<Self, UpstreamError> {
        let endpoint_override = endpoint
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(|endpoint| parse_endpoint(scheme, endpoint))
            .transpose()?;
        let rules = rule_specs
            .iter()
            .map(|spec| spec.parse())
            .collect::<Result<Vec<UpstreamRewriteRule>, _>>()?;

        Self::new(scheme, endpoint_override, rules)
    }

    pub fn resolve_host(&self, origin_host: &str) -> Result<String, UpstreamError> {
        Ok(self.resolve(origin_host)?.host)
    }

    pub fn resolve(&self, origin_host: &str) -> Result<ResolvedUpstream, UpstreamError> {
        debug!("origin host: {}", origin_host);
        if let Some(upstream) = &self.endpoint_override {
            return Ok(upstream.clone());
        }

        self.rules
            .iter()
            .find_map(|rule| rule.match_and_replace(origin_host))
            .map(|host| ResolvedUpstream::new(self.scheme, host))
            .ok_or_else(|| {
                debug!("did not match the origin format for {}", origin_host);
                UpstreamError::NoHostMatch
            })
    }
}

fn parse_endpoint(default_scheme: Scheme, endpoint: &str) -> Result<ResolvedUpstream, UpstreamError> {
    let (scheme, host) = match endpoint.split_once(SCHEME_SEPARATOR) {
        Some(("http", host)) => (Scheme::Http, host),
        Some(("https", host)) => (Scheme::Https, host),
        Some(_) => return Err(UpstreamError::InvalidEndpoint(endpoint.to_string())),
        None => (default_scheme, endpoint),
    };
    let host = host.trim_end_matches('/');
    if host.is_empty() || host.contains('/') {
        return Err(UpstreamError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(ResolvedUpstream::new(scheme, host))
}
