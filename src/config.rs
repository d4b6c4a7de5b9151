use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::proxy::assemble::DEFAULT_MAX_SIGNED_BODY_BYTES;
use crate::proxy::credential_cache::CacheSettings;
use crate::proxy::lookup_retry::LookupRetry;
use crate::proxy::source_filter::{SourceAllowlist, SubnetParseError};
use crate::proxy::upstream::{Scheme, UpstreamError, UpstreamResolver};

const DEFAULT_CONFIG_FILE: &str = "./config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),
    #[error(transparent)]
    InvalidSubnet(#[from] SubnetParseError),
    #[error(transparent)]
    InvalidUpstream(#[from] UpstreamError),
    #[error("rgw admin configuration: {0}")]
    RgwAdmin(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("cache.ttl_secs ({ttl}) must exceed cache.refresh_interval_secs ({refresh}) or be 0")]
    TtlTooShort { ttl: u64, refresh: u64 },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub refresh_interval_secs: u64,
    /// 0 disables expiry.
    pub ttl_secs: u64,
    pub evict_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            ttl_secs: 0,
            evict_interval_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LookupRetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_total_wait_ms: u64,
}

impl Default for LookupRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 5,
            max_total_wait_ms: 1000,
        }
    }
}

/// Comma separated, one admin credential per endpoint.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RgwAdminConfig {
    pub endpoints: String,
    pub access_keys: String,
    pub secret_keys: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub listen_address: String,
    pub health_address: String,
    pub allowed_source_subnets: Vec<String>,
    pub upstream_endpoint: Option<String>,
    pub upstream_matchers: Vec<String>,
    pub upstream_insecure: bool,
    pub region: String,
    /// Largest request body buffered for signing.
    pub max_signed_body_bytes: usize,
    pub cache: CacheConfig,
    pub lookup_retry: LookupRetryConfig,
    pub rgw_admin: RgwAdminConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            listen_address: "0.0.0.0:8099".to_string(),
            health_address: "0.0.0.0:8888".to_string(),
            allowed_source_subnets: vec!["127.0.0.1/32".to_string()],
            upstream_endpoint: None,
            upstream_matchers: Vec::new(),
            upstream_insecure: false,
            region: "default".to_string(),
            max_signed_body_bytes: DEFAULT_MAX_SIGNED_BODY_BYTES,
            cache: CacheConfig::default(),
            lookup_retry: LookupRetryConfig::default(),
            rgw_admin: RgwAdminConfig::default(),
        }
    }
}

impl Config {
    pub fn upstream_scheme(&self) -> Scheme {
        Scheme::from_insecure(self.upstream_insecure)
    }

    pub fn upstream_resolver(&self) -> Result<UpstreamResolver, UpstreamError> {
        UpstreamResolver::from_config(
            self.upstream_scheme(),
            self.upstream_endpoint.as_deref(),
            &self.upstream_matchers,
        )
    }

    /// `None` when no subnets are configured, which leaves the filter out.
    pub fn source_allowlist(&self) -> Result<Option<SourceAllowlist>, SubnetParseError> {
        if self.allowed_source_subnets.is_empty() {
            return Ok(None);
        }
        SourceAllowlist::parse(&self.allowed_source_subnets).map(Some)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache.refresh_interval_secs)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            ttl: (self.cache.ttl_secs > 0).then(|| Duration::from_secs(self.cache.ttl_secs)),
            evict_interval: Duration::from_secs(self.cache.evict_interval_secs),
            lookup_retry: LookupRetry::new(
                self.lookup_retry.max_attempts,
                Duration::from_millis(self.lookup_retry.initial_delay_ms),
                Duration::from_millis(self.lookup_retry.max_total_wait_ms),
            ),
        }
    }
}

/// Configuration loader: TOML file first, environment variables otherwise.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Uses `path` when given, then `./config.toml` if it exists, then the
    /// environment.
    pub fn resolve(path: Option<&Path>) -> Result<Config, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))
            }
            None => Self::load(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load configuration from environment variables with fallback defaults
    pub fn load() -> Result<Config, ConfigError> {
        Self::load_from(|name| env::var(name).ok())
    }

    pub fn load_from<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let upstream_insecure = match var("INSECURE") {
            Some(value) => parse_bool("INSECURE", &value)?,
            None => defaults.upstream_insecure,
        };

        Ok(Config {
            log_level: var("S3RESIGN_LOG_LEVEL").unwrap_or(defaults.log_level),
            listen_address: var("S3RESIGN_LISTEN_ADDRESS").unwrap_or(defaults.listen_address),
            health_address: var("S3RESIGN_HEALTH_ADDRESS").unwrap_or(defaults.health_address),
            allowed_source_subnets: var("ALLOWED_SOURCE_SUBNET")
                .map(|value| split_list(&value))
                .unwrap_or(defaults.allowed_source_subnets),
            upstream_endpoint: var("UPSTREAM_ENDPOINT"),
            upstream_matchers: var("UPSTREAM_MATCHERS")
                .map(|value| split_rules(&value))
                .unwrap_or_default(),
            upstream_insecure,
            region: var("S3RESIGN_REGION").unwrap_or(defaults.region),
            max_signed_body_bytes: parse_or(
                "S3RESIGN_MAX_SIGNED_BODY_BYTES",
                var("S3RESIGN_MAX_SIGNED_BODY_BYTES"),
                defaults.max_signed_body_bytes,
            )?,
            cache: CacheConfig {
                refresh_interval_secs: parse_or(
                    "S3RESIGN_REFRESH_INTERVAL_SECS",
                    var("S3RESIGN_REFRESH_INTERVAL_SECS"),
                    defaults.cache.refresh_interval_secs,
                )?,
                ttl_secs: parse_or(
                    "S3RESIGN_CACHE_TTL_SECS",
                    var("S3RESIGN_CACHE_TTL_SECS"),
                    defaults.cache.ttl_secs,
                )?,
                evict_interval_secs: parse_or(
                    "S3RESIGN_CACHE_EVICT_INTERVAL_SECS",
                    var("S3RESIGN_CACHE_EVICT_INTERVAL_SECS"),
                    defaults.cache.evict_interval_secs,
                )?,
            },
            lookup_retry: defaults.lookup_retry,
            rgw_admin: RgwAdminConfig {
                endpoints: var("RGW_ENDPOINT").unwrap_or_default(),
                access_keys: var("RGW_ACCESS_KEY").unwrap_or_default(),
                secret_keys: var("RGW_SECRET_KEY").unwrap_or_default(),
            },
        })
    }

    /// Print configuration help
    pub fn print_help() {
        println!("s3resign Configuration - Environment Variables");
        println!("==============================================");
        println!();
        println!("Used when neither --config nor ./config.toml is present.");
        println!();
        println!("Core Configuration:");
        println!("  S3RESIGN_LOG_LEVEL         Log level (default: info)");
        println!("  S3RESIGN_LISTEN_ADDRESS    Proxy listener (default: 0.0.0.0:8099)");
        println!("  S3RESIGN_HEALTH_ADDRESS    Liveness listener (default: 0.0.0.0:8888)");
        println!("  ALLOWED_SOURCE_SUBNET      Comma separated CIDRs allowed to connect");
        println!("                             (default: 127.0.0.1/32)");
        println!();
        println!("Upstream:");
        println!("  UPSTREAM_ENDPOINT          Static upstream host, overrides matchers");
        println!("  UPSTREAM_MATCHERS          Whitespace separated rewrite rules,");
        println!("                             each matchPattern:replacePattern:replaceWith:levelsDeep");
        println!("  INSECURE                   Use http towards the upstream (default: false)");
        println!("  S3RESIGN_REGION            Signing region (default: default)");
        println!("  S3RESIGN_MAX_SIGNED_BODY_BYTES");
        println!("                             Largest body buffered for signing (default: 67108864)");
        println!();
        println!("Credential Cache:");
        println!("  S3RESIGN_REFRESH_INTERVAL_SECS     Reload interval (default: 300)");
        println!("  S3RESIGN_CACHE_TTL_SECS            Entry time to live, 0 disables (default: 0)");
        println!("  S3RESIGN_CACHE_EVICT_INTERVAL_SECS Expired entry sweep (default: 600)");
        println!();
        println!("RGW Admin API:");
        println!("  RGW_ENDPOINT               Comma separated admin endpoints");
        println!("  RGW_ACCESS_KEY             Comma separated admin access keys");
        println!("  RGW_SECRET_KEY             Comma separated admin secret keys");
        println!();
        println!("Example:");
        println!("  export RGW_ENDPOINT=\"http://rgw-a:8080,http://rgw-b:8080\"");
        println!("  export RGW_ACCESS_KEY=\"ADMINKEYA,ADMINKEYB\"");
        println!("  export RGW_SECRET_KEY=\"secret-a,secret-b\"");
        println!("  export UPSTREAM_MATCHERS='obj\\.(las1|lga1)\\.coreweave\\.com:obj\\.:s3.:3'");
    }

    /// Validate loaded configuration
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        match config.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(config.log_level.clone())),
        }

        for (name, value) in [
            ("listen_address", &config.listen_address),
            ("health_address", &config.health_address),
        ] {
            value
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidValue {
                    name,
                    value: value.clone(),
                })?;
        }

        config.source_allowlist()?;
        config.upstream_resolver()?;

        let rgw = &config.rgw_admin;
        let endpoints = split_list(&rgw.endpoints);
        let access_keys = split_list(&rgw.access_keys);
        let secret_keys = split_list(&rgw.secret_keys);
        if endpoints.is_empty() || access_keys.is_empty() || secret_keys.is_empty() {
            return Err(ConfigError::RgwAdmin(
                "missing endpoint, access key or secret key".to_string(),
            ));
        }
        if endpoints.len() != access_keys.len() || endpoints.len() != secret_keys.len() {
            return Err(ConfigError::RgwAdmin(format!(
                "{} endpoints, {} access keys and {} secret keys",
                endpoints.len(),
                access_keys.len(),
                secret_keys.len()
            )));
        }

        for (name, value) in [
            ("cache.refresh_interval_secs", config.cache.refresh_interval_secs),
            ("cache.evict_interval_secs", config.cache.evict_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        let cache = &config.cache;
        if cache.ttl_secs > 0 && cache.ttl_secs <= cache.refresh_interval_secs {
            return Err(ConfigError::TtlTooShort {
                ttl: cache.ttl_secs,
                refresh: cache.refresh_interval_secs,
            });
        }
        if config.max_signed_body_bytes == 0 {
            return Err(ConfigError::Zero("max_signed_body_bytes"));
        }
        if config.lookup_retry.max_attempts == 0 {
            return Err(ConfigError::Zero("lookup_retry.max_attempts"));
        }

        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Rules are separated by whitespace since their regexes may hold commas.
fn split_rules(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }),
    }
}

fn parse_or<T: FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}
