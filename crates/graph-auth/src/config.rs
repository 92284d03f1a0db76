//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from the GRAPH_CLIENT_SECRET env var or
//! client_secret_file, never stored in the TOML directly.

use std::path::{Path, PathBuf};

use common::Secret;
use serde::Deserialize;
use url::Url;

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub oauth: OauthConfig,
    pub api: ApiConfig,
}

/// Identity provider and token cache settings
#[derive(Debug, Clone, Deserialize)]
pub struct OauthConfig {
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret>,
    /// Path to a file containing the client secret (alternative to the
    /// GRAPH_CLIENT_SECRET env var). Absent both, the client is public.
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    /// Authority base, e.g. `https://login.microsoftonline.com/common`
    pub authority_url: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: PathBuf,
}

/// Resource API settings
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,
}

fn default_redirect_uri() -> String {
    "http://localhost:8400/callback".into()
}

fn default_token_cache_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".graph-session")
        .join("tokens.json")
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_rate_limit_max_requests() -> u32 {
    30
}

impl OauthConfig {
    pub fn authorize_endpoint(&self) -> String {
        format!(
            "{}/oauth2/v2.0/authorize",
            self.authority_url.trim_end_matches('/')
        )
    }

    pub fn token_endpoint(&self) -> String {
        format!(
            "{}/oauth2/v2.0/token",
            self.authority_url.trim_end_matches('/')
        )
    }

    /// Space-delimited scope string as sent to the provider.
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// Port and path the redirect URI points at, for the local listener.
    pub fn redirect_parts(&self) -> common::Result<(u16, String)> {
        let url = Url::parse(&self.redirect_uri).map_err(|e| {
            common::Error::Config(format!("invalid redirect_uri {}: {e}", self.redirect_uri))
        })?;
        let port = url.port().unwrap_or(80);
        Ok((port, url.path().to_string()))
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables and validate.
    ///
    /// Client secret resolution order:
    /// 1. GRAPH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Self::finish(config)
    }

    /// Overlay env vars onto an already-deserialized config and validate.
    /// Split out so embedders can build the struct directly.
    pub fn finish(mut config: Config) -> common::Result<Self> {
        if let Ok(id) = std::env::var("GRAPH_CLIENT_ID") {
            if !id.trim().is_empty() {
                config.oauth.client_id = id.trim().to_owned();
            }
        }

        // Resolve client secret: env var takes precedence over file
        if let Ok(secret) = std::env::var("GRAPH_CLIENT_SECRET") {
            if !secret.trim().is_empty() {
                config.oauth.client_secret = Some(Secret::new(secret.trim().to_owned()));
            }
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        if config.oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }

        for (name, value) in [
            ("authority_url", &config.oauth.authority_url),
            ("base_url", &config.api.base_url),
        ] {
            if !value.starts_with("http://") && !value.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {value}"
                )));
            }
            // A prefix check alone admits strings url::Url rejects later,
            // surfacing mid-flow instead of at load time.
            if let Err(e) = Url::parse(value) {
                return Err(common::Error::Config(format!(
                    "{name} is not a valid URL: {e}, got: {value}"
                )));
            }
        }

        // Redirect URI must parse and point at a loopback listener we can bind
        let redirect = Url::parse(&config.oauth.redirect_uri).map_err(|e| {
            common::Error::Config(format!(
                "invalid redirect_uri {}: {e}",
                config.oauth.redirect_uri
            ))
        })?;
        if redirect.scheme() != "http" || redirect.host_str().is_none() {
            return Err(common::Error::Config(format!(
                "redirect_uri must be an http URL with a host, got: {}",
                config.oauth.redirect_uri
            )));
        }

        if config.oauth.scopes.is_empty() {
            return Err(common::Error::Config(
                "at least one scope must be configured".into(),
            ));
        }

        if config.api.rate_limit_window_secs == 0 {
            return Err(common::Error::Config(
                "rate_limit_window_secs must be greater than 0".into(),
            ));
        }
        if config.api.rate_limit_max_requests == 0 {
            return Err(common::Error::Config(
                "rate_limit_max_requests must be greater than 0".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or GRAPH_CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("GRAPH_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("graph-session.toml")
    }
}
