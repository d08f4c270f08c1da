//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! A bootstrap refresh token is only ever read from EDGE_REFRESH_TOKEN,
//! never from the TOML, so it cannot end up in a checked-in file.

use common::Secret;
use resilient_client::ClientConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(skip)]
    pub bootstrap_refresh_token: Option<Secret<String>>,
}

/// Local HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Session persistence and token endpoint
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    pub credentials_path: PathBuf,
    pub token_endpoint: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Reachability probe settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// `host:port` to probe. Empty means the host of `client.base_url`.
    pub probe_addr: String,
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_addr: String::new(),
            probe_interval_secs: 10,
            probe_timeout_ms: 2_000,
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.client.validate()?;

        if !config.auth.token_endpoint.starts_with("http://")
            && !config.auth.token_endpoint.starts_with("https://")
        {
            return Err(common::Error::invalid(
                "auth.token_endpoint",
                format!(
                    "must start with http:// or https://, got: {}",
                    config.auth.token_endpoint
                ),
            ));
        }

        if config.agent.max_connections == 0 {
            return Err(common::Error::invalid(
                "agent.max_connections",
                "must be greater than 0",
            ));
        }

        if config.connectivity.probe_interval_secs == 0 {
            return Err(common::Error::invalid(
                "connectivity.probe_interval_secs",
                "must be greater than 0",
            ));
        }

        if config.connectivity.probe_timeout_ms == 0 {
            return Err(common::Error::invalid(
                "connectivity.probe_timeout_ms",
                "must be greater than 0",
            ));
        }

        if config.connectivity.probe_addr.is_empty() {
            config.connectivity.probe_addr = probe_addr_for(&config.client.base_url)?;
        }

        if let Ok(token) = std::env::var("EDGE_REFRESH_TOKEN") {
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.bootstrap_refresh_token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("edge-agent.toml")
    }
}

/// `host:port` of the upstream, used when no probe address is configured.
fn probe_addr_for(base_url: &str) -> common::Result<String> {
    let url = reqwest::Url::parse(base_url)
        .map_err(|e| common::Error::invalid("client.base_url", format!("is not a URL: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| common::Error::invalid("client.base_url", format!("has no host: {base_url}")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| common::Error::invalid("client.base_url", format!("has no port: {base_url}")))?;
    Ok(format!("{host}:{port}"))
}
