use crate::connection::ConnectionOptions;
use crate::ldap_protocol::DEFAULT_MAX_FRAME_BYTES;
use crate::tls::{TlsMode, TlsOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub bind: BindConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// ldap://host[:port] or ldaps://host[:port].
    pub url: String,
    /// TCP (and for ldaps:// TLS) connect timeout in seconds (default 5).
    pub connect_timeout_sec: Option<u64>,
    /// Bind and StartTLS response timeout in seconds (default 30). 0 waits indefinitely.
    pub operation_timeout_sec: Option<u64>,
}

/// Simple bind credentials. Without `binddn` the session stays anonymous.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindConfig {
    pub binddn: Option<String>,
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// none, ldaps or starttls. An ldaps:// URL implies ldaps.
    pub mode: Option<TlsModeConfig>,
    /// Не проверять сертификат сервера (только для тестов/внутренней сети).
    pub skip_verify: Option<bool>,
    /// PEM CA certificate or bundle, used in addition to system roots.
    pub ca_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsModeConfig {
    None,
    Ldaps,
    Starttls,
}

impl From<TlsModeConfig> for TlsMode {
    fn from(mode: TlsModeConfig) -> Self {
        match mode {
            TlsModeConfig::None => TlsMode::None,
            TlsModeConfig::Ldaps => TlsMode::Ldaps,
            TlsModeConfig::Starttls => TlsMode::StartTls,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Default search base for the command line tool.
    pub base: Option<String>,
    /// Entries buffered per search stream (default 256).
    pub channel_capacity: Option<usize>,
    /// Largest accepted response frame in bytes (default 16 MiB).
    pub max_frame_bytes: Option<usize>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Parse YAML config")?;
        Ok(config)
    }

    /// Host, port, and whether the URL scheme itself implies TLS.
    pub fn server_address(&self) -> Result<(String, u16, bool)> {
        parse_ldap_url(&self.server.url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_sec.unwrap_or(5))
    }

    pub fn tls_mode(&self) -> Result<TlsMode> {
        let (_, _, implied_tls) = self.server_address()?;
        let mode = match self.tls.mode {
            Some(mode) => TlsMode::from(mode),
            None if implied_tls => TlsMode::Ldaps,
            None => TlsMode::None,
        };
        if implied_tls && mode != TlsMode::Ldaps {
            anyhow::bail!(
                "ldaps:// URL {} conflicts with tls.mode {:?}",
                self.server.url,
                mode
            );
        }
        Ok(mode)
    }

    /// Connection settings for the client core; reads `tls.ca_file` when set.
    pub fn connection_options(&self) -> Result<ConnectionOptions> {
        let ca_pem = match &self.tls.ca_file {
            Some(path) => Some(
                fs::read(path).with_context(|| format!("Read TLS CA file {}", path))?,
            ),
            None => None,
        };
        let defaults = ConnectionOptions::default();
        let operation_timeout = match self.server.operation_timeout_sec {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.operation_timeout,
        };
        Ok(ConnectionOptions {
            tls_mode: self.tls_mode()?,
            tls: TlsOptions {
                skip_verify: self.tls.skip_verify.unwrap_or(false),
                ca_pem,
            },
            operation_timeout,
            channel_capacity: self
                .search
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            max_frame_bytes: self.search.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                url: "ldap://127.0.0.1:389".to_string(),
                connect_timeout_sec: Some(5),
                operation_timeout_sec: Some(30),
            },
            bind: BindConfig::default(),
            tls: TlsConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

/// Parse "ldap://host[:port]" or "ldaps://host[:port]" to (host, port, tls).
pub fn parse_ldap_url(url: &str) -> Result<(String, u16, bool)> {
    let (rest, tls, default_port) = if let Some(rest) = url.strip_prefix("ldaps://") {
        (rest, true, 636)
    } else if let Some(rest) = url.strip_prefix("ldap://") {
        (rest, false, 389)
    } else {
        anyhow::bail!("Invalid LDAP URL scheme: {}", url);
    };
    // Anything after the authority (DN, attributes) is not used here.
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        anyhow::bail!("No host in URL: {}", url);
    }

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("Unterminated IPv6 address in URL: {}", url))?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(port),
            None if after.is_empty() => None,
            None => anyhow::bail!("Invalid authority in URL: {}", url),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .with_context(|| format!("Invalid port in URL: {}", url))?,
        None => default_port,
    };
    if host.is_empty() {
        anyhow::bail!("No host in URL: {}", url);
    }
    Ok((host.to_string(), port, tls))
}
