// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{AuthMechanism, CompressorName};

/// Default port when an address omits one.
pub const DEFAULT_PORT: u16 = 27017;

/// A server endpoint. Identity is host + port; the host stays unresolved so
/// a SOCKS5 proxy can perform the DNS lookup on our behalf.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for ServerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        ensure!(!s.is_empty(), "server address must not be empty");
        match s.rsplit_once(':') {
            Some((host, port)) => {
                ensure!(!host.is_empty(), "server address '{s}' has no host");
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("invalid port in server address '{s}'"))?;
                Ok(Self::new(host, port))
            },
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ServerAddress> for String {
    fn from(a: ServerAddress) -> String {
        a.to_string()
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Where and how to reach the deployment.
    pub connection: ConnectionConfig,
    /// Credential material, if authentication is required.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Compressors offered during the handshake.
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Client metadata reported in the greeting.
    #[serde(default)]
    pub client: ClientMetadataConfig,
    /// Optional SOCKS5 proxy the transport tunnels through.
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Optional stable server API version marker.
    #[serde(default)]
    pub server_api: Option<ServerApiConfig>,
}

/// Endpoint and pool settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnectionConfig {
    #[serde(default, rename = "Hosts")]
    /// Static seed list. Mutually exclusive with `SrvHost`.
    pub hosts: Vec<ServerAddress>,

    #[serde(default, rename = "SrvHost")]
    /// SRV name to resolve; the resolver callback delivers the hosts.
    pub srv_host: Option<String>,

    #[serde(default, rename = "LoadBalanced")]
    /// Whether the deployment sits behind an external load balancer.
    pub load_balanced: bool,

    #[serde(rename = "ConnectTimeout", with = "serde_secs")]
    /// Budget for establishing the TCP connection.
    pub connect_timeout: Duration,

    #[serde(rename = "IoTimeout", with = "serde_secs")]
    /// Per-read/write budget on an established stream.
    pub io_timeout: Duration,

    #[serde(default = "default_max_pool_size", rename = "MaxPoolSize")]
    /// Upper bound on pooled connections per server.
    pub max_pool_size: u32,
}

fn default_max_pool_size() -> u32 {
    10
}

/// Credential fields that can come from configuration. OIDC callbacks are
/// code and are attached at runtime when the credential is built.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct AuthConfig {
    #[serde(default, rename = "Mechanism")]
    /// Absent means "negotiate via saslSupportedMechs".
    pub mechanism: Option<AuthMechanism>,

    #[serde(default = "default_auth_source", rename = "Source")]
    /// Database the credential is defined on.
    pub source: String,

    #[serde(default, rename = "Username")]
    pub username: Option<String>,

    #[serde(default, rename = "Password")]
    pub password: Option<String>,

    #[serde(default, rename = "AllowedHosts")]
    /// Host patterns an OIDC callback may be invoked for. Absent = any.
    /// Only a single leading `*.` wildcard is accepted per pattern.
    pub allowed_hosts: Option<Vec<String>>,

    #[serde(default, rename = "TokenFileEnv")]
    /// Environment variable naming a web-identity token file; configures
    /// the automatic OIDC provider and bypasses callbacks.
    pub token_file_env: Option<String>,
}

fn default_auth_source() -> String {
    "admin".to_string()
}

impl AuthConfig {
    pub fn is_configured(&self) -> bool {
        self.username.is_some() || self.mechanism.is_some()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct CompressionConfig {
    #[serde(default, rename = "Compressors")]
    /// Offered in this order; the first server-shared name wins.
    pub compressors: Vec<CompressorName>,

    #[serde(default, rename = "ZlibLevel")]
    /// Zlib compression level override (0-9).
    pub zlib_level: Option<u32>,
}

/// Fields of the `client` metadata document sent with the greeting.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ClientMetadataConfig {
    #[serde(default, rename = "AppName")]
    pub app_name: Option<String>,
}

/// SOCKS5 proxy endpoint plus optional RFC 1929 credentials.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProxyConfig {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(default, rename = "Username")]
    pub username: Option<String>,
    #[serde(default, rename = "Password")]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn address(&self) -> ServerAddress {
        ServerAddress::new(self.host.clone(), self.port)
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        }
    }
}

/// Stable server API marker. When set, the greeting uses the modern command
/// name and every command carries the version fields.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerApiConfig {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(default, rename = "Strict")]
    pub strict: bool,
    #[serde(default, rename = "DeprecationErrors")]
    pub deprecation_errors: bool,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        let conn = &self.connection;
        ensure!(
            !conn.hosts.is_empty() || conn.srv_host.is_some(),
            "either Hosts or SrvHost must be configured"
        );
        ensure!(
            conn.hosts.is_empty() || conn.srv_host.is_none(),
            "Hosts and SrvHost are mutually exclusive"
        );
        if conn.load_balanced {
            ensure!(
                conn.hosts.len() <= 1,
                "a load-balanced deployment takes a single host or an SRV name"
            );
        }
        ensure!(conn.max_pool_size >= 1, "MaxPoolSize must be >= 1");

        // Mechanism-specific credential shape.
        match self.auth.mechanism {
            Some(AuthMechanism::Plain)
            | Some(AuthMechanism::NativeCr)
            | Some(AuthMechanism::ScramSha1)
            | Some(AuthMechanism::ScramSha256) => {
                ensure!(
                    self.auth.username.is_some(),
                    "mechanism {} requires Username",
                    self.auth.mechanism.map(|m| m.to_string()).unwrap_or_default()
                );
                ensure!(
                    self.auth.password.is_some(),
                    "mechanism {} requires Password",
                    self.auth.mechanism.map(|m| m.to_string()).unwrap_or_default()
                );
            },
            Some(AuthMechanism::Oidc) => {
                ensure!(
                    self.auth.password.is_none(),
                    "MONGODB-OIDC does not take a Password"
                );
            },
            None => {},
        }

        // Wildcards other than a single leading one are rejected up front.
        if let Some(patterns) = &self.auth.allowed_hosts {
            for p in patterns {
                let tail = p.strip_prefix("*.").unwrap_or(p);
                if tail.contains('*') {
                    bail!("allowed-host pattern '{p}' may only use a single leading wildcard");
                }
            }
        }

        for c in &self.compression.compressors {
            ensure!(
                c.is_supported(),
                "compressor '{c}' is not supported by this build"
            );
        }
        if let Some(level) = self.compression.zlib_level {
            ensure!(level <= 9, "ZlibLevel must be within 0..=9");
        }

        Ok(())
    }
}

/// Resolves a config path relative to the current working directory,
/// canonicalized so error messages point at the real file.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
