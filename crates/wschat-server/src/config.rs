//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use wschat_core::{ChatError, ChatResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
            handshake_timeout_secs: default_handshake_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

/// `[router]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouterSection {
    #[serde(default)]
    pub identity_binding: IdentityBinding,
}

/// How far the router trusts the `connectionId` a client puts in an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityBinding {
    /// A claimed id that names a live connection is honored, so one socket
    /// can authenticate or speak for another.
    #[default]
    Lenient,
    /// Envelopes always act on the socket they arrived on.
    Strict,
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Hex-encoded shared secret for the `hmac` backend.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_auth_attempts")]
    pub auth_attempts_per_minute: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            secret: None,
            auth_attempts_per_minute: default_auth_attempts(),
        }
    }
}

impl AuthConfig {
    /// Decode `secret`; required for the `hmac` backend.
    pub fn secret_bytes(&self) -> ChatResult<Vec<u8>> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| ChatError::Config("[auth] secret is required for the hmac backend".into()))?;
        let bytes = hex::decode(secret.trim())
            .map_err(|e| ChatError::Config(format!("[auth] secret is not valid hex: {e}")))?;
        if bytes.is_empty() {
            return Err(ChatError::Config("[auth] secret is empty".into()));
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Trust,
    Hmac,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_max_connections() -> usize {
    1024
}
fn default_max_message_size() -> usize {
    wschat_core::frame::DEFAULT_MAX_PAYLOAD
}
fn default_outbound_queue() -> usize {
    64
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_shutdown_grace() -> u64 {
    2000
}
/// Off unless configured: behind a proxy every client shares one IP.
fn default_auth_attempts() -> u32 {
    0
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub strict_identity: bool,
}

/// Resolved server configuration (file + CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Upgraded connections allowed at once; 0 means unlimited.
    pub max_connections: usize,
    pub max_message_size: usize,
    pub outbound_queue: usize,
    pub handshake_timeout_secs: u64,
    pub shutdown_grace_ms: u64,
    pub identity_binding: IdentityBinding,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let server = ServerSection::default();
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: server.port,
            max_connections: server.max_connections,
            max_message_size: server.max_message_size,
            outbound_queue: server.outbound_queue,
            handshake_timeout_secs: server.handshake_timeout_secs,
            shutdown_grace_ms: server.shutdown_grace_ms,
            identity_binding: IdentityBinding::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file (if it exists), then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> ChatResult<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                parse_file(&content)?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Parse a TOML document with no overrides.
    pub fn from_toml(content: &str) -> ChatResult<Self> {
        Self::resolve(parse_file(content)?, &Overrides::default())
    }

    fn resolve(file: ConfigFile, overrides: &Overrides) -> ChatResult<Self> {
        let bind_str = overrides.bind.clone().unwrap_or(file.server.bind);
        let bind = bind_str
            .parse::<IpAddr>()
            .map_err(|e| ChatError::Config(format!("invalid bind address {bind_str:?}: {e}")))?;

        if file.server.outbound_queue == 0 {
            return Err(ChatError::Config("[server] outbound_queue must be at least 1".into()));
        }

        let identity_binding = if overrides.strict_identity {
            IdentityBinding::Strict
        } else {
            file.router.identity_binding
        };

        Ok(Self {
            bind,
            port: overrides.port.unwrap_or(file.server.port),
            max_connections: overrides.max_connections.unwrap_or(file.server.max_connections),
            max_message_size: file.server.max_message_size,
            outbound_queue: file.server.outbound_queue,
            handshake_timeout_secs: file.server.handshake_timeout_secs,
            shutdown_grace_ms: file.server.shutdown_grace_ms,
            identity_binding,
            auth: file.auth,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn parse_file(content: &str) -> ChatResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| ChatError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr().to_string(), "0.0.0.0:8090");
        assert_eq!(config.max_connections, 1024);
        assert_eq!(config.outbound_queue, 64);
        assert_eq!(config.identity_binding, IdentityBinding::Lenient);
        assert_eq!(config.auth.backend, BackendKind::Trust);
        assert_eq!(config.auth.auth_attempts_per_minute, 0);
    }

    #[test]
    fn parses_partial_file() {
        let config = ServerConfig::from_toml(
            r#"
            [server]
            port = 9000
            max_message_size = 4096

            [router]
            identity_binding = "strict"

            [auth]
            backend = "hmac"
            secret = "deadbeef"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.identity_binding, IdentityBinding::Strict);
        assert_eq!(config.auth.secret_bytes().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            ServerConfig::from_toml("[server]\nbind = \"not an ip\""),
            Err(ChatError::Config(_))
        ));
        assert!(ServerConfig::from_toml("[server]\noutbound_queue = 0").is_err());
        assert!(ServerConfig::from_toml("[router]\nidentity_binding = \"loose\"").is_err());
    }

    #[test]
    fn file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 7000\nbind = \"127.0.0.1\"").unwrap();

        let config = ServerConfig::load(Some(file.path()), &Overrides::default()).unwrap();
        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:7000");

        let overrides = Overrides {
            port: Some(7100),
            max_connections: Some(2),
            strict_identity: true,
            ..Overrides::default()
        };
        let config = ServerConfig::load(Some(file.path()), &overrides).unwrap();
        assert_eq!(config.port, 7100);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.identity_binding, IdentityBinding::Strict);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            ServerConfig::load(Some(&dir.path().join("absent.toml")), &Overrides::default())
                .unwrap();
        assert_eq!(config.port, 8090);
    }
}
