/// Configuration parsing for the client proxy and the OOB peer.
use serde::Deserialize;
use std::path::Path;

// ── Client config ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub oob: OobSettings,
    #[serde(default)]
    pub concealment: ConcealmentSettings,
}

#[derive(Debug, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_listen_addr")]
    pub listen: String,
    #[serde(default = "default_client_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            port: default_client_port(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct OobSettings {
    /// `host:port` of the OOB peer. Empty means the peer runs in-process
    /// and OOB calls are direct.
    #[serde(default)]
    pub peer: String,
}

#[derive(Debug, Deserialize)]
pub struct ConcealmentSettings {
    /// On CONNECT tunnels, read the ClientHello and conceal it instead of
    /// opening a plain direct tunnel.
    #[serde(default)]
    pub prioritize_sni: bool,
    /// Carry the whole ClientHello over the OOB peer (full concealment)
    /// rather than only target resolution (SNI-only).
    #[serde(default = "default_true")]
    pub full_client_hello: bool,
    /// In SNI-only mode, rewrite the forwarded ClientHello's server_name to
    /// this value. Empty leaves the hello untouched.
    #[serde(default)]
    pub fake_sni: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ConcealmentSettings {
    fn default() -> Self {
        Self {
            prioritize_sni: false,
            full_client_hello: true,
            fake_sni: String::new(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

// ── OOB peer config ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OobConfig {
    #[serde(default)]
    pub server: ServerListenConfig,
    #[serde(default)]
    pub sessions: SessionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerListenConfig {
    #[serde(default = "default_bind_addr")]
    pub listen: String,
    #[serde(default = "default_oob_port")]
    pub port: u16,
}

impl Default for ServerListenConfig {
    fn default() -> Self {
        Self {
            listen: default_bind_addr(),
            port: default_oob_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Defaults ─────────────────────────────────────────────────────────

fn default_listen_addr() -> String {
    "127.0.0.1".into()
}
fn default_bind_addr() -> String {
    "0.0.0.0".into()
}
fn default_client_port() -> u16 {
    3128
}
fn default_oob_port() -> u16 {
    9008
}
fn default_log_level() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_cleanup_interval() -> u64 {
    300
}

// ── Loaders ──────────────────────────────────────────────────────────

pub fn load_client_config(path: &Path) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let config: ClientConfig = toml::from_str(&content)?;
    Ok(config)
}

pub fn load_oob_config(path: &Path) -> Result<OobConfig, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let config: OobConfig = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config.client.listen, "127.0.0.1");
        assert_eq!(config.client.port, 3128);
        assert!(config.oob.peer.is_empty());
        assert!(!config.concealment.prioritize_sni);
        assert!(config.concealment.full_client_hello);
        assert_eq!(config.concealment.handshake_timeout_ms, 10_000);
    }

    #[test]
    fn client_config_overrides() {
        let config: ClientConfig = toml::from_str(
            r#"
            [client]
            listen = "0.0.0.0"
            port = 8080

            [oob]
            peer = "198.51.100.7:9008"

            [concealment]
            prioritize_sni = true
            full_client_hello = false
            fake_sni = "decoy.example.net"
            "#,
        )
        .unwrap();
        assert_eq!(config.client.port, 8080);
        assert_eq!(config.oob.peer, "198.51.100.7:9008");
        assert!(config.concealment.prioritize_sni);
        assert!(!config.concealment.full_client_hello);
        assert_eq!(config.concealment.fake_sni, "decoy.example.net");
    }

    #[test]
    fn oob_config_defaults() {
        let config: OobConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0");
        assert_eq!(config.server.port, 9008);
        assert_eq!(config.sessions.idle_timeout_secs, 300);
        assert_eq!(config.sessions.cleanup_interval_secs, 300);
    }
}
