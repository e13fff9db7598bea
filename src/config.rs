//! Tunables of the connection layer, loadable from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use serde::Deserialize;

use crate::{Error, Result};

/// Default capacity of a connection's input buffer in bytes.
pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 8192;

/// Default capacity of a connection's output buffer in bytes.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 65536;

/// Milliseconds without reading any data before an unreferenced connection
/// with a read callback is closed.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Default length of the pending-connection queue of a listener.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 128;

/// Configuration shared by every connection and listener of a
/// [crate::net::Network].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetConfig {
    /// Capacity of each connection's input buffer.
    pub input_buffer_size: usize,
    /// Capacity of each connection's output buffer. Data beyond the free
    /// capacity passed to `send` is dropped.
    pub output_buffer_size: usize,
    /// Idle time before auto-close, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Backlog passed to `listen(2)`.
    pub listen_backlog: i32,
    /// Certificate material used by TLS listeners.
    pub tls: Option<TlsFiles>,
}

/// PEM files for TLS listeners.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFiles {
    /// Certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// Private key matching the leaf certificate.
    pub key_path: PathBuf,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            input_buffer_size: DEFAULT_INPUT_BUFFER_SIZE,
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            tls: None,
        }
    }
}

impl NetConfig {
    /// Parses and validates a configuration from TOML text. Missing keys take
    /// their default values.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: NetConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Rejects values the connection layer cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.input_buffer_size == 0 {
            return Err(Error::Config("input_buffer_size must be greater than 0".into()));
        }
        if self.output_buffer_size == 0 {
            return Err(Error::Config(
                "output_buffer_size must be greater than 0".into(),
            ));
        }
        if self.listen_backlog <= 0 {
            return Err(Error::Config("listen_backlog must be greater than 0".into()));
        }
        Ok(())
    }

    /// Idle timeout as a [Duration].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = NetConfig::from_toml_str("").unwrap();
        assert_eq!(config, NetConfig::default());
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_document_overrides() {
        let config = NetConfig::from_toml_str(
            r#"
            output_buffer_size = 16
            idle_timeout_ms = 500

            [tls]
            cert_path = "cert.pem"
            key_path = "key.pem"
            "#,
        )
        .unwrap();

        assert_eq!(config.output_buffer_size, 16);
        assert_eq!(config.input_buffer_size, DEFAULT_INPUT_BUFFER_SIZE);
        assert_eq!(config.idle_timeout(), Duration::from_millis(500));
        let tls = config.tls.unwrap();
        assert_eq!(tls.cert_path, PathBuf::from("cert.pem"));
    }

    #[test]
    fn zero_buffer_invalid() {
        assert!(matches!(
            NetConfig::from_toml_str("input_buffer_size = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            NetConfig::from_toml_str("listen_backlog = 0"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn unknown_key_invalid() {
        assert!(NetConfig::from_toml_str("buffer = 1").is_err());
    }
}
