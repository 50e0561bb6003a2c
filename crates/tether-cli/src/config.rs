//! Configuration system for the Tether CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::{MemoryUserDirectory, UserRecord};
use tether_transport::{TcpHost, TcpLink};

/// Tether CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkSection,
    /// Channel configuration
    #[serde(default)]
    pub channels: ChannelSection,
    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Listen address for `serve`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Default request timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Inbound handshake deadline
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
    /// Largest accepted frame
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
    /// Minimum time between resends
    #[serde(default = "default_resend_delay_ms")]
    pub resend_delay_ms: u64,
    /// Manager tick
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,
    /// Skip updates equal to the last value
    #[serde(default = "default_true")]
    pub skip_unchanged: bool,
    /// Channels a peer may open per connection
    #[serde(default = "default_max_received_channels")]
    pub max_received_channels: usize,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthSection {
    /// Refuse unauthenticated connections
    #[serde(default)]
    pub require_authentication: bool,
    /// Accept sign-ups
    #[serde(default)]
    pub allow_registration: bool,
    /// Users file: one `identifier hex-verifier` per line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users_file: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_request_timeout_ms() -> u64 {
    3_000
}

fn default_setup_timeout_ms() -> u64 {
    30_000
}

fn default_max_received_channels() -> usize {
    256
}

fn default_max_frame_size() -> usize {
    1024 * 1024
}

fn default_resend_delay_ms() -> u64 {
    250
}

fn default_resend_interval_ms() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_ms: default_request_timeout_ms(),
            setup_timeout_ms: default_setup_timeout_ms(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            resend_delay_ms: default_resend_delay_ms(),
            resend_interval_ms: default_resend_interval_ms(),
            skip_unchanged: true,
            max_received_channels: default_max_received_channels(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tether/config.toml")
    }

    /// Load `path` if given, else the default path if it exists, else defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file cannot be loaded.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Convert to the library configuration.
    #[must_use]
    pub fn network_config(&self) -> tether_core::NetworkConfig {
        let mut config = tether_core::NetworkConfig::default();
        config.connection.request_timeout = Duration::from_millis(self.network.request_timeout_ms);
        config.connection.setup_timeout = Duration::from_millis(self.network.setup_timeout_ms);
        config.connection.max_frame_size = self.network.max_frame_size;
        config.channel.resend_delay = Duration::from_millis(self.channels.resend_delay_ms);
        config.channel.resend_interval = Duration::from_millis(self.channels.resend_interval_ms);
        config.channel.skip_unchanged_updates = self.channels.skip_unchanged;
        config.channel.max_received_channels = self.channels.max_received_channels;
        config.auth.require_authentication = self.auth.require_authentication;
        config.auth.allow_registration = self.auth.allow_registration;
        config
    }

    /// TCP host on `addr` sharing the configured frame limit.
    #[must_use]
    pub fn tcp_host(&self, addr: SocketAddr) -> TcpHost {
        TcpHost::new(addr).with_max_frame(self.network.max_frame_size)
    }

    /// TCP link to `remote` sharing the configured frame limit.
    #[must_use]
    pub fn tcp_link(&self, remote: SocketAddr) -> TcpLink {
        TcpLink::dial(remote).with_max_frame(self.network.max_frame_size)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.network_config().validate()?;
        Ok(())
    }
}

/// Load a users file into a directory.
///
/// Blank lines and lines starting with `#` are skipped.
///
/// # Errors
///
/// Returns an error naming the first malformed line.
pub fn load_users(path: &Path) -> anyhow::Result<MemoryUserDirectory> {
    let contents = fs::read_to_string(path)?;
    let directory = MemoryUserDirectory::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((identifier, verifier)) = line.split_once(char::is_whitespace) else {
            anyhow::bail!("{}:{}: expected `identifier verifier`", path.display(), number + 1);
        };
        let verifier = hex::decode(verifier.trim())
            .map_err(|err| anyhow::anyhow!("{}:{}: {}", path.display(), number + 1, err))?;
        directory.insert(
            identifier,
            UserRecord {
                verifier,
                profile: None,
            },
        );
    }
    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tether_core::UserDirectory;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.listen_addr, "127.0.0.1:7400");
        assert_eq!(config.channels.resend_delay_ms, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_network_config_conversion() {
        let config: Config = toml::from_str(
            r#"
            [network]
            request_timeout_ms = 100

            [channels]
            resend_delay_ms = 500
            skip_unchanged = false

            [auth]
            require_authentication = true
            "#,
        )
        .unwrap();

        let network = config.network_config();
        assert_eq!(network.connection.request_timeout, Duration::from_millis(100));
        assert_eq!(network.channel.resend_delay, Duration::from_millis(500));
        assert!(!network.channel.skip_unchanged_updates);
        assert!(network.auth.require_authentication);
        assert!(!network.auth.allow_registration);
    }

    #[test]
    fn test_tcp_transports_use_frame_limit() {
        let config: Config = toml::from_str(
            r#"
            [network]
            max_frame_size = 4194304
            "#,
        )
        .unwrap();
        let addr: SocketAddr = "127.0.0.1:7400".parse().unwrap();

        assert_eq!(config.network_config().connection.max_frame_size, 4 * 1024 * 1024);
        assert_eq!(config.tcp_host(addr).max_frame(), 4 * 1024 * 1024);
        assert_eq!(config.tcp_link(addr).max_frame(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.channels.resend_interval_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_users() {
        let verifier = tether_crypto::Authenticator::create_verifier("alice", "hunter2").unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# users").unwrap();
        writeln!(file, "alice {}", hex::encode(&verifier)).unwrap();

        let directory = load_users(file.path()).unwrap();
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.lookup("alice").unwrap().verifier, verifier);
    }

    #[test]
    fn test_load_users_rejects_bad_hex() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice not-hex").unwrap();
        assert!(load_users(file.path()).is_err());
    }
}
