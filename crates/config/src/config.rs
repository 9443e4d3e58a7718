//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP front-end configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port the HTTP server listens on
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Externally reachable base URL, used to build playlist and channel URLs
    #[serde(default = "default_web_path")]
    pub web_path: String,
    /// Token required in `x-admin-token` for admin routes (open when unset)
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    7878
}

fn default_web_path() -> String {
    "http://127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_server_port(),
            web_path: default_web_path(),
            admin_token: None,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// SQLite database holding channels, shares and the catalog
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("relaycast.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Feature switches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureConfig {
    /// Enables the share consume endpoint
    #[serde(default = "default_true")]
    pub share: bool,
    /// Restricts anonymous endpoints to `access.interface_ranges`
    #[serde(default)]
    pub access_control: bool,
    /// Enables live channels
    #[serde(default = "default_true")]
    pub channel: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            share: true,
            access_control: false,
            channel: true,
        }
    }
}

/// Interface access list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessConfig {
    /// CIDR ranges allowed when access control is enabled
    #[serde(default = "default_interface_ranges")]
    pub interface_ranges: Vec<String>,
}

fn default_interface_ranges() -> Vec<String> {
    vec!["127.0.0.0/8".to_string(), "::1/128".to_string()]
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            interface_ranges: default_interface_ranges(),
        }
    }
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable (ffmpeg-compatible command line)
    #[serde(default = "default_encoder_program")]
    pub program: String,
    /// Directory for per-run source lists
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// How long a freshly spawned encoder has to start accepting connections
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Connect timeout used when probing an encoder port
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_encoder_program() -> String {
    "ffmpeg".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/relaycast")
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    500
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_encoder_program(),
            work_dir: default_work_dir(),
            startup_timeout_ms: default_startup_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Live channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    /// Port used when a channel has no fixed endpoint and no port was assigned yet
    #[serde(default = "default_channel_port")]
    pub default_port: u16,
    /// Interval of the process monitoring tick
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

fn default_channel_port() -> u16 {
    8200
}

fn default_monitor_interval_ms() -> u64 {
    5_000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            default_port: default_channel_port(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Parse a boolean switch the way operators tend to write them.
fn parse_switch(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RELAY_BIND -> server.bind
    /// - RELAY_PORT -> server.port
    /// - RELAY_WEB_PATH -> server.web_path
    /// - RELAY_ADMIN_TOKEN -> server.admin_token
    /// - RELAY_DATABASE_PATH -> storage.database_path
    /// - RELAY_FEATURE_SHARE -> features.share
    /// - RELAY_FEATURE_ACCESS_CONTROL -> features.access_control
    /// - RELAY_FEATURE_CHANNEL -> features.channel
    /// - RELAY_ENCODER_PROGRAM -> encoder.program
    /// - RELAY_ENCODER_STARTUP_TIMEOUT_MS -> encoder.startup_timeout_ms
    ///
    /// Unparseable values leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RELAY_BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }

        if let Ok(val) = env::var("RELAY_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var("RELAY_WEB_PATH") {
            if !val.is_empty() {
                self.server.web_path = val.trim_end_matches('/').to_string();
            }
        }

        if let Ok(val) = env::var("RELAY_ADMIN_TOKEN") {
            self.server.admin_token = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = env::var("RELAY_DATABASE_PATH") {
            if !val.is_empty() {
                self.storage.database_path = PathBuf::from(val);
            }
        }

        if let Some(on) = env::var("RELAY_FEATURE_SHARE").ok().as_deref().and_then(parse_switch) {
            self.features.share = on;
        }

        if let Some(on) = env::var("RELAY_FEATURE_ACCESS_CONTROL")
            .ok()
            .as_deref()
            .and_then(parse_switch)
        {
            self.features.access_control = on;
        }

        if let Some(on) = env::var("RELAY_FEATURE_CHANNEL").ok().as_deref().and_then(parse_switch) {
            self.features.channel = on;
        }

        if let Ok(val) = env::var("RELAY_ENCODER_PROGRAM") {
            if !val.is_empty() {
                self.encoder.program = val;
            }
        }

        if let Ok(val) = env::var("RELAY_ENCODER_STARTUP_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.encoder.startup_timeout_ms = ms;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "RELAY_BIND",
            "RELAY_PORT",
            "RELAY_WEB_PATH",
            "RELAY_ADMIN_TOKEN",
            "RELAY_DATABASE_PATH",
            "RELAY_FEATURE_SHARE",
            "RELAY_FEATURE_ACCESS_CONTROL",
            "RELAY_FEATURE_CHANNEL",
            "RELAY_ENCODER_PROGRAM",
            "RELAY_ENCODER_STARTUP_TIMEOUT_MS",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            port in 1u16..u16::MAX,
            share in proptest::bool::ANY,
            access_control in proptest::bool::ANY,
            channel in proptest::bool::ANY,
            startup_ms in 1u64..120_000,
            default_port in 1024u16..u16::MAX,
        ) {
            let toml_str = format!(
                r#"
[server]
port = {}
web_path = "https://music.example.org"

[features]
share = {}
access_control = {}
channel = {}

[access]
interface_ranges = ["10.0.0.0/8"]

[encoder]
startup_timeout_ms = {}

[channel]
default_port = {}
"#,
                port, share, access_control, channel, startup_ms, default_port
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.server.port, port);
            prop_assert_eq!(config.server.web_path.as_str(), "https://music.example.org");
            prop_assert_eq!(config.features.share, share);
            prop_assert_eq!(config.features.access_control, access_control);
            prop_assert_eq!(config.features.channel, channel);
            prop_assert_eq!(config.access.interface_ranges.clone(), vec!["10.0.0.0/8".to_string()]);
            prop_assert_eq!(config.encoder.startup_timeout_ms, startup_ms);
            prop_assert_eq!(config.channel.default_port, default_port);
        }

        #[test]
        fn prop_env_overrides_port(
            initial in 1u16..u16::MAX,
            override_port in 1u16..u16::MAX,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[server]\nport = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RELAY_PORT", override_port.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.server.port, override_port);
        }

        #[test]
        fn prop_env_overrides_feature_switches(
            initial in proptest::bool::ANY,
            override_share in proptest::bool::ANY,
            override_acl in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[features]\nshare = {}\naccess_control = {}\n",
                initial, initial
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RELAY_FEATURE_SHARE", override_share.to_string());
            env::set_var("RELAY_FEATURE_ACCESS_CONTROL", if override_acl { "yes" } else { "0" });
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.features.share, override_share);
            prop_assert_eq!(config.features.access_control, override_acl);
        }

        #[test]
        fn prop_env_overrides_startup_timeout(
            initial in 1u64..60_000,
            override_ms in 1u64..60_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[encoder]\nstartup_timeout_ms = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RELAY_ENCODER_STARTUP_TIMEOUT_MS", override_ms.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoder.startup_timeout_ms, override_ms);
        }
    }

    #[test]
    fn test_invalid_switch_keeps_existing_value() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("RELAY_FEATURE_CHANNEL", "maybe");
        env::set_var("RELAY_PORT", "not-a-port");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.features.channel);
        assert_eq!(config.server.port, 7878);
    }

    #[test]
    fn test_web_path_override_strips_trailing_slash() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("RELAY_WEB_PATH", "https://radio.example.org/");
        env::set_var("RELAY_ADMIN_TOKEN", "s3cret");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.server.web_path, "https://radio.example.org");
        assert_eq!(config.server.admin_token.as_deref(), Some("s3cret"));
    }

    // Test that missing sections use defaults
    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 7878);
        assert_eq!(config.server.admin_token, None);
        assert_eq!(config.storage.database_path, PathBuf::from("relaycast.db"));
        assert!(config.features.share);
        assert!(!config.features.access_control);
        assert!(config.features.channel);
        assert_eq!(config.encoder.program, "ffmpeg");
        assert_eq!(config.encoder.startup_timeout_ms, 10_000);
        assert_eq!(config.channel.default_port, 8200);
    }

    // Test partial config with some sections missing
    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[encoder]
program = "/usr/local/bin/ffmpeg"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.encoder.program, "/usr/local/bin/ffmpeg");
        assert_eq!(config.encoder.probe_timeout_ms, 500); // default
        assert_eq!(config.access.interface_ranges.len(), 2); // default
        assert_eq!(config.channel.monitor_interval_ms, 5_000); // default
    }
}
