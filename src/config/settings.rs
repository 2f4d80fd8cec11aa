//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Server identity and transport settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            _schema: None,
            _comment: None,
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// The two ways a server can be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-delimited JSON-RPC over a persistent duplex stream (stdio).
    #[default]
    Stream,
    /// Stateless JSON-RPC over HTTP POST.
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Settings a server is constructed with.
///
/// Immutable for the lifetime of one server instance; switching transport
/// means building a new server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Name reported to clients in `serverInfo`.
    pub name: String,

    /// Semantic version reported to clients in `serverInfo`.
    pub version: String,

    /// Optional human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Transport to bind on start.
    #[serde(default)]
    pub transport: TransportKind,

    /// Fixed HTTP port. When absent a free port is chosen at bind time.
    #[serde(default)]
    pub port: Option<u16>,
}

impl ServerConfig {
    /// Creates a configuration with no description and no fixed port.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            transport,
            port: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets a fixed HTTP port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or version is blank, or if the port is 0.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "server name must not be empty".to_string(),
            });
        }
        if self.version.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "server version must not be empty".to_string(),
            });
        }
        if self.port == Some(0) {
            return Err(ConfigError::ValidationError {
                message: "port 0 is not allowed; omit the port to pick a free one".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            TransportKind::default(),
        )
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
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

fn default_log_level() -> String {
    "warn".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r"{}";
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.transport, TransportKind::Stream);
        assert_eq!(config.server.name, env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Test config",
            "server": {
                "name": "tools",
                "version": "1.2.3",
                "description": "Tool host",
                "transport": "http",
                "port": 4000
            },
            "logging": {
                "level": "debug"
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.name, "tools");
        assert_eq!(config.server.version, "1.2.3");
        assert_eq!(config.server.description.as_deref(), Some("Tool host"));
        assert_eq!(config.server.transport, TransportKind::Http);
        assert_eq!(config.server.port, Some(4000));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn server_section_requires_name_and_version() {
        let json = r#"{ "server": { "transport": "http" } }"#;
        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn reject_unknown_transport() {
        let json = r#"{ "server": { "name": "a", "version": "1", "transport": "carrier-pigeon" } }"#;
        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn reject_blank_name() {
        let config = ServerConfig::new("  ", "1.0.0", TransportKind::Stream);
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_port_zero() {
        let config = ServerConfig::new("a", "1.0.0", TransportKind::Http).with_port(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("port 0"));
    }

    #[test]
    fn logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "warn");
    }

    #[test]
    fn reject_unknown_fields() {
        let json = r#"{
            "unknown_field": "value"
        }"#;

        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn transport_kind_display() {
        assert_eq!(TransportKind::Stream.to_string(), "stream");
        assert_eq!(TransportKind::Http.to_string(), "http");
    }
}
