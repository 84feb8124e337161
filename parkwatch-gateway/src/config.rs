//! Gateway configuration file
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration for a local broker and InfluxDB.
//!
//! ```toml
//! [mqtt]
//! host = "broker.local"
//! port = 1883
//! client_id = "parkwatch-gateway"
//! qos = 1
//!
//! [influx]
//! url = "http://localhost:8086"
//! org = "parkwatch"
//! bucket = "telemetry"
//! token = "..."
//!
//! [routing]
//! subscriptions = ["things/+/shadow/update"]
//! measurement = "telemetry"
//! command_topic = "things/{device}/commands"
//!
//! [routing.channels.NOISE]
//! field = "noise"
//! kind = "float"
//!
//! [correlation]
//! button_app_id = "BUTTON"
//!
//! [logging]
//! level = "debug"
//!
//! [ratings.temperature]
//! optimal = [20.0, 25.0]
//! slope_above = 0.5
//! slope_below = 0.8
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parkwatch_connectors::{InfluxConfig, MqttConfig};
use parkwatch_core::{ChannelRegistry, ChannelSpec};
use parkwatch_scoring::{RatingError, RatingProfile};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder for the device id in `routing.command_topic`
pub const DEVICE_PLACEHOLDER: &str = "{device}";

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid rating profile {name:?}: {source}")]
    Rating { name: String, source: RatingError },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub mqtt: MqttSection,
    pub influx: InfluxSection,
    pub routing: RoutingSection,
    pub correlation: CorrelationSection,
    pub logging: LoggingSection,
    /// Rating profiles keyed by field name
    pub ratings: HashMap<String, RatingProfile>,
}

/// Broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub qos: u8,
    pub channel_capacity: usize,
    pub max_consecutive_errors: u32,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "parkwatch-gateway".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            qos: 0,
            channel_capacity: 1024,
            max_consecutive_errors: 10,
        }
    }
}

impl MqttSection {
    pub fn to_config(&self) -> MqttConfig {
        let mut config = MqttConfig::new(self.host.as_str(), self.port)
            .client_id(self.client_id.as_str())
            .keep_alive_secs(self.keep_alive_secs)
            .qos(self.qos)
            .channel_capacity(self.channel_capacity)
            .max_consecutive_errors(self.max_consecutive_errors);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            config = config.credentials(user.as_str(), pass.as_str());
        }
        config
    }
}

/// Time-series store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxSection {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for InfluxSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            org: "parkwatch".to_string(),
            bucket: "telemetry".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

impl InfluxSection {
    pub fn to_config(&self) -> InfluxConfig {
        let mut config = InfluxConfig::new(self.url.as_str(), self.org.as_str(), self.bucket.as_str())
            .timeout_secs(self.timeout_secs);
        if let Some(token) = &self.token {
            config = config.token(token.as_str());
        }
        config
    }
}

/// Subscriptions, persistence rules and command addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    /// Bus topic filters the router consumes
    pub subscriptions: Vec<String>,
    /// Measurement points are written to
    pub measurement: String,
    /// Topic template for outgoing commands
    pub command_topic: String,
    /// Extra or overriding `appId` persistence rules
    pub channels: HashMap<String, ChannelSpec>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            subscriptions: vec!["things/+/shadow/update".to_string()],
            measurement: parkwatch_core::point::DEFAULT_MEASUREMENT.to_string(),
            command_topic: format!("things/{}/commands", DEVICE_PLACEHOLDER),
            channels: HashMap::new(),
        }
    }
}

impl RoutingSection {
    /// Default channels with configured ones layered on top
    pub fn registry(&self) -> ChannelRegistry {
        self.channels
            .iter()
            .fold(ChannelRegistry::default(), |registry, (app_id, spec)| {
                registry.with_channel(app_id.as_str(), spec.clone())
            })
    }

    /// Command topic for one device
    pub fn command_topic_for(&self, device_id: &str) -> String {
        self.command_topic.replace(DEVICE_PLACEHOLDER, device_id)
    }
}

/// Correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSection {
    /// `appId` of the physical button event
    pub button_app_id: String,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            button_app_id: "BUTTON".to_string(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing.subscriptions.is_empty() {
            return Err(ConfigError::Invalid("routing.subscriptions is empty".into()));
        }
        let filters = &self.routing.subscriptions;
        for (i, first) in filters.iter().enumerate() {
            if let Some(second) = filters[i + 1..]
                .iter()
                .find(|second| parkwatch_connectors::filters_overlap(first, second))
            {
                return Err(ConfigError::Invalid(format!(
                    "routing.subscriptions {:?} and {:?} overlap",
                    first, second
                )));
            }
        }
        if self.routing.measurement.is_empty() {
            return Err(ConfigError::Invalid("routing.measurement is empty".into()));
        }
        if !self.routing.command_topic.contains(DEVICE_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "routing.command_topic must contain {}",
                DEVICE_PLACEHOLDER
            )));
        }
        if self.correlation.button_app_id.is_empty() {
            return Err(ConfigError::Invalid("correlation.button_app_id is empty".into()));
        }
        for (name, profile) in &self.ratings {
            profile.validate().map_err(|source| ConfigError::Rating {
                name: name.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkwatch_core::ChannelKind;
    use parkwatch_scoring::Curve;

    #[test]
    fn empty_file_is_default() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.influx.bucket, "telemetry");
        assert_eq!(config.routing.subscriptions, vec!["things/+/shadow/update"]);
        assert_eq!(config.correlation.button_app_id, "BUTTON");
        assert_eq!(config.logging.level, "info");
        assert!(config.ratings.is_empty());
    }

    #[test]
    fn full_file() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [mqtt]
            host = "broker.local"
            qos = 1
            username = "gw"
            password = "pw"

            [influx]
            token = "t0k3n"
            timeout_secs = 5

            [routing]
            command_topic = "site/a/things/{device}/cmd"

            [routing.channels.NOISE]
            field = "noise"
            kind = "float"

            [routing.channels.TEMP]
            field = "temp_c"
            kind = "float"

            [ratings.lux]
            curve = "linear"
            optimal = [300.0, 500.0]
            full = [0.0, 1000.0]
            "#,
        )
        .unwrap();

        let mqtt = config.mqtt.to_config();
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.qos, 1);
        assert_eq!(mqtt.username.as_deref(), Some("gw"));

        let influx = config.influx.to_config();
        assert_eq!(influx.token.as_deref(), Some("t0k3n"));
        assert_eq!(influx.timeout.as_secs(), 5);

        let registry = config.routing.registry();
        assert_eq!(registry.get("NOISE").map(|s| s.kind), Some(ChannelKind::Float));
        assert_eq!(registry.get("TEMP").map(|s| s.field.as_str()), Some("temp_c"));
        assert!(registry.contains("CO2"));

        assert_eq!(config.routing.command_topic_for("dev9"), "site/a/things/dev9/cmd");
        assert_eq!(config.ratings["lux"].curve, Curve::Linear);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            GatewayConfig::from_toml_str("[routing]\ncommand_topic = \"cmds\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            GatewayConfig::from_toml_str("[routing]\nsubscriptions = []"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            GatewayConfig::from_toml_str("[ratings.temperature]\noptimal = [25.0, 20.0]"),
            Err(ConfigError::Rating { .. })
        ));
        assert!(matches!(
            GatewayConfig::from_toml_str("[mqtt]\nport = \"high\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn overlapping_subscriptions_rejected() {
        let err = GatewayConfig::from_toml_str(
            "[routing]\nsubscriptions = [\"things/#\", \"things/+/shadow/update\"]",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("overlap")));

        assert!(GatewayConfig::from_toml_str(
            "[routing]\nsubscriptions = [\"things/+/shadow/update\", \"things/+/shadow/update\"]",
        )
        .is_err());

        let config = GatewayConfig::from_toml_str(
            "[routing]\nsubscriptions = [\"things/+/shadow/update\", \"things/+/events\"]",
        )
        .unwrap();
        assert_eq!(config.routing.subscriptions.len(), 2);
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            GatewayConfig::load("/nonexistent/parkwatch.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
