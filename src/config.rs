//! # Settings
//!
//! Broker and session configuration, resolved once at process start.
//!
//! Values come from a TOML file (default `<config dir>/iotdash/config.toml`)
//! and are then overridden by `IOTDASH_MQTT_*` environment variables. A missing
//! file is not an error: the dashboard starts with defaults pointing at a
//! local broker, so it stays usable without any setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::mqtt::config::{
    qos_from_level, BrokerEndpoint, ConnectOptions, Credentials, ReconnectPolicy, SessionOptions,
};
use crate::mqtt::error::ConfigError;

const CONFIG_DIR: &str = "iotdash";
const CONFIG_FILE: &str = "config.toml";

pub const ENV_URL: &str = "IOTDASH_MQTT_URL";
pub const ENV_PORT: &str = "IOTDASH_MQTT_PORT";
pub const ENV_USERNAME: &str = "IOTDASH_MQTT_USERNAME";
pub const ENV_PASSWORD: &str = "IOTDASH_MQTT_PASSWORD";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub session: SessionSettings,
    pub reconnect: ReconnectSettings,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    /// `mqtt://host[:port]`, `tcp://host[:port]` or a bare host
    pub url: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub client_id_prefix: String,
    pub clean_session: bool,
    pub channel_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 60,
            client_id_prefix: "iotdash_".to_string(),
            clean_session: true,
            channel_capacity: 100,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    pub qos: u8,
    pub resubscribe_on_reconnect: bool,
    pub close_timeout_ms: u64,
    /// Topics the binary subscribes to once connected
    pub topics: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            qos: 0,
            resubscribe_on_reconnect: true,
            close_timeout_ms: 5000,
            topics: Vec::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            multiplier: policy.multiplier,
        }
    }
}

/// `<config dir>/iotdash/config.toml`, falling back to the working directory
pub fn default_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads `path` (or the default location) and applies environment overrides
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;

        let mut settings = if exists {
            let content =
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| ConfigError::Read {
                        path: path.display().to_string(),
                        source,
                    })?;
            info!("Loaded settings from {}", path.display());
            Self::from_toml(&content)?
        } else {
            info!("No config at {}, using defaults", path.display());
            Self::default()
        };

        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Overrides broker values from `lookup` (normally the process environment)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_URL) {
            debug!("{} overrides broker url", ENV_URL);
            self.broker.url = url;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.broker.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.broker.password = Some(password);
        }
        Ok(())
    }

    /// Validates and turns the settings into what the session worker consumes
    pub fn resolve(&self) -> Result<(ConnectOptions, SessionOptions), ConfigError> {
        let endpoint = BrokerEndpoint::parse(&self.broker.url, Some(self.broker.port))?;

        let credentials = match (&self.broker.username, &self.broker.password) {
            (Some(username), password) => Some(Credentials {
                username: username.clone(),
                password: password.clone().unwrap_or_default(),
            }),
            (None, Some(_)) => {
                debug!("Password configured without username, ignoring credentials");
                None
            }
            (None, None) => None,
        };

        if self.broker.keep_alive_secs > u64::from(u16::MAX) {
            return Err(ConfigError::InvalidKeepAlive(self.broker.keep_alive_secs));
        }

        let mut options = ConnectOptions::new(endpoint);
        options.credentials = credentials;
        options.keep_alive = Duration::from_secs(self.broker.keep_alive_secs);
        options.clean_session = self.broker.clean_session;
        options.channel_capacity = self.broker.channel_capacity.max(1);

        let reconnect = ReconnectPolicy {
            max_attempts: self.reconnect.max_attempts,
            initial_backoff: Duration::from_millis(self.reconnect.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.reconnect.max_backoff_ms),
            multiplier: self.reconnect.multiplier,
        };
        reconnect.validate()?;

        let session = SessionOptions {
            qos: qos_from_level(self.session.qos)?,
            resubscribe_on_reconnect: self.session.resubscribe_on_reconnect,
            close_timeout: Duration::from_millis(self.session.close_timeout_ms),
            client_id_prefix: self.broker.client_id_prefix.clone(),
            reconnect,
        };

        Ok((options, session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::QoS;
    use std::collections::HashMap;

    #[test]
    fn defaults_resolve_to_local_broker() {
        let (options, session) = Settings::default().resolve().unwrap();
        assert_eq!(options.endpoint.to_string(), "localhost:1883");
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert!(options.credentials.is_none());
        assert_eq!(session.qos, QoS::AtMostOnce);
        assert!(session.resubscribe_on_reconnect);
        assert_eq!(session.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn parses_partial_toml() {
        let settings = Settings::from_toml(
            r#"
            [broker]
            url = "mqtt://broker.lan"
            port = 1884
            username = "dash"
            password = "pw"

            [session]
            qos = 1
            topics = ["sensors/#", "status/+"]

            [reconnect]
            max_attempts = 0
            "#,
        )
        .unwrap();

        assert_eq!(settings.broker.keep_alive_secs, 60);
        assert_eq!(settings.session.topics.len(), 2);
        let (options, session) = settings.resolve().unwrap();
        assert_eq!(options.endpoint.port, 1884);
        assert_eq!(options.credentials.unwrap().username, "dash");
        assert_eq!(session.qos, QoS::AtLeastOnce);
        assert!(!session.reconnect.allows(1));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            Settings::from_toml("[broker]\nport = \"x\""),
            Err(ConfigError::Parse(_))
        ));

        let mut settings = Settings::default();
        settings.session.qos = 5;
        assert!(matches!(settings.resolve(), Err(ConfigError::InvalidQos(5))));

        let mut settings = Settings::default();
        settings.broker.url = "wss://broker".into();
        assert!(matches!(
            settings.resolve(),
            Err(ConfigError::UnsupportedScheme(_))
        ));

        let mut settings = Settings::default();
        settings.reconnect.multiplier = 0.0;
        assert!(matches!(
            settings.resolve(),
            Err(ConfigError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn keep_alive_must_fit_connect_header() {
        let mut settings = Settings::default();
        settings.broker.keep_alive_secs = u64::from(u16::MAX);
        let (options, _) = settings.resolve().unwrap();
        assert_eq!(options.keep_alive, Duration::from_secs(65_535));

        settings.broker.keep_alive_secs = 70_000;
        assert!(matches!(
            settings.resolve(),
            Err(ConfigError::InvalidKeepAlive(70_000))
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_URL, "tcp://10.1.1.1"),
            (ENV_PORT, "2883"),
            (ENV_USERNAME, "env-user"),
            (ENV_PASSWORD, "env-pw"),
        ]);
        let mut settings = Settings::default();
        settings
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        let (options, _) = settings.resolve().unwrap();
        assert_eq!(options.endpoint.to_string(), "10.1.1.1:2883");
        let creds = options.credentials.unwrap();
        assert_eq!(creds.username, "env-user");
        assert_eq!(creds.password, "env-pw");
    }

    #[test]
    fn bad_env_port_is_rejected() {
        let mut settings = Settings::default();
        let result = settings.apply_env(|key| (key == ENV_PORT).then(|| "nope".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidPort(_))));
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("iotdash-does-not-exist/config.toml");
        let settings = Settings::load(Some(&path)).await.unwrap();
        assert_eq!(settings.session, SessionSettings::default());
    }

    #[tokio::test]
    async fn loads_file_from_disk() {
        let dir = std::env::temp_dir().join(format!("iotdash-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("config.toml");
        tokio::fs::write(&path, "[session]\nclose_timeout_ms = 250\n")
            .await
            .unwrap();

        let settings = Settings::load(Some(&path)).await.unwrap();
        assert_eq!(settings.session.close_timeout_ms, 250);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
