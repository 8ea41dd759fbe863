use std::fmt;
use std::time::Duration;

use rumqttc::QoS;

use super::error::ConfigError;

const DEFAULT_PORT: u16 = 1883;

/// Broker host and port, resolved from a URL such as `mqtt://broker.local:1883`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    /// Parses `url` and falls back to `port` when the URL carries none.
    ///
    /// Accepted schemes are `mqtt://`, `tcp://` or no scheme at all. The
    /// transport speaks plain TCP only, so `ws://`, `wss://`, `mqtts://` and
    /// friends are rejected up front instead of failing at connect time.
    pub fn parse(url: &str, port: Option<u16>) -> Result<Self, ConfigError> {
        let url = url.trim();
        let rest = match url.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "mqtt" | "tcp" => rest,
                other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
            },
            None => url,
        };
        let authority = rest.split('/').next().unwrap_or_default();

        let (host, url_port) = match authority.rsplit_once(':') {
            Some((host, p)) => {
                let parsed = p
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidPort(p.to_string()))?;
                (host, Some(parsed))
            }
            None => (authority, None),
        };

        if host.is_empty() {
            return Err(ConfigError::MissingHost(url.to_string()));
        }

        let port = url_port.or(port).unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(ConfigError::InvalidPort("0".to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Optional username/password pair handed to the broker on CONNECT
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything needed to open one Connection
///
/// Built once from the resolved settings; every connection attempt clones it
/// and stamps a fresh client identifier via [`ConnectOptions::with_client_id`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub endpoint: BrokerEndpoint,
    pub credentials: Option<Credentials>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Capacity of the request and event channels of a link
    pub channel_capacity: usize,
}

impl ConnectOptions {
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            credentials: None,
            client_id: String::new(),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            channel_capacity: 100,
        }
    }

    pub fn with_client_id(&self, client_id: String) -> Self {
        Self {
            client_id,
            ..self.clone()
        }
    }
}

/// Generates a client identifier unique per connection attempt, e.g. `iotdash_3fa9c01b`
pub fn generate_client_id(prefix: &str) -> String {
    format!("{}{:08x}", prefix, rand::random::<u32>())
}

/// Explicit retry schedule used after an established connection drops
///
/// The delay before attempt `n` (starting at 1) grows geometrically from
/// `initial_backoff` by `multiplier` and is capped at `max_backoff`.
/// `max_attempts == 0` turns reconnection off entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::InvalidPolicy(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::InvalidPolicy(
                "max_backoff is smaller than initial_backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether attempt number `attempt` (1-based) is still within budget
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// Never panics: a multiplier below 1.0 or not finite is treated as 1.0.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = (self.initial_backoff.as_secs_f64() * multiplier.powi(exponent)).max(0.0);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

pub fn qos_from_level(level: u8) -> Result<QoS, ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::InvalidQos(other)),
    }
}

/// Per-session behaviour that is not part of the broker handshake
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub qos: QoS,
    pub resubscribe_on_reconnect: bool,
    /// Upper bound for waiting on a graceful DISCONNECT to be flushed
    pub close_timeout: Duration,
    pub client_id_prefix: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            resubscribe_on_reconnect: true,
            close_timeout: Duration::from_secs(5),
            client_id_prefix: "iotdash_".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}
