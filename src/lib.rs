//! iotdash - MQTT session core of an IoT dashboard
//!
//! - [`mqtt`] - the session manager, its state machine and transports
//! - [`notify`] - user-facing notification sinks
//! - [`config`] - settings file and environment resolution

pub mod config;
pub mod mqtt;
pub mod notify;
