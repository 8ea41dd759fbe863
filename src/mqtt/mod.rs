//! # MQTT Session Module
//!
//! Resilient single-connection MQTT client for dashboard-style consumers.
//! One [`SessionManager`] owns one broker connection at a time, keeps the set
//! of wanted subscriptions, and exposes the most recent inbound message as a
//! single latest-value slot.
//!
//! ## Why This Module Exists
//!
//! A dashboard only needs to know "am I connected" and "what is the latest
//! value", while issuing connect/subscribe/publish from synchronous code. This
//! module hides the asynchronous broker session behind exactly that surface
//! and makes the reconnect policy an explicit, observable part of the state
//! machine instead of a side effect of the client library.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs            - Endpoint, connect options, reconnect policy
//! ├── error.rs             - Config/transport/session error types
//! ├── message_manager.rs   - Payload slot, inbound messages, topic validation, stats
//! ├── mqtt_handler.rs      - Session worker state machine
//! ├── session_handle.rs    - Public SessionManager handle
//! ├── transport.rs         - Transport seam (trait + test double)
//! └── rumqtt_transport.rs  - rumqttc-backed transport
//! ```
//!
//! ## Concurrency
//!
//! The worker is the only task touching session state. Events of a Connection
//! are consumed from a channel owned by the worker, so replacing or closing a
//! Connection drops its receiver and no stale event can reach the state.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod rumqtt_transport;
pub mod session_handle;
pub mod transport;

pub use config::{BrokerEndpoint, ConnectOptions, Credentials, ReconnectPolicy, SessionOptions};
pub use error::{ConfigError, SessionError, TransportError};
pub use message_manager::{Payload, SessionStats};
pub use mqtt_handler::{ConnectionStatus, SessionSnapshot, SubscriptionSet, SubscriptionStatus};
pub use rumqtt_transport::RumqttTransport;
pub use session_handle::SessionManager;
pub use transport::{Transport, TransportEvent, TransportHandle, TransportLink};
