//! Session Manager Handle - public API of the MQTT session
//!
//! A cloneable, cheap handle around the session worker. The five operations
//! (`connect`, `disconnect`, `subscribe`, `unsubscribe`, `publish`) are plain
//! synchronous calls that enqueue a command and return immediately; their
//! outcome shows up later through the observable state and the notifier.
//! No operation ever returns an error or panics.
//!
//! ```text
//! SessionManager ─[SessionCommand]→ SessionWorker ─[requests]→ Transport
//!       ↑                                │   ↑                      │
//!       └──── watch (status/payload) ────┘   └──── TransportEvent ──┘
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::config::{ConnectOptions, SessionOptions};
use super::error::SessionError;
use super::message_manager::{Payload, SessionStats};
use super::mqtt_handler::{
    ConnectionStatus, Observers, SessionCommand, SessionSnapshot, SessionWorker, SubscriptionSet,
};
use super::transport::Transport;
use crate::config::Settings;
use crate::notify::Notifier;

/// Handle to one MQTT session
///
/// Every clone talks to the same worker. The worker is the single writer of
/// the session state; handles only read it and send commands. When the last
/// handle is dropped the worker disconnects gracefully and stops.
///
/// # Examples
///
/// ```rust,no_run
/// use iotdash::config::Settings;
/// use iotdash::mqtt::{RumqttTransport, SessionManager};
/// use iotdash::notify::TracingNotifier;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let settings = Settings::default();
/// let session = SessionManager::from_settings(&settings, RumqttTransport, TracingNotifier)?;
///
/// session.connect();
/// session.subscribe("sensors/temp");
/// println!("latest: {:?}", session.payload().message);
///
/// session.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<ConnectionStatus>,
    payload: watch::Receiver<Payload>,
    subscriptions: watch::Receiver<SubscriptionSet>,
    stats: watch::Receiver<SessionStats>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionManager {
    /// Spawns the session worker on the current tokio runtime
    ///
    /// Nothing connects yet; call [`SessionManager::connect`]. An invalid
    /// reconnect policy is logged and its backoff degrades to a constant delay.
    pub fn spawn(
        transport: impl Transport,
        notifier: impl Notifier,
        options: ConnectOptions,
        session: SessionOptions,
    ) -> Self {
        if let Err(e) = session.reconnect.validate() {
            warn!("{}, reconnect backoff will not grow", e);
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let observers = Observers::new();
        let status = observers.status.subscribe();
        let payload = observers.payload.subscribe();
        let subscriptions = observers.subscriptions.subscribe();
        let stats = observers.stats.subscribe();

        let worker = SessionWorker::new(
            Arc::new(transport),
            Arc::new(notifier),
            options,
            session,
            command_rx,
            observers,
        );
        let join = tokio::spawn(worker.run());

        Self {
            commands: command_tx,
            status,
            payload,
            subscriptions,
            stats,
            worker: Arc::new(Mutex::new(Some(join))),
        }
    }

    /// Resolves `settings` once and spawns the worker
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] when the broker URL, QoS level or
    /// reconnect policy in `settings` are invalid.
    pub fn from_settings(
        settings: &Settings,
        transport: impl Transport,
        notifier: impl Notifier,
    ) -> Result<Self, SessionError> {
        let (options, session) = settings.resolve()?;
        info!(
            "MQTT session configured for {} (keep-alive {:?})",
            options.endpoint, options.keep_alive
        );
        Ok(Self::spawn(transport, notifier, options, session))
    }

    pub fn connect(&self) {
        self.send(SessionCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.send(SessionCommand::Disconnect);
    }

    pub fn subscribe(&self, topic: impl Into<String>) {
        self.send(SessionCommand::Subscribe(topic.into()));
    }

    pub fn unsubscribe(&self, topic: impl Into<String>) {
        self.send(SessionCommand::Unsubscribe(topic.into()));
    }

    pub fn publish(&self, topic: impl Into<String>, message: impl Into<String>) {
        self.send(SessionCommand::Publish {
            topic: topic.into(),
            message: message.into(),
        });
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Latest inbound message, regardless of topic
    pub fn payload(&self) -> Payload {
        self.payload.borrow().clone()
    }

    pub fn subscriptions(&self) -> SubscriptionSet {
        self.subscriptions.borrow().clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn watch_payload(&self) -> watch::Receiver<Payload> {
        self.payload.clone()
    }

    /// State as seen by the worker after every command sent before this call
    ///
    /// # Errors
    ///
    /// [`SessionError::WorkerGone`] once the worker has stopped.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Snapshot(tx))
            .map_err(|_| SessionError::WorkerGone)?;
        rx.await.map_err(|_| SessionError::WorkerGone)
    }

    /// Disconnects gracefully and waits for the worker to stop
    ///
    /// Waiting for the broker is bounded by the configured close timeout.
    /// Calling it again after the worker stopped returns
    /// [`SessionError::WorkerGone`].
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Shutdown(tx))
            .map_err(|_| SessionError::WorkerGone)?;
        rx.await.map_err(|_| SessionError::WorkerGone)?;

        if let Some(join) = self.worker.lock().await.take() {
            if let Err(e) = join.await {
                warn!("Session worker ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    fn send(&self, command: SessionCommand) {
        if let Err(e) = self.commands.send(command) {
            warn!("Session worker is gone, dropping {:?}", e.0);
        }
    }
}
