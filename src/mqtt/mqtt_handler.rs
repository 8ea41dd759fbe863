//! Session worker - the single owner of the broker connection
//!
//! Runs as one tokio task and is the only writer of connection status,
//! payload slot, subscription set and statistics. Commands from
//! [`super::session_handle::SessionManager`] and events of the current
//! transport link are multiplexed in one `select!` loop.
//!
//! ```text
//! Disconnected ─connect─→ Connecting ─CONNACK─→ Connected
//!      ↑                      │error               │error
//!      │                      ↓                    ↓
//!      └──disconnect──── Failed ←─exhausted── Reconnecting ─CONNACK─→ Connected
//! ```

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Sleep;
use tracing::{debug, error, info, trace, warn};

use super::config::{generate_client_id, ConnectOptions, SessionOptions};
use super::error::{SessionError, TransportError};
use super::message_manager::{
    validate_topic_filter, validate_topic_name, InboundMessage, Payload, SessionStats,
};
use super::transport::{Transport, TransportEvent, TransportHandle};
use crate::notify::{NoticeKind, Notifier};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    /// Requested, SUBACK not seen yet on the current connection
    Pending,
    Active,
}

pub type SubscriptionSet = BTreeMap<String, SubscriptionStatus>;

/// Consistent view of the worker state at one point of its event order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub payload: Payload,
    pub subscriptions: SubscriptionSet,
    pub stats: SessionStats,
    pub client_id: Option<String>,
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Connect,
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, message: String },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Write side of everything consumers can observe
pub(crate) struct Observers {
    pub status: watch::Sender<ConnectionStatus>,
    pub payload: watch::Sender<Payload>,
    pub subscriptions: watch::Sender<SubscriptionSet>,
    pub stats: watch::Sender<SessionStats>,
}

impl Observers {
    pub fn new() -> Self {
        Self {
            status: watch::channel(ConnectionStatus::default()).0,
            payload: watch::channel(Payload::default()).0,
            subscriptions: watch::channel(SubscriptionSet::new()).0,
            stats: watch::channel(SessionStats::default()).0,
        }
    }
}

/// The live Connection; dropping it releases the transport link
struct ActiveConnection {
    client_id: String,
    handle: Box<dyn TransportHandle>,
    events: mpsc::Receiver<TransportEvent>,
    /// DISCONNECT requested, waiting for the transport to confirm
    closing: bool,
}

impl ActiveConnection {
    fn request_close(&mut self) -> Result<(), TransportError> {
        self.closing = true;
        self.handle.disconnect()
    }
}

struct SubscriptionEntry {
    status: SubscriptionStatus,
    /// User requests whose SUBACK still owes a success notice
    announce: u32,
}

/// Link events handled back to back before commands and deadlines get a turn
const EVENT_BURST: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Reconnect,
    CloseGrace,
}

pub(crate) struct SessionWorker {
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    base_options: ConnectOptions,
    session: SessionOptions,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    observers: Observers,
    state: ConnectionStatus,
    connection: Option<ActiveConnection>,
    subscriptions: BTreeMap<String, SubscriptionEntry>,
    stats: SessionStats,
    reconnect_attempt: u32,
    deadline: Option<(Deadline, Pin<Box<Sleep>>)>,
    /// Link events handled since the last command or deadline
    event_streak: u32,
}

impl SessionWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        base_options: ConnectOptions,
        session: SessionOptions,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        observers: Observers,
    ) -> Self {
        Self {
            transport,
            notifier,
            base_options,
            session,
            commands,
            observers,
            state: ConnectionStatus::Disconnected,
            connection: None,
            subscriptions: BTreeMap::new(),
            stats: SessionStats::default(),
            reconnect_attempt: 0,
            deadline: None,
            event_streak: 0,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Session worker started for broker {}",
            self.base_options.endpoint
        );
        // Events go first so a command sees everything already delivered, but a
        // flooding link yields to commands and deadlines every EVENT_BURST events.
        loop {
            let running = if self.event_streak >= EVENT_BURST {
                self.event_streak = 0;
                tokio::select! {
                    biased;

                    kind = wait_deadline(&mut self.deadline) => {
                        self.handle_deadline(kind);
                        true
                    }

                    command = self.commands.recv() => self.on_command(command).await,

                    event = next_event(&mut self.connection) => {
                        self.event_streak += 1;
                        self.handle_event(event);
                        true
                    }
                }
            } else {
                tokio::select! {
                    biased;

                    event = next_event(&mut self.connection) => {
                        self.event_streak += 1;
                        self.handle_event(event);
                        true
                    }

                    kind = wait_deadline(&mut self.deadline) => {
                        self.event_streak = 0;
                        self.handle_deadline(kind);
                        true
                    }

                    command = self.commands.recv() => {
                        self.event_streak = 0;
                        self.on_command(command).await
                    }
                }
            };
            if !running {
                break;
            }
        }
        info!("Session worker stopped");
    }

    /// Returns `false` once the worker has shut down
    async fn on_command(&mut self, command: Option<SessionCommand>) -> bool {
        match command {
            Some(SessionCommand::Shutdown(done)) => {
                self.shutdown().await;
                let _ = done.send(());
                false
            }
            Some(command) => {
                self.handle_command(command);
                true
            }
            None => {
                debug!("All session handles dropped");
                self.shutdown().await;
                false
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        trace!("Session command: {:?}", command);
        match command {
            SessionCommand::Connect => self.connect(),
            SessionCommand::Disconnect => self.disconnect(),
            SessionCommand::Subscribe(topic) => self.subscribe(topic),
            SessionCommand::Unsubscribe(topic) => self.unsubscribe(topic),
            SessionCommand::Publish { topic, message } => self.publish(topic, message),
            SessionCommand::Snapshot(reply) => {
                if reply.send(self.snapshot()).is_err() {
                    debug!("Snapshot requester went away");
                }
            }
            // Handled in on_command, it needs to await.
            SessionCommand::Shutdown(_) => {}
        }
    }

    fn handle_event(&mut self, event: Option<TransportEvent>) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let closing = connection.closing;

        match event {
            None | Some(TransportEvent::Closed) | Some(TransportEvent::Error(_)) if closing => {
                self.finish_disconnect()
            }
            None => self.on_link_lost("transport event stream ended".to_string()),
            Some(TransportEvent::Closed) => self.on_link_lost("closed by transport".to_string()),
            Some(TransportEvent::Error(reason)) => self.on_link_lost(reason),
            Some(event) if closing => trace!("Ignoring {:?} while disconnecting", event),
            Some(TransportEvent::Connected) => self.on_connected(),
            Some(TransportEvent::Message { topic, payload }) => self.on_message(topic, payload),
            Some(TransportEvent::SubscribeAck { topic, granted }) => {
                self.on_subscribe_ack(topic, granted)
            }
            Some(TransportEvent::UnsubscribeAck { topic }) => {
                debug!("MQTT Unsubscribed from {}", topic)
            }
        }
    }

    fn handle_deadline(&mut self, kind: Deadline) {
        match kind {
            Deadline::Reconnect if self.state == ConnectionStatus::Reconnecting => {
                self.reconnect_attempt += 1;
                self.stats.reconnect_attempts = self.reconnect_attempt;
                self.publish_stats();
                info!(
                    "MQTT reconnect attempt {}/{}",
                    self.reconnect_attempt, self.session.reconnect.max_attempts
                );
                self.notifier
                    .notify(NoticeKind::Info, "MQTT is trying to reconnect");
                if let Err(e) = self.open_connection() {
                    self.on_link_lost(e.to_string());
                }
            }
            Deadline::Reconnect => debug!("Stale reconnect deadline in state {:?}", self.state),
            Deadline::CloseGrace => {
                warn!(
                    "DISCONNECT not confirmed within {:?}, releasing connection",
                    self.session.close_timeout
                );
                self.finish_disconnect();
            }
        }
    }

    fn connect(&mut self) {
        if let Some(mut old) = self.connection.take() {
            info!("Superseding MQTT connection {}", old.client_id);
            if let Err(e) = old.request_close() {
                debug!("Superseded connection refused DISCONNECT: {}", e);
            }
        }
        self.deadline = None;
        self.reset_reconnect();
        self.clear_subscriptions();
        self.set_status(ConnectionStatus::Connecting);

        if let Err(e) = self.open_connection() {
            error!("MQTT Connection error: {}", e);
            self.notifier
                .notify(NoticeKind::Error, "MQTT was unable to connect");
            self.set_status(ConnectionStatus::Failed);
        }
    }

    fn open_connection(&mut self) -> Result<(), TransportError> {
        let client_id = generate_client_id(&self.session.client_id_prefix);
        let options = self.base_options.with_client_id(client_id.clone());
        debug!("Opening MQTT connection {} to {}", client_id, options.endpoint);
        let link = self.transport.open(&options)?;
        self.connection = Some(ActiveConnection {
            client_id,
            handle: link.handle,
            events: link.events,
            closing: false,
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connection.is_none() {
            if self.state == ConnectionStatus::Reconnecting {
                info!("Pending MQTT reconnect cancelled");
                self.finish_disconnect();
            } else {
                debug!("MQTT disconnect requested without a connection");
            }
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if connection.closing {
            debug!("MQTT disconnect already in progress");
            return;
        }

        info!("Disconnecting MQTT connection {}", connection.client_id);
        match connection.request_close() {
            Ok(()) => {
                self.deadline = Some((
                    Deadline::CloseGrace,
                    Box::pin(tokio::time::sleep(self.session.close_timeout)),
                ))
            }
            Err(e) => {
                warn!("MQTT disconnect request failed, releasing: {}", e);
                self.finish_disconnect();
            }
        }
    }

    fn finish_disconnect(&mut self) {
        self.connection = None;
        self.deadline = None;
        self.reset_reconnect();
        self.clear_subscriptions();
        self.set_status(ConnectionStatus::Disconnected);
        info!("MQTT Disconnected");
    }

    fn on_connected(&mut self) {
        let client_id = self
            .connection
            .as_ref()
            .map(|c| c.client_id.clone())
            .unwrap_or_default();
        match self.state {
            ConnectionStatus::Connected => debug!("Duplicate CONNACK for {}", client_id),
            ConnectionStatus::Reconnecting => {
                info!(
                    "MQTT Reconnected as {} after {} attempt(s)",
                    client_id, self.reconnect_attempt
                );
                self.deadline = None;
                self.reset_reconnect();
                self.set_status(ConnectionStatus::Connected);
                self.notifier.notify(NoticeKind::Success, "MQTT Reconnected");
                self.replay_subscriptions();
            }
            _ => {
                info!("MQTT Connected as {}", client_id);
                self.set_status(ConnectionStatus::Connected);
                self.notifier.notify(NoticeKind::Success, "MQTT Connected");
            }
        }
    }

    fn on_link_lost(&mut self, reason: String) {
        // Dropping the connection releases the transport link.
        self.connection = None;

        match self.state {
            ConnectionStatus::Connecting => {
                error!("MQTT Connection error: {}", reason);
                self.notifier
                    .notify(NoticeKind::Error, "MQTT was unable to connect");
                self.clear_subscriptions();
                self.set_status(ConnectionStatus::Failed);
            }
            ConnectionStatus::Connected => {
                error!("MQTT connection lost: {}", reason);
                self.notifier
                    .notify(NoticeKind::Error, "MQTT connection lost");
                if self.session.resubscribe_on_reconnect {
                    for entry in self.subscriptions.values_mut() {
                        entry.status = SubscriptionStatus::Pending;
                        entry.announce = 0;
                    }
                    self.publish_subscriptions();
                } else {
                    self.clear_subscriptions();
                }
                if self.session.reconnect.allows(1) {
                    self.set_status(ConnectionStatus::Reconnecting);
                    self.schedule_reconnect();
                } else {
                    self.clear_subscriptions();
                    self.set_status(ConnectionStatus::Failed);
                }
            }
            ConnectionStatus::Reconnecting => {
                warn!(
                    "MQTT reconnect attempt {} failed: {}",
                    self.reconnect_attempt, reason
                );
                self.schedule_reconnect();
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Failed => {
                debug!("Link lost in state {:?}: {}", self.state, reason)
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let next = self.reconnect_attempt + 1;
        if !self.session.reconnect.allows(next) {
            error!(
                "MQTT giving up after {} reconnect attempt(s)",
                self.reconnect_attempt
            );
            self.notifier
                .notify(NoticeKind::Error, "MQTT gave up reconnecting");
            self.deadline = None;
            self.clear_subscriptions();
            self.set_status(ConnectionStatus::Failed);
            return;
        }
        let delay = self.session.reconnect.delay_for(next);
        info!("MQTT reconnect attempt {} in {:?}", next, delay);
        self.deadline = Some((Deadline::Reconnect, Box::pin(tokio::time::sleep(delay))));
    }

    fn replay_subscriptions(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let qos = self.session.qos;
        info!("Replaying {} MQTT subscription(s)", self.subscriptions.len());

        self.subscriptions.retain(|topic, entry| {
            entry.status = SubscriptionStatus::Pending;
            entry.announce = 0;
            match connection.handle.subscribe(topic, qos) {
                Ok(()) => true,
                Err(e) => {
                    error!("MQTT Subscribe error while replaying {}: {}", topic, e);
                    false
                }
            }
        });
        self.publish_subscriptions();
    }

    fn on_message(&mut self, topic: String, payload: Vec<u8>) {
        let message = InboundMessage::from_topic(topic, payload);
        trace!("MQTT message {}", message);
        self.stats.record_received();
        self.publish_stats();
        self.observers.payload.send_replace(message.into_payload());
    }

    fn on_subscribe_ack(&mut self, topic: String, granted: bool) {
        let Some(entry) = self.subscriptions.get_mut(&topic) else {
            debug!("SUBACK for untracked topic {}", topic);
            return;
        };

        if granted {
            entry.status = SubscriptionStatus::Active;
            let announce = entry.announce > 0;
            entry.announce = entry.announce.saturating_sub(1);
            info!("MQTT Subscribed to {}", topic);
            if announce {
                self.notifier
                    .notify(NoticeKind::Success, "Successfully subscribed to topic");
            }
        } else {
            self.subscriptions.remove(&topic);
            error!("MQTT Subscribe error: broker refused {}", topic);
            self.notifier
                .notify(NoticeKind::Error, "Failed to subscribe to topic");
        }
        self.publish_subscriptions();
    }

    fn is_live(&self) -> bool {
        self.state == ConnectionStatus::Connected
            && self.connection.as_ref().is_some_and(|c| !c.closing)
    }

    fn subscribe(&mut self, topic: String) {
        if let Err(e) = validate_topic_filter(&topic) {
            error!("MQTT Subscribe error: {}", e);
            self.notifier
                .notify(NoticeKind::Error, "Failed to subscribe to topic");
            return;
        }
        if !self.is_live() {
            warn!(
                "MQTT Subscribe to {} ignored: {}",
                topic,
                SessionError::NotConnected
            );
            self.notifier
                .notify(NoticeKind::Error, "MQTT is not connected");
            return;
        }

        let qos = self.session.qos;
        let entry = self
            .subscriptions
            .entry(topic.clone())
            .or_insert(SubscriptionEntry {
                status: SubscriptionStatus::Pending,
                announce: 0,
            });
        entry.announce = entry.announce.saturating_add(1);

        let result = match self.connection.as_ref() {
            Some(connection) => connection.handle.subscribe(&topic, qos),
            None => Err(TransportError::Closed),
        };
        if let Err(e) = result {
            error!("MQTT Subscribe error for {}: {}", topic, e);
            if let Some(entry) = self.subscriptions.get_mut(&topic) {
                entry.announce = entry.announce.saturating_sub(1);
                if entry.status == SubscriptionStatus::Pending && entry.announce == 0 {
                    self.subscriptions.remove(&topic);
                }
            }
            self.notifier
                .notify(NoticeKind::Error, "Failed to subscribe to topic");
        }
        self.publish_subscriptions();
    }

    fn unsubscribe(&mut self, topic: String) {
        if let Err(e) = validate_topic_filter(&topic) {
            error!("MQTT Unsubscribe error: {}", e);
            return;
        }
        if self.subscriptions.remove(&topic).is_some() {
            self.publish_subscriptions();
        }
        if !self.is_live() {
            warn!(
                "MQTT Unsubscribe from {} ignored: {}",
                topic,
                SessionError::NotConnected
            );
            return;
        }
        if let Some(connection) = self.connection.as_ref() {
            if let Err(e) = connection.handle.unsubscribe(&topic) {
                error!("MQTT Unsubscribe error for {}: {}", topic, e);
            }
        }
    }

    fn publish(&mut self, topic: String, message: String) {
        if let Err(e) = validate_topic_name(&topic) {
            error!("MQTT Publish error: {}", e);
            return;
        }
        if !self.is_live() {
            warn!(
                "MQTT Publish to {} ignored: {}",
                topic,
                SessionError::NotConnected
            );
            return;
        }
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        match connection
            .handle
            .publish(&topic, self.session.qos, message.into_bytes())
        {
            Ok(()) => {
                self.stats.record_sent();
                self.publish_stats();
            }
            Err(e) => error!("MQTT Publish error for {}: {}", topic, e),
        }
    }

    /// Graceful teardown before the worker exits
    async fn shutdown(&mut self) {
        self.deadline = None;
        if let Some(mut connection) = self.connection.take() {
            info!("Closing MQTT connection {} on shutdown", connection.client_id);
            if !connection.closing {
                if let Err(e) = connection.request_close() {
                    warn!("MQTT disconnect request failed: {}", e);
                }
            }
            let confirmed = tokio::time::timeout(self.session.close_timeout, async {
                while let Some(event) = connection.events.recv().await {
                    if matches!(event, TransportEvent::Closed | TransportEvent::Error(_)) {
                        break;
                    }
                }
            })
            .await;
            if confirmed.is_err() {
                warn!(
                    "DISCONNECT not confirmed within {:?}",
                    self.session.close_timeout
                );
            }
        }
        self.reset_reconnect();
        self.clear_subscriptions();
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.state,
            payload: self.observers.payload.borrow().clone(),
            subscriptions: self.subscription_view(),
            stats: self.stats.clone(),
            client_id: self.connection.as_ref().map(|c| c.client_id.clone()),
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.state != status {
            debug!("MQTT status {:?} -> {:?}", self.state, status);
        }
        self.state = status;
        self.observers.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn reset_reconnect(&mut self) {
        self.reconnect_attempt = 0;
        if self.stats.reconnect_attempts != 0 {
            self.stats.reconnect_attempts = 0;
            self.publish_stats();
        }
    }

    fn clear_subscriptions(&mut self) {
        if !self.subscriptions.is_empty() {
            self.subscriptions.clear();
            self.publish_subscriptions();
        }
    }

    fn subscription_view(&self) -> SubscriptionSet {
        self.subscriptions
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.status))
            .collect()
    }

    fn publish_subscriptions(&self) {
        self.observers.subscriptions.send_replace(self.subscription_view());
    }

    fn publish_stats(&self) {
        self.observers.stats.send_replace(self.stats.clone());
    }
}

async fn next_event(connection: &mut Option<ActiveConnection>) -> Option<TransportEvent> {
    match connection {
        Some(connection) => connection.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: &mut Option<(Deadline, Pin<Box<Sleep>>)>) -> Deadline {
    if let Some((_, sleep)) = deadline.as_mut() {
        sleep.as_mut().await;
    }
    match deadline.take() {
        Some((kind, _)) => kind,
        None => std::future::pending().await,
    }
}
