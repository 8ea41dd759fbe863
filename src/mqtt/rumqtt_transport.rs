//! [`Transport`] backed by `rumqttc`
//!
//! Each link owns one `AsyncClient`/`EventLoop` pair and one pump task. The
//! pump stops at the first connection error instead of polling again, so
//! rumqttc's built-in reconnect never kicks in; retrying is the session
//! worker's decision.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::config::ConnectOptions;
use super::error::TransportError;
use super::transport::{Transport, TransportEvent, TransportHandle, TransportLink};

/// How long a dropped link keeps pumping to flush a requested DISCONNECT
const CLOSE_LINGER: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttTransport;

impl Transport for RumqttTransport {
    fn open(&self, options: &ConnectOptions) -> Result<TransportLink, TransportError> {
        let (handle, events) = open_link(options)?;
        Ok(TransportLink {
            handle: Box::new(handle),
            events,
        })
    }
}

fn open_link(
    options: &ConnectOptions,
) -> Result<(RumqttHandle, mpsc::Receiver<TransportEvent>), TransportError> {
    if options.client_id.is_empty() || options.client_id.starts_with(' ') {
        return Err(TransportError::InvalidOptions(format!(
            "invalid client id '{}'",
            options.client_id
        )));
    }
    if !options.keep_alive.is_zero() && options.keep_alive < Duration::from_secs(1) {
        return Err(TransportError::InvalidOptions(
            "keep-alive below one second".to_string(),
        ));
    }
    if options.keep_alive.as_secs() > u64::from(u16::MAX) {
        return Err(TransportError::InvalidOptions(format!(
            "keep-alive of {}s does not fit CONNECT",
            options.keep_alive.as_secs()
        )));
    }

    let mut mqtt_options = MqttOptions::new(
        options.client_id.clone(),
        options.endpoint.host.clone(),
        options.endpoint.port,
    );
    mqtt_options
        .set_keep_alive(options.keep_alive)
        .set_clean_session(options.clean_session);
    if let Some(creds) = &options.credentials {
        mqtt_options.set_credentials(creds.username.clone(), creds.password.clone());
    }

    let capacity = options.channel_capacity.max(1);
    let (client, eventloop) = AsyncClient::new(mqtt_options, capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let shared = Arc::new(LinkShared::default());
    let cancel = CancellationToken::new();

    debug!(
        "Opening rumqttc link {} -> {}",
        options.client_id, options.endpoint
    );
    tokio::spawn(pump(eventloop, event_tx, shared.clone(), cancel.clone()));

    Ok((
        RumqttHandle {
            client,
            shared,
            cancel,
        },
        event_rx,
    ))
}

/// Topics of requests queued on the client but not yet given a packet id
#[derive(Default)]
struct PendingRequests {
    subscribes: VecDeque<String>,
    unsubscribes: VecDeque<String>,
}

#[derive(Default)]
struct LinkShared {
    pending: Mutex<PendingRequests>,
    disconnect_requested: AtomicBool,
}

impl LinkShared {
    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct RumqttHandle {
    client: AsyncClient,
    shared: Arc<LinkShared>,
    cancel: CancellationToken,
}

impl TransportHandle for RumqttHandle {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        // Queue the topic first: the pump may see the outgoing packet before try_subscribe returns.
        self.shared.pending().subscribes.push_back(topic.to_string());
        self.client.try_subscribe(topic, qos).map_err(|e| {
            self.shared.pending().subscribes.pop_back();
            TransportError::Rejected(e.to_string())
        })
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.shared.pending().unsubscribes.push_back(topic.to_string());
        self.client.try_unsubscribe(topic).map_err(|e| {
            self.shared.pending().unsubscribes.pop_back();
            TransportError::Rejected(e.to_string())
        })
    }

    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.client
            .try_disconnect()
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        // Only a queued DISCONNECT turns the next connection error into a clean close.
        self.shared
            .disconnect_requested
            .store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for RumqttHandle {
    fn drop(&mut self) {
        if !self.shared.disconnect_requested.load(Ordering::SeqCst) {
            self.cancel.cancel();
            return;
        }
        // Give the pump a bounded window to flush the DISCONNECT packet.
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let cancel = self.cancel.clone();
                rt.spawn(async move {
                    tokio::time::sleep(CLOSE_LINGER).await;
                    cancel.cancel();
                });
            }
            Err(_) => self.cancel.cancel(),
        }
    }
}

async fn pump(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    shared: Arc<LinkShared>,
    cancel: CancellationToken,
) {
    let mut subscribe_ids: HashMap<u16, String> = HashMap::new();
    let mut unsubscribe_ids: HashMap<u16, String> = HashMap::new();

    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("rumqttc link cancelled");
                break;
            }
            polled = eventloop.poll() => polled,
        };

        let (event, last) = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("CONNACK received, session present: {}", ack.session_present);
                (Some(TransportEvent::Connected), false)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => (
                Some(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                }),
                false,
            ),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let granted = ack
                    .return_codes
                    .iter()
                    .all(|code| !matches!(code, SubscribeReasonCode::Failure));
                match subscribe_ids.remove(&ack.pkid) {
                    Some(topic) => (Some(TransportEvent::SubscribeAck { topic, granted }), false),
                    None => {
                        warn!("SUBACK for unknown packet id {}", ack.pkid);
                        (None, false)
                    }
                }
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => match unsubscribe_ids.remove(&ack.pkid)
            {
                Some(topic) => (Some(TransportEvent::UnsubscribeAck { topic }), false),
                None => {
                    warn!("UNSUBACK for unknown packet id {}", ack.pkid);
                    (None, false)
                }
            },
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                if let Some(topic) = shared.pending().subscribes.pop_front() {
                    subscribe_ids.insert(pkid, topic);
                }
                (None, false)
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                if let Some(topic) = shared.pending().unsubscribes.pop_front() {
                    unsubscribe_ids.insert(pkid, topic);
                }
                (None, false)
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => (Some(TransportEvent::Closed), true),
            Ok(other) => {
                trace!("rumqttc event: {:?}", other);
                (None, false)
            }
            Err(e) if shared.disconnect_requested.load(Ordering::SeqCst) => {
                debug!("Connection ended while disconnecting: {}", e);
                (Some(TransportEvent::Closed), true)
            }
            Err(e) => {
                error!("MQTT connection error: {}", e);
                (Some(TransportEvent::Error(e.to_string())), true)
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                trace!("Link receiver dropped, event discarded");
            }
        }
        if last {
            break;
        }
    }
    debug!("rumqttc pump stopped");
}
