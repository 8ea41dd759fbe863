//! Transport seam between the session worker and an MQTT client library
//!
//! The worker never talks to a client library directly. It opens a
//! [`TransportLink`] per Connection, issues non-blocking requests through the
//! link's [`TransportHandle`] and consumes the link's event channel. Dropping
//! the link releases the underlying client.

use rumqttc::QoS;
use tokio::sync::mpsc;

use super::config::ConnectOptions;
use super::error::TransportError;

/// Callback contract of a broker connection, delivered in transport order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake acknowledged by the broker
    Connected,
    Message { topic: String, payload: Vec<u8> },
    SubscribeAck { topic: String, granted: bool },
    UnsubscribeAck { topic: String },
    /// Connection-level failure; the link is dead after this event
    Error(String),
    /// Graceful shutdown completed; the link is dead after this event
    Closed,
}

/// Requests a live link accepts; every call returns without waiting for the broker
pub trait TransportHandle: Send {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError>;
    /// Asks for a clean DISCONNECT; completion is reported as [`TransportEvent::Closed`]
    fn disconnect(&self) -> Result<(), TransportError>;
}

pub struct TransportLink {
    pub handle: Box<dyn TransportHandle>,
    pub events: mpsc::Receiver<TransportEvent>,
}

pub trait Transport: Send + Sync + 'static {
    fn open(&self, options: &ConnectOptions) -> Result<TransportLink, TransportError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Request {
        Subscribe(String),
        Unsubscribe(String),
        Publish(String, Vec<u8>),
        Disconnect,
    }

    /// One opened link as seen from the test side
    pub struct MockLink {
        pub options: ConnectOptions,
        events: mpsc::Sender<TransportEvent>,
        requests: Mutex<Vec<Request>>,
    }

    impl MockLink {
        /// Injects an event; returns false once the worker dropped this link
        pub async fn emit(&self, event: TransportEvent) -> bool {
            self.events.send(event).await.is_ok()
        }

        pub fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }

        pub fn is_released(&self) -> bool {
            self.events.is_closed()
        }
    }

    #[derive(Default)]
    struct MockState {
        links: Vec<Arc<MockLink>>,
        fail_open: bool,
        reject_requests: bool,
        hold_close: bool,
    }

    /// In-memory transport that records requests and lets tests drive events
    #[derive(Clone, Default)]
    pub struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_open(&self, fail: bool) {
            self.state.lock().unwrap().fail_open = fail;
        }

        pub fn reject_requests(&self, reject: bool) {
            self.state.lock().unwrap().reject_requests = reject;
        }

        /// When set, a DISCONNECT request is recorded but never confirmed
        pub fn hold_close(&self, hold: bool) {
            self.state.lock().unwrap().hold_close = hold;
        }

        pub fn link_count(&self) -> usize {
            self.state.lock().unwrap().links.len()
        }

        pub fn link(&self, idx: usize) -> Arc<MockLink> {
            self.state.lock().unwrap().links[idx].clone()
        }

        pub fn last_link(&self) -> Arc<MockLink> {
            let state = self.state.lock().unwrap();
            state.links.last().cloned().expect("no link opened yet")
        }
    }

    impl Transport for MockTransport {
        fn open(&self, options: &ConnectOptions) -> Result<TransportLink, TransportError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_open {
                return Err(TransportError::InvalidOptions("mock refused".into()));
            }
            let (tx, rx) = mpsc::channel(64);
            let link = Arc::new(MockLink {
                options: options.clone(),
                events: tx,
                requests: Mutex::new(Vec::new()),
            });
            state.links.push(link.clone());
            Ok(TransportLink {
                handle: Box::new(MockHandle {
                    link,
                    shared: self.state.clone(),
                }),
                events: rx,
            })
        }
    }

    struct MockHandle {
        link: Arc<MockLink>,
        shared: Arc<Mutex<MockState>>,
    }

    impl MockHandle {
        fn record(&self, request: Request) -> Result<(), TransportError> {
            if self.shared.lock().unwrap().reject_requests {
                return Err(TransportError::Rejected("mock rejects".into()));
            }
            self.link.requests.lock().unwrap().push(request);
            Ok(())
        }
    }

    impl TransportHandle for MockHandle {
        fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
            self.record(Request::Subscribe(topic.to_string()))
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.record(Request::Unsubscribe(topic.to_string()))
        }

        fn publish(&self, topic: &str, _qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
            self.record(Request::Publish(topic.to_string(), payload))
        }

        fn disconnect(&self) -> Result<(), TransportError> {
            self.link.requests.lock().unwrap().push(Request::Disconnect);
            if !self.shared.lock().unwrap().hold_close {
                let _ = self.link.events.try_send(TransportEvent::Closed);
            }
            Ok(())
        }
    }
}
