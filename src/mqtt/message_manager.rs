use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::SessionError;

/// Latest-value slot handed to consumers
///
/// Only the most recent message survives; the topic it arrived on is
/// deliberately dropped.
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Payload {
    pub fn from_bytes(raw: &[u8]) -> Self {
        Payload {
            message: Some(String::from_utf8_lossy(raw).into_owned()),
        }
    }
}

/// A message as it came off the wire, before it is folded into the [`Payload`] slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub content: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn from_topic(topic: String, content: Vec<u8>) -> Self {
        InboundMessage {
            topic,
            content,
            received_at: Local::now(),
        }
    }

    pub fn into_payload(self) -> Payload {
        Payload::from_bytes(&self.content)
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.content);
        let preview: String = text.chars().take(32).collect();
        write!(
            f,
            "{} - {}: {}",
            self.received_at.format("%H:%M:%S"),
            self.topic,
            preview
        )
    }
}

/// Counters shown next to the connection status
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
    /// Attempts made during the current outage, reset on reconnect
    pub reconnect_attempts: u32,
}

impl SessionStats {
    pub(crate) fn record_received(&mut self) {
        self.messages_received += 1;
        self.last_activity = Some(Local::now());
    }

    pub(crate) fn record_sent(&mut self) {
        self.messages_sent += 1;
        self.last_activity = Some(Local::now());
    }
}

/// Checks an MQTT topic filter before it reaches the broker.
///
/// Wildcards must occupy a whole level and `#` may only be the last level.
pub fn validate_topic_filter(topic: &str) -> Result<(), SessionError> {
    let invalid = |reason| SessionError::InvalidTopic {
        topic: topic.to_string(),
        reason,
    };

    if topic.is_empty() {
        return Err(invalid("empty topic"));
    }
    if topic.len() > u16::MAX as usize {
        return Err(invalid("topic too long"));
    }
    if topic.contains('\0') {
        return Err(invalid("contains NUL"));
    }

    let levels: Vec<&str> = topic.split('/').collect();
    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || idx != levels.len() - 1) {
            return Err(invalid("'#' must be the last level on its own"));
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid("'+' must occupy a whole level"));
        }
    }
    Ok(())
}

/// Topic names used for PUBLISH must not contain wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), SessionError> {
    validate_topic_filter(topic)?;
    if topic.contains(['+', '#']) {
        return Err(SessionError::InvalidTopic {
            topic: topic.to_string(),
            reason: "wildcards are not allowed when publishing",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_decodes_text() {
        let msg = InboundMessage::from_topic("x".into(), b"42".to_vec());
        assert_eq!(
            msg.into_payload(),
            Payload {
                message: Some("42".into())
            }
        );
    }

    #[test]
    fn payload_decodes_invalid_utf8_lossily() {
        let payload = Payload::from_bytes(&[0x34, 0xff, 0x32]);
        assert_eq!(payload.message.as_deref(), Some("4\u{fffd}2"));
    }

    #[test]
    fn empty_payload_serializes_without_message() {
        assert_eq!(toml::to_string(&Payload::default()).unwrap().trim(), "");
        let full = Payload::from_bytes(b"42");
        assert_eq!(toml::to_string(&full).unwrap().trim(), "message = \"42\"");
    }

    #[test]
    fn display_truncates_long_messages() {
        let msg = InboundMessage::from_topic("sensors/temp".into(), vec![b'a'; 100]);
        let rendered = msg.to_string();
        assert!(rendered.contains("sensors/temp"));
        assert!(rendered.ends_with(&"a".repeat(32)));
    }

    #[test]
    fn topic_filters() {
        for ok in ["sensors/temp", "sensors/+/temp", "sensors/#", "#", "+", "/a//b"] {
            assert!(validate_topic_filter(ok).is_ok(), "{ok}");
        }
        for bad in ["", "sensors/#/x", "sensors/te#", "sen+sors", "a\0b"] {
            assert!(validate_topic_filter(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn publish_topics_reject_wildcards() {
        assert!(validate_topic_name("sensors/temp").is_ok());
        assert!(validate_topic_name("sensors/+").is_err());
        assert!(validate_topic_name("#").is_err());
    }

    #[test]
    fn stats_count_activity() {
        let mut stats = SessionStats::default();
        stats.record_received();
        stats.record_received();
        stats.record_sent();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.messages_sent, 1);
        assert!(stats.last_activity.is_some());
    }
}
