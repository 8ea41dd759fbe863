//! # Notification Sink
//!
//! User-facing, toast-style notices emitted by the session worker. The worker
//! only ever calls [`Notifier::notify`] and never looks at a result, so a slow
//! or absent UI can not stall the MQTT event loop.
//!
//! Two sinks ship with the crate:
//! - [`TracingNotifier`] writes notices into the log, used by the binary
//! - [`ChannelNotifier`] forwards [`Notice`] values to whatever renders them

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::{error, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    Success,
    Error,
    Info,
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            NoticeKind::Success => "success",
            NoticeKind::Error => "error",
            NoticeKind::Info => "info",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub at: DateTime<Local>,
}

/// Fire-and-forget sink for user-visible notices
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, kind: NoticeKind, title: &str);
}

impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    fn notify(&self, kind: NoticeKind, title: &str) {
        (**self).notify(kind, title)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, kind: NoticeKind, title: &str) {
        match kind {
            NoticeKind::Error => error!(target: "iotdash::notice", "{}", title),
            _ => info!(target: "iotdash::notice", "[{}] {}", kind, title),
        }
    }
}

/// Forwards notices over an unbounded channel
///
/// Once the receiving side is gone notices are silently dropped.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, kind: NoticeKind, title: &str) {
        let notice = Notice {
            kind,
            title: title.to_string(),
            at: Local::now(),
        };
        if self.tx.send(notice).is_err() {
            trace!("Notice '{}' dropped, no receiver", title);
        }
    }
}
