//! The seam between the session core and the pub/sub broker. The core
//! only ever sees an [`InboundMessage`] arriving on its event queue and a
//! [`Publisher`] it can hand outbound control payloads to; whether those
//! cross a real broker ([`crate::mqtt_link`]) or an in-process simulator
//! ([`crate::dummy_link`]) is invisible to it.

use log::debug;
use std::fmt::{self, Display};

/// A raw payload received from a device topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Device name, taken from the first topic segment.
    pub device: String,
    /// Untouched message payload.
    pub payload: Vec<u8>,
}

/// Failures at the broker boundary.
#[derive(Debug)]
pub enum TransportError {
    /// The broker could not be reached at startup.
    Connect(String),
    /// A publish was not accepted by the local client.
    Publish(String),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::Connect(reason) => write!(f, "broker connection failed: {reason}"),
            TransportError::Publish(reason) => write!(f, "publish failed: {reason}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Outbound half of the broker link. Publishes land on the device's
/// `<name>/CONFIG/` topic; delivery is fire-and-forget from the session's
/// point of view.
pub trait Publisher: Send {
    /// Publishes `payload` to the named device's configuration topic.
    fn publish(&self, device: &str, payload: &[u8]) -> Result<(), TransportError>;
}

/// Stands in for the broker when the connection failed at startup, so the
/// controller can keep running in a degraded no-devices mode.
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, device: &str, _payload: &[u8]) -> Result<(), TransportError> {
        debug!("no broker connection, dropping publish to {device}");
        Ok(())
    }
}

/// Extracts the device name from a topic, or `None` for topics the
/// controller should ignore. Topics containing `CONFIG` carry the
/// controller's own outbound messages, which the wildcard subscription
/// echoes back.
pub fn device_from_topic(topic: &str) -> Option<&str> {
    if topic.contains("CONFIG") {
        return None;
    }
    match topic.split('/').next() {
        Some("") | None => None,
        Some(name) => Some(name),
    }
}
