//! Message envelope for the kanava pipeline
//!
//! A [`Message`] is what a source hands to the pipeline: an opaque payload,
//! the logical source it arrived on, and optionally a credential presented
//! alongside it. The pipeline never shares a message between workers, so the
//! envelope is a plain owned value that moves from stage to stage.
//!
//! # Zero-Copy Payloads
//!
//! ```text
//! transport frame (Bytes)
//!         │
//!         ▼
//! Message { payload }   ← refcount bump, no copy
//!         │
//!         ▼
//! worker decodes in place, sink receives a Bytes slice
//! ```
//!
//! # Binary Message ID
//!
//! The `id` field is a 16-byte ULID. It is `Copy` and sorts by creation time,
//! which keeps log lines for one message easy to correlate.

use crate::error::PluginError;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Compact message identifier (binary ULID)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(ulid::Ulid);

impl MessageId {
    /// Generate a new unique ID
    #[inline]
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Get the ULID
    #[inline]
    pub fn as_ulid(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s)
            .map(Self)
            .map_err(|e| PluginError::Decode(format!("invalid message id '{s}': {e}")))
    }
}

impl From<ulid::Ulid> for MessageId {
    fn from(ulid: ulid::Ulid) -> Self {
        Self(ulid)
    }
}

/// The pipeline envelope
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use kanava_core::Message;
///
/// let msg = Message::new("devices/telemetry", Bytes::from_static(b"{}"))
///     .with_credential("token");
/// assert_eq!(msg.source, "devices/telemetry");
/// assert_eq!(msg.credential.as_deref(), Some("token"));
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique identifier
    pub id: MessageId,

    /// Receive time, unix nanoseconds
    pub timestamp: i64,

    /// Logical source identifier (topic, partition, device stream)
    pub source: String,

    /// Credential presented with the message, if the transport carries one
    /// out of band. Device readings usually embed theirs in the payload.
    pub credential: Option<String>,

    /// Opaque payload
    pub payload: Bytes,
}

impl Message {
    /// Create a new Message with a generated ID and the current time
    pub fn new(source: impl Into<String>, payload: Bytes) -> Self {
        Self {
            id: MessageId::new(),
            timestamp: now_unix_nanos(),
            source: source.into(),
            credential: None,
            payload,
        }
    }

    /// Create a Message with all identity fields specified
    pub fn with_id(
        id: MessageId,
        timestamp: i64,
        source: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            id,
            timestamp,
            source: source.into(),
            credential: None,
            payload,
        }
    }

    /// Attach an out-of-band credential
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Remove and return the credential
    pub fn take_credential(&mut self) -> Option<String> {
        self.credential.take()
    }

    /// Payload as UTF-8, if valid
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
