//! Published messages and their headers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;
use smallvec::SmallVec;

use super::MessagingError;

/// Opaque client identity (a session token locally, a node address remotely)
pub type ClientId = Arc<str>;

/// Subtopic the message is published to; a string or a list of strings
pub const SUBTOPIC_HEADER: &str = "bus.subtopic";
/// Delivery priority, 0..=9
pub const PRIORITY_HEADER: &str = "bus.priority";
/// Id of the client that sent the message
pub const SENDER_CLIENT_ID_HEADER: &str = "bus.sender";
/// Endpoint the message arrived on
pub const ENDPOINT_HEADER: &str = "bus.endpoint";
/// Selector expression on subscribe/unsubscribe commands
pub const SELECTOR_HEADER: &str = "bus.selector";
/// Maximum messages per second a subscriber wants to receive
pub const MAX_FREQUENCY_HEADER: &str = "bus.max-frequency";
/// Multi-subscribe entries to add
pub const ADD_SUBSCRIPTIONS_HEADER: &str = "bus.add-subscriptions";
/// Multi-subscribe entries to remove
pub const REMOVE_SUBSCRIPTIONS_HEADER: &str = "bus.remove-subscriptions";

/// Header value
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<HeaderValue>),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Str(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Str(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Int(i)
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        HeaderValue::Bool(b)
    }
}

impl From<Vec<&str>> for HeaderValue {
    fn from(items: Vec<&str>) -> Self {
        HeaderValue::List(items.into_iter().map(HeaderValue::from).collect())
    }
}

/// String-keyed header map
pub type Headers = HashMap<String, HeaderValue>;

static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn next_message_id(timestamp: u64) -> String {
    let seq = MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}-{:x}", std::process::id(), timestamp, seq)
}

/// A unit of published data
///
/// The body is reference counted so per-recipient clones share it; only the
/// headers and the target client id differ between copies.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Sender on inbound messages, recipient on per-client copies
    pub client_id: Option<ClientId>,
    pub destination: String,
    pub message_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Milliseconds; 0 means the message does not expire
    pub time_to_live: u64,
    pub body: Bytes,
    pub headers: Headers,
}

impl Message {
    pub fn new(destination: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let timestamp = now_millis();
        Self {
            client_id: None,
            destination: destination.into(),
            message_id: next_message_id(timestamp),
            timestamp,
            time_to_live: 0,
            body: body.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<ClientId>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn with_subtopic(self, subtopic: &str) -> Self {
        self.with_header(SUBTOPIC_HEADER, subtopic)
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<HeaderValue>) {
        self.headers.insert(name.to_string(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<HeaderValue> {
        self.headers.remove(name)
    }

    /// Subtopics named by the subtopic header
    ///
    /// Empty strings are skipped, so an empty result means the message
    /// targets the destination's default channel.
    pub fn subtopics(&self) -> Result<SmallVec<[&str; 2]>, MessagingError> {
        let mut out = SmallVec::new();
        match self.headers.get(SUBTOPIC_HEADER) {
            None => {}
            Some(HeaderValue::Str(s)) => {
                if !s.is_empty() {
                    out.push(s.as_str());
                }
            }
            Some(HeaderValue::List(items)) => {
                for item in items {
                    match item {
                        HeaderValue::Str(s) if s.is_empty() => {}
                        HeaderValue::Str(s) => out.push(s.as_str()),
                        _ => return Err(MessagingError::InvalidHeader(SUBTOPIC_HEADER)),
                    }
                }
            }
            Some(_) => return Err(MessagingError::InvalidHeader(SUBTOPIC_HEADER)),
        }
        Ok(out)
    }

    pub fn priority(&self) -> Option<i64> {
        self.headers.get(PRIORITY_HEADER).and_then(HeaderValue::as_int)
    }

    /// Whether the message outlived its time-to-live at `now` (ms since epoch)
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.time_to_live > 0 && now.saturating_sub(self.timestamp) > self.time_to_live
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtopics_single_and_list() {
        let msg = Message::new("d", "x").with_subtopic("news.sports");
        assert_eq!(msg.subtopics().unwrap().as_slice(), &["news.sports"]);

        let msg = Message::new("d", "x").with_header(SUBTOPIC_HEADER, vec!["a", "", "b"]);
        assert_eq!(msg.subtopics().unwrap().as_slice(), &["a", "b"]);

        let msg = Message::new("d", "x").with_subtopic("");
        assert!(msg.subtopics().unwrap().is_empty());
    }

    #[test]
    fn test_subtopics_rejects_non_string() {
        let msg = Message::new("d", "x").with_header(SUBTOPIC_HEADER, 3i64);
        assert_eq!(
            msg.subtopics(),
            Err(MessagingError::InvalidHeader(SUBTOPIC_HEADER))
        );
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Message::new("d", "x");
        let b = Message::new("d", "x");
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_expiry() {
        let mut msg = Message::new("d", "x");
        msg.timestamp = 1_000;
        assert!(!msg.is_expired_at(10_000));
        msg.time_to_live = 500;
        assert!(!msg.is_expired_at(1_400));
        assert!(msg.is_expired_at(1_600));
    }
}
