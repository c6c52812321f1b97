//! Request-scoped error types

use std::fmt;

/// Errors surfaced synchronously to the client that issued a request
///
/// None of these affect other subscribers or the integrity of the
/// subscription tables; they reject the single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Selector expression failed to compile
    BadSelector { expression: String, reason: String },
    /// Subtopic is not a well-formed pattern for the destination separator
    InvalidSubtopic(String),
    /// A publish named a wildcard subtopic
    WildcardSubtopicOnPublish(String),
    /// The destination does not accept subtopics
    SubtopicsNotSupported(String),
    /// The destination does not accept wildcard subscriptions
    WildcardSubtopicsNotAllowed(String),
    /// Unrecognized command operation code
    UnknownCommand(u32),
    /// A header carried a value of the wrong shape
    InvalidHeader(&'static str),
    /// Poll from a client with no subscription on the destination
    NotSubscribed(String),
    /// No destination registered under this id
    UnknownDestination(String),
    /// Inbound throttle policy rejected the message
    Throttled(String),
    /// The backend adapter refused the request
    Adapter(String),
}

impl MessagingError {
    /// Stable code reported to clients alongside the message
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadSelector { .. } => "BadSelector",
            Self::InvalidSubtopic(_) => "InvalidSubtopic",
            Self::WildcardSubtopicOnPublish(_) => "WildcardSubtopicOnPublish",
            Self::SubtopicsNotSupported(_) => "SubtopicsNotSupported",
            Self::WildcardSubtopicsNotAllowed(_) => "WildcardSubtopicsNotAllowed",
            Self::UnknownCommand(_) => "UnknownCommand",
            Self::InvalidHeader(_) => "InvalidHeader",
            Self::NotSubscribed(_) => "NotSubscribed",
            Self::UnknownDestination(_) => "UnknownDestination",
            Self::Throttled(_) => "Throttled",
            Self::Adapter(_) => "AdapterError",
        }
    }
}

impl fmt::Display for MessagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSelector { expression, reason } => {
                write!(f, "invalid selector '{}': {}", expression, reason)
            }
            Self::InvalidSubtopic(s) => write!(f, "invalid subtopic '{}'", s),
            Self::WildcardSubtopicOnPublish(s) => {
                write!(f, "subtopic '{}' contains a wildcard and cannot be published to", s)
            }
            Self::SubtopicsNotSupported(d) => {
                write!(f, "destination '{}' does not allow subtopics", d)
            }
            Self::WildcardSubtopicsNotAllowed(d) => {
                write!(f, "destination '{}' does not allow wildcard subtopics", d)
            }
            Self::UnknownCommand(op) => write!(f, "unknown command operation: {}", op),
            Self::InvalidHeader(name) => write!(f, "invalid value for header '{}'", name),
            Self::NotSubscribed(d) => write!(f, "client is not subscribed to destination '{}'", d),
            Self::UnknownDestination(d) => write!(f, "no destination with id '{}'", d),
            Self::Throttled(d) => write!(f, "message to destination '{}' was throttled", d),
            Self::Adapter(msg) => write!(f, "adapter error: {}", msg),
        }
    }
}

impl std::error::Error for MessagingError {}
