//! Subscription commands
//!
//! Endpoints hand over a `RawCommand` carrying an integer operation code and
//! loosely typed headers; it is decoded once into a `CommandMessage` whose
//! `Command` variant carries only the fields that operation needs.

use tracing::debug;

use super::message::{
    ClientId, HeaderValue, Headers, Message, ADD_SUBSCRIPTIONS_HEADER, MAX_FREQUENCY_HEADER,
    REMOVE_SUBSCRIPTIONS_HEADER, SELECTOR_HEADER, SUBTOPIC_HEADER,
};
use super::MessagingError;

/// Separates subtopic, selector and max frequency in multi-subscribe entries
pub const ENTRY_SEPARATOR: &str = "_;_";

const OP_SUBSCRIBE: u32 = 0;
const OP_UNSUBSCRIBE: u32 = 1;
const OP_POLL: u32 = 2;
const OP_MULTI_SUBSCRIBE: u32 = 11;
const OP_DISCONNECT: u32 = 12;

/// One add or remove entry of a multi-subscribe command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MultiSubscribeEntry {
    pub subtopic: Option<String>,
    pub selector: Option<String>,
    pub max_frequency: u32,
}

impl MultiSubscribeEntry {
    pub fn new(subtopic: Option<&str>, selector: Option<&str>) -> Self {
        Self {
            subtopic: subtopic.map(str::to_string),
            selector: selector.map(str::to_string),
            max_frequency: 0,
        }
    }

    /// Parse `subtopic_;_selector_;_maxFrequency`; every part may be empty
    /// and the trailing `_;_maxFrequency` may be omitted.
    pub fn parse(entry: &str) -> Option<Self> {
        let (subtopic, rest) = entry.split_once(ENTRY_SEPARATOR)?;
        let (selector, frequency) = match rest.split_once(ENTRY_SEPARATOR) {
            Some((selector, frequency)) => (selector, frequency),
            None => (rest, ""),
        };
        let max_frequency = if frequency.is_empty() {
            0
        } else {
            frequency.parse().ok()?
        };
        Some(Self {
            subtopic: non_empty(subtopic),
            selector: non_empty(selector),
            max_frequency,
        })
    }

    /// Encode back into the separator-joined form
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(self.subtopic.as_deref().unwrap_or(""));
        out.push_str(ENTRY_SEPARATOR);
        out.push_str(self.selector.as_deref().unwrap_or(""));
        if self.max_frequency > 0 {
            out.push_str(ENTRY_SEPARATOR);
            out.push_str(&self.max_frequency.to_string());
        }
        out
    }
}

/// Subscription management operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe {
        subtopic: Option<String>,
        selector: Option<String>,
        /// Messages per second, 0 = unlimited
        max_frequency: u32,
    },
    Unsubscribe {
        subtopic: Option<String>,
        selector: Option<String>,
    },
    MultiSubscribe {
        add: Vec<MultiSubscribeEntry>,
        remove: Vec<MultiSubscribeEntry>,
    },
    /// Drain queued messages for the client
    Poll,
    /// The client session ended; drop every subscription it holds
    Disconnect,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::MultiSubscribe { .. } => "multi-subscribe",
            Command::Poll => "poll",
            Command::Disconnect => "disconnect",
        }
    }

    pub fn operation_code(&self) -> u32 {
        match self {
            Command::Subscribe { .. } => OP_SUBSCRIBE,
            Command::Unsubscribe { .. } => OP_UNSUBSCRIBE,
            Command::MultiSubscribe { .. } => OP_MULTI_SUBSCRIBE,
            Command::Poll => OP_POLL,
            Command::Disconnect => OP_DISCONNECT,
        }
    }
}

/// A decoded command addressed to one destination
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    pub client_id: ClientId,
    pub destination: String,
    pub endpoint_id: String,
    pub command: Command,
    /// Original headers, passed through to adapters that manage subscriptions
    pub headers: Headers,
}

impl CommandMessage {
    pub fn new(
        client_id: impl Into<ClientId>,
        destination: impl Into<String>,
        endpoint_id: impl Into<String>,
        command: Command,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            destination: destination.into(),
            endpoint_id: endpoint_id.into(),
            command,
            headers: Headers::new(),
        }
    }

    pub fn subscribe(
        client_id: impl Into<ClientId>,
        destination: impl Into<String>,
        subtopic: Option<&str>,
        selector: Option<&str>,
    ) -> Self {
        Self::new(
            client_id,
            destination,
            "",
            Command::Subscribe {
                subtopic: subtopic.map(str::to_string),
                selector: selector.map(str::to_string),
                max_frequency: 0,
            },
        )
    }

    pub fn unsubscribe(
        client_id: impl Into<ClientId>,
        destination: impl Into<String>,
        subtopic: Option<&str>,
        selector: Option<&str>,
    ) -> Self {
        Self::new(
            client_id,
            destination,
            "",
            Command::Unsubscribe {
                subtopic: subtopic.map(str::to_string),
                selector: selector.map(str::to_string),
            },
        )
    }

    pub fn with_endpoint(mut self, endpoint_id: impl Into<String>) -> Self {
        self.endpoint_id = endpoint_id.into();
        self
    }
}

/// Result of a successfully serviced command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Acknowledged,
    /// Messages drained by a poll
    Messages(Vec<Message>),
}

/// Command as delivered by an endpoint, before decoding
#[derive(Debug, Clone, PartialEq)]
pub struct RawCommand {
    pub operation: u32,
    pub client_id: ClientId,
    pub destination: String,
    pub endpoint_id: String,
    pub headers: Headers,
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn string_header(headers: &Headers, name: &'static str) -> Result<Option<String>, MessagingError> {
    match headers.get(name) {
        None => Ok(None),
        Some(HeaderValue::Str(s)) => Ok(non_empty(s)),
        Some(_) => Err(MessagingError::InvalidHeader(name)),
    }
}

fn max_frequency_header(headers: &Headers) -> Result<u32, MessagingError> {
    match headers.get(MAX_FREQUENCY_HEADER) {
        None => Ok(0),
        Some(HeaderValue::Int(i)) => {
            u32::try_from(*i).map_err(|_| MessagingError::InvalidHeader(MAX_FREQUENCY_HEADER))
        }
        Some(_) => Err(MessagingError::InvalidHeader(MAX_FREQUENCY_HEADER)),
    }
}

fn entries_header(
    headers: &Headers,
    name: &'static str,
    command_frequency: u32,
) -> Result<Vec<MultiSubscribeEntry>, MessagingError> {
    let items = match headers.get(name) {
        None => return Ok(Vec::new()),
        Some(HeaderValue::List(items)) => items,
        Some(_) => return Err(MessagingError::InvalidHeader(name)),
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let raw = item.as_str().ok_or(MessagingError::InvalidHeader(name))?;
        match MultiSubscribeEntry::parse(raw) {
            Some(mut entry) => {
                entry.max_frequency = match (command_frequency, entry.max_frequency) {
                    (0, f) | (f, 0) => f,
                    (a, b) => a.min(b),
                };
                entries.push(entry);
            }
            None => debug!("Skipping malformed multi-subscribe entry '{}'", raw),
        }
    }
    Ok(entries)
}

impl TryFrom<RawCommand> for CommandMessage {
    type Error = MessagingError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        let headers = &raw.headers;
        let command = match raw.operation {
            OP_SUBSCRIBE => Command::Subscribe {
                subtopic: string_header(headers, SUBTOPIC_HEADER)?,
                selector: string_header(headers, SELECTOR_HEADER)?,
                max_frequency: max_frequency_header(headers)?,
            },
            OP_UNSUBSCRIBE => Command::Unsubscribe {
                subtopic: string_header(headers, SUBTOPIC_HEADER)?,
                selector: string_header(headers, SELECTOR_HEADER)?,
            },
            OP_MULTI_SUBSCRIBE => {
                let frequency = max_frequency_header(headers)?;
                Command::MultiSubscribe {
                    add: entries_header(headers, ADD_SUBSCRIPTIONS_HEADER, frequency)?,
                    // removals ignore frequency
                    remove: entries_header(headers, REMOVE_SUBSCRIPTIONS_HEADER, 0)?,
                }
            }
            OP_POLL => Command::Poll,
            OP_DISCONNECT => Command::Disconnect,
            other => return Err(MessagingError::UnknownCommand(other)),
        };

        Ok(CommandMessage {
            client_id: raw.client_id,
            destination: raw.destination,
            endpoint_id: raw.endpoint_id,
            command,
            headers: raw.headers,
        })
    }
}
