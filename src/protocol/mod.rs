//! Message and command definitions
//!
//! Defines the already-deserialized units the service operates on: published
//! messages with their headers, typed subscription commands, and the
//! request-scoped error kinds surfaced back to clients.

mod command;
mod error;
mod message;

pub use command::{
    Command, CommandMessage, CommandReply, MultiSubscribeEntry, RawCommand, ENTRY_SEPARATOR,
};
pub use error::MessagingError;
pub use message::{
    ClientId, HeaderValue, Headers, Message, ADD_SUBSCRIPTIONS_HEADER, ENDPOINT_HEADER,
    MAX_FREQUENCY_HEADER, PRIORITY_HEADER, REMOVE_SUBSCRIPTIONS_HEADER, SELECTOR_HEADER,
    SENDER_CLIENT_ID_HEADER, SUBTOPIC_HEADER,
};

/// Highest priority value a message may carry
pub const MAX_PRIORITY: u8 = 9;
