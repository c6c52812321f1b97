//! Service Adapters
//!
//! An adapter is the backend a destination publishes into. The in-memory
//! adapter fans messages straight back out through the service; other
//! backends may keep their own subscription state and report that through
//! `handles_subscriptions`.

use crate::broker::MessageService;
use crate::protocol::{CommandMessage, CommandReply, Message, MessagingError};

/// Backend contract for one destination
pub trait ServiceAdapter: Send + Sync {
    /// Adapter name, for logs
    fn name(&self) -> &str;

    /// Handle a published message
    fn invoke(&self, service: &MessageService, message: Message) -> Result<(), MessagingError>;

    /// Handle a subscription command
    ///
    /// Only consulted when `handles_subscriptions` is true. A returned
    /// reply replaces the service's default acknowledgement.
    fn manage(&self, _command: &CommandMessage) -> Result<Option<CommandReply>, MessagingError> {
        Ok(None)
    }

    /// Whether the backend tracks subscriptions itself
    fn handles_subscriptions(&self) -> bool {
        false
    }
}

/// Adapter that delivers messages to local subscribers and cluster peers
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryAdapter;

impl ServiceAdapter for InMemoryAdapter {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn invoke(&self, service: &MessageService, message: Message) -> Result<(), MessagingError> {
        service.push_message_to_clients(&message, true)?;
        service.send_push_message_from_peer(&message, true)?;
        Ok(())
    }
}
