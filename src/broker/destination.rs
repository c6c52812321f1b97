//! Destinations
//!
//! A destination bundles its settings with the local subscription table,
//! the mirror of other nodes' interest, its throttle state and the adapter
//! that messages published to it are handed to.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;

use crate::adapter::ServiceAdapter;
use crate::config::DestinationConfig;
use crate::protocol::{Message, MessagingError};
use crate::remote::RemoteSubscriptionTable;
use crate::selector::SelectorFactory;
use crate::throttle::ThrottleManager;
use crate::topic::{validate_separator, Subtopic, SubtopicError, SubscriptionTable};

/// How published messages travel between cluster nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Messages stay on the node they were published to
    #[default]
    #[serde(alias = "NONE")]
    None,
    /// Every message is pushed to every other node
    #[serde(alias = "BROADCAST")]
    Broadcast,
    /// Messages go only to nodes with matching subscriptions
    #[serde(alias = "SERVER_TO_SERVER")]
    ServerToServer,
}

/// A named channel with its subscriptions
pub struct Destination {
    config: DestinationConfig,
    separator: String,
    subscriptions: SubscriptionTable,
    remote: RemoteSubscriptionTable,
    throttle: ThrottleManager,
    adapter: Arc<dyn ServiceAdapter>,
    /// Held from a table change until its interest update is queued
    interest: Mutex<()>,
}

impl Destination {
    /// `default_separator` applies when the destination sets none
    pub fn new(
        config: DestinationConfig,
        default_separator: &str,
        selectors: Arc<dyn SelectorFactory>,
        adapter: Arc<dyn ServiceAdapter>,
    ) -> Result<Self, SubtopicError> {
        let separator = config
            .subtopic_separator
            .clone()
            .unwrap_or_else(|| default_separator.to_string());
        validate_separator(&separator)?;

        Ok(Self {
            subscriptions: SubscriptionTable::new(&config.id, &separator, selectors.clone()),
            remote: RemoteSubscriptionTable::new(&config.id, &separator, selectors),
            throttle: ThrottleManager::new(&config.id, config.throttle.clone()),
            separator,
            config,
            adapter,
            interest: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    pub fn routing_mode(&self) -> RoutingMode {
        self.config.routing_mode
    }

    pub fn is_clustered(&self) -> bool {
        self.config.clustered
    }

    /// Whether subscription interest is replicated to other nodes
    pub fn is_server_to_server(&self) -> bool {
        self.config.clustered && self.config.routing_mode == RoutingMode::ServerToServer
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Priority applied to delivered copies that carry none
    pub fn priority(&self) -> Option<u8> {
        self.config.priority
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn remote_subscriptions(&self) -> &RemoteSubscriptionTable {
        &self.remote
    }

    pub fn throttle(&self) -> &ThrottleManager {
        &self.throttle
    }

    pub fn adapter(&self) -> &Arc<dyn ServiceAdapter> {
        &self.adapter
    }

    /// Serialize subscription changes with the interest updates they cause
    ///
    /// Whether a change is the first or last one for a (subtopic, selector)
    /// pair is decided by the table; the update telling peers about it must
    /// be queued before any later change to the same table is made, or
    /// peers can apply a stale unsubscribe after a newer subscribe.
    pub fn lock_interest(&self) -> MutexGuard<'_, ()> {
        self.interest.lock()
    }

    /// Check a subtopic a client wants to subscribe or unsubscribe with
    pub fn check_subscription_subtopic(&self, subtopic: Option<&str>) -> Result<(), MessagingError> {
        let Some(subtopic) = subtopic.filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        if !self.config.allow_subtopics {
            return Err(MessagingError::SubtopicsNotSupported(self.id().to_string()));
        }
        let pattern = Subtopic::new(subtopic, &self.separator)?;
        if pattern.contains_wildcard() && self.config.disallow_wildcard_subtopics {
            return Err(MessagingError::WildcardSubtopicsNotAllowed(self.id().to_string()));
        }
        Ok(())
    }

    /// Check the subtopics a message is published to
    pub fn check_publish(&self, message: &Message) -> Result<(), MessagingError> {
        let subtopics = message.subtopics()?;
        if subtopics.is_empty() {
            return Ok(());
        }
        if !self.config.allow_subtopics {
            return Err(MessagingError::SubtopicsNotSupported(self.id().to_string()));
        }
        for subtopic in subtopics {
            let parsed = Subtopic::new(subtopic, &self.separator)?;
            if parsed.contains_wildcard() {
                return Err(MessagingError::WildcardSubtopicOnPublish(subtopic.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryAdapter;
    use crate::protocol::SUBTOPIC_HEADER;
    use crate::selector::HeaderSelectorFactory;
    use test_case::test_case;

    fn destination(config: DestinationConfig) -> Destination {
        Destination::new(
            config,
            ".",
            Arc::new(HeaderSelectorFactory),
            Arc::new(InMemoryAdapter),
        )
        .unwrap()
    }

    #[test_case("news.sports", true ; "plain")]
    #[test_case("news.*", false ; "single wildcard")]
    #[test_case("news.**", false ; "multi wildcard")]
    #[test_case("news..x", false ; "empty segment")]
    fn test_check_publish(subtopic: &str, ok: bool) {
        let dest = destination(DestinationConfig::new("feed"));
        let msg = Message::new("feed", "x").with_subtopic(subtopic);
        assert_eq!(dest.check_publish(&msg).is_ok(), ok);
    }

    #[test]
    fn test_wildcard_publish_error_kind() {
        let dest = destination(DestinationConfig::new("feed"));
        let msg = Message::new("feed", "x").with_header(SUBTOPIC_HEADER, vec!["a", "b.*"]);
        assert_eq!(
            dest.check_publish(&msg),
            Err(MessagingError::WildcardSubtopicOnPublish("b.*".to_string()))
        );
    }

    #[test]
    fn test_subtopic_settings() {
        let mut config = DestinationConfig::new("feed");
        config.allow_subtopics = false;
        let dest = destination(config);
        assert!(matches!(
            dest.check_subscription_subtopic(Some("a")),
            Err(MessagingError::SubtopicsNotSupported(_))
        ));
        assert!(dest.check_subscription_subtopic(None).is_ok());

        let mut config = DestinationConfig::new("feed");
        config.disallow_wildcard_subtopics = true;
        let dest = destination(config);
        assert!(dest.check_subscription_subtopic(Some("a.b")).is_ok());
        assert!(matches!(
            dest.check_subscription_subtopic(Some("a.*")),
            Err(MessagingError::WildcardSubtopicsNotAllowed(_))
        ));
    }

    #[test]
    fn test_separator_override() {
        let mut config = DestinationConfig::new("feed");
        config.subtopic_separator = Some("/".to_string());
        let dest = destination(config);
        assert_eq!(dest.separator(), "/");
        assert!(dest.check_subscription_subtopic(Some("a/*")).is_ok());
    }

    #[test]
    fn test_routing_mode_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: RoutingMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"server_to_server\"").unwrap();
        assert_eq!(parsed.mode, RoutingMode::ServerToServer);
        let parsed: Wrapper = toml::from_str("mode = \"BROADCAST\"").unwrap();
        assert_eq!(parsed.mode, RoutingMode::Broadcast);
    }
}
