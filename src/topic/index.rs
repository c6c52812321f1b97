//! Criteria index shared by the local and remote subscription tables
//!
//! Members (local client ids or peer node ids) are grouped first by subtopic
//! pattern and then by selector expression, so a publish evaluates each
//! distinct selector once no matter how many members share it.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use bincode::{Decode, Encode};
use tracing::warn;

use crate::protocol::{ClientId, Message};
use crate::selector::Selector;

use super::trie::SubtopicTrie;

/// The (subtopic, selector) pair identifying one subscription of a member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct SubscriptionCriteria {
    pub subtopic: Option<String>,
    pub selector: Option<String>,
}

impl SubscriptionCriteria {
    pub fn new(subtopic: Option<&str>, selector: Option<&str>) -> Self {
        Self {
            subtopic: subtopic.filter(|s| !s.is_empty()).map(str::to_string),
            selector: selector.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }
}

/// Members sharing one selector under one subtopic
#[derive(Debug)]
struct SelectorGroup {
    /// None matches every message
    selector: Option<Arc<dyn Selector>>,
    members: AHashSet<ClientId>,
}

/// All selector groups registered for one subtopic pattern
#[derive(Debug, Default)]
struct TopicSubscriptions {
    subtopic: Option<String>,
    groups: AHashMap<Option<String>, SelectorGroup>,
}

impl TopicSubscriptions {
    fn new(subtopic: Option<String>) -> Self {
        Self {
            subtopic,
            groups: AHashMap::new(),
        }
    }

    fn collect(&self, message: &Message, eval_selector: bool, out: &mut BTreeSet<ClientId>) {
        for group in self.groups.values() {
            if eval_selector {
                if let Some(ref selector) = group.selector {
                    match selector.matches(message) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => {
                            warn!("Treating subscription as non-matching: {}", e);
                            continue;
                        }
                    }
                }
            }
            out.extend(group.members.iter().cloned());
        }
    }
}

/// Subscription criteria to member index
#[derive(Debug)]
pub(crate) struct SubscriptionIndex {
    /// Subscriptions without a subtopic
    default_channel: TopicSubscriptions,
    subtopics: SubtopicTrie<TopicSubscriptions>,
}

impl SubscriptionIndex {
    pub fn new(separator: &str) -> Self {
        Self {
            default_channel: TopicSubscriptions::new(None),
            subtopics: SubtopicTrie::new(separator),
        }
    }

    fn topic_mut(&mut self, subtopic: Option<&str>) -> Option<&mut TopicSubscriptions> {
        match subtopic {
            None => Some(&mut self.default_channel),
            Some(pattern) => self.subtopics.get_mut(pattern),
        }
    }

    /// Add a member; returns true when the criteria gained its first member
    pub fn insert(
        &mut self,
        member: &ClientId,
        criteria: &SubscriptionCriteria,
        selector: Option<Arc<dyn Selector>>,
    ) -> bool {
        if self.topic_mut(criteria.subtopic.as_deref()).is_none() {
            if let Some(ref pattern) = criteria.subtopic {
                self.subtopics
                    .insert(pattern, TopicSubscriptions::new(Some(pattern.clone())));
            }
        }
        let Some(topic) = self.topic_mut(criteria.subtopic.as_deref()) else {
            return false;
        };

        let group = topic
            .groups
            .entry(criteria.selector.clone())
            .or_insert_with(|| SelectorGroup {
                selector,
                members: AHashSet::new(),
            });
        let was_empty = group.members.is_empty();
        group.members.insert(member.clone()) && was_empty
    }

    /// Remove a member; returns true when the criteria lost its last member
    pub fn remove(&mut self, member: &ClientId, criteria: &SubscriptionCriteria) -> bool {
        let Some(topic) = self.topic_mut(criteria.subtopic.as_deref()) else {
            return false;
        };
        let Some(group) = topic.groups.get_mut(&criteria.selector) else {
            return false;
        };
        if !group.members.remove(member) {
            return false;
        }

        let emptied = group.members.is_empty();
        if emptied {
            topic.groups.remove(&criteria.selector);
            if topic.groups.is_empty() {
                if let Some(ref pattern) = criteria.subtopic {
                    self.subtopics.remove(pattern);
                }
            }
        }
        emptied
    }

    /// Remove a member from every criteria it holds; returns the criteria
    /// that became empty
    pub fn remove_member(&mut self, member: &ClientId) -> Vec<SubscriptionCriteria> {
        let mut emptied = Vec::new();
        let mut prune = |topic: &mut TopicSubscriptions| {
            let subtopic = topic.subtopic.clone();
            topic.groups.retain(|selector, group| {
                if group.members.remove(member) && group.members.is_empty() {
                    emptied.push(SubscriptionCriteria {
                        subtopic: subtopic.clone(),
                        selector: selector.clone(),
                    });
                }
                !group.members.is_empty()
            });
            topic.groups.is_empty()
        };
        prune(&mut self.default_channel);
        self.subtopics.remove_by_predicate(|topic| prune(topic));
        emptied
    }

    /// Members whose criteria match the message
    ///
    /// A message without subtopics reaches the default channel only; a
    /// message with subtopics reaches only subtopic subscriptions.
    pub fn collect_matching(
        &self,
        subtopics: &[&str],
        message: &Message,
        eval_selector: bool,
        out: &mut BTreeSet<ClientId>,
    ) {
        if subtopics.is_empty() {
            self.default_channel.collect(message, eval_selector, out);
            return;
        }
        for subtopic in subtopics {
            self.subtopics
                .matches(subtopic, |topic| topic.collect(message, eval_selector, out));
        }
    }

    /// Every distinct criteria with at least one member
    pub fn criteria(&self) -> Vec<SubscriptionCriteria> {
        let mut out = Vec::new();
        let mut push = |topic: &TopicSubscriptions| {
            for selector in topic.groups.keys() {
                out.push(SubscriptionCriteria {
                    subtopic: topic.subtopic.clone(),
                    selector: selector.clone(),
                });
            }
        };
        push(&self.default_channel);
        self.subtopics.for_each(|topic| push(topic));
        out.sort();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.default_channel.groups.is_empty() && self.subtopics.is_empty()
    }
}
