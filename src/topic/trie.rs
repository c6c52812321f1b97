//! Subtopic Trie for efficient subscription matching
//!
//! A trie (prefix tree) keyed by subtopic segments. Patterns may use `*` for
//! a single segment and a trailing `**` for any number of trailing segments.
//! Patterns are assumed to have been validated by [`super::Subtopic::new`].
//!
//! Performance optimizations:
//! - Uses iterator-based traversal to avoid Vec allocations on insert/lookup
//! - Uses compact_str for memory-efficient segment storage
//! - Prunes emptied branches on removal so churny subtopics don't leak nodes

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use super::subtopic::{MULTI_WILDCARD, SINGLE_WILDCARD};

/// Node in the subtopic trie
#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a pattern ending at this node
    value: Option<V>,
    /// Children indexed by literal segment
    children: AHashMap<CompactString, TrieNode<V>>,
    /// `*` child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a pattern ending in `**` at this depth
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::with_capacity(4),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Subtopic Trie for efficient subscription matching
#[derive(Debug)]
pub struct SubtopicTrie<V> {
    root: TrieNode<V>,
    separator: CompactString,
}

impl<V> SubtopicTrie<V> {
    pub fn new(separator: &str) -> Self {
        Self {
            root: TrieNode::new(),
            separator: CompactString::new(separator),
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// True when no pattern is stored
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Insert a pattern with associated value, replacing any previous value
    pub fn insert(&mut self, pattern: &str, value: V) {
        let mut node = &mut self.root;
        let mut segments = pattern.split(self.separator.as_str()).peekable();

        while let Some(segment) = segments.next() {
            let is_last = segments.peek().is_none();

            if segment == MULTI_WILDCARD {
                node.multi_wildcard = Some(value);
                return;
            } else if segment == SINGLE_WILDCARD {
                node = node
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()));
            } else {
                node = node.children.entry(CompactString::new(segment)).or_default();
            }

            if is_last {
                node.value = Some(value);
                return;
            }
        }
    }

    /// Get a mutable reference to the value stored for a pattern
    pub fn get_mut(&mut self, pattern: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut segments = pattern.split(self.separator.as_str()).peekable();

        while let Some(segment) = segments.next() {
            let is_last = segments.peek().is_none();

            if segment == MULTI_WILDCARD {
                return node.multi_wildcard.as_mut();
            } else if segment == SINGLE_WILDCARD {
                node = node.single_wildcard.as_mut()?;
            } else {
                node = node.children.get_mut(segment)?;
            }

            if is_last {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove a pattern from the trie
    /// Uses SmallVec to avoid heap allocation for typical depths (up to 8 segments)
    pub fn remove(&mut self, pattern: &str) -> Option<V> {
        let segments: SmallVec<[&str; 8]> = pattern.split(self.separator.as_str()).collect();
        Self::remove_recursive(&mut self.root, &segments, 0)
    }

    fn remove_recursive(node: &mut TrieNode<V>, segments: &[&str], index: usize) -> Option<V> {
        if index >= segments.len() {
            return node.value.take();
        }

        let segment = segments[index];
        if segment == MULTI_WILDCARD {
            return node.multi_wildcard.take();
        }

        if segment == SINGLE_WILDCARD {
            let child = node.single_wildcard.as_mut()?;
            let removed = Self::remove_recursive(child, segments, index + 1);
            if child.is_empty() {
                node.single_wildcard = None;
            }
            removed
        } else {
            let child = node.children.get_mut(segment)?;
            let removed = Self::remove_recursive(child, segments, index + 1);
            if child.is_empty() {
                node.children.remove(segment);
            }
            removed
        }
    }

    /// Visit every stored value
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_recursive(&self.root, &mut callback);
    }

    fn for_each_recursive<F>(node: &TrieNode<V>, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(ref v) = node.value {
            callback(v);
        }
        if let Some(ref v) = node.multi_wildcard {
            callback(v);
        }
        if let Some(ref child) = node.single_wildcard {
            Self::for_each_recursive(child, callback);
        }
        for child in node.children.values() {
            Self::for_each_recursive(child, callback);
        }
    }

    /// Remove entries by predicate (returns true if entry should be removed)
    pub fn remove_by_predicate<F>(&mut self, mut pred: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        Self::remove_by_predicate_recursive(&mut self.root, &mut pred);
    }

    fn remove_by_predicate_recursive<F>(node: &mut TrieNode<V>, pred: &mut F)
    where
        F: FnMut(&mut V) -> bool,
    {
        if let Some(ref mut v) = node.value {
            if pred(v) {
                node.value = None;
            }
        }

        if let Some(ref mut v) = node.multi_wildcard {
            if pred(v) {
                node.multi_wildcard = None;
            }
        }

        if let Some(ref mut child) = node.single_wildcard {
            Self::remove_by_predicate_recursive(child, pred);
            if child.is_empty() {
                node.single_wildcard = None;
            }
        }

        node.children.retain(|_, child| {
            Self::remove_by_predicate_recursive(child, pred);
            !child.is_empty()
        });
    }

    /// Find all values whose pattern matches a concrete subtopic
    pub fn matches<F>(&self, subtopic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let segments: SmallVec<[&str; 8]> = subtopic.split(self.separator.as_str()).collect();
        Self::matches_recursive(&self.root, &segments, 0, &mut callback);
    }

    fn matches_recursive<F>(node: &TrieNode<V>, segments: &[&str], index: usize, callback: &mut F)
    where
        F: FnMut(&V),
    {
        // `**` covers the remaining segments, including none
        if let Some(ref v) = node.multi_wildcard {
            callback(v);
        }

        if index >= segments.len() {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        }

        if let Some(ref child) = node.single_wildcard {
            Self::matches_recursive(child, segments, index + 1, callback);
        }

        if let Some(child) = node.children.get(segments[index]) {
            Self::matches_recursive(child, segments, index + 1, callback);
        }
    }
}
