//! Topics and ordered topic sets.

use crate::identity::PeerId;
use serde::{Deserialize, Serialize};

/// A 32-byte rendezvous identifier.
///
/// Topics and public keys share one value space: joining
/// `Topic::from(peer_id)` is how a node makes itself findable by key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic([u8; 32]);

impl Topic {
    /// Wrap raw topic bytes
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw topic bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<PeerId> for Topic {
    fn from(key: PeerId) -> Self {
        Self(key)
    }
}

impl From<&PeerId> for Topic {
    fn from(key: &PeerId) -> Self {
        Self(*key)
    }
}

impl AsRef<[u8]> for Topic {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Topic({})", hex::encode(&self.0[..8]))
    }
}

/// Insertion-ordered, duplicate-free set of topics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicSet {
    topics: Vec<Topic>,
}

impl TopicSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `topic`; returns false if it was already present
    pub fn insert(&mut self, topic: Topic) -> bool {
        if self.contains(&topic) {
            return false;
        }
        self.topics.push(topic);
        true
    }

    /// Remove `topic`; returns false if it was absent
    pub fn remove(&mut self, topic: &Topic) -> bool {
        match self.topics.iter().position(|t| t == topic) {
            Some(index) => {
                self.topics.remove(index);
                true
            }
            None => false,
        }
    }

    /// Whether `topic` is in the set
    #[must_use]
    pub fn contains(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }

    /// Number of topics
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.topics.iter()
    }

    /// Copy out the topics in insertion order
    #[must_use]
    pub fn to_vec(&self) -> Vec<Topic> {
        self.topics.clone()
    }
}

impl FromIterator<Topic> for TopicSet {
    fn from_iter<I: IntoIterator<Item = Topic>>(iter: I) -> Self {
        let mut set = Self::new();
        for topic in iter {
            set.insert(topic);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(byte: u8) -> Topic {
        Topic::new([byte; 32])
    }

    #[test]
    fn test_insert_deduplicates_and_keeps_order() {
        let mut set = TopicSet::new();
        assert!(set.insert(topic(3)));
        assert!(set.insert(topic(1)));
        assert!(!set.insert(topic(3)));
        assert_eq!(set.to_vec(), vec![topic(3), topic(1)]);
    }

    #[test]
    fn test_remove() {
        let mut set: TopicSet = [topic(1), topic(2)].into_iter().collect();
        assert!(set.remove(&topic(1)));
        assert!(!set.remove(&topic(1)));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&topic(2)));
    }

    #[test]
    fn test_topic_from_peer_id() {
        let key = [7u8; 32];
        assert_eq!(Topic::from(key).as_bytes(), &key);
    }

    #[test]
    fn test_display_is_full_hex() {
        assert_eq!(topic(0xab).to_string(), "ab".repeat(32));
    }
}
