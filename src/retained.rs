//! Retained-message store
//!
//! Stores the latest retained message per exact topic inside a topic trie
//! so that subscribe-time replay can walk the trie under a wildcard
//! filter. A retained publish with an empty payload deletes the entry;
//! the store never holds a message with an empty payload.

use tracing::trace;

use crate::protocol::Message;
use crate::topic::TopicTrie;

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: TopicTrie<Message>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self {
            messages: TopicTrie::new(),
        }
    }

    /// Apply a retained publish: store the message under its exact topic,
    /// or delete the entry when the payload is empty.
    pub fn update(&mut self, message: &Message) {
        if message.payload.is_empty() {
            if self.messages.remove(&message.topic).is_some() {
                trace!(topic = %message.topic, "retained message deleted");
            }
        } else {
            trace!(topic = %message.topic, "retained message stored");
            self.messages.insert(&message.topic, message.clone());
        }
    }

    /// Collect every retained message whose topic matches the filter, for
    /// replay to a new subscription.
    pub fn matching(&self, filter: &str) -> Vec<Message> {
        let mut out = Vec::new();
        self.messages.matches_filter(filter, |m| out.push(m.clone()));
        out
    }

    /// Number of stored retained messages
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.messages.for_each(|_| count += 1);
        count
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn msg(topic: &str, payload: &str) -> Message {
        Message::new(topic, payload.as_bytes().to_vec(), QoS::AtMostOnce).retained()
    }

    #[test]
    fn test_latest_wins() {
        let mut store = RetainedStore::new();
        store.update(&msg("topic", "test"));
        store.update(&msg("topic", "toast"));

        let found = store.matching("topic");
        assert_eq!(found.len(), 1);
        assert_eq!(&found[0].payload[..], b"toast");
    }

    #[test]
    fn test_empty_payload_deletes() {
        let mut store = RetainedStore::new();
        store.update(&msg("topic", "test"));
        store.update(&msg("topic", ""));

        assert!(store.matching("topic").is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_without_entry_is_noop() {
        let mut store = RetainedStore::new();
        store.update(&msg("nothing/here", ""));
        assert!(store.is_empty());
    }

    #[test]
    fn test_wildcard_replay() {
        let mut store = RetainedStore::new();
        store.update(&msg("a/b", "1"));
        store.update(&msg("a/c", "2"));
        store.update(&msg("b/d", "3"));

        let mut topics: Vec<_> = store
            .matching("a/+")
            .into_iter()
            .map(|m| m.topic.to_string())
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["a/b", "a/c"]);

        assert_eq!(store.matching("#").len(), 3);
        assert_eq!(store.len(), 3);
    }
}
