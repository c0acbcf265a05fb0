//! Topic trie for subscription, retained-message and permission lookups
//!
//! A prefix tree keyed by `/`-separated topic levels with MQTT wildcard
//! support (`+` and `#`). The same structure backs three different uses:
//! subscription filters (match a topic against stored filters), retained
//! messages (match stored exact topics against a filter), and permission
//! sets (decide whether a filter is covered by stored filters).
//!
//! Performance notes:
//! - Iterator-based traversal avoids Vec allocations on insert/lookup
//! - CompactString child keys avoid heap allocation for short levels
//! - SmallVec level splits cover typical topic depths without spilling

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

/// Node in the topic trie
#[derive(Debug, Clone)]
struct TrieNode<V> {
    /// Value stored at this node
    value: Option<V>,
    /// Children indexed by topic level
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Multi-level wildcard (#) value
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

    /// A node with no value, no wildcards and no children can be pruned.
    fn is_vacant(&self) -> bool {
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

/// Topic trie keyed by topic filter (or exact topic name)
#[derive(Debug, Clone)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// A trie containing a single filter
    pub fn singleton(filter: &str, value: V) -> Self {
        let mut trie = Self::new();
        trie.insert(filter, value);
        trie
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.root.is_vacant()
    }

    /// Insert a filter with associated value, replacing any previous value
    ///
    /// A terminal `#` stores the value as the multi-wildcard of its parent
    /// node; every other filter ends at the value slot of the node its
    /// last level walks to.
    pub fn insert(&mut self, filter: &str, value: V) {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            match level {
                "#" => {
                    node.multi_wildcard = Some(value);
                    return;
                }
                "+" => {
                    let child = node.single_wildcard.get_or_insert_with(Box::default);
                    node = &mut **child;
                }
                _ => node = node.children.entry(CompactString::new(level)).or_default(),
            }
        }
        node.value = Some(value);
    }

    /// Get a reference to the value at an exact filter
    pub fn get(&self, filter: &str) -> Option<&V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let mut node = &self.root;
        for (index, &level) in levels.iter().enumerate() {
            match level {
                "#" if index + 1 == levels.len() => return node.multi_wildcard.as_ref(),
                "#" => return None,
                "+" => node = node.single_wildcard.as_deref()?,
                _ => node = node.children.get(level)?,
            }
        }
        node.value.as_ref()
    }

    /// Get a mutable reference to the value at an exact filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let mut node = &mut self.root;
        for (index, &level) in levels.iter().enumerate() {
            match level {
                "#" if index + 1 == levels.len() => return node.multi_wildcard.as_mut(),
                "#" => return None,
                "+" => node = node.single_wildcard.as_deref_mut()?,
                _ => node = node.children.get_mut(level)?,
            }
        }
        node.value.as_mut()
    }

    /// Remove a filter, pruning subtrees left empty on the way back up
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels, 0)
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str], index: usize) -> Option<V> {
        if index >= levels.len() {
            return node.value.take();
        }

        let level = levels[index];

        match level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                let child = node.single_wildcard.as_deref_mut()?;
                let removed = if index + 1 >= levels.len() {
                    child.value.take()
                } else {
                    Self::remove_recursive(child, levels, index + 1)
                };
                if child.is_vacant() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = if index + 1 >= levels.len() {
                    child.value.take()
                } else {
                    Self::remove_recursive(child, levels, index + 1)
                };
                if child.is_vacant() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Remove entries by predicate (returns true if an entry should go),
    /// pruning subtrees left empty
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
            if child.is_vacant() {
                node.single_wildcard = None;
            }
        }

        node.children.retain(|_, child| {
            Self::remove_by_predicate_recursive(child, pred);
            !child.is_vacant()
        });
    }

    /// Find all stored filters matching a topic name
    ///
    /// Follows literal children, `+` children (one level each) and `#`
    /// values (all remaining levels including zero). Topics whose first
    /// level starts with `$` do not match a leading `#` or `+`.
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let is_system = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::match_topic(&self.root, &levels, 0, is_system, &mut callback);
    }

    fn match_topic<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        // wildcards never apply to the first level of a $-topic
        let wildcards_apply = !is_system || index > 0;

        if wildcards_apply {
            if let Some(ref v) = node.multi_wildcard {
                callback(v);
            }
        }

        let Some(&level) = levels.get(index) else {
            // the topic is exhausted; a filter ending exactly here matches
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        };

        if wildcards_apply {
            if let Some(ref child) = node.single_wildcard {
                Self::match_topic(child, levels, index + 1, is_system, callback);
            }
        }
        if let Some(child) = node.children.get(level) {
            Self::match_topic(child, levels, index + 1, is_system, callback);
        }
    }

    /// True when a topic name matches at least one stored filter
    pub fn matches_any(&self, topic: &str) -> bool {
        let mut hit = false;
        self.matches(topic, |_| hit = true);
        hit
    }

    /// True when some stored filter covers the given filter: every topic
    /// the given filter could match is also matched by the stored one.
    /// Used for permission checks on subscription filters.
    pub fn covers_filter(&self, filter: &str) -> bool {
        let is_system = filter.starts_with('$');
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::covers_recursive(&self.root, &levels, 0, is_system)
    }

    fn covers_recursive(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system: bool,
    ) -> bool {
        // wildcards never apply to the first level of a $-topic
        let wildcards_apply = !is_system || index > 0;

        if wildcards_apply && node.multi_wildcard.is_some() {
            return true;
        }

        let Some(&level) = levels.get(index) else {
            return node.value.is_some();
        };

        match level {
            // only a stored `#` covers a requested `#`, handled above
            "#" => false,
            "+" => node
                .single_wildcard
                .as_deref()
                .is_some_and(|child| Self::covers_recursive(child, levels, index + 1, is_system)),
            _ => {
                if wildcards_apply {
                    if let Some(ref child) = node.single_wildcard {
                        if Self::covers_recursive(child, levels, index + 1, is_system) {
                            return true;
                        }
                    }
                }
                node.children
                    .get(level)
                    .is_some_and(|child| Self::covers_recursive(child, levels, index + 1, is_system))
            }
        }
    }

    /// Find all values stored under exact topic keys that a wildcard
    /// filter matches (the reverse of `matches`). Used for retained-message
    /// replay on subscribe. Wildcard nodes in the trie are ignored; keys
    /// are expected to be exact topic names. A leading `#` or `+` in the
    /// filter does not descend into `$`-prefixed branches.
    pub fn matches_filter<F>(&self, filter: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::filter_walk(&self.root, &levels, 0, &mut callback);
    }

    fn filter_walk<F>(node: &TrieNode<V>, levels: &[&str], index: usize, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if index >= levels.len() {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        }

        match levels[index] {
            "#" => {
                for (key, child) in &node.children {
                    if index == 0 && key.starts_with('$') {
                        continue;
                    }
                    Self::collect_subtree(child, callback);
                }
                if let Some(ref v) = node.value {
                    callback(v);
                }
            }
            "+" => {
                for (key, child) in &node.children {
                    if index == 0 && key.starts_with('$') {
                        continue;
                    }
                    Self::filter_walk(child, levels, index + 1, callback);
                }
            }
            level => {
                if let Some(child) = node.children.get(level) {
                    Self::filter_walk(child, levels, index + 1, callback);
                }
            }
        }
    }

    fn collect_subtree<F>(node: &TrieNode<V>, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(ref v) = node.value {
            callback(v);
        }
        for child in node.children.values() {
            Self::collect_subtree(child, callback);
        }
    }

    /// Merge another trie into this one, keeping existing values on conflict
    pub fn union(&mut self, other: TopicTrie<V>) {
        Self::union_nodes(&mut self.root, other.root);
    }

    fn union_nodes(dst: &mut TrieNode<V>, src: TrieNode<V>) {
        if dst.value.is_none() {
            dst.value = src.value;
        }
        if dst.multi_wildcard.is_none() {
            dst.multi_wildcard = src.multi_wildcard;
        }
        match (&mut dst.single_wildcard, src.single_wildcard) {
            (Some(d), Some(s)) => Self::union_nodes(d, *s),
            (d @ None, Some(s)) => *d = Some(s),
            _ => {}
        }
        for (key, child) in src.children {
            match dst.children.get_mut(&key) {
                Some(existing) => Self::union_nodes(existing, child),
                None => {
                    dst.children.insert(key, child);
                }
            }
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
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(trie: &TopicTrie<i32>, topic: &str) -> Vec<i32> {
        let mut matches = Vec::new();
        trie.matches(topic, |v| matches.push(*v));
        matches.sort();
        matches
    }

    #[test]
    fn test_exact_match() {
        let mut trie = TopicTrie::new();
        trie.insert("test/topic", 1);

        assert_eq!(collect(&trie, "test/topic"), vec![1]);
        assert!(collect(&trie, "test/other").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut trie = TopicTrie::new();
        trie.insert("test/+", 1);
        trie.insert("+/topic", 2);
        trie.insert("+/+", 3);

        assert_eq!(collect(&trie, "test/topic"), vec![1, 2, 3]);
    }

    #[test]
    fn test_multi_wildcard() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("test/#", 2);

        assert_eq!(collect(&trie, "test/topic/deep"), vec![1, 2]);
        // `test/#` also matches the parent level itself
        assert_eq!(collect(&trie, "test"), vec![1, 2]);
    }

    #[test]
    fn test_system_topics() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("+/test", 2);
        trie.insert("$SYS/#", 3);

        // $-topics do not match a leading # or +
        assert_eq!(collect(&trie, "$SYS/test"), vec![3]);
    }

    #[test]
    fn test_remove_prunes_empty_branches() {
        let mut trie = TopicTrie::new();
        trie.insert("a/b/c", 1);
        trie.insert("a/b", 2);

        assert_eq!(trie.remove("a/b/c"), Some(1));
        assert_eq!(trie.remove("a/b"), Some(2));
        assert!(trie.is_empty());
        assert_eq!(trie.remove("a/b"), None);
    }

    #[test]
    fn test_remove_wildcard_entries() {
        let mut trie = TopicTrie::new();
        trie.insert("a/+/c", 1);
        trie.insert("a/#", 2);

        assert_eq!(trie.remove("a/+/c"), Some(1));
        assert_eq!(trie.remove("a/#"), Some(2));
        assert!(trie.is_empty());
    }

    #[test]
    fn test_covers_filter() {
        let mut trie = TopicTrie::new();
        trie.insert("a/#", ());
        trie.insert("b/+", ());
        trie.insert("c/d", ());

        assert!(trie.covers_filter("a/x/y"));
        assert!(trie.covers_filter("a/#"));
        assert!(trie.covers_filter("a"));
        assert!(trie.covers_filter("b/x"));
        assert!(trie.covers_filter("b/+"));
        assert!(!trie.covers_filter("b/#"));
        assert!(!trie.covers_filter("b/x/y"));
        assert!(trie.covers_filter("c/d"));
        assert!(!trie.covers_filter("c/+"));
    }

    #[test]
    fn test_covers_filter_system_topics() {
        let mut trie = TopicTrie::new();
        trie.insert("#", ());

        assert!(trie.covers_filter("a/b"));
        assert!(!trie.covers_filter("$SYS/broker"));
    }

    #[test]
    fn test_matches_filter_reverse_lookup() {
        let mut trie = TopicTrie::new();
        trie.insert("a/b", 1);
        trie.insert("a/c", 2);
        trie.insert("a/b/c", 3);
        trie.insert("$SYS/x", 4);

        let mut hits = Vec::new();
        trie.matches_filter("a/+", |v| hits.push(*v));
        hits.sort();
        assert_eq!(hits, vec![1, 2]);

        hits.clear();
        trie.matches_filter("a/#", |v| hits.push(*v));
        hits.sort();
        assert_eq!(hits, vec![1, 2, 3]);

        hits.clear();
        trie.matches_filter("#", |v| hits.push(*v));
        hits.sort();
        assert_eq!(hits, vec![1, 2, 3]);

        hits.clear();
        trie.matches_filter("$SYS/x", |v| hits.push(*v));
        assert_eq!(hits, vec![4]);
    }

    #[test]
    fn test_union_keeps_existing() {
        let mut a = TopicTrie::singleton("x/y", 1);
        let mut b = TopicTrie::singleton("x/y", 2);
        b.insert("z/#", 3);

        a.union(b);
        assert_eq!(a.get("x/y"), Some(&1));
        assert_eq!(a.get("z/#"), Some(&3));
    }
}
