//! Subscription tree: a topic-hierarchy trie whose nodes hold subscriber
//! lists and an optional retained-message pointer into the store.
//!
//! Produces the set of `(client, qos)` fan-out targets for a given publish,
//! and is the owner of the retained-message slot per topic.

use std::sync::Arc;

use compact_str::CompactString;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;
use crate::store::StoredMessage;

/// A `{client, qos}` pair installed on a terminal node's subs list.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub client_id: Arc<str>,
    pub qos: QoS,
}

struct Node {
    /// Ordered by insertion, as in the spec's data model. Linear scan is
    /// fine at the branching factors real topic trees exhibit.
    children: Vec<(CompactString, Node)>,
    subs: Vec<Subscriber>,
    retained: Option<Arc<StoredMessage>>,
}

impl Node {
    fn new() -> Self {
        Self {
            children: Vec::new(),
            subs: Vec::new(),
            retained: None,
        }
    }

    fn child_mut(&mut self, level: &str) -> &mut Node {
        if let Some(idx) = self.children.iter().position(|(l, _)| l == level) {
            &mut self.children[idx].1
        } else {
            self.children.push((CompactString::new(level), Node::new()));
            &mut self.children.last_mut().unwrap().1
        }
    }

    fn child(&self, level: &str) -> Option<&Node> {
        self.children.iter().find(|(l, _)| l == level).map(|(_, n)| n)
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subs.is_empty() && self.retained.is_none()
    }
}

/// A retained message freshly matched on subscribe, to be synthesized into
/// an Out delivery with `retain = true`.
pub struct RetainedMatch {
    pub stored: Arc<StoredMessage>,
}

/// The subscription tree. The broker database holds two pre-created
/// top-level children, `""` (normal) and `"$SYS"`, matching the spec's data
/// model; this type itself is agnostic to that and just holds whatever root
/// children are inserted into it.
pub struct SubscriptionTree {
    root: RwLock<Node>,
}

impl SubscriptionTree {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::new()),
        }
    }

    /// Walk/create nodes along `/`-separated levels and install
    /// `{client, qos}` on the terminal node, replacing any existing entry
    /// for the same client. Returns the retained message at the terminal
    /// node, if any, so the caller can synthesize a retained delivery.
    pub fn subscribe(&self, filter: &str, client_id: Arc<str>, qos: QoS) -> Option<RetainedMatch> {
        let mut root = self.root.write();
        let mut node = &mut *root;
        for level in filter.split('/') {
            node = node.child_mut(level);
        }
        node.subs.retain(|s| s.client_id != client_id);
        node.subs.push(Subscriber {
            client_id,
            qos,
        });
        node.retained.clone().map(|stored| RetainedMatch { stored })
    }

    /// Remove `client_id`'s subscription at `filter`, pruning now-empty
    /// nodes back up to (but not including) the root.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut root = self.root.write();
        Self::unsubscribe_recursive(&mut root, &filter.split('/').collect::<Vec<_>>(), client_id)
    }

    fn unsubscribe_recursive(node: &mut Node, levels: &[&str], client_id: &str) -> bool {
        let Some((head, rest)) = levels.split_first() else {
            let before = node.subs.len();
            node.subs.retain(|s| s.client_id.as_ref() != client_id);
            return node.subs.len() != before;
        };
        let Some(idx) = node.children.iter().position(|(l, _)| l == *head) else {
            return false;
        };
        let removed = Self::unsubscribe_recursive(&mut node.children[idx].1, rest, client_id);
        if node.children[idx].1.is_empty() {
            node.children.remove(idx);
        }
        removed
    }

    /// Remove every subscription belonging to `client_id`, pruning empty
    /// nodes.
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut root = self.root.write();
        Self::unsubscribe_all_recursive(&mut root, client_id);
    }

    fn unsubscribe_all_recursive(node: &mut Node, client_id: &str) {
        node.subs.retain(|s| s.client_id.as_ref() != client_id);
        node.children
            .retain_mut(|(_, child)| {
                Self::unsubscribe_all_recursive(child, client_id);
                !child.is_empty()
            });
    }

    /// Walk the tree matching the concrete `topic`, honoring `+`/`#`
    /// wildcard subscriptions, and invoke `callback` once per matching
    /// subscriber.
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&Subscriber),
    {
        let is_system_topic = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let root = self.root.read();
        Self::matches_recursive(&root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &Node,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&Subscriber),
    {
        let at_root_level = index == 0;

        if !(is_system_topic && at_root_level) {
            if let Some(multi) = node.child("#") {
                for sub in &multi.subs {
                    callback(sub);
                }
            }
        }

        if index >= levels.len() {
            for sub in &node.subs {
                callback(sub);
            }
            return;
        }

        let level = levels[index];

        if !(is_system_topic && at_root_level) {
            if let Some(single) = node.child("+") {
                Self::matches_recursive(single, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(child) = node.child(level) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }

    /// Set or clear (empty-payload) the retained pointer at the terminal
    /// node for `topic`, ref-adjusting the old and new records accordingly.
    /// `stored = None` clears the slot.
    pub fn set_retained(&self, topic: &str, stored: Option<Arc<StoredMessage>>) {
        let mut root = self.root.write();
        let mut node = &mut *root;
        for level in topic.split('/') {
            node = node.child_mut(level);
        }
        if let Some(ref new) = stored {
            new.incr_ref();
        }
        if let Some(old) = node.retained.take() {
            old.decr_ref();
        }
        node.retained = stored;
    }

    /// Number of distinct subscribers across the whole tree, for tests and
    /// diagnostics.
    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        fn walk(node: &Node) -> usize {
            node.subs.len() + node.children.iter().map(|(_, n)| walk(n)).sum::<usize>()
        }
        walk(&self.root.read())
    }
}

impl Default for SubscriptionTree {
    fn default() -> Self {
        Self::new()
    }
}
