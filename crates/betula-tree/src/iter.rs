//! Ordered iteration over live entries.

use serde::de::DeserializeOwned;
use serde::Serialize;

use betula_common::{BetulaError, Result};

use crate::message::{Message, MessageKey, Opcode};
use crate::tree::Betree;

/// Iterator over `(key, value)` entries in key order.
///
/// Walks the tree's global message stream in `(key, timestamp)` order and
/// folds each key's messages into a materialized entry: inserts replace,
/// updates fold in (starting from the default value when nothing is
/// live), deletes invalidate. An entry is emitted once the stream moves
/// past its key.
///
/// Items are `Result` because advancing can touch the backing store; an
/// error is yielded once, after the last successfully materialized entry.
pub struct TreeIter<'a, K, V> {
    tree: &'a Betree<K, V>,
    pos: Option<(MessageKey<K>, Message<V>)>,
    key: Option<K>,
    value: Option<V>,
    pending_error: Option<BetulaError>,
}

impl<'a, K, V> TreeIter<'a, K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(tree: &'a Betree<K, V>, after: Option<MessageKey<K>>) -> Result<Self> {
        let pos = tree.next_message(after.as_ref())?;
        let mut iter = TreeIter {
            tree,
            pos,
            key: None,
            value: None,
            pending_error: None,
        };
        iter.setup_next_entry()?;
        Ok(iter)
    }

    /// Consumes messages until one full entry is materialized or the
    /// stream ends.
    fn setup_next_entry(&mut self) -> Result<()> {
        self.value = None;
        while let Some((mk, msg)) = self.pos.take() {
            if self.value.is_some() && self.key.as_ref() != Some(&mk.key) {
                // The stream moved to the next key; the current entry is
                // complete.
                self.pos = Some((mk, msg));
                break;
            }
            self.apply(&mk, &msg);
            self.pos = self.tree.next_message(Some(&mk))?;
        }
        Ok(())
    }

    fn apply(&mut self, mkey: &MessageKey<K>, msg: &Message<V>) {
        match msg.opcode {
            Opcode::Insert => {
                self.key = Some(mkey.key.clone());
                self.value = Some(msg.value.clone());
            }
            Opcode::Update => {
                self.key = Some(mkey.key.clone());
                let base = self
                    .value
                    .take()
                    .unwrap_or_else(|| self.tree.default_value().clone());
                self.value = Some((self.tree.combine())(&base, &msg.value));
            }
            Opcode::Delete => {
                self.value = None;
            }
        }
    }
}

impl<K, V> Iterator for TreeIter<'_, K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }
        let value = self.value.clone()?;
        let key = self.key.clone().expect("materialized entry without key");
        if let Err(e) = self.setup_next_entry() {
            self.pending_error = Some(e);
        }
        Some(Ok((key, value)))
    }
}
