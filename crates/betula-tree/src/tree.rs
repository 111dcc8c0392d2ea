//! The tree's public surface and its persisted metadata.

use serde::de::DeserializeOwned;
use serde::Serialize;

use betula_common::{BetulaError, Result};
use betula_swap::{Handle, LoadStream, SaveStream, SwapSpace, Swappable};

use crate::iter::TreeIter;
use crate::message::{Message, MessageKey, Opcode};
use crate::node::{self, MessageMap, Node};

/// Default bound on node size, in message-equivalent units.
pub const DEFAULT_MAX_NODE_SIZE: u64 = 1 << 18;

/// Combiner folding an update delta into an existing value. Must be
/// associative, with the tree's default value as left identity.
pub type CombineFn<V> = fn(&V, &V) -> V;

/// Tuning parameters for a tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    /// Target upper bound on `|pivots| + buffered messages` per node,
    /// enforced whenever a mutation returns.
    pub max_node_size: u64,
    /// Smallest batch worth flushing to a child that would have to be
    /// read in from the backing store. Half this suffices for a child
    /// already in memory.
    pub min_flush_size: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_node_size: DEFAULT_MAX_NODE_SIZE,
            min_flush_size: DEFAULT_MAX_NODE_SIZE / 16,
        }
    }
}

impl TreeConfig {
    /// Creates a configuration with the given bounds.
    pub fn new(max_node_size: u64, min_flush_size: u64) -> Self {
        Self {
            max_node_size,
            min_flush_size,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.min_flush_size == 0 {
            return Err(BetulaError::InvalidParameter {
                name: "min_flush_size".to_string(),
                value: self.min_flush_size.to_string(),
            });
        }
        // Leaf rebalancing bounds pivot buffers by 2 * min_flush_size;
        // a single-pivot leaf holding one full buffer must stay under the
        // node bound, or it would have to split with nothing to split.
        if 2 * self.min_flush_size + 1 >= self.max_node_size {
            return Err(BetulaError::InvalidParameter {
                name: "max_node_size".to_string(),
                value: self.max_node_size.to_string(),
            });
        }
        Ok(())
    }
}

/// Persisted tree state, installed as the swap space's root object so a
/// checkpointed tree can be reopened.
pub(crate) struct TreeMeta<K, V> {
    pub root: Handle<Node<K, V>>,
    pub next_timestamp: u64,
    pub config: TreeConfig,
    pub default_value: V,
}

impl<K, V> Swappable for TreeMeta<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn save(&self, out: &mut SaveStream) -> Result<()> {
        self.root.save(out);
        out.put_u64(self.next_timestamp);
        out.put_u64(self.config.max_node_size);
        out.put_u64(self.config.min_flush_size);
        out.put(&self.default_value)
    }

    fn load(input: &mut LoadStream<'_>) -> Result<Self> {
        let root = Handle::load(input)?;
        let next_timestamp = input.get_u64()?;
        let config = TreeConfig {
            max_node_size: input.get_u64()?,
            min_flush_size: input.get_u64()?,
        };
        let default_value = input.get()?;
        Ok(TreeMeta {
            root,
            next_timestamp,
            config,
            default_value,
        })
    }
}

/// An ordered map from `K` to `V` with buffered-message write
/// optimization.
///
/// All state that must survive a checkpoint lives in swap-space objects;
/// the struct itself only caches immutable parameters and the combiner,
/// which cannot be persisted and is supplied again on reopen.
pub struct Betree<K, V> {
    space: SwapSpace,
    meta: Handle<TreeMeta<K, V>>,
    config: TreeConfig,
    default_value: V,
    combine: CombineFn<V>,
}

impl<K, V> Betree<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates an empty tree in the swap space and installs its metadata
    /// as the space root. `default_value` must be a left identity of
    /// `combine`.
    pub fn create(
        space: &SwapSpace,
        config: TreeConfig,
        default_value: V,
        combine: CombineFn<V>,
    ) -> Result<Self> {
        config.validate()?;
        let root = space.allocate(Node::leaf())?;
        let meta = space.allocate(TreeMeta {
            root,
            next_timestamp: 1,
            config,
            default_value: default_value.clone(),
        })?;
        space.set_root(&meta)?;
        Ok(Self {
            space: space.clone(),
            meta,
            config,
            default_value,
            combine,
        })
    }

    /// Reopens the tree rooted in the swap space, typically after a
    /// reboot from a checkpoint. Configuration and default value come
    /// from the persisted metadata.
    pub fn open(space: &SwapSpace, combine: CombineFn<V>) -> Result<Self> {
        let meta = space
            .get_root::<TreeMeta<K, V>>()?
            .ok_or(BetulaError::NotFound)?;
        let (config, default_value) = {
            let pin = meta.read()?;
            let state = pin.value();
            (state.config, state.default_value.clone())
        };
        Ok(Self {
            space: space.clone(),
            meta,
            config,
            default_value,
            combine,
        })
    }

    pub(crate) fn space(&self) -> &SwapSpace {
        &self.space
    }

    pub(crate) fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub(crate) fn default_value(&self) -> &V {
        &self.default_value
    }

    pub(crate) fn combine(&self) -> CombineFn<V> {
        self.combine
    }

    /// Stamps a message and hands it to the root, growing the tree by one
    /// level when the root splits.
    fn upsert(&self, opcode: Opcode, key: K, value: V) -> Result<()> {
        let pin = self.meta.write()?;
        let (timestamp, root) = {
            let mut meta = pin.value_mut();
            let ts = meta.next_timestamp;
            meta.next_timestamp += 1;
            (ts, meta.root.clone())
        };

        let mut batch = MessageMap::new();
        batch.insert(MessageKey::new(key, timestamp), Message::new(opcode, value));
        let new_pivots = node::flush(self, &root, batch)?;

        if !new_pivots.is_empty() {
            let height = root.read()?.value().height + 1;
            tracing::trace!(height, "root split");
            let new_root = self.space.allocate(Node {
                height,
                pivots: new_pivots,
            })?;
            pin.value_mut().root = new_root;
        }
        Ok(())
    }

    /// Sets the value for a key, replacing any previous value.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        self.upsert(Opcode::Insert, key, value)
    }

    /// Folds a delta into the value for a key with the tree's combiner.
    pub fn update(&self, key: K, value: V) -> Result<()> {
        self.upsert(Opcode::Update, key, value)
    }

    /// Removes a key.
    pub fn erase(&self, key: K) -> Result<()> {
        self.upsert(Opcode::Delete, key, self.default_value.clone())
    }

    /// Looks up the value for a key. `NotFound` if the key has no live
    /// value.
    pub fn query(&self, key: &K) -> Result<V> {
        node::query(self, &self.root()?, key)
    }

    /// Iterates every live entry in key order.
    pub fn iter(&self) -> Result<TreeIter<'_, K, V>> {
        TreeIter::new(self, None)
    }

    /// Iterates entries with keys `>= key` in key order.
    pub fn lower_bound(&self, key: &K) -> Result<TreeIter<'_, K, V>> {
        TreeIter::new(self, Some(MessageKey::range_start(key.clone())))
    }

    /// Iterates entries with keys `> key` in key order.
    pub fn upper_bound(&self, key: &K) -> Result<TreeIter<'_, K, V>> {
        TreeIter::new(self, Some(MessageKey::range_end(key.clone())))
    }

    /// Maintenance pass collapsing runs of small root children into
    /// single nodes.
    pub fn merge_small_children(&self) -> Result<()> {
        let root = self.root()?;
        let pin = root.write()?;
        let mut node = pin.value_mut();
        node.merge_small_children(self)
    }

    /// Walks the whole tree checking the shape invariants: node sizes
    /// within bound, buffered messages inside their pivot's key range,
    /// child heights one below their parent.
    pub fn check_invariants(&self) -> Result<()> {
        self.check_node(&self.root()?, None)
    }

    fn check_node(&self, handle: &Handle<Node<K, V>>, upper: Option<&K>) -> Result<()> {
        let pin = handle.read()?;
        let node = pin.value();
        let id = handle.id().get();

        if node.total_size() > self.config.max_node_size {
            return Err(BetulaError::corruption(
                id,
                format!(
                    "node size {} exceeds bound {}",
                    node.total_size(),
                    self.config.max_node_size
                ),
            ));
        }

        let mut pivots = node.pivots.iter().peekable();
        while let Some((key, link)) = pivots.next() {
            let next_key = pivots.peek().map(|(k, _)| *k).or(upper);
            for mk in link.buffer.keys() {
                let in_range = mk.key >= *key && next_key.map_or(true, |nk| mk.key < *nk);
                if !in_range {
                    return Err(BetulaError::corruption(
                        id,
                        "buffered message outside its pivot range",
                    ));
                }
            }
            match (&link.child, node.is_leaf()) {
                (None, true) => {}
                (Some(child), false) => {
                    let child_height = child.read()?.value().height;
                    if child_height + 1 != node.height {
                        return Err(BetulaError::corruption(
                            id,
                            format!(
                                "child height {} under node of height {}",
                                child_height, node.height
                            ),
                        ));
                    }
                    self.check_node(child, next_key)?;
                }
                (None, false) => {
                    return Err(BetulaError::corruption(id, "interior pivot without child"));
                }
                (Some(_), true) => {
                    return Err(BetulaError::corruption(id, "leaf pivot with child"));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn next_message(
        &self,
        after: Option<&MessageKey<K>>,
    ) -> Result<Option<(MessageKey<K>, Message<V>)>> {
        node::next_message(self, &self.root()?, after)
    }

    fn root(&self) -> Result<Handle<Node<K, V>>> {
        let pin = self.meta.read()?;
        let root = pin.value().root.clone();
        Ok(root)
    }
}
