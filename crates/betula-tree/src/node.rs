//! Tree nodes and the message-moving machinery.
//!
//! A node is a sorted map from pivot keys to child descriptors. Each
//! descriptor owns the message buffer for its key range `[k_i, k_{i+1})`
//! and, on interior nodes, the handle of the child subtree. Leaves have no
//! children; their buffers hold the authoritative insert messages.
//!
//! Node sizes are measured in message-equivalent units:
//! `total_size = |pivots| + sum of buffer lengths`. A flush may push a
//! node past the configured bound transiently; by the time the flush
//! returns, every node in the touched subtree satisfies it again.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::de::DeserializeOwned;
use serde::Serialize;

use betula_common::{BetulaError, Result};
use betula_swap::{Handle, LoadStream, SaveStream, Swappable};

use crate::message::{Message, MessageKey, Opcode};
use crate::tree::{Betree, CombineFn};

pub(crate) type MessageMap<K, V> = BTreeMap<MessageKey<K>, Message<V>>;
pub(crate) type PivotMap<K, V> = BTreeMap<K, ChildLink<K, V>>;

/// Child descriptor: the subtree handle (absent on leaves), a cached
/// subtree size, and the buffer of messages destined for the child's key
/// range.
pub(crate) struct ChildLink<K, V> {
    pub child: Option<Handle<Node<K, V>>>,
    pub child_size: u64,
    pub buffer: MessageMap<K, V>,
}

impl<K, V> ChildLink<K, V> {
    fn empty() -> Self {
        Self {
            child: None,
            child_size: 0,
            buffer: MessageMap::new(),
        }
    }
}

fn pivot_map_size<K, V>(pivots: &PivotMap<K, V>) -> u64 {
    pivots.len() as u64 + pivots.values().map(|l| l.buffer.len() as u64).sum::<u64>()
}

fn purge_key<K, V>(buffer: &mut MessageMap<K, V>, key: &K)
where
    K: Ord + Clone,
{
    let doomed: Vec<MessageKey<K>> = buffer
        .range(MessageKey::range_start(key.clone())..=MessageKey::range_end(key.clone()))
        .map(|(mk, _)| mk.clone())
        .collect();
    for mk in doomed {
        buffer.remove(&mk);
    }
}

pub(crate) struct Node<K, V> {
    pub height: u64,
    pub pivots: PivotMap<K, V>,
}

impl<K, V> Node<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn leaf() -> Self {
        Self {
            height: 0,
            pivots: PivotMap::new(),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.height == 0
    }

    pub(crate) fn total_size(&self) -> u64 {
        pivot_map_size(&self.pivots)
    }

    /// Key of the pivot whose range contains `key`: the greatest pivot
    /// key `<= key`. `NotFound` when the node is empty or the key sorts
    /// below every pivot.
    pub(crate) fn pivot_key(&self, key: &K) -> Result<&K> {
        self.pivots
            .range(..=key)
            .next_back()
            .map(|(pk, _)| pk)
            .ok_or(BetulaError::NotFound)
    }

    /// Applies one message to this node's local buffers.
    ///
    /// Inserts and deletes first purge every buffered message for the
    /// key, across all timestamps. A delete is dropped at a leaf and kept
    /// as a tombstone on interior nodes so it cascades. An update
    /// collapses into the newest buffered insert when one exists, becomes
    /// an insert of `default ⊕ v` at a leaf with nothing buffered, and is
    /// otherwise buffered to resolve later in timestamp order.
    pub(crate) fn apply(
        &mut self,
        mkey: MessageKey<K>,
        msg: Message<V>,
        default_value: &V,
        combine: CombineFn<V>,
    ) -> Result<()> {
        let is_leaf = self.is_leaf();
        let pivot = self.pivot_key(&mkey.key)?.clone();
        match msg.opcode {
            Opcode::Insert => {
                let link = self.pivots.get_mut(&pivot).expect("pivot vanished");
                purge_key(&mut link.buffer, &mkey.key);
                link.buffer.insert(mkey, msg);
            }
            Opcode::Delete => {
                let link = self.pivots.get_mut(&pivot).expect("pivot vanished");
                purge_key(&mut link.buffer, &mkey.key);
                if !is_leaf {
                    link.buffer.insert(mkey, msg);
                }
            }
            Opcode::Update => {
                let newest = {
                    let link = self.pivots.get(&pivot).expect("pivot vanished");
                    link.buffer
                        .range(..=MessageKey::range_end(mkey.key.clone()))
                        .next_back()
                        .filter(|(mk, _)| mk.key == mkey.key)
                        .map(|(_, m)| m.clone())
                };
                match newest {
                    None if is_leaf => {
                        let value = combine(default_value, &msg.value);
                        self.apply(
                            mkey,
                            Message::new(Opcode::Insert, value),
                            default_value,
                            combine,
                        )?;
                    }
                    Some(m) if m.opcode == Opcode::Insert => {
                        let value = combine(&m.value, &msg.value);
                        self.apply(
                            mkey,
                            Message::new(Opcode::Insert, value),
                            default_value,
                            combine,
                        )?;
                    }
                    _ => {
                        let link = self.pivots.get_mut(&pivot).expect("pivot vanished");
                        link.buffer.insert(mkey, msg);
                    }
                }
            }
        }
        Ok(())
    }

    /// Splits leaf buffers that grew past `2 * min_flush_size` into two
    /// pivots at the buffer's median, repeating until every buffer fits.
    pub(crate) fn rebalance_leaf_pivots(&mut self, min_flush_size: u64) {
        debug_assert!(self.is_leaf());
        loop {
            let oversize = self
                .pivots
                .iter()
                .find(|(_, link)| link.buffer.len() as u64 > 2 * min_flush_size)
                .map(|(key, _)| key.clone());
            let Some(key) = oversize else {
                break;
            };
            self.split_pivot(&key);
        }
    }

    fn split_pivot(&mut self, key: &K) {
        let link = self.pivots.get_mut(key).expect("pivot vanished");
        let mid = link
            .buffer
            .keys()
            .nth(link.buffer.len() / 2)
            .expect("split of empty pivot buffer")
            .clone();
        let upper = link.buffer.split_off(&mid);
        let new_key = upper
            .keys()
            .next()
            .expect("upper half nonempty")
            .key
            .clone();
        self.pivots.insert(
            new_key,
            ChildLink {
                child: None,
                child_size: 0,
                buffer: upper,
            },
        );
    }

    /// Splits this node into two siblings of the same height, first half
    /// of the pivots to the left, second half to the right. Returns the
    /// two-entry pivot map the caller installs in place of this node,
    /// whose own pivot map is left empty.
    pub(crate) fn split(&mut self, tree: &Betree<K, V>) -> Result<PivotMap<K, V>> {
        tracing::trace!(
            pivots = self.pivots.len(),
            total = self.total_size(),
            height = self.height,
            "node split"
        );
        assert!(self.pivots.len() > 1, "split of single-pivot node");

        let pivots = std::mem::take(&mut self.pivots);
        let count = pivots.len();
        let mut left = PivotMap::new();
        let mut right = PivotMap::new();
        for (i, (key, link)) in pivots.into_iter().enumerate() {
            if i < count / 2 {
                left.insert(key, link);
            } else {
                right.insert(key, link);
            }
        }

        let mut result = PivotMap::new();
        for half in [left, right] {
            let first = half.keys().next().expect("split half nonempty").clone();
            let size = pivot_map_size(&half);
            let sibling = Node {
                height: self.height,
                pivots: half,
            };
            let handle = tree.space().allocate(sibling)?;
            result.insert(
                first,
                ChildLink {
                    child: Some(handle),
                    child_size: size,
                    buffer: MessageMap::new(),
                },
            );
        }
        Ok(result)
    }

    /// Collapses runs of small children: scanning left to right, any run
    /// of two or more children whose combined cached size stays under
    /// `0.6 * max_node_size` is replaced by a single merged child holding
    /// the union of their pivots, with the union of the run's buffers.
    pub(crate) fn merge_small_children(&mut self, tree: &Betree<K, V>) -> Result<()> {
        if self.is_leaf() {
            return Ok(());
        }
        let threshold = 6 * tree.config().max_node_size / 10;
        let keys: Vec<K> = self.pivots.keys().cloned().collect();
        let mut i = 0;
        while i < keys.len() {
            let mut total = 0u64;
            let mut j = i;
            while j < keys.len() {
                let size = self.pivots[&keys[j]].child_size;
                if total + size > threshold {
                    break;
                }
                total += size;
                j += 1;
            }
            if j - i >= 2 {
                self.merge_run(tree, &keys[i..j])?;
            }
            i = j.max(i + 1);
        }
        Ok(())
    }

    fn merge_run(&mut self, tree: &Betree<K, V>, run: &[K]) -> Result<()> {
        tracing::trace!(children = run.len(), "merging children");
        let mut merged_pivots = PivotMap::new();
        let mut merged_buffer = MessageMap::new();
        let mut height = 0;
        for key in run {
            let link = self.pivots.remove(key).expect("pivot vanished");
            let child = link.child.expect("interior pivot without child");
            {
                let pin = child.write()?;
                let mut child_node = pin.value_mut();
                height = child_node.height;
                merged_pivots.append(&mut child_node.pivots);
            }
            merged_buffer.extend(link.buffer);
        }
        let size = pivot_map_size(&merged_pivots);
        let merged = Node {
            height,
            pivots: merged_pivots,
        };
        let handle = tree.space().allocate(merged)?;
        self.pivots.insert(
            run[0].clone(),
            ChildLink {
                child: Some(handle),
                child_size: size,
                buffer: merged_buffer,
            },
        );
        Ok(())
    }
}

impl<K, V> Swappable for Node<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn save(&self, out: &mut SaveStream) -> Result<()> {
        out.put_u64(self.height);
        out.put_u64(self.pivots.len() as u64);
        for (key, link) in &self.pivots {
            out.put(key)?;
            Handle::save_opt(link.child.as_ref(), out);
            out.put_u64(link.child_size);
            out.put_u64(link.buffer.len() as u64);
            for (mk, msg) in &link.buffer {
                out.put(&mk.key)?;
                out.put_u64(mk.timestamp);
                out.put_u8(msg.opcode as u8);
                out.put(&msg.value)?;
            }
        }
        Ok(())
    }

    fn load(input: &mut LoadStream<'_>) -> Result<Self> {
        let height = input.get_u64()?;
        let npivots = input.get_u64()?;
        let mut pivots = PivotMap::new();
        for _ in 0..npivots {
            let key: K = input.get()?;
            let child = Handle::load_opt(input)?;
            let child_size = input.get_u64()?;
            let nmessages = input.get_u64()?;
            let mut buffer = MessageMap::new();
            for _ in 0..nmessages {
                let mkey = MessageKey::new(input.get()?, input.get_u64()?);
                let opcode = Opcode::from_u8(input.get_u8()?)?;
                let value: V = input.get()?;
                buffer.insert(mkey, Message::new(opcode, value));
            }
            pivots.insert(
                key,
                ChildLink {
                    child,
                    child_size,
                    buffer,
                },
            );
        }
        Ok(Node { height, pivots })
    }
}

/// Delivers a batch of messages to `handle`'s subtree, flushing and
/// splitting as needed to restore the size bound. Returns an empty map
/// when the subtree still fits, or the two-pivot map of a split for the
/// caller to install in place of this node.
pub(crate) fn flush<K, V>(
    tree: &Betree<K, V>,
    handle: &Handle<Node<K, V>>,
    elts: MessageMap<K, V>,
) -> Result<PivotMap<K, V>>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    if elts.is_empty() {
        return Ok(PivotMap::new());
    }
    let max_node_size = tree.config().max_node_size;
    let min_flush_size = tree.config().min_flush_size;

    let pin = handle.write()?;
    let mut node = pin.value_mut();
    tracing::trace!(
        incoming = elts.len(),
        height = node.height,
        pivots = node.pivots.len(),
        "flush"
    );

    // A node with no pivots seeds one from the smallest incoming key.
    if node.pivots.is_empty() {
        let seed = elts.keys().next().expect("nonempty batch").key.clone();
        node.pivots.insert(seed, ChildLink::empty());
    }

    // The leftmost range extends downward when a smaller key arrives.
    let old_min = node.pivots.keys().next().expect("pivots nonempty").clone();
    let new_min = elts.keys().next().expect("nonempty batch").key.clone();
    if new_min < old_min {
        let link = node.pivots.remove(&old_min).expect("pivot vanished");
        node.pivots.insert(new_min, link);
    }

    if node.is_leaf() {
        for (mk, msg) in elts {
            node.apply(mk, msg, tree.default_value(), tree.combine())?;
        }
        node.rebalance_leaf_pivots(min_flush_size);
        if node.total_size() >= max_node_size {
            return node.split(tree);
        }
        return Ok(PivotMap::new());
    }

    // If the whole batch lands on a single child that is already dirty,
    // push it straight down: the child has to be rewritten anyway, so
    // buffering here buys nothing.
    let first_pivot = node.pivot_key(&elts.keys().next().expect("nonempty batch").key)?.clone();
    let last_pivot = node
        .pivot_key(&elts.keys().next_back().expect("nonempty batch").key)?
        .clone();
    if first_pivot == last_pivot {
        let link = node.pivots.get(&first_pivot).expect("pivot vanished");
        let child = link.child.clone().expect("interior pivot without child");
        if child.is_dirty() {
            assert!(
                link.buffer.is_empty(),
                "dirty-child fast path with buffered messages"
            );
            let new_children = flush(tree, &child, elts)?;
            if new_children.is_empty() {
                let size = child.read()?.value().total_size();
                node.pivots
                    .get_mut(&first_pivot)
                    .expect("pivot vanished")
                    .child_size = size;
            } else {
                node.pivots.remove(&first_pivot);
                node.pivots.extend(new_children);
                // Absorbed splits can push the pivot count past the
                // bound even with nothing buffered locally.
                if node.total_size() > max_node_size {
                    return node.split(tree);
                }
            }
            return Ok(PivotMap::new());
        }
    }

    for (mk, msg) in elts {
        node.apply(mk, msg, tree.default_value(), tree.combine())?;
    }

    // Flush the biggest batches down until the node fits again. A batch
    // qualifies at full size for any child, or at half size when the
    // child is in memory and dirtying it costs no read.
    while node.total_size() >= max_node_size {
        let mut best: Option<(K, u64)> = None;
        for (key, link) in node.pivots.iter() {
            let len = link.buffer.len() as u64;
            let in_memory = link.child.as_ref().map_or(false, |c| c.is_resident());
            let qualifies = len >= min_flush_size || (len >= min_flush_size / 2 && in_memory);
            let best_len = best.as_ref().map_or(0, |(_, l)| *l);
            if qualifies && len > best_len {
                best = Some((key.clone(), len));
            }
        }
        // Nothing qualifies: too many pivots, so we split instead.
        let Some((key, _)) = best else {
            break;
        };

        let (child, batch) = {
            let link = node.pivots.get_mut(&key).expect("pivot vanished");
            let child = link.child.clone().expect("interior pivot without child");
            (child, std::mem::take(&mut link.buffer))
        };
        let new_children = flush(tree, &child, batch)?;
        if new_children.is_empty() {
            let size = child.read()?.value().total_size();
            node.pivots.get_mut(&key).expect("pivot vanished").child_size = size;
        } else {
            node.pivots.remove(&key);
            node.pivots.extend(new_children);
        }
    }

    if node.total_size() > max_node_size {
        return node.split(tree);
    }
    Ok(PivotMap::new())
}

/// Point query against `handle`'s subtree.
pub(crate) fn query<K, V>(
    tree: &Betree<K, V>,
    handle: &Handle<Node<K, V>>,
    key: &K,
) -> Result<V>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let pin = handle.read()?;
    let node = pin.value();
    let pivot = node.pivot_key(key)?.clone();
    let link = node.pivots.get(&pivot).expect("pivot vanished");

    if node.is_leaf() {
        return match link
            .buffer
            .range(MessageKey::range_start(key.clone())..)
            .next()
        {
            Some((mk, msg)) if mk.key == *key => {
                debug_assert_eq!(msg.opcode, Opcode::Insert);
                Ok(msg.value.clone())
            }
            _ => Err(BetulaError::NotFound),
        };
    }

    let messages: Vec<Message<V>> = link
        .buffer
        .range(MessageKey::range_start(key.clone())..=MessageKey::range_end(key.clone()))
        .map(|(_, m)| m.clone())
        .collect();
    let child = link.child.clone().expect("interior pivot without child");
    drop(node);
    drop(pin);

    let mut updates = &messages[..];
    let value = match messages.first() {
        // No buffered messages for this key: the answer is below.
        None => return query(tree, &child, key),
        Some(first) => match first.opcode {
            // Buffered updates fold into whatever the subtree holds, or
            // into the default value if it holds nothing.
            Opcode::Update => match query(tree, &child, key) {
                Ok(v) => v,
                Err(BetulaError::NotFound) => tree.default_value().clone(),
                Err(e) => return Err(e),
            },
            // A tombstone cuts off the subtree; only updates buffered
            // after it can resurrect the key.
            Opcode::Delete => {
                if messages.len() == 1 {
                    return Err(BetulaError::NotFound);
                }
                updates = &messages[1..];
                tree.default_value().clone()
            }
            Opcode::Insert => {
                updates = &messages[1..];
                first.value.clone()
            }
        },
    };

    let mut value = value;
    for msg in updates {
        debug_assert_eq!(msg.opcode, Opcode::Update);
        value = (tree.combine())(&value, &msg.value);
    }
    Ok(value)
}

/// The least message in `handle`'s subtree strictly greater than `after`
/// (or the least message overall when `after` is `None`), merging this
/// node's buffers with the appropriate child subtrees.
pub(crate) fn next_message<K, V>(
    tree: &Betree<K, V>,
    handle: &Handle<Node<K, V>>,
    after: Option<&MessageKey<K>>,
) -> Result<Option<(MessageKey<K>, Message<V>)>>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let pin = handle.read()?;
    let node = pin.value();
    if node.pivots.is_empty() {
        return Ok(None);
    }

    // Start at the pivot containing the probe key, clamped to the first
    // pivot so a probe below the smallest key scans from the start.
    let start = match after {
        Some(mk) => match node.pivots.range(..=&mk.key).next_back() {
            Some((pk, _)) => pk.clone(),
            None => node.pivots.keys().next().expect("pivots nonempty").clone(),
        },
        None => node.pivots.keys().next().expect("pivots nonempty").clone(),
    };

    for (_, link) in node.pivots.range(start..) {
        let buffered = match after {
            Some(mk) => link
                .buffer
                .range((Bound::Excluded(mk), Bound::Unbounded))
                .next(),
            None => link.buffer.iter().next(),
        }
        .map(|(mk, msg)| (mk.clone(), msg.clone()));

        if node.is_leaf() {
            if buffered.is_some() {
                return Ok(buffered);
            }
            continue;
        }

        let child = link.child.clone().expect("interior pivot without child");
        let from_child = next_message(tree, &child, after)?;
        match (buffered, from_child) {
            (Some(b), Some(c)) => {
                return Ok(Some(if c.0 < b.0 { c } else { b }));
            }
            (Some(b), None) => return Ok(Some(b)),
            (None, Some(c)) => return Ok(Some(c)),
            (None, None) => continue,
        }
    }
    Ok(None)
}
