//! Write-optimized ordered key-value index for Betula.
//!
//! A B^ε-tree: a B-tree variant in which interior nodes buffer pending
//! messages (inserts, deletes, monoidal updates) for their subtrees and
//! flush them downward in batches. Buffering turns many small random
//! writes into few large ones, which is what makes the tree
//! write-optimized; queries fold buffered messages into the value they
//! find below.
//!
//! Nodes live in a [`betula_swap::SwapSpace`] and reference each other
//! through swap-space handles, so the tree's memory footprint is bounded
//! by the space's cache policy rather than by the tree's size.
//!
//! # Example
//!
//! ```no_run
//! use betula_swap::{LruCacheManager, MemStore, SwapSpace};
//! use betula_tree::{Betree, TreeConfig};
//!
//! fn main() -> betula_common::Result<()> {
//!     let space = SwapSpace::new(
//!         Box::new(MemStore::new()),
//!         Box::new(LruCacheManager::new(64)),
//!     )?;
//!     let tree: Betree<u64, String> =
//!         Betree::create(&space, TreeConfig::default(), String::new(), |a, b| {
//!             format!("{a}{b}")
//!         })?;
//!
//!     tree.insert(1, "one".to_string())?;
//!     tree.update(1, "!".to_string())?;
//!     assert_eq!(tree.query(&1)?, "one!");
//!
//!     for entry in tree.iter()? {
//!         let (k, v) = entry?;
//!         println!("{k} -> {v}");
//!     }
//!     Ok(())
//! }
//! ```

mod iter;
mod message;
mod node;
mod tree;

pub use iter::TreeIter;
pub use tree::{Betree, CombineFn, TreeConfig, DEFAULT_MAX_NODE_SIZE};
