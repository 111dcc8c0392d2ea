//! Messages and message keys.
//!
//! Every mutation enters the tree as a message stamped with a tree-wide
//! monotone timestamp. Data is indexed by `(user key, timestamp)` so that
//! buffered updates against the same key resolve in insertion order.

use betula_common::{BetulaError, Result};

/// The three kinds of upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Opcode {
    /// Replaces the value for a key.
    Insert = 0,
    /// Tombstones a key.
    Delete = 1,
    /// Folds a delta into the existing value with the tree's combiner;
    /// against a missing key the combiner starts from the default value.
    Update = 2,
}

impl Opcode {
    pub(crate) fn from_u8(raw: u8) -> Result<Opcode> {
        match raw {
            0 => Ok(Opcode::Insert),
            1 => Ok(Opcode::Delete),
            2 => Ok(Opcode::Update),
            _ => Err(BetulaError::corruption(0, format!("invalid opcode {raw}"))),
        }
    }
}

/// A buffered mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Message<V> {
    pub opcode: Opcode,
    pub value: V,
}

impl<V> Message<V> {
    pub fn new(opcode: Opcode, value: V) -> Self {
        Self { opcode, value }
    }
}

/// Timestamp reserved as "before any message".
pub(crate) const TIMESTAMP_FLOOR: u64 = 0;

/// A user key qualified by the timestamp its message was stamped with.
///
/// Ordering is lexicographic, key first. Timestamps start at 1; 0 is the
/// floor sentinel, `u64::MAX` the ceiling, so `range_start`/`range_end`
/// bracket every message for one key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct MessageKey<K> {
    pub key: K,
    pub timestamp: u64,
}

impl<K> MessageKey<K> {
    pub fn new(key: K, timestamp: u64) -> Self {
        Self { key, timestamp }
    }

    /// Sorts before every message for `key`.
    pub fn range_start(key: K) -> Self {
        Self {
            key,
            timestamp: TIMESTAMP_FLOOR,
        }
    }

    /// Sorts after every message for `key`.
    pub fn range_end(key: K) -> Self {
        Self {
            key,
            timestamp: u64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_key_orders_by_key_then_timestamp() {
        assert!(MessageKey::new(1u64, 9) < MessageKey::new(2u64, 1));
        assert!(MessageKey::new(1u64, 1) < MessageKey::new(1u64, 2));
        assert_eq!(MessageKey::new(1u64, 1), MessageKey::new(1u64, 1));
    }

    #[test]
    fn test_range_brackets_every_timestamp() {
        let start = MessageKey::range_start(5u64);
        let end = MessageKey::range_end(5u64);
        let msg = MessageKey::new(5u64, 12345);

        assert!(start < msg);
        assert!(msg < end);
        assert!(MessageKey::new(4u64, u64::MAX) < start);
        assert!(end < MessageKey::new(6u64, 0));
    }

    #[test]
    fn test_opcode_roundtrip() {
        for opcode in [Opcode::Insert, Opcode::Delete, Opcode::Update] {
            assert_eq!(Opcode::from_u8(opcode as u8).unwrap(), opcode);
        }
        assert!(Opcode::from_u8(3).is_err());
    }
}
