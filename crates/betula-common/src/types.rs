//! Identifier types shared between the swap space and the backing store.

use serde::{Deserialize, Serialize};

/// Unique identifier for a swappable object within one swap space.
///
/// IDs are assigned by a monotone counter starting at 1 and are stable for
/// the object's lifetime, including across checkpoints. Zero is reserved as
/// the serialized form of a null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Returns the raw identifier value.
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// Unique identifier for a blob within one backing store.
///
/// Assigned by the store's allocator; stable for the blob's lifetime.
/// Zero is reserved as the on-disk encoding of "no blob" and is never
/// handed out by `allocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(pub u64);

impl BlobId {
    /// Returns the raw identifier value.
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }

    /// Encodes an optional blob ID as a u64 with 0 meaning absent.
    #[inline]
    pub fn encode(id: Option<BlobId>) -> u64 {
        id.map_or(0, |b| b.0)
    }

    /// Decodes a u64 with 0 meaning absent.
    #[inline]
    pub fn decode(raw: u64) -> Option<BlobId> {
        if raw == 0 {
            None
        } else {
            Some(BlobId(raw))
        }
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "blob:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_display() {
        assert_eq!(ObjectId(42).to_string(), "obj:42");
    }

    #[test]
    fn test_blob_id_display() {
        assert_eq!(BlobId(7).to_string(), "blob:7");
    }

    #[test]
    fn test_blob_id_encode_decode() {
        assert_eq!(BlobId::encode(None), 0);
        assert_eq!(BlobId::encode(Some(BlobId(9))), 9);
        assert_eq!(BlobId::decode(0), None);
        assert_eq!(BlobId::decode(9), Some(BlobId(9)));
    }

    #[test]
    fn test_ids_are_ordered() {
        assert!(ObjectId(1) < ObjectId(2));
        assert!(BlobId(3) > BlobId(2));
    }
}
