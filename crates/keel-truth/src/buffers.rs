//! Immutable, reference-counted byte blobs.
//!
//! Buffer property values reference opaque blobs through [`BufferRef`]
//! handles. Blobs are immutable once added; the store deduplicates by
//! content hash, so adding the same bytes twice yields handles to the same
//! allocation. Reference counting is carried by the `Arc` inside the
//! handle: cloning retains, dropping releases, and the store only holds
//! weak references so unreferenced blobs are reclaimed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::hash::hash_bytes;

// ---------------------------------------------------------------------------
// BufferRef
// ---------------------------------------------------------------------------

/// Shared handle to an immutable byte blob.
#[derive(Debug, Clone)]
pub struct BufferRef {
    bytes: Arc<[u8]>,
    hash: u64,
}

impl BufferRef {
    /// The blob's bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    /// Content hash of the blob.
    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Size of the blob in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the blob is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for BufferRef {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Eq for BufferRef {}

// ---------------------------------------------------------------------------
// BufferStore
// ---------------------------------------------------------------------------

/// Deduplicating store of immutable blobs, keyed by content hash.
///
/// The store keeps only weak references; a blob lives exactly as long as
/// some [`BufferRef`] to it does. Dead entries are pruned opportunistically
/// on `add`.
#[derive(Debug, Default)]
pub struct BufferStore {
    by_hash: Mutex<HashMap<u64, Weak<[u8]>>>,
}

impl BufferStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob, taking ownership of `data`. If `hash` is `None` it is
    /// computed from the content. Returns a handle; the caller's single
    /// reference is the returned `BufferRef`.
    pub fn add(&self, data: Vec<u8>, hash: Option<u64>) -> BufferRef {
        let hash = hash.unwrap_or_else(|| hash_bytes(&data));
        let mut by_hash = self.by_hash.lock().expect("buffer store poisoned");
        if let Some(existing) = by_hash.get(&hash).and_then(Weak::upgrade) {
            return BufferRef {
                bytes: existing,
                hash,
            };
        }
        by_hash.retain(|_, weak| weak.strong_count() > 0);
        let bytes: Arc<[u8]> = Arc::from(data);
        by_hash.insert(hash, Arc::downgrade(&bytes));
        BufferRef { bytes, hash }
    }

    /// Look up a live blob by content hash.
    pub fn lookup(&self, hash: u64) -> Option<BufferRef> {
        let by_hash = self.by_hash.lock().expect("buffer store poisoned");
        by_hash
            .get(&hash)
            .and_then(Weak::upgrade)
            .map(|bytes| BufferRef { bytes, hash })
    }
}
