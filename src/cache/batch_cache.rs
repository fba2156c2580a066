use crate::batch::{Batch, MAX_IMAGE_BYTES};
use crate::types::BatchInput;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Compute SHA-256 of an in-memory byte slice.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Encode a raw 32-byte hash as a lowercase hex string (64 chars).
pub fn to_hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

/// Processed batches keyed by the ordered (content hash, display name) list of
/// their inputs. Unbounded; entries live until invalidated or cleared.
#[derive(Debug, Default)]
pub struct BatchCache {
    entries: RwLock<HashMap<String, Arc<Batch>>>,
}

impl BatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for an input list, or `None` when some input cannot be read
    /// (such a batch is always processed fresh). Oversized inputs always fail
    /// the same way, so they are keyed by size without reading them.
    pub fn key_for(&self, inputs: &[BatchInput]) -> Option<String> {
        let mut hasher = Sha256::new();
        for input in inputs {
            let size = input.source.size().ok()?;
            if size > MAX_IMAGE_BYTES {
                hasher.update(b"oversized");
                hasher.update(size.to_le_bytes());
            } else {
                let bytes = input.source.read().ok()?;
                hasher.update(sha256_bytes(&bytes));
            }
            hasher.update((input.name.len() as u64).to_le_bytes());
            hasher.update(input.name.as_bytes());
        }
        let digest: [u8; 32] = hasher.finalize().into();
        Some(to_hex(&digest))
    }

    pub fn get(&self, key: &str) -> Option<Arc<Batch>> {
        let guard = self.entries.read().ok()?;
        guard.get(key).cloned()
    }

    pub fn insert(&self, key: String, batch: Arc<Batch>) {
        if let Ok(mut guard) = self.entries.write() {
            guard.insert(key, batch);
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut guard) = self.entries.write() {
            guard.remove(key);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.write() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
