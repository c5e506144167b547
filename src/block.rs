use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 hash as hex string; the unique identifier of any object in the
/// content-addressed graph (blob, tree, or commit).
pub type ObjectHash = String;

/// A content-addressable blob: a document's canonical-JSON serialization
/// (or, for bundles, a raw payload). Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blob {
    pub hash: ObjectHash,
    pub data: Vec<u8>,
}

impl Blob {
    /// Create a new blob from raw data; hash is computed automatically.
    pub fn new(data: Vec<u8>) -> Self {
        let hash = compute_hash(&data);
        Self { hash, data }
    }

    /// Verify the blob's integrity against its own hash.
    pub fn verify(&self) -> bool {
        compute_hash(&self.data) == self.hash
    }
}

/// Compute the SHA-256 hex digest of some data.
pub fn compute_hash(data: &[u8]) -> ObjectHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_content_addressable() {
        let b1 = Blob::new(b"hello".to_vec());
        let b2 = Blob::new(b"hello".to_vec());
        assert_eq!(b1.hash, b2.hash);
        assert!(b1.verify());
    }

    #[test]
    fn different_data_different_hash() {
        let b1 = Blob::new(b"hello".to_vec());
        let b2 = Blob::new(b"world".to_vec());
        assert_ne!(b1.hash, b2.hash);
    }

    #[test]
    fn tampered_blob_fails_verify() {
        let mut b = Blob::new(b"original".to_vec());
        b.data = b"tampered".to_vec();
        assert!(!b.verify());
    }
}
