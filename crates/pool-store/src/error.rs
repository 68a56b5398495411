use pool_types::ChunkHash;

/// Errors from chunk store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested chunk is not in the pool.
    #[error("chunk not found: {0}")]
    NotFound(ChunkHash),

    /// The bytes written do not hash to the hash the caller announced.
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch {
        expected: ChunkHash,
        computed: ChunkHash,
    },

    /// The stored chunk cannot be decoded or does not match its name.
    #[error("corrupt chunk {sha256}: {reason}")]
    Corrupt { sha256: ChunkHash, reason: String },

    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
