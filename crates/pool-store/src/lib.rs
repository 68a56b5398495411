//! Content-addressed chunk storage for the chunk pool.
//!
//! Every chunk is stored once, compressed, at a path derived from the SHA-256
//! of its uncompressed bytes:
//!
//! ```text
//! <pool>/<hex[0..2]>/<hex[2..4]>/<hex[4..6]>/<hex>-sha256.zz
//! ```
//!
//! # Design Rules
//!
//! 1. Chunks are immutable once written; the name is always recomputed from
//!    the bytes actually written, never trusted from the caller.
//! 2. Write-temp-then-rename: a chunk file appears atomically or not at all.
//! 3. Concurrent writers of identical content converge: whoever renames first
//!    wins, everybody else discards their temp file.
//! 4. Reads re-hash while streaming and fail the stream if the content does
//!    not match its name.
//! 5. Removal is the caller's responsibility to serialize (pool-wide lock).

pub mod codec;
pub mod error;
pub mod fs;
pub mod handle;
pub mod layout;
pub mod traits;

pub use codec::{CountingWriter, VerifyingReader};
pub use error::{StoreError, StoreResult};
pub use fs::{ChunkStoreConfig, FsChunkStore, DEFAULT_MAX_CHUNK_SIZE};
pub use handle::ChunkHandle;
pub use layout::{chunk_file_name, chunk_relative_path, parse_chunk_file_name, CHUNK_SUFFIX};
pub use traits::{ChunkEntry, ChunkInfo, ChunkReader, ChunkStore};
