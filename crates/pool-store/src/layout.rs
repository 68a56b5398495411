use std::ffi::OsStr;
use std::path::PathBuf;

use pool_types::ChunkHash;

/// File name suffix of every chunk file.
pub const CHUNK_SUFFIX: &str = "-sha256.zz";

/// Number of two-character shard directories above a chunk file.
const SHARD_DEPTH: usize = 3;

/// `<hex>-sha256.zz`
pub fn chunk_file_name(sha256: &ChunkHash) -> String {
    format!("{}{CHUNK_SUFFIX}", sha256.to_hex())
}

/// Shard directories plus file name, relative to the pool root.
pub fn chunk_relative_path(sha256: &ChunkHash) -> PathBuf {
    let hex = sha256.to_hex();
    let mut path = PathBuf::new();
    for level in 0..SHARD_DEPTH {
        path.push(&hex[level * 2..level * 2 + 2]);
    }
    path.push(chunk_file_name(sha256));
    path
}

/// Parse a chunk file name back into its hash.
///
/// Returns `None` for anything that is not a chunk file (temp files, ledgers,
/// lock files).
pub fn parse_chunk_file_name(name: &OsStr) -> Option<ChunkHash> {
    let name = name.to_str()?;
    let hex = name.strip_suffix(CHUNK_SUFFIX)?;
    ChunkHash::from_hex(hex).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_is_sharded() {
        let hash = ChunkHash::of(b"hello");
        let path = chunk_relative_path(&hash);
        assert_eq!(
            path,
            PathBuf::from("2c/f2/4d")
                .join("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824-sha256.zz")
        );
    }

    #[test]
    fn parse_inverts_file_name() {
        let hash = ChunkHash::of(b"layout");
        let name = chunk_file_name(&hash);
        assert_eq!(parse_chunk_file_name(OsStr::new(&name)), Some(hash));
    }

    #[test]
    fn parse_rejects_other_files() {
        assert_eq!(parse_chunk_file_name(OsStr::new("REFCNT.pool.bin")), None);
        assert_eq!(parse_chunk_file_name(OsStr::new(".tmpA1b2C3")), None);
        assert_eq!(parse_chunk_file_name(OsStr::new("abcd-sha256.zz")), None);
    }
}
