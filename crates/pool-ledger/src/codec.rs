use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use pool_types::{LedgerRecord, RefCountRecord, UnusedRecord};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{LedgerError, LedgerResult};

/// Ledger file magic.
pub const LEDGER_MAGIC: &[u8; 4] = b"PLDG";
/// Current ledger format version.
pub const LEDGER_VERSION: u32 = 1;

/// Frame header size: 4 bytes length + 4 bytes CRC.
const FRAME_HEADER_SIZE: usize = 8;
/// Upper bound on one framed record; anything larger is a torn length.
const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Lazy, fault-tolerant reader over a ledger file.
///
/// On-disk format:
/// ```text
/// [4 bytes: magic "PLDG"]
/// [4 bytes: version (big-endian u32)]
/// repeated:
///   [4 bytes: payload length (little-endian u32)]
///   [4 bytes: CRC32 of payload (little-endian u32)]
///   [N bytes: payload (bincode-serialized LedgerRecord)]
/// ```
///
/// Frames failing the CRC check are skipped; a truncated frame ends the
/// stream. Neither is an error: ledgers are rebuildable by fsck.
pub struct LedgerReader {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    offset: u64,
}

impl LedgerReader {
    /// Open a ledger, validating its header.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;
        if &header[0..4] != LEDGER_MAGIC {
            return Err(LedgerError::InvalidMagic {
                path: path.to_path_buf(),
            });
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != LEDGER_VERSION {
            return Err(LedgerError::UnsupportedVersion(version));
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(reader),
            offset: header.len() as u64,
        })
    }

    /// A reader that yields nothing.
    pub fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            reader: None,
            offset: 0,
        }
    }

    /// Open a ledger, treating any failure as an empty ledger.
    pub fn open_or_empty(path: &Path) -> Self {
        match Self::open(path) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(path = ?path, error = %e, "cannot read ledger, treating it as empty");
                Self::empty(path)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stop(&mut self) -> Option<LedgerRecord> {
        self.reader = None;
        None
    }
}

impl Iterator for LedgerReader {
    type Item = LedgerRecord;

    fn next(&mut self) -> Option<LedgerRecord> {
        loop {
            let reader = self.reader.as_mut()?;

            let mut header = [0u8; FRAME_HEADER_SIZE];
            match read_frame_header(reader, &mut header) {
                Ok(true) => {}
                Ok(false) => return self.stop(),
                Err(e) => {
                    warn!(path = ?self.path, offset = self.offset, error = %e, "torn ledger frame header; stopping");
                    return self.stop();
                }
            }

            let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if length == 0 || length > MAX_FRAME_SIZE {
                warn!(path = ?self.path, offset = self.offset, length, "invalid ledger frame length; stopping");
                return self.stop();
            }

            let mut payload = vec![0u8; length as usize];
            if let Err(e) = reader.read_exact(&mut payload) {
                warn!(path = ?self.path, offset = self.offset, error = %e, "truncated ledger frame; stopping");
                return self.stop();
            }
            let frame_offset = self.offset;
            self.offset += (FRAME_HEADER_SIZE + payload.len()) as u64;

            let actual_crc = crc32fast::hash(&payload);
            if actual_crc != expected_crc {
                warn!(
                    path = ?self.path,
                    offset = frame_offset,
                    expected = expected_crc,
                    actual = actual_crc,
                    "CRC mismatch; skipping ledger record"
                );
                continue;
            }

            match bincode::deserialize::<LedgerRecord>(&payload) {
                Ok(record) => return Some(record),
                Err(e) => {
                    warn!(path = ?self.path, offset = frame_offset, error = %e, "undecodable ledger record; skipping");
                }
            }
        }
    }
}

/// Fill `header`, distinguishing a clean end of file (`Ok(false)`) from a
/// header cut short.
fn read_frame_header(reader: &mut impl Read, header: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Every reference-count record of a ledger.
///
/// Missing or unreadable ledgers yield nothing (with a warning).
pub fn read_refcnt(path: &Path) -> impl Iterator<Item = RefCountRecord> {
    let reader = LedgerReader::open_or_empty(path);
    let path = reader.path().to_path_buf();
    reader.filter_map(move |record| match record {
        LedgerRecord::RefCount(r) => Some(r),
        LedgerRecord::Unused(u) => {
            warn!(path = ?path, sha256 = %u.sha256, "unused record in a reference-count ledger; ignoring");
            None
        }
    })
}

/// Every unused record of an unused ledger.
pub fn read_unused(path: &Path) -> impl Iterator<Item = UnusedRecord> {
    let reader = LedgerReader::open_or_empty(path);
    let path = reader.path().to_path_buf();
    reader.filter_map(move |record| match record {
        LedgerRecord::Unused(u) => Some(u),
        LedgerRecord::RefCount(r) => {
            warn!(path = ?path, sha256 = %r.sha256, "reference-count record in an unused ledger; ignoring");
            None
        }
    })
}

/// Serialize `records` into a new ledger that atomically replaces `path`.
///
/// Returns the number of records written. On error the previous ledger is
/// left untouched.
pub fn write_ledger<I>(path: &Path, records: I) -> LedgerResult<u64>
where
    I: IntoIterator<Item = LedgerRecord>,
{
    replace_file(path, |w| {
        w.write_all(LEDGER_MAGIC)?;
        w.write_all(&LEDGER_VERSION.to_be_bytes())?;
        let mut count = 0u64;
        for record in records {
            let payload = bincode::serialize(&record)
                .map_err(|e| LedgerError::Serialization(e.to_string()))?;
            let crc = crc32fast::hash(&payload);
            w.write_all(&(payload.len() as u32).to_le_bytes())?;
            w.write_all(&crc.to_le_bytes())?;
            w.write_all(&payload)?;
            count += 1;
        }
        Ok(count)
    })
    .inspect(|count| debug!(path = ?path, records = count, "ledger written"))
}

/// Write-temp-then-rename. The temp file lives in the target directory so the
/// rename is atomic.
pub(crate) fn replace_file<T>(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<NamedTempFile>) -> LedgerResult<T>,
) -> LedgerResult<T> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut writer = BufWriter::new(NamedTempFile::new_in(&dir)?);
    let value = write(&mut writer)?;
    let tmp = writer.into_inner().map_err(|e| e.into_error())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(value)
}
