//! Append-only checksummed record log
//!
//! Shared by the LSM metadata backend and the per-shard write-ahead logs.
//! Every record carries a log sequence number (LSN) assigned under the
//! writer lock, so file order always equals LSN order.
//!
//! Record format:
//! ```text
//! +--------+------+--------+------+--------+
//! | Magic  | LSN  | Length | Data | CRC32C |
//! | 4B     | 8B   | 4B     | var  | 4B     |
//! +--------+------+--------+------+--------+
//! ```
//!
//! A torn record at the tail (crash mid-write) ends the readable log. It is
//! cut off when the log is reopened so new appends stay reachable.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Record header size (magic + lsn + length)
const RECORD_HEADER_SIZE: usize = 16;

/// Trailing checksum size
const CRC_SIZE: usize = 4;

/// Record log configuration
#[derive(Clone, Debug)]
pub struct RecordLogConfig {
    /// Sync after every append
    pub sync_on_write: bool,
    /// Size after which the owner should checkpoint and truncate
    pub max_size_bytes: u64,
    /// Buffer size for writes
    pub write_buffer_size: usize,
}

impl Default for RecordLogConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_size_bytes: 64 * 1024 * 1024,
            write_buffer_size: 64 * 1024,
        }
    }
}

fn encode_record(magic: u32, lsn: u64, data: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(data.len())
        .map_err(|_| Error::invalid_argument(format!("record too large: {} bytes", data.len())))?;

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + data.len() + CRC_SIZE);
    buf.extend_from_slice(&magic.to_le_bytes());
    buf.extend_from_slice(&lsn.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);

    // CRC over everything except the CRC itself
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Read the next record from a reader with `remaining` bytes left.
/// `Ok(None)` means a clean end of log or a torn tail.
fn read_record(
    reader: &mut impl Read,
    magic: u32,
    remaining: u64,
) -> Result<Option<(u64, Vec<u8>, usize)>> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut word = [0u8; 4];
    word.copy_from_slice(&header[0..4]);
    if u32::from_le_bytes(word) != magic {
        return Ok(None);
    }
    let mut lsn_bytes = [0u8; 8];
    lsn_bytes.copy_from_slice(&header[4..12]);
    let lsn = u64::from_le_bytes(lsn_bytes);
    word.copy_from_slice(&header[12..16]);
    let data_len = u32::from_le_bytes(word) as usize;
    // A length running past the end of the file is a torn or corrupt header
    let record_len = RECORD_HEADER_SIZE + data_len + CRC_SIZE;
    if record_len as u64 > remaining {
        return Ok(None);
    }

    let mut body = vec![0u8; data_len + CRC_SIZE];
    match reader.read_exact(&mut body) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    word.copy_from_slice(&body[data_len..]);
    let stored_crc = u32::from_le_bytes(word);
    let computed_crc = crc32c::crc32c_append(crc32c::crc32c(&header), &body[..data_len]);
    if computed_crc != stored_crc {
        return Ok(None);
    }

    body.truncate(data_len);
    Ok(Some((lsn, body, record_len)))
}

/// Append-only record log
pub struct RecordLog {
    /// Log file path
    path: PathBuf,
    /// Record magic number
    magic: u32,
    /// File handle for writing
    writer: Mutex<BufWriter<File>>,
    /// Current file size
    size: AtomicU64,
    /// Last assigned LSN
    last_lsn: AtomicU64,
    /// Highest LSN known to be on stable storage
    synced_lsn: AtomicU64,
    config: RecordLogConfig,
}

impl RecordLog {
    /// Open the log at `path`, creating it when missing.
    ///
    /// Existing records are scanned to recover the last LSN; anything after
    /// the last valid record is discarded.
    pub fn open(path: impl AsRef<Path>, magic: u32, config: RecordLogConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (last_lsn, valid_len) = Self::scan(&path, magic)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                "Discarding {} trailing bytes from log {:?}",
                on_disk - valid_len,
                path
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path)?;
        let writer = BufWriter::with_capacity(config.write_buffer_size, file);

        debug!("Opened log {:?} at LSN {}", path, last_lsn);
        Ok(Self {
            path,
            magic,
            writer: Mutex::new(writer),
            size: AtomicU64::new(valid_len),
            last_lsn: AtomicU64::new(last_lsn),
            synced_lsn: AtomicU64::new(last_lsn),
            config,
        })
    }

    /// Scan the log to find the last LSN and the length of the valid prefix
    fn scan(path: &Path, magic: u32) -> Result<(u64, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut last_lsn = 0u64;
        let mut pos = 0u64;
        while let Some((lsn, _, size)) = read_record(&mut reader, magic, len - pos)? {
            last_lsn = lsn;
            pos += size as u64;
        }
        Ok((last_lsn, pos))
    }

    /// Append a record and return its LSN
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        self.append_then(data, |lsn| lsn)
    }

    /// Append a record, then run `then` with the assigned LSN before the
    /// writer lock is released. Callers use this to publish records to other
    /// consumers in exactly log order.
    pub fn append_then<T>(&self, data: &[u8], then: impl FnOnce(u64) -> T) -> Result<T> {
        let mut writer = self.writer.lock();
        let lsn = self.last_lsn.load(Ordering::SeqCst) + 1;
        let bytes = encode_record(self.magic, lsn, data)?;

        writer.write_all(&bytes)?;
        if self.config.sync_on_write {
            writer.flush()?;
            writer.get_ref().sync_data()?;
            self.synced_lsn.store(lsn, Ordering::SeqCst);
        }

        self.last_lsn.store(lsn, Ordering::SeqCst);
        self.size.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(then(lsn))
    }

    /// Flush buffered records and fsync. Returns the highest durable LSN.
    pub fn sync(&self) -> Result<u64> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        let lsn = self.last_lsn.load(Ordering::SeqCst);
        self.synced_lsn.store(lsn, Ordering::SeqCst);
        Ok(lsn)
    }

    /// Replay records with LSN >= `from_lsn`. Returns the last LSN seen.
    pub fn replay<F>(&self, from_lsn: u64, mut callback: F) -> Result<u64>
    where
        F: FnMut(u64, &[u8]) -> Result<()>,
    {
        // Make buffered appends visible to the reader
        self.writer.lock().flush()?;

        let file = File::open(&self.path)?;
        let mut remaining = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut last_lsn = 0u64;
        while let Some((lsn, data, size)) = read_record(&mut reader, self.magic, remaining)? {
            remaining -= size as u64;
            if lsn >= from_lsn {
                callback(lsn, &data)?;
            }
            last_lsn = lsn;
        }
        Ok(last_lsn)
    }

    /// Drop every record with LSN < `lsn`.
    ///
    /// Surviving records keep their LSNs. Appends are blocked for the
    /// duration of the rewrite.
    pub fn truncate_before(&self, lsn: u64) -> Result<()> {
        let kept = self.retain(|record_lsn, _| record_lsn >= lsn)?;
        debug!(
            "Truncated log {:?} before LSN {} ({} records kept)",
            self.path, lsn, kept
        );
        Ok(())
    }

    /// Rewrite the log keeping only records for which `keep` returns true.
    /// Returns the number of records kept.
    pub fn retain<F>(&self, mut keep: F) -> Result<u64>
    where
        F: FnMut(u64, &[u8]) -> bool,
    {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let new_path = self.path.with_extension("new");
        let mut kept = 0u64;
        let mut new_size = 0u64;
        {
            let out = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&new_path)?;
            let mut out = BufWriter::with_capacity(self.config.write_buffer_size, out);

            let file = File::open(&self.path)?;
            let mut remaining = file.metadata()?.len();
            let mut reader = BufReader::new(file);
            while let Some((record_lsn, data, size)) =
                read_record(&mut reader, self.magic, remaining)?
            {
                remaining -= size as u64;
                if keep(record_lsn, &data) {
                    let bytes = encode_record(self.magic, record_lsn, &data)?;
                    out.write_all(&bytes)?;
                    new_size += bytes.len() as u64;
                    kept += 1;
                }
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }

        // Atomic rename
        std::fs::rename(&new_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        *writer = BufWriter::with_capacity(self.config.write_buffer_size, file);
        self.size.store(new_size, Ordering::Relaxed);
        Ok(kept)
    }

    /// Ensure future appends are numbered after `lsn`.
    ///
    /// Owners call this after loading a checkpoint, since a fully truncated
    /// log no longer remembers how far numbering had progressed.
    pub fn advance_to(&self, lsn: u64) {
        let _guard = self.writer.lock();
        if lsn > self.last_lsn.load(Ordering::SeqCst) {
            self.last_lsn.store(lsn, Ordering::SeqCst);
            self.synced_lsn.store(lsn, Ordering::SeqCst);
        }
    }

    /// Last assigned LSN
    #[must_use]
    pub fn current_lsn(&self) -> u64 {
        self.last_lsn.load(Ordering::SeqCst)
    }

    /// Highest LSN known to be durable
    #[must_use]
    pub fn synced_lsn(&self) -> u64 {
        self.synced_lsn.load(Ordering::SeqCst)
    }

    /// Current file size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether the log has grown past its configured limit
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.size() >= self.config.max_size_bytes
    }

    /// Log file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
