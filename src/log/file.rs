//! Append-only log backed by a single file.
//!
//! Each record is framed as:
//!
//! ```text
//! magic "TCL\0" | version u8 | flags u8 | id.ms u64 | id.seq u64
//! | body_len u32 | body (MessagePack field map) | crc32(body) u32
//! ```
//!
//! All integers are little-endian. Offsets of every record are kept in memory
//! and rebuilt by scanning the file on open.

use super::{check_explicit_id, first_after, first_at, wait_for_tail, Block, IdStrategy, LogStore, TailState};
use crate::error::{BrokerError, Result};
use crate::types::{EntryId, Fields, Record};
use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for each record frame.
const FRAME_MAGIC: &[u8; 4] = b"TCL\0";

/// Magic bytes for the directory manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"TCM\0";

/// Current on-disk format version.
const FORMAT_VERSION: u8 = 1;

/// Fixed part of a frame before the body.
const FRAME_HEADER_SIZE: usize = 4 + 1 + 1 + 8 + 8 + 4;

/// Size of the trailing checksum.
const FRAME_TRAILER_SIZE: usize = 4;

const LOG_FILE: &str = "entries.log";
const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";

/// File log configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogConfig {
    /// Directory holding the log, its manifest and lock file.
    pub path: PathBuf,

    /// Sync to disk every N appends (0 behaves like 1).
    pub sync_interval: u64,

    /// How ids are assigned to appended records.
    pub id_strategy: IdStrategy,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./tailcast"),
            sync_interval: 100,
            id_strategy: IdStrategy::Sequential,
            create_if_missing: true,
        }
    }
}

impl FileLogConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_sync_interval(mut self, sync_interval: u64) -> Self {
        self.sync_interval = sync_interval;
        self
    }

    pub fn with_id_strategy(mut self, id_strategy: IdStrategy) -> Self {
        self.id_strategy = id_strategy;
        self
    }
}

/// Writer-side state, guarded by one lock.
struct Inner {
    file: File,
    file_size: u64,
    writes_since_sync: u64,
    /// `(id, offset)` of every record, in id order.
    index: Vec<(EntryId, u64)>,
    interrupts: u64,
}

impl TailState for Inner {
    fn has_after(&self, after: Option<EntryId>) -> bool {
        match (self.index.last(), after) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some((last, _)), Some(after)) => *last > after,
        }
    }

    fn interrupts(&self) -> u64 {
        self.interrupts
    }
}

/// Result of decoding one frame during the open scan.
enum Frame {
    Complete(Record, u64),
    Torn,
}

/// Append-only log stored in `<path>/entries.log`.
pub struct FileLog {
    config: FileLogConfig,
    inner: Mutex<Inner>,
    appended: Condvar,
    /// Separate handle so historical reads don't hold the writer lock.
    reader: Mutex<File>,
    _lock_file: File,
}

impl FileLog {
    /// Open the log at `path` with default settings, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(FileLogConfig::new(path.as_ref()))
    }

    /// Open or create a log.
    pub fn open_with_config(config: FileLogConfig) -> Result<Self> {
        let dir = config.path.clone();
        if dir.join(MANIFEST_FILE).exists() {
            Self::verify_manifest(&dir)?;
        } else if config.create_if_missing {
            fs::create_dir_all(&dir)?;
            Self::write_manifest(&dir)?;
        } else {
            return Err(BrokerError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no log at {}", dir.display()),
            )));
        }

        let lock_file = Self::acquire_lock(&dir)?;

        let log_path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;

        let (index, valid_size) = Self::scan(&file)?;
        let on_disk = file.metadata()?.len();
        if valid_size < on_disk {
            warn!(
                path = %log_path.display(),
                dropped_bytes = on_disk - valid_size,
                "truncating torn record at end of log"
            );
            file.set_len(valid_size)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_size))?;

        debug!(path = %log_path.display(), records = index.len(), "opened file log");

        let reader = File::open(&log_path)?;

        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                file,
                file_size: valid_size,
                writes_since_sync: 0,
                index,
                interrupts: 0,
            }),
            appended: Condvar::new(),
            reader: Mutex::new(reader),
            _lock_file: lock_file,
        })
    }

    /// Directory this log lives in.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Current log file size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().file_size
    }

    fn write(&self, inner: &mut Inner, id: EntryId, fields: &Fields) -> Result<EntryId> {
        let frame = encode_frame(id, fields)?;

        let offset = inner.file_size;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&frame)?;
        inner.file_size = offset + frame.len() as u64;

        inner.writes_since_sync += 1;
        if inner.writes_since_sync >= self.config.sync_interval.max(1) {
            inner.file.sync_data()?;
            inner.writes_since_sync = 0;
        }

        inner.index.push((id, offset));
        self.appended.notify_all();
        Ok(id)
    }

    /// Read `count` consecutive records starting at `offset`.
    fn read_frames(&self, offset: u64, count: usize) -> Result<Vec<Record>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(&mut *file);

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            match read_frame(&mut reader)? {
                Frame::Complete(record, _) => records.push(record),
                Frame::Torn => {
                    return Err(BrokerError::Corruption(format!(
                        "record at offset {} ends past the end of the log",
                        offset
                    )))
                }
            }
        }
        Ok(records)
    }

    /// Rebuild the offset index; returns it and the size of the valid prefix.
    fn scan(file: &File) -> Result<(Vec<(EntryId, u64)>, u64)> {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut index: Vec<(EntryId, u64)> = Vec::new();
        let mut offset = 0u64;
        loop {
            match read_frame(&mut reader) {
                Ok(Frame::Complete(record, size)) => {
                    if let Some((last, _)) = index.last() {
                        if record.id <= *last {
                            return Err(BrokerError::Corruption(format!(
                                "id {} at offset {} does not follow {}",
                                record.id, offset, last
                            )));
                        }
                    }
                    index.push((record.id, offset));
                    offset += size;
                }
                Ok(Frame::Torn) => break,
                Err(e) => return Err(e),
            }
        }
        Ok((index, offset))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join(MANIFEST_FILE))?;
        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[FORMAT_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join(MANIFEST_FILE))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MANIFEST_MAGIC {
            return Err(BrokerError::InvalidFormat("Invalid manifest magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(BrokerError::InvalidFormat(format!(
                "Unsupported log version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| BrokerError::Locked)?;
        Ok(lock_file)
    }
}

impl LogStore for FileLog {
    fn append(&self, fields: Fields) -> Result<EntryId> {
        let mut inner = self.inner.lock();
        let id = self
            .config
            .id_strategy
            .next_id(inner.index.last().map(|(id, _)| *id))?;
        self.write(&mut inner, id, &fields)
    }

    fn append_with_id(&self, id: EntryId, fields: Fields) -> Result<EntryId> {
        let mut inner = self.inner.lock();
        check_explicit_id(id, inner.index.last().map(|(id, _)| *id))?;
        self.write(&mut inner, id, &fields)
    }

    fn read_after(&self, after: Option<EntryId>, count: usize, block: Block) -> Result<Vec<Record>> {
        let (offset, n) = {
            let mut inner = self.inner.lock();
            wait_for_tail(&self.appended, &mut inner, after, block);
            let start = first_after(&inner.index, after, |(id, _)| *id);
            let n = (inner.index.len() - start).min(count);
            match inner.index.get(start) {
                Some((_, offset)) => (*offset, n),
                None => return Ok(Vec::new()),
            }
        };
        self.read_frames(offset, n)
    }

    fn read_range(&self, from: Option<EntryId>, count: Option<usize>) -> Result<Vec<Record>> {
        let (offset, n) = {
            let inner = self.inner.lock();
            let start = first_at(&inner.index, from, |(id, _)| *id);
            let available = inner.index.len() - start;
            let n = count.map_or(available, |c| c.min(available));
            match inner.index.get(start) {
                Some((_, offset)) => (*offset, n),
                None => return Ok(Vec::new()),
            }
        };
        self.read_frames(offset, n)
    }

    fn last_id(&self) -> Result<Option<EntryId>> {
        Ok(self.inner.lock().index.last().map(|(id, _)| *id))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.inner.lock().index.len())
    }

    fn interrupt(&self) {
        let mut inner = self.inner.lock();
        inner.interrupts += 1;
        self.appended.notify_all();
    }
}

impl Drop for FileLog {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

fn encode_frame(id: EntryId, fields: &Fields) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(fields)?;
    let body_len = u32::try_from(body.len())
        .map_err(|_| BrokerError::Serialization(format!("record body too large: {} bytes", body.len())))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len() + FRAME_TRAILER_SIZE);
    frame.extend_from_slice(FRAME_MAGIC);
    frame.push(FORMAT_VERSION);
    frame.push(0u8); // flags (reserved)
    frame.extend_from_slice(&id.ms.to_le_bytes());
    frame.extend_from_slice(&id.seq.to_le_bytes());
    frame.extend_from_slice(&body_len.to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

/// Fill `buf`, reporting `false` when the stream ends first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_frame(reader: &mut impl Read) -> Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    if !read_full(reader, &mut header)? {
        return Ok(Frame::Torn);
    }

    if &header[0..4] != FRAME_MAGIC {
        return Err(BrokerError::InvalidFormat("Invalid record magic".into()));
    }
    if header[4] != FORMAT_VERSION {
        return Err(BrokerError::InvalidFormat(format!(
            "Unsupported log version: {}",
            header[4]
        )));
    }

    let u64_at = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&header[at..at + 8]);
        u64::from_le_bytes(bytes)
    };
    let id = EntryId::new(u64_at(6), u64_at(14));

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[22..26]);
    let body_len = u32::from_le_bytes(len_bytes) as usize;

    let mut body = vec![0u8; body_len];
    if !read_full(reader, &mut body)? {
        return Ok(Frame::Torn);
    }

    let mut checksum_bytes = [0u8; FRAME_TRAILER_SIZE];
    if !read_full(reader, &mut checksum_bytes)? {
        return Ok(Frame::Torn);
    }
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&body);
    if stored != computed {
        return Err(BrokerError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let fields: Fields = rmp_serde::from_slice(&body)?;
    let size = (FRAME_HEADER_SIZE + body_len + FRAME_TRAILER_SIZE) as u64;
    Ok(Frame::Complete(Record::new(id, fields), size))
}
