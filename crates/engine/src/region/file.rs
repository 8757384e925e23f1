//! One region's backing container.
//!
//! Layout: a 16-byte header (magic + geometry), a slot-length table, then
//! `blocks_per_file` fixed-stride payload slots of `max_block_size` bytes
//! each. Slots that were never written occupy no disk space (the file is
//! sparse); a table entry of 0 means "no block stored".
//!
//! The handle is logically closed by [`RegionFile::attempt_close`]; the
//! OS file lives until the last `Arc` drops, so in-flight reads finish
//! harmlessly. Writes are gated by a writer count so a close can never
//! commit under an active [`BlockWriter`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::SeqCst};

use parking_lot::Mutex;
use thiserror::Error;

use super::RegionGeometry;

const MAGIC: [u8; 4] = *b"SRG1";
const HEADER_LEN: u64 = 16;

/// Outcome of a single block operation against one handle.
#[derive(Debug, Error)]
pub enum BlockIoError {
    /// The handle was (or was being) closed when the operation ran. A
    /// transient condition: retry against a fresh handle. The cache does
    /// this automatically; this variant never escapes it.
    #[error("region file handle is closed")]
    Closed,
    /// A genuine I/O failure. Definitive.
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug)]
struct Inner {
    file: File,
    /// In-memory shadow of the on-disk slot-length table.
    lengths: Vec<u32>,
}

/// An open region container. Cheap shared reads and writes of block
/// payloads by slot index; the cache owns the open/close lifecycle.
#[derive(Debug)]
pub struct RegionFile {
    path: PathBuf,
    geometry: RegionGeometry,
    inner: Mutex<Inner>,
    closed: AtomicBool,
    writers: AtomicU32,
}

impl RegionFile {
    /// Open (or create) the container at `path`. An existing file must
    /// carry the same magic and geometry; anything else is corruption or
    /// a configuration change, surfaced as `InvalidData`.
    pub fn open(path: &Path, geometry: RegionGeometry) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let lengths = if file.metadata()?.len() == 0 {
            init_header(&mut file, geometry)?
        } else {
            read_header(&mut file, geometry, path)?
        };

        Ok(Self {
            path: path.to_path_buf(),
            geometry,
            inner: Mutex::new(Inner { file, lengths }),
            closed: AtomicBool::new(false),
            writers: AtomicU32::new(0),
        })
    }

    pub fn geometry(&self) -> RegionGeometry {
        self.geometry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle has been logically closed. A closed handle
    /// refuses all block operations; get a fresh one from the cache.
    pub fn is_closed(&self) -> bool {
        self.closed.load(SeqCst)
    }

    /// Read one block's payload. `None` if no block is stored in the slot.
    pub fn read_block(&self, index: u32) -> Result<Option<Vec<u8>>, BlockIoError> {
        self.check_index(index)?;
        let mut inner = self.inner.lock();
        // A close that beat us to the lock has already flushed; bail so
        // the caller retries against the replacement handle.
        if self.is_closed() {
            return Err(BlockIoError::Closed);
        }
        let len = inner.lengths[index as usize];
        if len == 0 {
            return Ok(None);
        }
        let offset = self.slot_offset(index);
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        inner.file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    /// Start writing one block. The data lands in the file only on
    /// [`BlockWriter::commit`]; dropping the writer uncommitted discards
    /// it. While the writer is alive, [`attempt_close`](Self::attempt_close)
    /// fails.
    pub fn block_writer(&self, index: u32) -> Result<BlockWriter<'_>, BlockIoError> {
        self.check_index(index)?;
        let guard = self.begin_write()?;
        Ok(BlockWriter {
            file: self,
            index,
            buf: Vec::new(),
            committed: false,
            _guard: guard,
        })
    }

    /// Write one block's payload in a single call.
    pub fn write_block(&self, index: u32, data: &[u8]) -> Result<(), BlockIoError> {
        let mut writer = self.block_writer(index)?;
        writer.write_all(data).map_err(BlockIoError::Io)?;
        writer.commit()
    }

    /// Whether a block is stored in the slot.
    pub fn block_exists(&self, index: u32) -> Result<bool, BlockIoError> {
        self.check_index(index)?;
        let inner = self.inner.lock();
        if self.is_closed() {
            return Err(BlockIoError::Closed);
        }
        Ok(inner.lengths[index as usize] > 0)
    }

    /// Remove the block in the slot (the payload bytes stay on disk but
    /// become unreachable; the slot reads as absent and may be rewritten).
    pub fn delete_block(&self, index: u32) -> Result<(), BlockIoError> {
        self.check_index(index)?;
        let _guard = self.begin_write()?;
        let mut inner = self.inner.lock();
        if inner.lengths[index as usize] == 0 {
            return Ok(());
        }
        write_table_entry(&mut inner.file, index, 0)?;
        inner.lengths[index as usize] = 0;
        Ok(())
    }

    /// Push everything through to disk.
    pub fn flush(&self) -> Result<(), BlockIoError> {
        let inner = self.inner.lock();
        if self.is_closed() {
            return Err(BlockIoError::Closed);
        }
        inner.file.sync_all()?;
        Ok(())
    }

    /// Cooperatively close this handle: succeeds only if no block writer
    /// is currently open against it, and never waits for one. Returns
    /// whether the handle is closed when the call returns. Idempotent.
    ///
    /// The check runs under the inner lock, which `begin_write` also
    /// takes, so a writer can never appear between the count check and
    /// the close commit.
    pub fn attempt_close(&self) -> bool {
        let inner = self.inner.lock();
        if self.is_closed() {
            return true;
        }
        if self.writers.load(SeqCst) != 0 {
            return false;
        }
        self.closed.store(true, SeqCst);
        if let Err(e) = inner.file.sync_all() {
            tracing::warn!("flush on close failed for {}: {e}", self.path.display());
        }
        true
    }

    fn begin_write(&self) -> Result<WriteGuard<'_>, BlockIoError> {
        // Taken under the inner lock so the count and the closed flag
        // move together relative to attempt_close.
        let _inner = self.inner.lock();
        if self.is_closed() {
            return Err(BlockIoError::Closed);
        }
        self.writers.fetch_add(1, SeqCst);
        Ok(WriteGuard(self))
    }

    fn check_index(&self, index: u32) -> Result<(), BlockIoError> {
        if index >= self.geometry.blocks_per_file {
            return Err(BlockIoError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block index {index} out of range (capacity {})",
                    self.geometry.blocks_per_file
                ),
            )));
        }
        Ok(())
    }

    fn table_offset(index: u32) -> u64 {
        HEADER_LEN + index as u64 * 4
    }

    fn slot_offset(&self, index: u32) -> u64 {
        HEADER_LEN
            + self.geometry.blocks_per_file as u64 * 4
            + index as u64 * self.geometry.max_block_size as u64
    }
}

struct WriteGuard<'a>(&'a RegionFile);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.writers.fetch_sub(1, SeqCst);
    }
}

/// In-progress write of one block's payload. Buffered until `commit`.
pub struct BlockWriter<'a> {
    file: &'a RegionFile,
    index: u32,
    buf: Vec<u8>,
    committed: bool,
    _guard: WriteGuard<'a>,
}

impl BlockWriter<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bytes buffered so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write the buffered payload into the slot and publish it in the
    /// length table. The table entry goes last, so a crash mid-commit
    /// leaves the previous block visible rather than a torn one.
    pub fn commit(mut self) -> Result<(), BlockIoError> {
        let file = self.file;
        let index = self.index;
        let mut inner = file.inner.lock();
        // No closed check: our write guard keeps attempt_close from
        // committing for as long as we exist.
        inner.file.seek(SeekFrom::Start(file.slot_offset(index)))?;
        inner.file.write_all(&self.buf)?;
        write_table_entry(&mut inner.file, index, self.buf.len() as u32)?;
        inner.lengths[index as usize] = self.buf.len() as u32;
        self.committed = true;
        Ok(())
    }
}

impl Write for BlockWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let max = self.file.geometry.max_block_size as usize;
        if self.buf.len() + data.len() > max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block payload exceeds the {max}-byte slot limit"),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BlockWriter<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.buf.is_empty() {
            tracing::debug!(
                "block writer for slot {} of {} dropped uncommitted ({} bytes discarded)",
                self.index,
                self.file.path.display(),
                self.buf.len(),
            );
        }
    }
}

// ── Header + table I/O ──────────────────────────────────────────────────

fn init_header(file: &mut File, geometry: RegionGeometry) -> io::Result<Vec<u32>> {
    let mut header = Vec::with_capacity(HEADER_LEN as usize);
    header.extend_from_slice(&MAGIC);
    header.extend_from_slice(&geometry.blocks_per_file.to_le_bytes());
    header.extend_from_slice(&geometry.max_block_size.to_le_bytes());
    header.extend_from_slice(&[0u8; 4]);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.write_all(&vec![0u8; geometry.blocks_per_file as usize * 4])?;
    Ok(vec![0u32; geometry.blocks_per_file as usize])
}

fn read_header(file: &mut File, geometry: RegionGeometry, path: &Path) -> io::Result<Vec<u32>> {
    let mut header = [0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;

    if header[..4] != MAGIC {
        return Err(invalid_data(format!(
            "{} is not a region file (bad magic)",
            path.display()
        )));
    }
    let blocks = u32::from_le_bytes(header[4..8].try_into().unwrap());
    let max = u32::from_le_bytes(header[8..12].try_into().unwrap());
    if blocks != geometry.blocks_per_file || max != geometry.max_block_size {
        return Err(invalid_data(format!(
            "{} has geometry {blocks}x{max}, expected {}x{}",
            path.display(),
            geometry.blocks_per_file,
            geometry.max_block_size,
        )));
    }

    let mut table = vec![0u8; blocks as usize * 4];
    file.read_exact(&mut table)?;
    Ok(table
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn write_table_entry(file: &mut File, index: u32, len: u32) -> io::Result<()> {
    file.seek(SeekFrom::Start(RegionFile::table_offset(index)))?;
    file.write_all(&len.to_le_bytes())
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
