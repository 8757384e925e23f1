//! Shared cache of open region-file handles.
//!
//! Any number of threads may read and write blocks concurrently; at most
//! one open handle exists per region at a time. Handles open lazily (one
//! opener, everyone else waits a bounded spin/yield/sleep) and are closed
//! again after an idle timeout by [`RegionFileCache::sweep_idle`].
//!
//! A handle closed while an operation is in flight is a transient race:
//! the per-block operations detect it and retry against a fresh handle.
//! Only genuine I/O failures reach the caller.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use thiserror::Error;

use super::file::{BlockIoError, RegionFile};
use super::{RegionGeometry, RegionPos};

/// A definitive failure of a cache block operation. Transient races never
/// appear here; they are retried internally.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("block index {index} out of range for region {pos} (capacity {capacity})")]
    BlockIndexOutOfRange {
        pos: RegionPos,
        index: u32,
        capacity: u32,
    },
    #[error("block payload of {len} bytes exceeds the {max}-byte slot limit")]
    BlockTooLarge { len: usize, max: u32 },
    /// The backing file could not be opened (or the open wait was
    /// exhausted). Persistently hitting this is a hard failure for the
    /// layer above; the cache itself keeps serving other regions.
    #[error("no file handle available for region {0}")]
    HandleUnavailable(RegionPos),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Tuning for the handle cache.
#[derive(Debug, Clone)]
pub struct RegionCacheConfig {
    /// Handles untouched for this long are eligible for `sweep_idle`.
    pub idle_timeout: Duration,
    /// How many backoff rounds a thread waits for a concurrent opener
    /// before giving up with "no handle". `None` waits indefinitely:
    /// opens are short and liveness is usually worth more than fast
    /// failure here.
    pub open_wait_limit: Option<u32>,
    /// Backoff shape: busy-spin rounds, then yield rounds, then sleeps.
    pub spin_rounds: u32,
    pub yield_rounds: u32,
    pub sleep_interval: Duration,
}

impl Default for RegionCacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            open_wait_limit: None,
            spin_rounds: 64,
            yield_rounds: 16,
            sleep_interval: Duration::from_millis(1),
        }
    }
}

/// Counter snapshot for diagnostics; see [`RegionFileCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Successful file opens.
    pub opens: u64,
    /// Failed open attempts.
    pub open_failures: u64,
    /// Handles closed by idle/shutdown sweeps.
    pub evictions: u64,
    /// Block operations retried because their handle closed mid-flight.
    pub close_retries: u64,
}

#[derive(Default)]
struct CacheStats {
    opens: AtomicU64,
    open_failures: AtomicU64,
    evictions: AtomicU64,
    close_retries: AtomicU64,
}

/// Per-region handle state. The machine: no handle (closed) -> `opening`
/// claimed by exactly one thread -> handle stored (open), or back to no
/// handle on open failure.
struct RegionSlot {
    handle: ArcSwapOption<RegionFile>,
    opening: AtomicBool,
    /// Milliseconds since the cache epoch; updated on every access.
    last_used: AtomicU64,
}

impl RegionSlot {
    fn new() -> Self {
        Self {
            handle: ArcSwapOption::empty(),
            opening: AtomicBool::new(false),
            last_used: AtomicU64::new(0),
        }
    }
}

/// Reference-managed cache of open region files for one world directory.
pub struct RegionFileCache {
    dir: PathBuf,
    geometry: RegionGeometry,
    config: RegionCacheConfig,
    slots: DashMap<RegionPos, Arc<RegionSlot>>,
    epoch: Instant,
    stats: CacheStats,
}

impl RegionFileCache {
    /// Create a cache over `dir` (created if absent). No files are opened
    /// until a block is first touched.
    pub fn new(
        dir: impl Into<PathBuf>,
        geometry: RegionGeometry,
        config: RegionCacheConfig,
    ) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            geometry,
            config,
            slots: DashMap::new(),
            epoch: Instant::now(),
            stats: CacheStats::default(),
        })
    }

    pub fn geometry(&self) -> RegionGeometry {
        self.geometry
    }

    /// The live handle for a region, opening it if necessary.
    ///
    /// Exactly one thread performs the actual open; the others back off
    /// (spin, then yield, then short sleeps) until the winner installs
    /// the handle. `None` means the open failed or the configured wait
    /// was exhausted -- never that the region is merely empty.
    pub fn get_handle(&self, pos: RegionPos) -> Option<Arc<RegionFile>> {
        let slot = self.slot(pos);
        let mut waited = 0u32;
        loop {
            let current = slot.handle.load();
            match &*current {
                Some(handle) if !handle.is_closed() => {
                    self.touch(&slot);
                    return Some(Arc::clone(handle));
                }
                Some(_) => {
                    // Stale closed handle: clear exactly the one we saw,
                    // then go around again.
                    slot.handle.compare_and_swap(&current, None);
                    continue;
                }
                None => {}
            }

            if !slot.opening.swap(true, SeqCst) {
                // We claimed the opener role, but between our load above
                // and the claim a previous opener may have finished: it
                // installed a handle and released the flag. Re-check under
                // the claim, otherwise we would open the file a second
                // time and two live handles would coexist for one region.
                let current = slot.handle.load();
                match &*current {
                    Some(handle) if !handle.is_closed() => {
                        slot.opening.store(false, SeqCst);
                        self.touch(&slot);
                        return Some(Arc::clone(handle));
                    }
                    Some(_) => {
                        // Closed remnant; we hold the claim, so clear it
                        // and open fresh.
                        slot.handle.compare_and_swap(&current, None);
                    }
                    None => {}
                }

                let opened = RegionFile::open(&self.dir.join(pos.file_name()), self.geometry);
                let result = match opened {
                    Ok(file) => {
                        let handle = Arc::new(file);
                        // Install before releasing the opening claim so
                        // waiters leave through the handle path.
                        slot.handle.store(Some(Arc::clone(&handle)));
                        self.stats.opens.fetch_add(1, SeqCst);
                        self.touch(&slot);
                        Some(handle)
                    }
                    Err(e) => {
                        tracing::error!("failed to open region file for {pos}: {e}");
                        self.stats.open_failures.fetch_add(1, SeqCst);
                        None
                    }
                };
                slot.opening.store(false, SeqCst);
                return result;
            }

            // Someone else is opening. Wait our bounded turn.
            if let Some(limit) = self.config.open_wait_limit {
                if waited >= limit {
                    return None;
                }
            }
            self.backoff(waited);
            waited += 1;
        }
    }

    /// Read one block's payload; `None` if the slot is empty.
    pub fn read_block(&self, pos: RegionPos, index: u32) -> Result<Option<Vec<u8>>, RegionError> {
        self.check_index(pos, index)?;
        self.with_handle(pos, |file| file.read_block(index))
    }

    /// Write one block's payload.
    pub fn write_block(&self, pos: RegionPos, index: u32, data: &[u8]) -> Result<(), RegionError> {
        self.check_index(pos, index)?;
        if data.len() > self.geometry.max_block_size as usize {
            return Err(RegionError::BlockTooLarge {
                len: data.len(),
                max: self.geometry.max_block_size,
            });
        }
        self.with_handle(pos, |file| file.write_block(index, data))
    }

    pub fn block_exists(&self, pos: RegionPos, index: u32) -> Result<bool, RegionError> {
        self.check_index(pos, index)?;
        self.with_handle(pos, |file| file.block_exists(index))
    }

    pub fn delete_block(&self, pos: RegionPos, index: u32) -> Result<(), RegionError> {
        self.check_index(pos, index)?;
        self.with_handle(pos, |file| file.delete_block(index))
    }

    /// Close every handle idle past the timeout. Cooperative: a handle
    /// with an active block writer stays open and is retried on the next
    /// sweep. Returns how many handles were closed.
    pub fn sweep_idle(&self) -> usize {
        self.sweep(Some(self.config.idle_timeout))
    }

    /// Shutdown sweep: close every handle regardless of idle time (still
    /// cooperative with active writers).
    pub fn close_all(&self) -> usize {
        self.sweep(None)
    }

    /// Flush every open handle to disk without closing anything.
    /// Best-effort: every handle is attempted even if one fails, and the
    /// first failure is returned after the sweep.
    pub fn flush_all(&self) -> Result<(), RegionError> {
        let mut first_failure = None;
        for entry in self.slots.iter() {
            if let Some(handle) = entry.value().handle.load_full() {
                match handle.flush() {
                    Ok(()) | Err(BlockIoError::Closed) => {}
                    Err(BlockIoError::Io(e)) => {
                        tracing::error!("flush failed for region {}: {e}", entry.key());
                        first_failure.get_or_insert(e);
                    }
                }
            }
        }
        match first_failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Currently open handles.
    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .handle
                    .load_full()
                    .is_some_and(|h| !h.is_closed())
            })
            .count()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            opens: self.stats.opens.load(SeqCst),
            open_failures: self.stats.open_failures.load(SeqCst),
            evictions: self.stats.evictions.load(SeqCst),
            close_retries: self.stats.close_retries.load(SeqCst),
        }
    }

    fn sweep(&self, idle_for: Option<Duration>) -> usize {
        let now = self.now_ms();
        let mut closed = 0;
        for entry in self.slots.iter() {
            let slot = entry.value();
            let current = slot.handle.load();
            let Some(handle) = &*current else { continue };
            if handle.is_closed() {
                slot.handle.compare_and_swap(&current, None);
                continue;
            }
            if let Some(timeout) = idle_for {
                let idle = now.saturating_sub(slot.last_used.load(SeqCst));
                if idle < timeout.as_millis() as u64 {
                    continue;
                }
            }
            if handle.attempt_close() {
                slot.handle.compare_and_swap(&current, None);
                self.stats.evictions.fetch_add(1, SeqCst);
                closed += 1;
                tracing::debug!("closed region file for {}", entry.key());
            }
        }
        closed
    }

    /// Run a block operation, transparently refreshing the handle when it
    /// was closed out from under us. Real I/O failures surface.
    fn with_handle<R>(
        &self,
        pos: RegionPos,
        op: impl Fn(&RegionFile) -> Result<R, BlockIoError>,
    ) -> Result<R, RegionError> {
        loop {
            let Some(handle) = self.get_handle(pos) else {
                return Err(RegionError::HandleUnavailable(pos));
            };
            match op(&handle) {
                Ok(value) => return Ok(value),
                Err(BlockIoError::Closed) => {
                    self.stats.close_retries.fetch_add(1, SeqCst);
                    continue;
                }
                Err(BlockIoError::Io(e)) => return Err(e.into()),
            }
        }
    }

    fn slot(&self, pos: RegionPos) -> Arc<RegionSlot> {
        self.slots
            .entry(pos)
            .or_insert_with(|| Arc::new(RegionSlot::new()))
            .clone()
    }

    fn touch(&self, slot: &RegionSlot) {
        slot.last_used.store(self.now_ms(), SeqCst);
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn check_index(&self, pos: RegionPos, index: u32) -> Result<(), RegionError> {
        if index >= self.geometry.blocks_per_file {
            return Err(RegionError::BlockIndexOutOfRange {
                pos,
                index,
                capacity: self.geometry.blocks_per_file,
            });
        }
        Ok(())
    }

    fn backoff(&self, round: u32) {
        if round < self.config.spin_rounds {
            std::hint::spin_loop();
        } else if round < self.config.spin_rounds + self.config.yield_rounds {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.config.sleep_interval);
        }
    }
}
