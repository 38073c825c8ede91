//! Cross-process shared queue
//!
//! A memory-mapped file that short-lived producer processes write into and a
//! long-lived flush worker drains. Two atomic cursors in the segment header
//! serialise producers and consumers across processes:
//!
//! ```text
//! ┌─────────────────────── header (64 bytes) ───────────────────────┐
//! │ magic │ slot_size │ capacity │ max_size │ write │ read │ format │
//! └─────────────────────────────────────────────────────────────────┘
//! ┌ slot 0 ──────────────────────────────┐ ┌ slot 1 ...
//! │ tag │ expires_at_ms │ len │ payload  │ │
//! └──────────────────────────────────────┘ └
//! ```
//!
//! `format` is the build's wire format version; a segment created by a build
//! with a different envelope layout is refused on open.
//!
//! Cursor `c` lives in slot `c % capacity`. Each slot carries a sequence tag:
//!
//! - `c`            free for the writer that claimed cursor `c`
//! - `c + 1`        holds the record for the reader that claimed cursor `c`
//! - `BUSY | t`     a writer or reader claimed the slot at epoch millis `t`
//!   and is copying; a claim older than `STALE_CLAIM_MS` belongs to a
//!   participant that died and is reclaimed by whoever needs the slot
//!
//! A reader releases the slot by setting the tag to `c + capacity`, the next
//! writer's cursor. Cursors are claimed with a CAS on the header words and slots
//! with a CAS on the tag, so a slot is handed to at most one reader.

use crate::broker::error::BackendError;
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::time::epoch_millis;
use crate::core::version::WIRE_FORMAT_VERSION;
use crate::queue::envelope::QueuedEnvelope;
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::producer::QueueSink;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

const MAGIC: u64 = u64::from_le_bytes(*b"RLYBUSQ1");
const HEADER_SIZE: usize = 64;
const SLOT_HEADER_SIZE: usize = 24;
const BUSY: u64 = 1 << 63;
const COMPACTING: u64 = u64::MAX;

const OFF_MAGIC: usize = 0;
const OFF_SLOT_SIZE: usize = 8;
const OFF_CAPACITY: usize = 16;
const OFF_MAX_SIZE: usize = 24;
const OFF_WRITE: usize = 32;
const OFF_READ: usize = 40;
const OFF_WIRE_FORMAT: usize = 48;

// How long either side waits on a slot still owned by the other
const SLOT_WAIT_SPINS: u32 = 100_000;
// Copying one slot takes microseconds; a claim this old is abandoned
const STALE_CLAIM_MS: u64 = 5_000;

fn busy_tag() -> u64 {
    BUSY | (epoch_millis(SystemTime::now()) & !BUSY)
}

fn is_busy(tag: u64) -> bool {
    tag & BUSY != 0
}

/// A claim whose owner has been gone too long (or that carries no sane time)
fn is_stale_claim(tag: u64) -> bool {
    is_busy(tag) && epoch_millis(SystemTime::now()).abs_diff(tag & !BUSY) > STALE_CLAIM_MS
}

#[derive(Debug, Clone)]
pub struct SharedQueueConfig {
    pub path: PathBuf,
    /// Number of slots in the segment
    pub capacity: usize,
    /// Maximum unread records; at most `capacity`
    pub max_size: usize,
    /// Maximum payload bytes per record
    pub slot_size: usize,
    /// How long a record stays deliverable
    pub ttl: Duration,
}

impl Default for SharedQueueConfig {
    fn default() -> Self {
        Self {
            path: default_segment_path("default"),
            capacity: 4096,
            max_size: 4096,
            slot_size: 4096,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Host-local location for a named segment
pub fn default_segment_path(name: &str) -> PathBuf {
    let shm = Path::new("/dev/shm");
    let base = if shm.is_dir() {
        shm.to_path_buf()
    } else {
        dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
    };
    base.join(format!("relaybus-{}.queue", name))
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SharedQueueStats {
    pub path: String,
    pub size: u64,
    pub capacity: u64,
    pub max_size: u64,
    pub write_cursor: u64,
    pub read_cursor: u64,
}

pub struct SharedQueue {
    path: PathBuf,
    // Kept alive for `base`
    _mmap: MmapMut,
    base: *mut u8,
    capacity: u64,
    max_size: u64,
    slot_size: usize,
    slot_stride: usize,
    ttl: Duration,
}

// All shared state is accessed through atomics or under slot ownership
unsafe impl Send for SharedQueue {}
unsafe impl Sync for SharedQueue {}

impl std::fmt::Debug for SharedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedQueue")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl SharedQueue {
    /// Open the segment at `config.path`, creating and initialising it if absent
    pub fn open(config: SharedQueueConfig) -> QueueResult<Self> {
        if config.capacity == 0 {
            return Err(QueueError::InvalidCapacity {
                capacity: 0,
                reason: "shared queue capacity must be greater than 0".to_string(),
            });
        }
        if config.slot_size == 0 {
            return Err(QueueError::InvalidCapacity {
                capacity: 0,
                reason: "shared queue slot size must be greater than 0".to_string(),
            });
        }
        let max_size = config.max_size.clamp(1, config.capacity) as u64;
        let slot_stride = (SLOT_HEADER_SIZE + config.slot_size).div_ceil(8) * 8;
        let total = HEADER_SIZE + slot_stride * config.capacity;

        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QueueError::segment(&config.path, e))?;
        }

        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&config.path)
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&config.path)
                    .map_err(|e| QueueError::segment(&config.path, e))?;
                (file, false)
            }
            Err(e) => return Err(QueueError::segment(&config.path, e)),
        };

        if created {
            file.set_len(total as u64)
                .map_err(|e| QueueError::segment(&config.path, e))?;
        } else {
            wait_for_length(&file, total as u64, &config.path)?;
        }

        let mut mmap = unsafe { MmapOptions::new().len(total).map_mut(&file) }
            .map_err(|e| QueueError::segment(&config.path, e))?;
        let base = mmap.as_mut_ptr();

        let queue = Self {
            path: config.path.clone(),
            _mmap: mmap,
            base,
            capacity: config.capacity as u64,
            max_size,
            slot_size: config.slot_size,
            slot_stride,
            ttl: config.ttl,
        };

        if created {
            queue.reset_tags();
            queue.atomic(OFF_SLOT_SIZE).store(config.slot_size as u64, Ordering::Relaxed);
            queue.atomic(OFF_CAPACITY).store(queue.capacity, Ordering::Relaxed);
            queue.atomic(OFF_MAX_SIZE).store(max_size, Ordering::Relaxed);
            queue.atomic(OFF_WRITE).store(0, Ordering::Relaxed);
            queue.atomic(OFF_READ).store(0, Ordering::Relaxed);
            queue
                .atomic(OFF_WIRE_FORMAT)
                .store(u64::from(WIRE_FORMAT_VERSION), Ordering::Relaxed);
            queue.atomic(OFF_MAGIC).store(MAGIC, Ordering::Release);
            log::debug!(
                "Created shared queue segment {} ({} slots of {} bytes)",
                config.path.display(),
                config.capacity,
                config.slot_size
            );
        } else {
            queue.validate_existing()?;
        }

        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Unread records (including expired ones not yet dequeued)
    pub fn len(&self) -> usize {
        let write = self.write_cursor().load(Ordering::Acquire);
        let read = self.read_cursor().load(Ordering::Acquire);
        if write == COMPACTING || write < read {
            return 0;
        }
        (write - read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a record; `Ok(false)` when the queue is full
    pub fn enqueue(&self, envelope: &QueuedEnvelope) -> QueueResult<bool> {
        let bytes = envelope.to_bytes();
        if bytes.len() > self.slot_size {
            return Err(QueueError::PayloadTooLarge {
                size: bytes.len(),
                max: self.slot_size,
            });
        }

        let cursor = loop {
            let write = self.write_cursor().load(Ordering::Acquire);
            let read = self.read_cursor().load(Ordering::Acquire);
            if write == COMPACTING || write < read {
                return Ok(false);
            }
            if write - read >= self.max_size {
                return Ok(false);
            }
            if self
                .write_cursor()
                .compare_exchange_weak(write, write + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break write;
            }
        };

        let slot = self.slot_ptr(cursor);
        let tag = self.slot_tag(slot);
        let mut spins = 0;
        loop {
            let current = tag.load(Ordering::Acquire);
            if current == cursor {
                if tag
                    .compare_exchange_weak(cursor, busy_tag(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
                continue;
            }
            // The previous owner died mid-copy: take the slot over
            if is_stale_claim(current) {
                if tag
                    .compare_exchange(current, cursor, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    log::warn!("Reclaimed abandoned shared queue slot for cursor {}", cursor);
                }
                continue;
            }
            // The reader for this cursor gave up on us and skipped the slot
            if !is_busy(current) && current > cursor {
                return Ok(false);
            }
            spins += 1;
            if spins >= SLOT_WAIT_SPINS {
                log::debug!("Shared queue slot for cursor {} is still occupied", cursor);
                return Ok(false);
            }
            std::hint::spin_loop();
        }

        let expires_at = epoch_millis(SystemTime::now() + self.ttl);
        unsafe {
            (slot.add(8) as *mut u64).write_volatile(expires_at);
            (slot.add(16) as *mut u32).write_volatile(bytes.len() as u32);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.add(SLOT_HEADER_SIZE), bytes.len());
        }
        tag.store(cursor + 1, Ordering::Release);
        Ok(true)
    }

    /// Take the next record
    ///
    /// A claimed slot that expired or was never completed yields `None`; the
    /// cursor still advances past it.
    pub fn dequeue(&self) -> Option<QueuedEnvelope> {
        let cursor = loop {
            let read = self.read_cursor().load(Ordering::Acquire);
            let write = self.write_cursor().load(Ordering::Acquire);
            if write == COMPACTING || read >= write {
                return None;
            }
            if self
                .read_cursor()
                .compare_exchange_weak(read, read + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break read;
            }
        };

        let slot = self.slot_ptr(cursor);
        let tag = self.slot_tag(slot);
        let filled = cursor + 1;
        let released = cursor + self.capacity;

        let mut spins = 0;
        loop {
            let current = tag.load(Ordering::Acquire);
            if current == filled {
                if tag
                    .compare_exchange_weak(filled, busy_tag(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
                continue;
            }
            // The writer died mid-copy: the record is lost, release the slot
            if is_stale_claim(current) {
                if tag
                    .compare_exchange(current, released, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    log::warn!("Dropped half-written shared queue record {}", cursor);
                    return None;
                }
                continue;
            }
            spins += 1;
            if spins >= SLOT_WAIT_SPINS {
                // Writer never started: skip the slot so it cannot complete later
                if current == cursor
                    && tag
                        .compare_exchange(cursor, released, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    spins = 0;
                    continue;
                }
                log::debug!("Shared queue slot {} was never completed", cursor);
                return None;
            }
            std::hint::spin_loop();
        }

        let (expires_at, payload) = unsafe {
            let expires_at = (slot.add(8) as *const u64).read_volatile();
            let len = ((slot.add(16) as *const u32).read_volatile() as usize).min(self.slot_size);
            let mut payload = vec![0u8; len];
            std::ptr::copy_nonoverlapping(slot.add(SLOT_HEADER_SIZE), payload.as_mut_ptr(), len);
            (expires_at, payload)
        };
        tag.store(released, Ordering::Release);

        if epoch_millis(SystemTime::now()) > expires_at {
            log::debug!("Shared queue record {} expired before delivery", cursor);
            return None;
        }
        QueuedEnvelope::from_bytes(&payload)
    }

    /// Take up to `max` records
    pub fn dequeue_batch(&self, max: usize) -> Vec<QueuedEnvelope> {
        let mut batch = Vec::with_capacity(max.min(self.len()));
        for _ in 0..max {
            if self.is_empty() {
                break;
            }
            if let Some(envelope) = self.dequeue() {
                batch.push(envelope);
            }
        }
        batch
    }

    /// Reset both cursors to zero when the queue is empty
    ///
    /// Returns `false` without touching anything if records are pending.
    /// Producers see the queue as full for the duration of the reset.
    pub fn compact(&self) -> bool {
        let write = self.write_cursor().load(Ordering::Acquire);
        let read = self.read_cursor().load(Ordering::Acquire);
        if write == COMPACTING || write != read || write == 0 {
            return false;
        }
        if self
            .write_cursor()
            .compare_exchange(write, COMPACTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // A live participant still copying keeps the old numbering
        if !self.slots_idle() {
            self.write_cursor().store(write, Ordering::Release);
            log::debug!("Skipped compaction of {}: a slot is still in use", self.path.display());
            return false;
        }
        // Tags must line up with the restarted cursors
        self.reset_tags();

        self.read_cursor().store(0, Ordering::Release);
        self.write_cursor().store(0, Ordering::Release);
        log::debug!("Compacted shared queue {} at cursor {}", self.path.display(), write);
        true
    }

    pub fn stats(&self) -> SharedQueueStats {
        SharedQueueStats {
            path: self.path.display().to_string(),
            size: self.len() as u64,
            capacity: self.capacity,
            max_size: self.max_size,
            write_cursor: self.write_cursor().load(Ordering::Acquire),
            read_cursor: self.read_cursor().load(Ordering::Acquire),
        }
    }

    /// Dequeue up to `batch_size` records into `sink`, with one batch flush
    pub async fn flush_to(&self, sink: &dyn QueueSink, batch_size: usize) -> usize {
        let batch = self.dequeue_batch(batch_size);
        if batch.is_empty() {
            return 0;
        }
        let mut sent = 0;
        for envelope in &batch {
            match sink.send(envelope).await {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Shared queue publish to '{}' failed: {}", envelope.topic, e),
            }
        }
        if let Err(e) = sink.flush_batch().await {
            log::warn!("Shared queue batch flush failed: {}", e);
        }
        sent
    }

    /// Background worker draining the segment into `sink` until shutdown
    ///
    /// Compacts the cursors whenever it finds the queue empty.
    pub fn spawn_flush_worker(
        self: &Arc<Self>,
        sink: Arc<dyn QueueSink>,
        batch_size: usize,
        interval: Duration,
        shutdown: ShutdownCoordinator,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            loop {
                while queue.flush_to(sink.as_ref(), batch_size).await > 0 {}
                if queue.is_empty() {
                    queue.compact();
                }
                if shutdown.is_shutdown_requested() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.recv() => {}
                }
            }
            log::debug!("Shared queue worker for {} stopped", queue.path.display());
        })
    }

    /// Delete the backing file; other processes keep their mapping until they close
    pub fn remove(path: &Path) -> QueueResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::segment(path, e)),
        }
    }

    fn validate_existing(&self) -> QueueResult<()> {
        let mut spins = 0;
        while self.atomic(OFF_MAGIC).load(Ordering::Acquire) != MAGIC {
            spins += 1;
            if spins > 1_000 {
                return Err(QueueError::segment(&self.path, "not a relaybus queue segment"));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let wire_format = self.atomic(OFF_WIRE_FORMAT).load(Ordering::Relaxed);
        if wire_format != u64::from(WIRE_FORMAT_VERSION) {
            return Err(QueueError::segment(
                &self.path,
                format!(
                    "segment wire format {} does not match this build's {}",
                    wire_format, WIRE_FORMAT_VERSION
                ),
            ));
        }
        let capacity = self.atomic(OFF_CAPACITY).load(Ordering::Relaxed);
        let slot_size = self.atomic(OFF_SLOT_SIZE).load(Ordering::Relaxed) as usize;
        if capacity != self.capacity || slot_size != self.slot_size {
            return Err(QueueError::segment(
                &self.path,
                format!(
                    "segment geometry {}x{} does not match configured {}x{}",
                    capacity, slot_size, self.capacity, self.slot_size
                ),
            ));
        }
        Ok(())
    }

    /// Wait briefly for every live claim to finish; abandoned claims count as idle
    fn slots_idle(&self) -> bool {
        (0..self.capacity).all(|index| {
            let tag = self.slot_tag(self.slot_ptr(index));
            let mut spins = 0;
            loop {
                let current = tag.load(Ordering::Acquire);
                if !is_busy(current) || is_stale_claim(current) {
                    return true;
                }
                spins += 1;
                if spins >= SLOT_WAIT_SPINS {
                    return false;
                }
                std::hint::spin_loop();
            }
        })
    }

    fn reset_tags(&self) {
        for index in 0..self.capacity {
            let tag = self.slot_tag(self.slot_ptr(index));
            let mut spins = 0;
            loop {
                let current = tag.load(Ordering::Acquire);
                let settled = !is_busy(current) || is_stale_claim(current) || spins >= SLOT_WAIT_SPINS;
                if settled
                    && tag
                        .compare_exchange_weak(current, index, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    break;
                }
                spins += 1;
                std::hint::spin_loop();
            }
        }
    }

    fn atomic(&self, offset: usize) -> &AtomicU64 {
        // Offsets are 8-aligned within a page-aligned mapping
        unsafe { &*(self.base.add(offset) as *const AtomicU64) }
    }

    fn write_cursor(&self) -> &AtomicU64 {
        self.atomic(OFF_WRITE)
    }

    fn read_cursor(&self) -> &AtomicU64 {
        self.atomic(OFF_READ)
    }

    fn slot_ptr(&self, cursor: u64) -> *mut u8 {
        let index = (cursor % self.capacity) as usize;
        unsafe { self.base.add(HEADER_SIZE + index * self.slot_stride) }
    }

    fn slot_tag(&self, slot: *mut u8) -> &AtomicU64 {
        unsafe { &*(slot as *const AtomicU64) }
    }
}

fn wait_for_length(file: &std::fs::File, expected: u64, path: &Path) -> QueueResult<()> {
    for _ in 0..1_000 {
        let len = file.metadata().map_err(|e| QueueError::segment(path, e))?.len();
        if len == expected {
            return Ok(());
        }
        if len > expected {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Err(QueueError::segment(
        path,
        format!("segment size does not match the configured geometry ({} bytes)", expected),
    ))
}

/// Sink adapter so tests and tools can treat a shared queue as a producer path
pub struct SharedQueueSink(pub Arc<SharedQueue>);

#[async_trait::async_trait]
impl QueueSink for SharedQueueSink {
    async fn send(&self, envelope: &QueuedEnvelope) -> Result<(), BackendError> {
        match self.0.enqueue(envelope) {
            Ok(true) => Ok(()),
            Ok(false) => Err(BackendError::Rejected("shared queue is full".into())),
            Err(e) => Err(BackendError::Rejected(e.to_string())),
        }
    }

    async fn flush_batch(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
