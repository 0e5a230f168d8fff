//! The append-only record log.
//!
//! ## Record format
//!
//! ```text
//! | structure_id (8, LE) | length (4, LE) | payload (N) | crc32 (4, LE) |
//! ```
//!
//! The address of a loggable is the byte offset of its header. The CRC
//! covers the header and payload.
//!
//! ## Recovery policy
//!
//! Forward iteration tolerates a truncated record at the tail (a crash
//! mid-write before the high address advanced) and treats it as a clean
//! end of log. A CRC mismatch on a complete record is real corruption and
//! is a hard error.

use crate::backend::LogBackend;
use crate::error::{LogError, LogResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of the per-record header: structure id (8) + payload length (4).
pub const LOGGABLE_HEADER_SIZE: usize = 12;

/// Size of the trailing checksum.
const CRC_SIZE: usize = 4;

/// Number of recently touched records kept in the read cache.
const CACHE_CAPACITY: usize = 256;

/// Computes an IEEE CRC32 checksum.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    crc ^ 0xFFFF_FFFF
}

/// One durable record in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loggable {
    /// Byte offset of the record header.
    pub address: u64,
    /// Identity of the tree this record belongs to.
    pub structure_id: u64,
    /// Record payload.
    pub data: Vec<u8>,
}

impl Loggable {
    /// Returns the on-disk footprint of a record with a payload of
    /// `payload_len` bytes.
    #[must_use]
    pub fn encoded_len_for(payload_len: usize) -> u64 {
        (LOGGABLE_HEADER_SIZE + payload_len + CRC_SIZE) as u64
    }

    /// Returns the total on-disk footprint of the record in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        Self::encoded_len_for(self.data.len())
    }
}

struct CachedRecord {
    structure_id: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct RecordCache {
    records: HashMap<u64, CachedRecord>,
    order: VecDeque<u64>,
}

impl RecordCache {
    fn insert(&mut self, address: u64, structure_id: u64, data: Vec<u8>) {
        if self.records.contains_key(&address) {
            return;
        }
        while self.order.len() >= CACHE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.records.remove(&evicted);
            }
        }
        self.records.insert(address, CachedRecord { structure_id, data });
        self.order.push_back(address);
    }

    fn get(&self, address: u64) -> Option<&CachedRecord> {
        self.records.get(&address)
    }

    fn evict_from(&mut self, address: u64) {
        self.records.retain(|&addr, _| addr < address);
        self.order.retain(|&addr| addr < address);
    }

    fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }
}

struct LogInner {
    backend: Box<dyn LogBackend>,
    high: u64,
    closed: bool,
}

impl LogInner {
    fn check_open(&self) -> LogResult<()> {
        if self.closed {
            Err(LogError::Closed)
        } else {
            Ok(())
        }
    }
}

/// An append-only log of checksummed records.
///
/// The log is internally synchronized: appends serialize on an internal
/// lock while reads of already durable records go through a small cache.
/// The high address only moves backwards through [`Log::set_high_address`],
/// which the environment uses to roll back a failed commit.
pub struct Log {
    inner: Mutex<LogInner>,
    cache: Mutex<RecordCache>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Log {
    /// Opens a log over `backend`, taking its current size as the high
    /// address.
    pub fn new(backend: Box<dyn LogBackend>) -> LogResult<Self> {
        let high = backend.len()?;
        Ok(Self {
            inner: Mutex::new(LogInner {
                backend,
                high,
                closed: false,
            }),
            cache: Mutex::new(RecordCache::default()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Appends a loggable and returns its address.
    ///
    /// The record is durable (backend flushed) before this returns. On
    /// failure the high address is unchanged.
    pub fn append(&self, structure_id: u64, payload: &[u8]) -> LogResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let mut record = Vec::with_capacity(LOGGABLE_HEADER_SIZE + payload.len() + CRC_SIZE);
        record.extend_from_slice(&structure_id.to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(payload);
        let crc = compute_crc32(&record);
        record.extend_from_slice(&crc.to_le_bytes());

        let address = inner.backend.append(&record)?;
        inner.backend.flush()?;
        inner.high = address + record.len() as u64;

        self.cache
            .lock()
            .insert(address, structure_id, payload.to_vec());
        Ok(address)
    }

    /// Reads the loggable at `address`.
    pub fn read(&self, address: u64) -> LogResult<Loggable> {
        if let Some(cached) = self.cache.lock().get(address) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Loggable {
                address,
                structure_id: cached.structure_id,
                data: cached.data.clone(),
            });
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let inner = self.inner.lock();
        inner.check_open()?;
        let record = read_record(&*inner.backend, address, inner.high)?
            .ok_or_else(|| LogError::corrupt(address, "record extends past high address"))?;
        drop(inner);

        self.cache
            .lock()
            .insert(address, record.structure_id, record.data.clone());
        Ok(record)
    }

    /// Returns one past the last durable byte.
    pub fn high_address(&self) -> u64 {
        self.inner.lock().high
    }

    /// Rolls the log back so that `address` is the new high address.
    ///
    /// Used exclusively to undo a partially performed commit. Records at
    /// or past `address` are discarded, including any cached copies.
    pub fn set_high_address(&self, address: u64) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if address > inner.high {
            return Err(LogError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot advance high address from {} to {}", inner.high, address),
            )));
        }
        inner.backend.truncate(address)?;
        inner.high = address;
        self.cache.lock().evict_from(address);
        Ok(())
    }

    /// Discards all records.
    pub fn clear(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.backend.truncate(0)?;
        inner.high = 0;
        self.cache.lock().clear();
        Ok(())
    }

    /// Flushes pending writes to durable storage.
    pub fn flush(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.backend.flush()
    }

    /// Closes the log. Subsequent operations fail with [`LogError::Closed`].
    ///
    /// Closing an already closed log is a no-op.
    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.backend.flush()?;
        inner.closed = true;
        Ok(())
    }

    /// Returns true until [`Log::close`] has been called.
    pub fn is_open(&self) -> bool {
        !self.inner.lock().closed
    }

    /// Fraction of reads served from the record cache, in `[0, 1]`.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let misses = self.cache_misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Iterates over all loggables from the start of the log.
    pub fn iter(&self) -> LogIterator<'_> {
        self.iter_from(0)
    }

    /// Iterates over loggables starting at `address`.
    pub fn iter_from(&self, address: u64) -> LogIterator<'_> {
        LogIterator {
            log: self,
            next: address,
        }
    }

    /// Returns the last loggable carrying `structure_id`, scanning forward.
    pub fn last_loggable_with_id(&self, structure_id: u64) -> LogResult<Option<Loggable>> {
        let mut found = None;
        for result in self.iter() {
            let loggable = result?;
            if loggable.structure_id == structure_id {
                found = Some(loggable);
            }
        }
        Ok(found)
    }

    /// Reads a record tolerantly: a truncated tail yields `None`.
    fn read_tolerant(&self, address: u64) -> LogResult<Option<Loggable>> {
        let inner = self.inner.lock();
        inner.check_open()?;
        read_record(&*inner.backend, address, inner.high)
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("high_address", &self.high_address())
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Parses the record at `address`, returning `None` when the record does
/// not fit below `high` (truncated tail).
fn read_record(backend: &dyn LogBackend, address: u64, high: u64) -> LogResult<Option<Loggable>> {
    let header_end = address + LOGGABLE_HEADER_SIZE as u64;
    if header_end > high {
        return Ok(None);
    }
    let header = backend.read_at(address, LOGGABLE_HEADER_SIZE)?;
    let structure_id = u64::from_le_bytes(header[0..8].try_into().unwrap_or([0; 8]));
    let len = u32::from_le_bytes(header[8..12].try_into().unwrap_or([0; 4])) as usize;

    let total = LOGGABLE_HEADER_SIZE + len + CRC_SIZE;
    if address + total as u64 > high {
        return Ok(None);
    }

    let body = backend.read_at(header_end, len + CRC_SIZE)?;
    let (payload, crc_bytes) = body.split_at(len);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap_or([0; 4]));

    let mut checked = Vec::with_capacity(LOGGABLE_HEADER_SIZE + len);
    checked.extend_from_slice(&header);
    checked.extend_from_slice(payload);
    if compute_crc32(&checked) != stored_crc {
        return Err(LogError::corrupt(address, "checksum mismatch"));
    }

    Ok(Some(Loggable {
        address,
        structure_id,
        data: payload.to_vec(),
    }))
}

/// Forward iterator over log records.
pub struct LogIterator<'a> {
    log: &'a Log,
    next: u64,
}

impl Iterator for LogIterator<'_> {
    type Item = LogResult<Loggable>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.log.read_tolerant(self.next) {
            Ok(Some(loggable)) => {
                self.next = loggable.address + loggable.encoded_len();
                Some(Ok(loggable))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn create_log() -> Log {
        Log::new(Box::new(MemoryBackend::new())).unwrap()
    }

    #[test]
    fn crc32_known_vector() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn append_then_read() {
        let log = create_log();
        let addr = log.append(7, b"payload").unwrap();
        let loggable = log.read(addr).unwrap();
        assert_eq!(loggable.structure_id, 7);
        assert_eq!(loggable.data, b"payload");
        assert_eq!(loggable.address, addr);
    }

    #[test]
    fn high_address_advances_per_record() {
        let log = create_log();
        assert_eq!(log.high_address(), 0);
        let addr = log.append(1, b"abc").unwrap();
        let expected = addr + (LOGGABLE_HEADER_SIZE + 3 + CRC_SIZE) as u64;
        assert_eq!(log.high_address(), expected);
    }

    #[test]
    fn set_high_address_discards_tail_records() {
        let log = create_log();
        log.append(1, b"keep").unwrap();
        let mark = log.high_address();
        let second = log.append(1, b"drop").unwrap();

        log.set_high_address(mark).unwrap();
        assert_eq!(log.high_address(), mark);
        // The rolled-back record is gone, cache included.
        assert!(log.read(second).is_err());
        assert_eq!(log.iter().count(), 1);
    }

    #[test]
    fn set_high_address_cannot_grow() {
        let log = create_log();
        log.append(1, b"x").unwrap();
        let high = log.high_address();
        assert!(log.set_high_address(high + 10).is_err());
    }

    #[test]
    fn clear_resets_everything() {
        let log = create_log();
        log.append(1, b"data").unwrap();
        log.clear().unwrap();
        assert_eq!(log.high_address(), 0);
        assert_eq!(log.iter().count(), 0);
    }

    #[test]
    fn iterates_in_append_order() {
        let log = create_log();
        for i in 0..5u64 {
            log.append(i + 1, &[i as u8]).unwrap();
        }
        let ids: Vec<u64> = log
            .iter()
            .map(|r| r.unwrap().structure_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn last_loggable_with_id_finds_newest() {
        let log = create_log();
        log.append(9, b"old").unwrap();
        log.append(3, b"other").unwrap();
        let newest = log.append(9, b"new").unwrap();

        let found = log.last_loggable_with_id(9).unwrap().unwrap();
        assert_eq!(found.address, newest);
        assert_eq!(found.data, b"new");
        assert!(log.last_loggable_with_id(42).unwrap().is_none());
    }

    #[test]
    fn truncated_tail_is_clean_end() {
        let log = create_log();
        log.append(1, b"whole").unwrap();
        let addr2 = log.append(1, b"partial").unwrap();

        // Chop the second record in half, as a crash mid-write would.
        log.set_high_address(addr2 + 3).unwrap();

        let records: Vec<_> = log.iter().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, b"whole");
    }

    #[test]
    fn corrupt_record_is_hard_error() {
        let mut backend = MemoryBackend::new();
        // A complete record with a bad checksum.
        let mut record = Vec::new();
        record.extend_from_slice(&1u64.to_le_bytes());
        record.extend_from_slice(&2u32.to_le_bytes());
        record.extend_from_slice(b"ab");
        record.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        backend.append(&record).unwrap();

        let log = Log::new(Box::new(backend)).unwrap();
        assert!(matches!(log.read(0), Err(LogError::Corrupt { .. })));
        assert!(log.iter().next().unwrap().is_err());
    }

    #[test]
    fn cache_hit_rate_reflects_reads() {
        let log = create_log();
        let addr = log.append(1, b"cached").unwrap();
        assert_eq!(log.cache_hit_rate(), 0.0);

        // Appended records are cached, so the first read already hits.
        log.read(addr).unwrap();
        log.read(addr).unwrap();
        assert!(log.cache_hit_rate() > 0.99);
    }

    #[test]
    fn closed_log_rejects_operations() {
        let log = create_log();
        log.append(1, b"x").unwrap();
        log.close().unwrap();

        assert!(matches!(log.append(1, b"y"), Err(LogError::Closed)));
        assert!(matches!(log.set_high_address(0), Err(LogError::Closed)));
        assert!(!log.is_open());
        // Closing twice is a no-op.
        log.close().unwrap();
    }

    #[test]
    fn reopen_over_existing_bytes() {
        let mut backend = MemoryBackend::new();
        {
            let log = Log::new(Box::new(MemoryBackend::new())).unwrap();
            log.append(5, b"persisted").unwrap();
            // Copy bytes into the backend we reopen from.
            let inner = log.inner.lock();
            let len = inner.backend.len().unwrap();
            let bytes = inner.backend.read_at(0, len as usize).unwrap();
            backend.append(&bytes).unwrap();
        }

        let reopened = Log::new(Box::new(backend)).unwrap();
        let records: Vec<_> = reopened.iter().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].structure_id, 5);
        assert_eq!(records[0].data, b"persisted");
    }
}
