//! Host block-store boundary.
//!
//! The host database owns durable storage; this module pins down the
//! contracts the index engines rely on: fixed-size pages behind per-page
//! latches, a write-ahead-log sink invoked once per page write, a tuple
//! table-scan iterator, and the row addressing scheme. [`MemStore`] is the
//! in-memory reference implementation used by bulk builds and tests.
//!
//! Page access is closure-scoped: a latch is held exactly for the duration
//! of the closure and released on unwind, so no cancellation path can leak
//! a pin.

pub use crate::config::PAGE_SIZE;

use crate::error::{Result, VexError};
use crate::vector::Vector;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::sync::Arc;

/// Logical page number within one index's store. Page 0 is always the
/// index metadata page.
pub type PageId = u32;

/// Sentinel for "no page" in chain links. Page 0 is the metadata page and
/// can never be a chain target.
pub const INVALID_PAGE: PageId = 0;

/// Opaque host row address: 48-bit block number plus 16-bit offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleId(u64);

impl TupleId {
    pub fn new(block: u64, offset: u16) -> Self {
        debug_assert!(block < (1 << 48));
        Self((block << 16) | offset as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn block(&self) -> u64 {
        self.0 >> 16
    }

    pub fn offset(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block(), self.offset())
    }
}

/// The host's table-scan iterator.
///
/// IVFFlat builds make multiple passes (sample, assign, load), so the
/// source must support [`rewind`](TupleSource::rewind).
pub trait TupleSource {
    fn next_tuple(&mut self) -> Result<Option<(TupleId, Vector)>>;

    /// Restart the scan from the first tuple.
    fn rewind(&mut self) -> Result<()>;
}

/// In-memory tuple source over an owned row set.
pub struct VecSource {
    rows: Vec<(TupleId, Vector)>,
    pos: usize,
}

impl VecSource {
    pub fn new(rows: Vec<(TupleId, Vector)>) -> Self {
        Self { rows, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl TupleSource for VecSource {
    fn next_tuple(&mut self) -> Result<Option<(TupleId, Vector)>> {
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let row = self.rows[self.pos].clone();
        self.pos += 1;
        Ok(Some(row))
    }

    fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }
}

/// WAL sink: the host logs one record per page write.
pub trait WalSink: Send + Sync {
    fn page_write(&self, page: PageId, image: &[u8]) -> Result<()>;
}

/// Reference WAL sink writing CRC32-framed records:
/// `[u32 len BE][u32 crc BE][page_id LE | image]`.
pub struct FrameWal<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> FrameWal<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> WalSink for FrameWal<W> {
    fn page_write(&self, page: PageId, image: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(4 + image.len());
        payload.extend_from_slice(&page.to_le_bytes());
        payload.extend_from_slice(image);
        let crc = crc32fast::hash(&payload);

        let mut w = self.writer.lock();
        let mut write = || -> std::io::Result<()> {
            w.write_all(&(payload.len() as u32).to_be_bytes())?;
            w.write_all(&crc.to_be_bytes())?;
            w.write_all(&payload)?;
            w.flush()
        };
        write().map_err(|e| VexError::Storage(format!("WAL append failed: {e}")))
    }
}

type PageBuf = Arc<RwLock<Vec<u8>>>;

/// In-memory paged block store with per-page latches and WAL logging.
pub struct MemStore {
    pages: RwLock<Vec<PageBuf>>,
    wal: Option<Arc<dyn WalSink>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Empty store with the metadata page (page 0) pre-allocated.
    pub fn new() -> Self {
        let store = Self {
            pages: RwLock::new(Vec::new()),
            wal: None,
        };
        store.allocate();
        store
    }

    pub fn with_wal(wal: Arc<dyn WalSink>) -> Self {
        let store = Self {
            pages: RwLock::new(Vec::new()),
            wal: Some(wal),
        };
        store.allocate();
        store
    }

    /// Allocate a zeroed page, returning its id.
    pub fn allocate(&self) -> PageId {
        let mut pages = self.pages.write();
        let id = pages.len() as PageId;
        pages.push(Arc::new(RwLock::new(vec![0u8; PAGE_SIZE])));
        id
    }

    pub fn page_count(&self) -> u32 {
        self.pages.read().len() as u32
    }

    fn page(&self, id: PageId) -> Result<PageBuf> {
        self.pages
            .read()
            .get(id as usize)
            .cloned()
            .ok_or_else(|| VexError::Storage(format!("page {id} does not exist")))
    }

    /// Pin `id` with the shared latch and run `f` over its bytes.
    pub fn with_page<R>(&self, id: PageId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let page = self.page(id)?;
        let guard = page.read();
        Ok(f(&guard))
    }

    /// Pin `id` with the exclusive latch, run `f` over its bytes, then emit
    /// one WAL record with the full page image.
    pub fn update_page<R>(&self, id: PageId, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let page = self.page(id)?;
        let mut guard = page.write();
        let out = f(&mut guard);
        if let Some(wal) = &self.wal {
            wal.page_write(id, &guard)?;
        }
        Ok(out)
    }
}

// Chained page streams: a sequential byte stream across pages, each page
// holding `[u32 next LE]` followed by payload. Used for metadata spill and
// element records that exceed one page.

const STREAM_HEADER: usize = 4;
const STREAM_CAPACITY: usize = PAGE_SIZE - STREAM_HEADER;

/// Sequential writer over a chain of pages.
pub struct PageStreamWriter<'a> {
    store: &'a MemStore,
    first: PageId,
    current: PageId,
    offset: usize,
}

impl<'a> PageStreamWriter<'a> {
    /// Begin a new chain on a freshly allocated page.
    pub fn new(store: &'a MemStore) -> Self {
        let first = store.allocate();
        Self {
            store,
            first,
            current: first,
            offset: STREAM_HEADER,
        }
    }

    /// First page of the chain, valid once writing is complete.
    pub fn first_page(&self) -> PageId {
        self.first
    }

    pub fn write_all(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            if self.offset == PAGE_SIZE {
                let next = self.store.allocate();
                let current = self.current;
                self.store.update_page(current, |data| {
                    data[0..4].copy_from_slice(&next.to_le_bytes());
                })?;
                self.current = next;
                self.offset = STREAM_HEADER;
            }
            let room = PAGE_SIZE - self.offset;
            let take = room.min(bytes.len());
            let offset = self.offset;
            self.store.update_page(self.current, |data| {
                data[offset..offset + take].copy_from_slice(&bytes[..take]);
            })?;
            self.offset += take;
            bytes = &bytes[take..];
        }
        Ok(())
    }

    /// Write a length-prefixed record.
    pub fn write_record(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.write_all(bytes)
    }
}

/// Sequential reader over a chain of pages.
pub struct PageStreamReader<'a> {
    store: &'a MemStore,
    current: PageId,
    offset: usize,
}

impl<'a> PageStreamReader<'a> {
    pub fn new(store: &'a MemStore, first: PageId) -> Self {
        Self {
            store,
            current: first,
            offset: STREAM_HEADER,
        }
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.offset == PAGE_SIZE {
                let next = self.store.with_page(self.current, |data| {
                    PageId::from_le_bytes([data[0], data[1], data[2], data[3]])
                })?;
                if next == INVALID_PAGE {
                    return Err(VexError::Storage(
                        "page stream ended before expected length".into(),
                    ));
                }
                self.current = next;
                self.offset = STREAM_HEADER;
            }
            let room = PAGE_SIZE - self.offset;
            let take = room.min(out.len() - filled);
            let offset = self.offset;
            self.store.with_page(self.current, |data| {
                out[filled..filled + take].copy_from_slice(&data[offset..offset + take]);
            })?;
            self.offset += take;
            filled += take;
        }
        Ok(())
    }

    /// Read a length-prefixed record written by
    /// [`PageStreamWriter::write_record`].
    pub fn read_record(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > self.store.page_count() as usize * PAGE_SIZE {
            return Err(VexError::Storage(format!(
                "page stream record length {len} exceeds store size"
            )));
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

// Metadata records: bincode payloads framed as `[u32 len][u32 crc][bytes]`
// at the start of a page.

/// Serialize `value` into `page` with a CRC32-guarded frame.
pub fn write_meta<T: Serialize>(store: &MemStore, page: PageId, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value)
        .map_err(|e| VexError::Storage(format!("metadata encode failed: {e}")))?;
    if bytes.len() + 8 > PAGE_SIZE {
        return Err(VexError::Storage(format!(
            "metadata record of {} bytes does not fit one page",
            bytes.len()
        )));
    }
    let crc = crc32fast::hash(&bytes);
    store.update_page(page, |data| {
        data[0..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        data[4..8].copy_from_slice(&crc.to_le_bytes());
        data[8..8 + bytes.len()].copy_from_slice(&bytes);
    })
}

/// Deserialize a metadata record written by [`write_meta`], verifying CRC32.
pub fn read_meta<T: DeserializeOwned>(store: &MemStore, page: PageId) -> Result<T> {
    let bytes = store.with_page(page, |data| {
        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len + 8 > PAGE_SIZE {
            return Err(VexError::Storage("metadata record length corrupt".into()));
        }
        let crc = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let payload = &data[8..8 + len];
        if crc32fast::hash(payload) != crc {
            return Err(VexError::Storage("metadata record CRC mismatch".into()));
        }
        Ok(payload.to_vec())
    })??;
    bincode::deserialize(&bytes)
        .map_err(|e| VexError::Storage(format!("metadata decode failed: {e}")))
}
