//! Inverted File with Flat storage (IVFFlat) index.
//!
//! Vectors are partitioned into `lists` clusters by k-means over a training
//! sample; each cluster's members live in a chain of fixed-size list pages
//! holding verbatim `(tuple_id, vector)` entries. Queries probe the nearest
//! `probes` centroids and scan only those chains.
//!
//! Page layout: page 0 is the metadata record; a chain of directory pages
//! packs one `(head, tail, centroid)` record per list; list pages follow,
//! allocated lazily as lists grow.

/// Build pipeline: sampling, training, assignment, loading.
mod build;
/// k-means++ seeding and Elkan-accelerated Lloyd training.
mod kmeans;
/// Probe-based search.
mod scan;

use crate::config;
use crate::error::{Result, VexError};
use crate::progress::ProgressSink;
use crate::scan::OrderedHits;
use crate::session::{InterruptFlag, MaintenanceBudget, SearchOptions};
use crate::store::{MemStore, PageId, TupleId, TupleSource, INVALID_PAGE, PAGE_SIZE};
use crate::vector::distance::Distance;
use crate::vector::Vector;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(crate) const IVF_META_MAGIC: u32 = 0x4956_4631; // "IVF1"

/// Build-time options for an IVFFlat index.
#[derive(Debug, Clone)]
pub struct IvfOptions {
    /// Number of inverted lists, `[1, 32768]`.
    pub lists: usize,
    /// Distance kind bound to the index.
    pub distance: Distance,
    /// Fixed RNG seed for reproducible training; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for IvfOptions {
    fn default() -> Self {
        Self {
            lists: config::IVF_DEFAULT_LISTS,
            distance: Distance::L2,
            seed: None,
        }
    }
}

impl IvfOptions {
    pub fn validate(&self) -> Result<()> {
        if self.lists < config::IVF_MIN_LISTS || self.lists > config::IVF_MAX_LISTS {
            return Err(VexError::bad_input(format!(
                "lists must be between {} and {}",
                config::IVF_MIN_LISTS,
                config::IVF_MAX_LISTS
            )));
        }
        Ok(())
    }
}

/// Metadata record on page 0.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IvfMeta {
    pub magic: u32,
    pub version: u16,
    pub dim: u16,
    pub lists: u32,
    pub distance: Distance,
    pub directory_head: PageId,
    pub tuples: u64,
}

// List pages: `[u32 next][u16 count][2 pad]` then fixed-size entries of
// `[u64 tuple_id][dim × f32]`, all little-endian.
const LIST_PAGE_HEADER: usize = 8;

#[inline]
pub(crate) fn entry_size(dim: usize) -> usize {
    8 + dim * 4
}

#[inline]
pub(crate) fn list_page_capacity(dim: usize) -> usize {
    (PAGE_SIZE - LIST_PAGE_HEADER) / entry_size(dim)
}

#[inline]
pub(crate) fn page_next(data: &[u8]) -> PageId {
    PageId::from_le_bytes([data[0], data[1], data[2], data[3]])
}

#[inline]
pub(crate) fn page_count_entries(data: &[u8]) -> usize {
    u16::from_le_bytes([data[4], data[5]]) as usize
}

pub(crate) fn write_entry(data: &mut [u8], slot: usize, dim: usize, tid: TupleId, v: &[f32]) {
    let off = LIST_PAGE_HEADER + slot * entry_size(dim);
    data[off..off + 8].copy_from_slice(&tid.raw().to_le_bytes());
    let mut pos = off + 8;
    for x in v {
        data[pos..pos + 4].copy_from_slice(&x.to_le_bytes());
        pos += 4;
    }
}

pub(crate) fn read_entry(data: &[u8], slot: usize, dim: usize, out: &mut Vec<f32>) -> TupleId {
    let off = LIST_PAGE_HEADER + slot * entry_size(dim);
    let tid = TupleId::from_raw(u64::from_le_bytes(
        data[off..off + 8].try_into().expect("entry header in bounds"),
    ));
    out.clear();
    let mut pos = off + 8;
    for _ in 0..dim {
        out.push(f32::from_le_bytes(
            data[pos..pos + 4].try_into().expect("entry body in bounds"),
        ));
        pos += 4;
    }
    tid
}

// Directory pages: `[u32 next][u16 count][2 pad]` then per-list records of
// `[u32 head][u32 tail][dim × f32 centroid]`.
const DIR_PAGE_HEADER: usize = 8;

#[inline]
fn dir_entry_size(dim: usize) -> usize {
    8 + dim * 4
}

#[inline]
fn dir_page_capacity(dim: usize) -> usize {
    ((PAGE_SIZE - DIR_PAGE_HEADER) / dir_entry_size(dim)).max(1)
}

/// An IVFFlat index over a host page store.
pub struct IvfIndex {
    store: Arc<MemStore>,
    dim: usize,
    lists: usize,
    distance: Distance,
    /// Centroid table, frozen after build. `lists × dim`, row-major.
    centroids: Vec<f32>,
    /// First data page per list; `INVALID_PAGE` until the first insert.
    heads: Vec<Mutex<PageId>>,
    /// Tail latch per list: serializes appends to the list's last page.
    tails: Vec<Mutex<PageId>>,
    /// Directory chain, in list order.
    dir_pages: Vec<PageId>,
}

impl IvfIndex {
    /// Build a new index from a tuple source. See [`build`](module) docs for
    /// the pipeline; `workers > 1` parallelizes the loading pass.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        store: Arc<MemStore>,
        dim: usize,
        options: &IvfOptions,
        source: &mut dyn TupleSource,
        budget: &MaintenanceBudget,
        interrupt: &InterruptFlag,
        progress: Arc<dyn ProgressSink>,
        workers: usize,
    ) -> Result<IvfIndex> {
        build::build(store, dim, options, source, budget, interrupt, progress, workers)
    }

    /// Open an existing index from its pages.
    pub fn open(store: Arc<MemStore>) -> Result<IvfIndex> {
        let meta: IvfMeta = crate::store::read_meta(&store, 0)?;
        if meta.magic != IVF_META_MAGIC {
            return Err(VexError::Storage("not an IVFFlat index".into()));
        }
        let dim = meta.dim as usize;
        let lists = meta.lists as usize;
        let per_page = dir_page_capacity(dim);

        let mut centroids = vec![0.0f32; lists * dim];
        let mut heads = Vec::with_capacity(lists);
        let mut tails = Vec::with_capacity(lists);
        let mut dir_pages = Vec::new();

        let mut page = meta.directory_head;
        let mut list = 0usize;
        while page != INVALID_PAGE && list < lists {
            dir_pages.push(page);
            let in_page = per_page.min(lists - list);
            page = store.with_page(page, |data| {
                for slot in 0..in_page {
                    let off = DIR_PAGE_HEADER + slot * dir_entry_size(dim);
                    let head = PageId::from_le_bytes(
                        data[off..off + 4].try_into().expect("dir head in bounds"),
                    );
                    let tail = PageId::from_le_bytes(
                        data[off + 4..off + 8].try_into().expect("dir tail in bounds"),
                    );
                    heads.push(Mutex::new(head));
                    tails.push(Mutex::new(tail));
                    let mut pos = off + 8;
                    for d in 0..dim {
                        centroids[(list + slot) * dim + d] = f32::from_le_bytes(
                            data[pos..pos + 4].try_into().expect("dir centroid in bounds"),
                        );
                        pos += 4;
                    }
                }
                page_next(data)
            })?;
            list += in_page;
        }
        if list != lists {
            return Err(VexError::Storage(format!(
                "directory chain holds {list} of {lists} lists"
            )));
        }

        Ok(IvfIndex {
            store,
            dim,
            lists,
            distance: meta.distance,
            centroids,
            heads,
            tails,
            dir_pages,
        })
    }

    pub fn dims(&self) -> usize {
        self.dim
    }

    pub fn lists(&self) -> usize {
        self.lists
    }

    pub fn distance(&self) -> Distance {
        self.distance
    }

    pub(crate) fn store(&self) -> &MemStore {
        &self.store
    }

    pub(crate) fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    pub(crate) fn head(&self, list: usize) -> PageId {
        *self.heads[list].lock()
    }

    /// Insert one `(tuple, vector)` pair into the nearest centroid's list.
    pub fn insert(&self, tid: TupleId, vector: &Vector) -> Result<()> {
        if vector.dims() != self.dim {
            return Err(VexError::DimensionMismatch {
                expected: self.dim,
                actual: vector.dims(),
            });
        }
        let list = kmeans::nearest_centroid(
            &self.centroids,
            self.dim,
            vector.as_slice(),
            self.distance,
        );
        self.append(list, tid, vector.as_slice())
    }

    /// Append an entry to `list`'s tail page under the list's tail latch,
    /// allocating and chaining a new page when the tail is full.
    pub(crate) fn append(&self, list: usize, tid: TupleId, v: &[f32]) -> Result<()> {
        let capacity = list_page_capacity(self.dim);
        let mut tail = self.tails[list].lock();

        if *tail == INVALID_PAGE {
            let page = self.store.allocate();
            self.store.update_page(page, |data| {
                data[0..4].copy_from_slice(&INVALID_PAGE.to_le_bytes());
                data[4..6].copy_from_slice(&0u16.to_le_bytes());
            })?;
            *self.heads[list].lock() = page;
            *tail = page;
            self.write_dir_pointers(list, page, page)?;
        }

        let count = self.store.with_page(*tail, |data| page_count_entries(data))?;
        let target = if count < capacity {
            *tail
        } else {
            let page = self.store.allocate();
            self.store.update_page(page, |data| {
                data[0..4].copy_from_slice(&INVALID_PAGE.to_le_bytes());
                data[4..6].copy_from_slice(&0u16.to_le_bytes());
            })?;
            let prev = *tail;
            self.store.update_page(prev, |data| {
                data[0..4].copy_from_slice(&page.to_le_bytes());
            })?;
            *tail = page;
            self.write_dir_pointers(list, *self.heads[list].lock(), page)?;
            page
        };

        let slot = self.store.with_page(target, |data| page_count_entries(data))?;
        self.store.update_page(target, |data| {
            write_entry(data, slot, self.dim, tid, v);
            data[4..6].copy_from_slice(&((slot + 1) as u16).to_le_bytes());
        })?;
        Ok(())
    }

    /// Rewrite `list`'s head/tail pointers in its directory record.
    fn write_dir_pointers(&self, list: usize, head: PageId, tail: PageId) -> Result<()> {
        let per_page = dir_page_capacity(self.dim);
        let page = self.dir_pages[list / per_page];
        let off = DIR_PAGE_HEADER + (list % per_page) * dir_entry_size(self.dim);
        self.store.update_page(page, |data| {
            data[off..off + 4].copy_from_slice(&head.to_le_bytes());
            data[off + 4..off + 8].copy_from_slice(&tail.to_le_bytes());
        })
    }

    /// Write the directory chain for a fresh index: centroids with empty
    /// list pointers. Returns the chain head and the pages in order.
    pub(crate) fn write_directory(
        store: &MemStore,
        dim: usize,
        centroids: &[f32],
    ) -> Result<(PageId, Vec<PageId>)> {
        let lists = centroids.len() / dim;
        let per_page = dir_page_capacity(dim);
        let page_count = lists.div_ceil(per_page);
        let pages: Vec<PageId> = (0..page_count).map(|_| store.allocate()).collect();

        for (pi, &page) in pages.iter().enumerate() {
            let first = pi * per_page;
            let in_page = per_page.min(lists - first);
            let next = pages.get(pi + 1).copied().unwrap_or(INVALID_PAGE);
            store.update_page(page, |data| {
                data[0..4].copy_from_slice(&next.to_le_bytes());
                data[4..6].copy_from_slice(&(in_page as u16).to_le_bytes());
                for slot in 0..in_page {
                    let off = DIR_PAGE_HEADER + slot * dir_entry_size(dim);
                    data[off..off + 4].copy_from_slice(&INVALID_PAGE.to_le_bytes());
                    data[off + 4..off + 8].copy_from_slice(&INVALID_PAGE.to_le_bytes());
                    let mut pos = off + 8;
                    for d in 0..dim {
                        let x = centroids[(first + slot) * dim + d];
                        data[pos..pos + 4].copy_from_slice(&x.to_le_bytes());
                        pos += 4;
                    }
                }
            })?;
        }
        Ok((pages.first().copied().unwrap_or(INVALID_PAGE), pages))
    }

    /// Distance-ordered scan of the `probes` nearest lists.
    pub fn search(
        &self,
        query: &Vector,
        options: &SearchOptions,
        interrupt: &InterruptFlag,
    ) -> Result<OrderedHits> {
        scan::search(self, query, options, interrupt)
    }

    /// Number of entries currently stored in `list`.
    #[cfg(test)]
    pub(crate) fn list_len(&self, list: usize) -> Result<usize> {
        let mut total = 0usize;
        let mut page = self.head(list);
        while page != INVALID_PAGE {
            let (count, next) =
                self.store.with_page(page, |data| (page_count_entries(data), page_next(data)))?;
            total += count;
            page = next;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullSink;

    fn gaussian_rows(n: usize, dim: usize, seed: u64) -> Vec<(TupleId, Vector)> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
                (TupleId::new(i as u64, 1), Vector::new(v).unwrap())
            })
            .collect()
    }

    fn build_small(lists: usize, rows: Vec<(TupleId, Vector)>, dim: usize) -> IvfIndex {
        let mut source = crate::store::VecSource::new(rows);
        IvfIndex::build(
            Arc::new(MemStore::new()),
            dim,
            &IvfOptions {
                lists,
                distance: Distance::L2,
                seed: Some(7),
            },
            &mut source,
            &MaintenanceBudget::default_limit(),
            &InterruptFlag::new(),
            Arc::new(NullSink),
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_entry_codec_round_trip() {
        let mut page = vec![0u8; PAGE_SIZE];
        let v = [1.5f32, -2.25, 3.0];
        write_entry(&mut page, 2, 3, TupleId::new(9, 4), &v);
        let mut out = Vec::new();
        let tid = read_entry(&page, 2, 3, &mut out);
        assert_eq!(tid, TupleId::new(9, 4));
        assert_eq!(out, v);
    }

    #[test]
    fn test_page_capacity_large_dim() {
        // A 2000-dim entry is 8008 bytes: exactly one per page
        assert_eq!(list_page_capacity(2000), 1);
        assert!(list_page_capacity(3) > 500);
    }

    #[test]
    fn test_build_and_open_round_trip() {
        let rows = gaussian_rows(200, 4, 3);
        let index = build_small(4, rows, 4);
        let store = index.store.clone();

        let reopened = IvfIndex::open(store).unwrap();
        assert_eq!(reopened.dims(), 4);
        assert_eq!(reopened.lists(), 4);
        assert_eq!(reopened.distance(), Distance::L2);
        assert_eq!(reopened.centroids(), index.centroids());
        let total: usize = (0..4).map(|l| reopened.list_len(l).unwrap()).sum();
        assert_eq!(total, 200);
    }

    #[test]
    fn test_insert_appends_and_chains_pages() {
        let index = build_small(1, gaussian_rows(3, 3, 1), 3);
        let capacity = list_page_capacity(3);
        // Overflow the first page
        for i in 0..capacity + 10 {
            index
                .insert(
                    TupleId::new(1000 + i as u64, 1),
                    &Vector::from_slice(&[0.1, 0.2, 0.3]).unwrap(),
                )
                .unwrap();
        }
        assert_eq!(index.list_len(0).unwrap(), 3 + capacity + 10);
    }

    #[test]
    fn test_insert_rejects_dimension_mismatch() {
        let index = build_small(2, gaussian_rows(10, 3, 1), 3);
        let bad = Vector::from_slice(&[1.0, 2.0]).unwrap();
        assert!(matches!(
            index.insert(TupleId::new(1, 1), &bad),
            Err(VexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_build_then_insert() {
        let index = build_small(4, Vec::new(), 3);
        assert_eq!((0..4).map(|l| index.list_len(l).unwrap()).sum::<usize>(), 0);
        index
            .insert(TupleId::new(1, 1), &Vector::from_slice(&[1.0, 0.0, 0.0]).unwrap())
            .unwrap();
        assert_eq!((0..4).map(|l| index.list_len(l).unwrap()).sum::<usize>(), 1);
    }

    #[test]
    fn test_options_validation() {
        let opts = IvfOptions {
            lists: 0,
            ..IvfOptions::default()
        };
        assert!(opts.validate().is_err());
        let opts = IvfOptions {
            lists: config::IVF_MAX_LISTS + 1,
            ..IvfOptions::default()
        };
        assert!(opts.validate().is_err());
        assert!(IvfOptions::default().validate().is_ok());
    }
}
