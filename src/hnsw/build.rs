//! HNSW index build, persistence, and search entry points.
//!
//! Bulk build loads every vector into the budgeted pool first (`loading
//! tuples`, with the one-time disk-fallback notice when the arena budget
//! runs out), then links elements — serially, or striped across workers
//! that all run the single-element linking path and meet at a barrier
//! before the graph is flushed to pages.

use crate::error::{Result, VexError};
use crate::hnsw::graph::{ElementId, EntryPoint, HnswGraph, HnswOptions};
use crate::hnsw::search::knn_search;
use crate::progress::{BuildPhase, ProgressCounter, ProgressSink};
use crate::scan::OrderedHits;
use crate::session::{InterruptFlag, MaintenanceBudget, SearchOptions};
use crate::store::{
    MemStore, PageId, PageStreamReader, PageStreamWriter, TupleId, TupleSource,
};
use crate::vector::distance::Distance;
use crate::vector::Vector;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Barrier};

pub(crate) const HNSW_META_MAGIC: u32 = 0x484e_5331; // "HNS1"

/// Metadata record on page 0.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct HnswMeta {
    pub magic: u32,
    pub version: u16,
    pub dim: u16,
    pub m: u32,
    pub ef_construction: u32,
    pub distance: Distance,
    pub count: u64,
    /// `(element id, level)` of the entry point.
    pub entry: Option<(u32, u8)>,
    pub elements_page: PageId,
}

/// One element as stored in the page chain.
#[derive(Debug, Serialize, Deserialize)]
struct ElementRecord {
    tuple: u64,
    level: u8,
    neighbors: Vec<Vec<ElementId>>,
    vector: Vec<f32>,
}

/// An HNSW index over a host page store.
pub struct HnswIndex {
    graph: HnswGraph,
    store: Arc<MemStore>,
}

impl HnswIndex {
    /// Build a new index from a tuple source. `workers > 1` parallelizes
    /// the linking pass.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        store: Arc<MemStore>,
        dim: usize,
        options: &HnswOptions,
        source: &mut dyn TupleSource,
        budget: &MaintenanceBudget,
        interrupt: &InterruptFlag,
        progress: Arc<dyn ProgressSink>,
        workers: usize,
    ) -> Result<HnswIndex> {
        progress.phase(BuildPhase::Initializing);
        let mut graph = HnswGraph::new(dim, options.clone())?;

        progress.phase(BuildPhase::LoadingTuples);
        let mut loaded = 0u64;
        while let Some((tid, vector)) = source.next_tuple()? {
            if loaded % crate::config::INTERRUPT_CHECK_OPS as u64 == 0 {
                interrupt.check()?;
            }
            graph.append_element(tid, vector.as_slice(), budget)?;
            loaded += 1;
        }

        let counter = ProgressCounter::new(progress, loaded);
        let total = graph.len();
        if workers <= 1 {
            for id in 0..total as ElementId {
                interrupt.check()?;
                graph.link(id, interrupt)?;
                counter.advance(1);
            }
        } else {
            link_parallel(&graph, interrupt, &counter, workers)?;
        }

        let index = HnswIndex { graph, store };
        index.flush()?;
        Ok(index)
    }

    /// Open an existing index from its pages, revalidating the graph.
    pub fn open(store: Arc<MemStore>) -> Result<HnswIndex> {
        let meta: HnswMeta = crate::store::read_meta(&store, 0)?;
        if meta.magic != HNSW_META_MAGIC {
            return Err(VexError::Storage("not an hnsw index".into()));
        }
        let options = HnswOptions {
            m: meta.m as usize,
            ef_construction: meta.ef_construction as usize,
            distance: meta.distance,
            seed: None,
        };
        let mut graph = HnswGraph::new(meta.dim as usize, options)?;

        // Reloading reads the index's own pages; the build-time budget does
        // not apply.
        let budget = MaintenanceBudget::new(usize::MAX / 2);
        let mut reader = PageStreamReader::new(&store, meta.elements_page);
        for _ in 0..meta.count {
            let record: ElementRecord = bincode::deserialize(&reader.read_record()?)
                .map_err(|e| VexError::Storage(format!("element record decode failed: {e}")))?;
            graph.append_loaded(
                TupleId::from_raw(record.tuple),
                &record.vector,
                record.level as usize,
                record.neighbors,
                &budget,
            )?;
        }
        if let Some((id, level)) = meta.entry {
            graph.restore_entry(EntryPoint {
                id,
                level: level as usize,
            });
        }
        graph
            .validate()
            .map_err(|e| VexError::Storage(format!("hnsw graph invalid after load: {e}")))?;
        Ok(HnswIndex { graph, store })
    }

    /// Write the graph to the page store: element records into a fresh page
    /// chain, then the metadata record with the entry reference.
    pub fn flush(&self) -> Result<()> {
        let mut writer = PageStreamWriter::new(&self.store);
        let elements_page = writer.first_page();
        for id in 0..self.graph.len() as ElementId {
            let record = ElementRecord {
                tuple: self.graph.tuple(id).raw(),
                level: self.graph.level(id) as u8,
                neighbors: self.graph.neighbors[id as usize].read().clone(),
                vector: self.graph.vector(id).to_vec(),
            };
            let bytes = bincode::serialize(&record)
                .map_err(|e| VexError::Storage(format!("element record encode failed: {e}")))?;
            writer.write_record(&bytes)?;
        }

        let entry = self
            .graph
            .entry_point()
            .map(|e| (e.id, e.level as u8));
        crate::store::write_meta(
            &self.store,
            0,
            &HnswMeta {
                magic: HNSW_META_MAGIC,
                version: 1,
                dim: self.graph.dims() as u16,
                m: self.graph.options().m as u32,
                ef_construction: self.graph.options().ef_construction as u32,
                distance: self.graph.distance(),
                count: self.graph.len() as u64,
                entry,
                elements_page,
            },
        )
    }

    /// Insert one `(tuple, vector)` pair and persist the updated graph.
    pub fn insert(
        &mut self,
        tid: TupleId,
        vector: &Vector,
        budget: &MaintenanceBudget,
        interrupt: &InterruptFlag,
    ) -> Result<()> {
        self.graph.insert(tid, vector, budget, interrupt)?;
        self.flush()
    }

    /// Top-`k` nearest tuples in ascending distance order. The layer-0 beam
    /// is `max(ef_search, k)`; an empty index yields an empty stream.
    pub fn search(
        &self,
        query: &Vector,
        k: usize,
        options: &SearchOptions,
        interrupt: &InterruptFlag,
    ) -> Result<OrderedHits> {
        if query.dims() != self.graph.dims() {
            return Err(VexError::DimensionMismatch {
                expected: self.graph.dims(),
                actual: query.dims(),
            });
        }
        let found = knn_search(
            &self.graph,
            query.as_slice(),
            k,
            options.ef_search,
            interrupt,
        )?;
        let hits = found
            .into_iter()
            .map(|(d, id)| (d, self.graph.tuple(id)))
            .collect();
        Ok(OrderedHits::from_compare(hits, self.graph.distance()))
    }

    pub fn dims(&self) -> usize {
        self.graph.dims()
    }

    pub fn distance(&self) -> Distance {
        self.graph.distance()
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Structural invariant check, surfaced for tests and recovery.
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.graph.validate()
    }
}

/// Striped parallel linking: worker `w` links elements `w, w + workers,
/// w + 2·workers, …`, all through the shared per-element latches. Every
/// worker reaches the barrier before the leader returns to finalization;
/// the first worker error is re-raised on the leader.
fn link_parallel(
    graph: &HnswGraph,
    interrupt: &InterruptFlag,
    counter: &ProgressCounter,
    workers: usize,
) -> Result<()> {
    let total = graph.len();
    let failure: Mutex<Option<VexError>> = Mutex::new(None);
    let barrier = Barrier::new(workers + 1);

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let graph = &*graph;
            let failure = &failure;
            let barrier = &barrier;
            let counter = &*counter;
            let interrupt = interrupt.clone();
            scope.spawn(move || {
                let mut id = worker;
                while id < total {
                    if failure.lock().is_some() {
                        break;
                    }
                    let outcome = interrupt
                        .check()
                        .and_then(|_| graph.link(id as ElementId, &interrupt));
                    if let Err(e) = outcome {
                        let mut slot = failure.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        break;
                    }
                    counter.advance(1);
                    id += workers;
                }
                barrier.wait();
            });
        }
        // Finalization is gated on every worker reaching the barrier
        barrier.wait();
    });

    if let Some(e) = failure.into_inner() {
        return Err(e);
    }
    Ok(())
}
