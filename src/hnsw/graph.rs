//! HNSW graph storage and configuration.
//!
//! Elements live in struct-of-arrays form: vectors in a budgeted pool,
//! levels and tuple ids in flat arrays, and one latched neighbor-list set
//! per element so build workers linking different elements only contend
//! when they touch the same neighbor. The entry pointer advances through a
//! level-guarded compare-and-set under its own latch.

use crate::config;
use crate::error::{Result, VexError};
use crate::session::MaintenanceBudget;
use crate::store::TupleId;
use crate::vector::distance::Distance;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Position of an element within the graph arenas.
pub(crate) type ElementId = u32;

/// Build-time options for an HNSW index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswOptions {
    /// Neighbors per element per layer above 0; layer 0 holds `2 * m`.
    pub m: usize,
    /// Beam width during insertion.
    pub ef_construction: usize,
    /// Distance kind bound to the index.
    pub distance: Distance,
    /// Fixed RNG seed for reproducible level draws; `None` seeds from
    /// entropy.
    pub seed: Option<u64>,
}

impl Default for HnswOptions {
    fn default() -> Self {
        Self {
            m: config::HNSW_DEFAULT_M,
            ef_construction: config::HNSW_DEFAULT_EF_CONSTRUCTION,
            distance: Distance::L2,
            seed: None,
        }
    }
}

impl HnswOptions {
    pub fn validate(&self) -> Result<()> {
        if self.m < config::HNSW_MIN_M || self.m > config::HNSW_MAX_M {
            return Err(VexError::bad_input(format!(
                "m must be between {} and {}",
                config::HNSW_MIN_M,
                config::HNSW_MAX_M
            )));
        }
        if self.ef_construction < config::HNSW_MIN_EF_CONSTRUCTION
            || self.ef_construction > config::HNSW_MAX_EF_CONSTRUCTION
        {
            return Err(VexError::bad_input(format!(
                "ef_construction must be between {} and {}",
                config::HNSW_MIN_EF_CONSTRUCTION,
                config::HNSW_MAX_EF_CONSTRUCTION
            )));
        }
        if self.ef_construction < 2 * self.m {
            return Err(VexError::bad_input(
                "ef_construction must be at least twice m",
            ));
        }
        Ok(())
    }
}

/// Current top of the graph's descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryPoint {
    pub id: ElementId,
    pub level: usize,
}

/// Vector storage with two backends behind one interface: a contiguous
/// arena charged against the maintenance budget, and page-sized chunks for
/// elements arriving after the budget refuses further arena growth. The
/// switch happens on the first refused charge and is permanent for the
/// life of the build; arena contents stay where they are, so element ids
/// and vector references remain valid.
#[derive(Debug)]
pub(crate) struct VectorPool {
    dim: usize,
    arena: Vec<f32>,
    arena_rows: usize,
    chunks: Vec<Vec<f32>>,
    chunk_rows: usize,
    rows_per_chunk: usize,
    spilled: bool,
}

impl VectorPool {
    fn new(dim: usize) -> Self {
        Self {
            dim,
            arena: Vec::new(),
            arena_rows: 0,
            chunks: Vec::new(),
            chunk_rows: 0,
            rows_per_chunk: (config::PAGE_SIZE / (dim * 4)).max(1),
            spilled: false,
        }
    }

    fn len(&self) -> usize {
        self.arena_rows + self.chunk_rows
    }

    /// Append a vector. Returns `true` when this append switched the pool
    /// to the page-chunk backend.
    fn push(&mut self, v: &[f32], budget: &MaintenanceBudget) -> bool {
        debug_assert_eq!(v.len(), self.dim);
        let mut switched = false;
        if !self.spilled {
            if budget.try_charge(self.dim * 4) {
                self.arena.extend_from_slice(v);
                self.arena_rows += 1;
                return false;
            }
            self.spilled = true;
            switched = true;
        }
        if self.chunk_rows % self.rows_per_chunk == 0 {
            self.chunks
                .push(Vec::with_capacity(self.rows_per_chunk * self.dim));
        }
        self.chunks
            .last_mut()
            .expect("chunk allocated above")
            .extend_from_slice(v);
        self.chunk_rows += 1;
        switched
    }

    #[inline]
    fn get(&self, row: usize) -> &[f32] {
        if row < self.arena_rows {
            &self.arena[row * self.dim..(row + 1) * self.dim]
        } else {
            let r = row - self.arena_rows;
            let chunk = &self.chunks[r / self.rows_per_chunk];
            let offset = (r % self.rows_per_chunk) * self.dim;
            &chunk[offset..offset + self.dim]
        }
    }
}

/// The in-memory HNSW graph.
pub struct HnswGraph {
    dim: usize,
    options: HnswOptions,
    /// Layer-0 neighbor capacity, `2 * m`.
    pub(crate) m_max0: usize,
    /// Level multiplier `1 / ln(m)`.
    ml: f64,
    pool: VectorPool,
    levels: Vec<u8>,
    tuples: Vec<TupleId>,
    /// Per-element neighbor lists, `[layer][neighbor ids]`, behind the
    /// element's own latch.
    pub(crate) neighbors: Vec<RwLock<Vec<Vec<ElementId>>>>,
    entry: Mutex<Option<EntryPoint>>,
    rng: Mutex<StdRng>,
}

impl HnswGraph {
    pub fn new(dim: usize, options: HnswOptions) -> Result<Self> {
        crate::vector::check_dim(dim)?;
        if dim > config::MAX_INDEXED_DIM {
            return Err(VexError::unsupported(format!(
                "column cannot have more than {} dimensions for hnsw index",
                config::MAX_INDEXED_DIM
            )));
        }
        options.validate()?;
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            dim,
            m_max0: options.m * 2,
            ml: 1.0 / (options.m as f64).ln(),
            pool: VectorPool::new(dim),
            levels: Vec::new(),
            tuples: Vec::new(),
            neighbors: Vec::new(),
            entry: Mutex::new(None),
            rng: Mutex::new(rng),
            options,
        })
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dim
    }

    pub fn distance(&self) -> Distance {
        self.options.distance
    }

    pub(crate) fn options(&self) -> &HnswOptions {
        &self.options
    }

    #[inline]
    pub(crate) fn vector(&self, id: ElementId) -> &[f32] {
        self.pool.get(id as usize)
    }

    #[inline]
    pub(crate) fn level(&self, id: ElementId) -> usize {
        self.levels[id as usize] as usize
    }

    pub(crate) fn tuple(&self, id: ElementId) -> TupleId {
        self.tuples[id as usize]
    }

    /// Comparison-space distance from a query slice to an element.
    #[inline]
    pub(crate) fn compare(&self, q: &[f32], id: ElementId) -> f32 {
        self.options.distance.compare(q, self.vector(id))
    }

    /// Neighbor capacity at `layer`.
    #[inline]
    pub(crate) fn capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m_max0
        } else {
            self.options.m
        }
    }

    /// Draw an element level: `⌊−ln(u)·mL⌋`, capped.
    fn draw_level(&self) -> usize {
        let u: f64 = self.rng.lock().gen();
        let level = (-u.ln() * self.ml) as usize;
        level.min(config::HNSW_MAX_LEVEL)
    }

    pub(crate) fn entry_point(&self) -> Option<EntryPoint> {
        *self.entry.lock()
    }

    /// Seed the entry pointer if the graph has none. Returns `false` when
    /// another inserter won the race.
    pub(crate) fn try_set_first_entry(&self, id: ElementId, level: usize) -> bool {
        let mut entry = self.entry.lock();
        if entry.is_none() {
            *entry = Some(EntryPoint { id, level });
            true
        } else {
            false
        }
    }

    /// Compare-and-set on the entry pointer: only a strictly greater level
    /// replaces the current entry.
    pub(crate) fn try_advance_entry(&self, id: ElementId, level: usize) -> bool {
        let mut entry = self.entry.lock();
        match *entry {
            Some(current) if level <= current.level => false,
            _ => {
                *entry = Some(EntryPoint { id, level });
                true
            }
        }
    }

    /// Restore the entry pointer while reloading from pages.
    pub(crate) fn restore_entry(&self, entry: EntryPoint) {
        *self.entry.lock() = Some(entry);
    }

    /// Append an element's storage (vector, level, tuple id, empty neighbor
    /// lists) without linking it into the graph. Emits the one-time page
    /// fallback notice when the arena budget runs out.
    pub(crate) fn append_element(
        &mut self,
        tid: TupleId,
        v: &[f32],
        budget: &MaintenanceBudget,
    ) -> Result<ElementId> {
        if v.len() != self.dim {
            return Err(VexError::DimensionMismatch {
                expected: self.dim,
                actual: v.len(),
            });
        }
        if self.levels.len() >= ElementId::MAX as usize {
            return Err(VexError::Resource {
                needed: self.levels.len() + 1,
                budget: ElementId::MAX as usize,
            });
        }
        let level = self.draw_level();
        if self.pool.push(v, budget) {
            tracing::warn!(
                tuples = self.levels.len(),
                "hnsw graph no longer fits in maintenance memory after {} tuples, \
                 building the rest on disk",
                self.levels.len()
            );
        }
        let id = self.levels.len() as ElementId;
        self.levels.push(level as u8);
        self.tuples.push(tid);
        self.neighbors
            .push(RwLock::new(vec![Vec::new(); level + 1]));
        Ok(id)
    }

    /// Append a fully specified element (used when reloading from pages).
    pub(crate) fn append_loaded(
        &mut self,
        tid: TupleId,
        v: &[f32],
        level: usize,
        neighbor_lists: Vec<Vec<ElementId>>,
        budget: &MaintenanceBudget,
    ) -> Result<ElementId> {
        if v.len() != self.dim {
            return Err(VexError::DimensionMismatch {
                expected: self.dim,
                actual: v.len(),
            });
        }
        self.pool.push(v, budget);
        let id = self.levels.len() as ElementId;
        self.levels.push(level as u8);
        self.tuples.push(tid);
        self.neighbors.push(RwLock::new(neighbor_lists));
        Ok(id)
    }

    /// Check the structural invariants: every edge target exists at a
    /// sufficient level, no list exceeds its layer capacity, no self-loops
    /// or duplicate neighbors, and the entry point sits at the maximum
    /// observed level.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let n = self.len();
        let mut max_level = 0usize;
        for id in 0..n {
            max_level = max_level.max(self.level(id as ElementId));
        }
        match self.entry_point() {
            None if n > 0 => return Err("non-empty graph has no entry point".into()),
            None => {}
            Some(entry) => {
                if entry.id as usize >= n {
                    return Err(format!("entry point {} out of bounds", entry.id));
                }
                if self.level(entry.id) != entry.level {
                    return Err(format!(
                        "entry level {} disagrees with element level {}",
                        entry.level,
                        self.level(entry.id)
                    ));
                }
                if entry.level < max_level {
                    return Err(format!(
                        "entry level {} below maximum observed level {max_level}",
                        entry.level
                    ));
                }
            }
        }

        for id in 0..n as ElementId {
            let lists = self.neighbors[id as usize].read();
            if lists.len() != self.level(id) + 1 {
                return Err(format!(
                    "element {id} has {} layers, level says {}",
                    lists.len(),
                    self.level(id) + 1
                ));
            }
            for (layer, list) in lists.iter().enumerate() {
                if list.len() > self.capacity(layer) {
                    return Err(format!(
                        "element {id} layer {layer} holds {} neighbors, capacity {}",
                        list.len(),
                        self.capacity(layer)
                    ));
                }
                let mut seen = std::collections::HashSet::new();
                for &nb in list {
                    if nb == id {
                        return Err(format!("element {id} has a self-loop at layer {layer}"));
                    }
                    if nb as usize >= n {
                        return Err(format!(
                            "element {id} references missing element {nb}"
                        ));
                    }
                    if self.level(nb) < layer {
                        return Err(format!(
                            "edge {id}→{nb} at layer {layer} exceeds target level {}",
                            self.level(nb)
                        ));
                    }
                    if !seen.insert(nb) {
                        return Err(format!(
                            "element {id} lists neighbor {nb} twice at layer {layer}"
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(dim: usize) -> HnswGraph {
        HnswGraph::new(
            dim,
            HnswOptions {
                seed: Some(5),
                ..HnswOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_options_validation() {
        assert!(HnswOptions::default().validate().is_ok());
        assert!(HnswOptions {
            m: 1,
            ..HnswOptions::default()
        }
        .validate()
        .is_err());
        assert!(HnswOptions {
            m: 101,
            ..HnswOptions::default()
        }
        .validate()
        .is_err());
        assert!(HnswOptions {
            ef_construction: 2_000,
            ..HnswOptions::default()
        }
        .validate()
        .is_err());
        // ef_construction must be >= 2m
        assert!(HnswOptions {
            m: 40,
            ef_construction: 64,
            ..HnswOptions::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_rejects_oversized_dimension() {
        assert!(matches!(
            HnswGraph::new(config::MAX_INDEXED_DIM + 1, HnswOptions::default()),
            Err(VexError::Unsupported(_))
        ));
    }

    #[test]
    fn test_level_draws_are_bounded_and_mostly_zero() {
        let g = graph(4);
        let mut zeros = 0;
        for _ in 0..1_000 {
            let level = g.draw_level();
            assert!(level <= config::HNSW_MAX_LEVEL);
            if level == 0 {
                zeros += 1;
            }
        }
        // With m=16, P(level = 0) ≈ 1 − 1/16
        assert!(zeros > 850, "only {zeros} zero levels in 1000 draws");
    }

    #[test]
    fn test_entry_cas_requires_strictly_greater_level() {
        let g = graph(4);
        assert!(g.try_set_first_entry(0, 2));
        assert!(!g.try_set_first_entry(1, 5));
        assert!(!g.try_advance_entry(1, 2));
        assert!(g.try_advance_entry(1, 3));
        assert_eq!(g.entry_point(), Some(EntryPoint { id: 1, level: 3 }));
    }

    #[test]
    fn test_pool_spills_to_chunks_and_stays_readable() {
        let budget = MaintenanceBudget::new(4 * 4 * 3); // room for 3 rows of dim 4
        let mut pool = VectorPool::new(4);
        let mut switched_at = None;
        for i in 0..10 {
            let row = [i as f32; 4];
            if pool.push(&row, &budget) {
                switched_at = Some(i);
            }
        }
        assert_eq!(switched_at, Some(3));
        assert_eq!(pool.len(), 10);
        for i in 0..10 {
            assert_eq!(pool.get(i), &[i as f32; 4]);
        }
    }

    #[test]
    fn test_append_element_dimension_mismatch() {
        let mut g = graph(4);
        let budget = MaintenanceBudget::default_limit();
        assert!(matches!(
            g.append_element(TupleId::new(0, 1), &[1.0, 2.0], &budget),
            Err(VexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_catches_bad_edges() {
        let mut g = graph(2);
        let budget = MaintenanceBudget::default_limit();
        let a = g.append_element(TupleId::new(0, 1), &[0.0, 0.0], &budget).unwrap();
        let b = g.append_element(TupleId::new(0, 2), &[1.0, 0.0], &budget).unwrap();
        g.try_set_first_entry(a, g.level(a));
        g.try_advance_entry(b, g.level(b));

        // Healthy: a ↔ b at layer 0
        g.neighbors[a as usize].write()[0] = vec![b];
        g.neighbors[b as usize].write()[0] = vec![a];
        assert!(g.validate().is_ok());

        // Self-loop
        g.neighbors[a as usize].write()[0] = vec![a];
        assert!(g.validate().unwrap_err().contains("self-loop"));

        // Duplicate neighbor
        g.neighbors[a as usize].write()[0] = vec![b, b];
        assert!(g.validate().unwrap_err().contains("twice"));

        // Dangling target
        g.neighbors[a as usize].write()[0] = vec![99];
        assert!(g.validate().unwrap_err().contains("missing"));
    }
}
