//! HNSW insertion: descent, heuristic neighbor selection, bidirectional
//! connection, and over-capacity pruning.
//!
//! The linking path takes `&self` and synchronizes through per-element
//! neighbor latches plus the entry-pointer latch, so build workers run it
//! concurrently over disjoint element ranges. At most one neighbor latch is
//! held at a time, which rules out lock cycles.

use crate::error::Result;
use crate::hnsw::graph::{ElementId, HnswGraph};
use crate::hnsw::search::search_layer;
use crate::hnsw::visited::VisitedSet;
use crate::session::{InterruptFlag, MaintenanceBudget};
use crate::store::TupleId;
use crate::vector::Vector;
use std::cell::RefCell;

thread_local! {
    /// Reused visited set per linking thread; saves one allocation per
    /// element on large builds.
    static LINK_VISITED: RefCell<VisitedSet> = RefCell::new(VisitedSet::with_capacity(0));
}

impl HnswGraph {
    /// Insert one `(tuple, vector)` pair: append element storage, then link
    /// it into every layer up to its drawn level.
    pub fn insert(
        &mut self,
        tid: TupleId,
        vector: &Vector,
        budget: &MaintenanceBudget,
        interrupt: &InterruptFlag,
    ) -> Result<ElementId> {
        let id = self.append_element(tid, vector.as_slice(), budget)?;
        self.link(id, interrupt)?;
        Ok(id)
    }

    /// Link an already-appended element into the graph. Shared by the
    /// serial insert path and the parallel build workers.
    pub(crate) fn link(&self, id: ElementId, interrupt: &InterruptFlag) -> Result<()> {
        let level = self.level(id);
        if self.try_set_first_entry(id, level) {
            return Ok(());
        }
        let entry = self
            .entry_point()
            .expect("entry point exists once the first-insert race is settled");

        let query = self.vector(id);
        LINK_VISITED.with(|cell| -> Result<()> {
            let visited = &mut *cell.borrow_mut();

            // Greedy descent with ef = 1 through the layers above this
            // element's level.
            let mut current = entry.id;
            for layer in (level + 1..=entry.level).rev() {
                interrupt.check()?;
                let found = search_layer(self, query, &[current], 1, layer, visited, interrupt)?;
                if let Some(&(_, nearest)) = found.first() {
                    current = nearest;
                }
            }

            // Beam search per layer from the element's level down, choosing
            // neighbors by the diversity heuristic.
            let ef = self.options().ef_construction;
            let mut entry_points: Vec<ElementId> = vec![current];
            for layer in (0..=level.min(entry.level)).rev() {
                interrupt.check()?;
                let mut found =
                    search_layer(self, query, &entry_points, ef, layer, visited, interrupt)?;
                // A concurrently linked element may already reach us
                found.retain(|&(_, c)| c != id);

                let selected = select_neighbors(self, &found, self.capacity(layer));
                {
                    let mut lists = self.neighbors[id as usize].write();
                    lists[layer] = selected.iter().map(|&(_, c)| c).collect();
                }
                for &(_, neighbor) in &selected {
                    self.add_backlink(neighbor, id, layer);
                }

                entry_points.clear();
                entry_points.extend(found.iter().map(|&(_, c)| c));
                if entry_points.is_empty() {
                    entry_points.push(entry.id);
                }
            }
            Ok(())
        })?;

        if level > entry.level {
            self.try_advance_entry(id, level);
        }
        Ok(())
    }

    /// Add `id` to `neighbor`'s list at `layer`, re-selecting under that
    /// element's latch when the list overflows its capacity.
    fn add_backlink(&self, neighbor: ElementId, id: ElementId, layer: usize) {
        let capacity = self.capacity(layer);
        let mut lists = self.neighbors[neighbor as usize].write();
        let list = &mut lists[layer];
        if list.contains(&id) {
            return;
        }
        list.push(id);
        if list.len() > capacity {
            let base = self.vector(neighbor);
            let candidates: Vec<(f32, ElementId)> = list
                .iter()
                .map(|&c| (self.compare(base, c), c))
                .collect();
            let pruned = select_neighbors(self, &candidates, capacity);
            *list = pruned.into_iter().map(|(_, c)| c).collect();
        }
    }
}

/// Diversity-favoring neighbor selection: walk candidates in ascending
/// distance, keeping a candidate only when it is closer to the base element
/// than to every neighbor already kept. Remaining slots are backfilled with
/// the closest unused candidates.
pub(crate) fn select_neighbors(
    graph: &HnswGraph,
    candidates: &[(f32, ElementId)],
    m: usize,
) -> Vec<(f32, ElementId)> {
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    sorted.dedup_by_key(|&mut (_, c)| c);

    let mut selected: Vec<(f32, ElementId)> = Vec::with_capacity(m);
    for &(dist_to_base, candidate) in &sorted {
        if selected.len() >= m {
            break;
        }
        let candidate_vec = graph.vector(candidate);
        let diverse = selected.iter().all(|&(_, kept)| {
            dist_to_base < graph.compare(candidate_vec, kept)
        });
        if diverse {
            selected.push((dist_to_base, candidate));
        }
    }

    if selected.len() < m {
        for &(dist, candidate) in &sorted {
            if selected.len() >= m {
                break;
            }
            if !selected.iter().any(|&(_, kept)| kept == candidate) {
                selected.push((dist, candidate));
            }
        }
        selected
            .sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::graph::HnswOptions;

    fn build_graph(points: &[[f32; 2]], m: usize) -> HnswGraph {
        let mut graph = HnswGraph::new(
            2,
            HnswOptions {
                m,
                ef_construction: (2 * m).max(crate::config::HNSW_MIN_EF_CONSTRUCTION),
                seed: Some(21),
                ..HnswOptions::default()
            },
        )
        .unwrap();
        let budget = MaintenanceBudget::default_limit();
        let interrupt = InterruptFlag::new();
        for (i, p) in points.iter().enumerate() {
            let v = Vector::from_slice(p).unwrap();
            graph
                .insert(TupleId::new(i as u64, 1), &v, &budget, &interrupt)
                .unwrap();
        }
        graph
    }

    #[test]
    fn test_first_insert_becomes_entry() {
        let graph = build_graph(&[[1.0, 1.0]], 4);
        let entry = graph.entry_point().unwrap();
        assert_eq!(entry.id, 0);
        assert_eq!(entry.level, graph.level(0));
    }

    #[test]
    fn test_graph_stays_valid_under_many_inserts() {
        let points: Vec<[f32; 2]> = (0..200)
            .map(|i| {
                let a = i as f32 * 0.37;
                [a.sin() * (i as f32), a.cos() * (i as f32)]
            })
            .collect();
        let graph = build_graph(&points, 4);
        assert_eq!(graph.len(), 200);
        graph.validate().unwrap();
    }

    #[test]
    fn test_bidirectional_links_at_layer_zero() {
        let graph = build_graph(&[[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]], 4);
        // Every layer-0 edge has its reverse edge unless pruning removed it;
        // with 3 points and m=4 nothing prunes.
        for id in 0..3u32 {
            let lists = graph.neighbors[id as usize].read();
            for &nb in &lists[0] {
                let back = graph.neighbors[nb as usize].read();
                assert!(
                    back[0].contains(&id),
                    "edge {id}→{nb} missing its reverse"
                );
            }
        }
    }

    #[test]
    fn test_select_neighbors_prefers_diversity() {
        let graph = build_graph(&[[0.0, 0.0], [1.0, 0.0], [1.1, 0.0], [0.0, 1.2]], 4);
        // Base is element 0; candidates 1 and 2 are nearly identical, 3 is
        // off-axis. With m = 2 the heuristic keeps 1 and skips 2 (closer to
        // 1 than to base), then takes 3.
        let base = graph.vector(0);
        let candidates: Vec<(f32, ElementId)> = [1u32, 2, 3]
            .iter()
            .map(|&c| (graph.compare(base, c), c))
            .collect();
        let selected = select_neighbors(&graph, &candidates, 2);
        let ids: Vec<ElementId> = selected.iter().map(|&(_, c)| c).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_select_neighbors_backfills_to_capacity() {
        let graph = build_graph(&[[0.0, 0.0], [1.0, 0.0], [1.1, 0.0], [1.2, 0.0]], 4);
        let base = graph.vector(0);
        let candidates: Vec<(f32, ElementId)> = [1u32, 2, 3]
            .iter()
            .map(|&c| (graph.compare(base, c), c))
            .collect();
        // Heuristic alone would keep only element 1; backfill returns all 3
        let selected = select_neighbors(&graph, &candidates, 3);
        assert_eq!(selected.len(), 3);
        // Ascending distance after backfill
        for pair in selected.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }

    #[test]
    fn test_capacity_respected_with_small_m() {
        let points: Vec<[f32; 2]> = (0..64)
            .map(|i| [(i % 8) as f32, (i / 8) as f32])
            .collect();
        let graph = build_graph(&points, 2);
        for id in 0..64u32 {
            let lists = graph.neighbors[id as usize].read();
            for (layer, list) in lists.iter().enumerate() {
                assert!(list.len() <= graph.capacity(layer));
            }
        }
    }
}
