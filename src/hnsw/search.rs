//! HNSW search: single-layer beam search and multi-layer descent.
//!
//! `search_layer` keeps two priority queues over `(distance, element)`: a
//! min-queue of candidates still to expand and a max-queue of the best `ef`
//! results found so far, with a cached worst distance so the hot loop peeks
//! no heap. The visited set stops re-expansion.

use crate::config;
use crate::error::Result;
use crate::hnsw::graph::{ElementId, HnswGraph};
use crate::hnsw::visited::VisitedSet;
use crate::session::InterruptFlag;
use ordered_float::OrderedFloat;
use std::collections::BinaryHeap;

/// Candidate waiting to be expanded; max-heap on negated distance gives
/// nearest-first pops.
#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    neg_distance: OrderedFloat<f32>,
    id: ElementId,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.neg_distance.cmp(&other.neg_distance)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Result entry; max-heap on distance so the worst is always on top.
#[derive(Debug, PartialEq, Eq)]
struct ResultEntry {
    distance: OrderedFloat<f32>,
    id: ElementId,
}

impl Ord for ResultEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance.cmp(&other.distance)
    }
}

impl PartialOrd for ResultEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Beam search within one layer. Returns up to `ef` elements in ascending
/// distance order.
pub(crate) fn search_layer(
    graph: &HnswGraph,
    query: &[f32],
    entry_points: &[ElementId],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
    interrupt: &InterruptFlag,
) -> Result<Vec<(f32, ElementId)>> {
    visited.reset(graph.len());
    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<ResultEntry> = BinaryHeap::with_capacity(ef + 1);
    let mut worst = f32::MAX;

    for &ep in entry_points {
        if !visited.mark(ep) {
            continue;
        }
        let dist = graph.compare(query, ep);
        candidates.push(Candidate {
            neg_distance: OrderedFloat(-dist),
            id: ep,
        });
        results.push(ResultEntry {
            distance: OrderedFloat(dist),
            id: ep,
        });
        if results.len() > ef {
            results.pop();
        }
        if results.len() >= ef {
            worst = results.peek().map_or(f32::MAX, |r| r.distance.0);
        }
    }

    let mut expanded = 0usize;
    while let Some(candidate) = candidates.pop() {
        let dist = -candidate.neg_distance.0;
        if results.len() >= ef && dist > worst {
            break;
        }
        expanded += 1;
        if expanded % config::INTERRUPT_CHECK_OPS == 0 {
            interrupt.check()?;
        }

        let lists = graph.neighbors[candidate.id as usize].read();
        let Some(neighbor_list) = lists.get(layer) else {
            continue;
        };
        for &neighbor in neighbor_list {
            if !visited.mark(neighbor) {
                continue;
            }
            let dist = graph.compare(query, neighbor);
            if results.len() < ef || dist < worst {
                candidates.push(Candidate {
                    neg_distance: OrderedFloat(-dist),
                    id: neighbor,
                });
                results.push(ResultEntry {
                    distance: OrderedFloat(dist),
                    id: neighbor,
                });
                if results.len() > ef {
                    results.pop();
                }
                if results.len() >= ef {
                    worst = results.peek().map_or(f32::MAX, |r| r.distance.0);
                }
            }
        }
    }

    Ok(results
        .into_sorted_vec()
        .into_iter()
        .map(|r| (r.distance.0, r.id))
        .collect())
}

/// Multi-layer k-nearest search: greedy `ef = 1` descent to layer 1, then a
/// beam of `max(ef_search, k)` at layer 0.
pub(crate) fn knn_search(
    graph: &HnswGraph,
    query: &[f32],
    k: usize,
    ef_search: usize,
    interrupt: &InterruptFlag,
) -> Result<Vec<(f32, ElementId)>> {
    let Some(entry) = graph.entry_point() else {
        return Ok(Vec::new());
    };

    let mut visited = VisitedSet::with_capacity(graph.len());
    let mut current = entry.id;
    for layer in (1..=entry.level).rev() {
        let found = search_layer(graph, query, &[current], 1, layer, &mut visited, interrupt)?;
        if let Some(&(_, nearest)) = found.first() {
            current = nearest;
        }
    }

    let ef = ef_search.max(k);
    let mut results = search_layer(graph, query, &[current], ef, 0, &mut visited, interrupt)?;
    results.truncate(k);
    Ok(results)
}
