//! Hierarchical Navigable Small World (HNSW) approximate nearest neighbor
//! index.
//!
//! A multi-layer proximity graph: each element draws a geometric level and
//! keeps a bounded neighbor list per layer (`m` above layer 0, `2·m` at
//! layer 0). Queries descend greedily from the entry point, then run a beam
//! search at layer 0. Inserts pick neighbors with a diversity heuristic
//! that keeps the graph navigable instead of collapsing into hubs.
//!
//! Bulk builds fill a maintenance-memory arena and fall back to page-sized
//! allocation — with a one-time notice — once the budget is exhausted;
//! graph shape and results are identical either way.

/// Index lifecycle: bulk build, flush/open against the page store, search.
mod build;
/// Graph storage: element arenas, neighbor latches, entry pointer.
mod graph;
/// Insertion and heuristic neighbor selection.
mod insert;
/// Layer search and multi-layer descent.
mod search;
/// Epoch-based visited set.
mod visited;

pub use build::HnswIndex;
pub use graph::{HnswGraph, HnswOptions};
