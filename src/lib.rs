//! # vexcore
//!
//! Vector similarity search core for a database extension: a fixed-width
//! `f32` vector value type with SIMD-friendly distance kernels, and two
//! approximate nearest neighbor index engines — IVFFlat (k-means
//! partitioned inverted lists) and HNSW (multi-layer proximity graph) —
//! over a host-supplied paged block store.
//!
//! The host database provides pages, WAL, tuple visibility, and session
//! plumbing; this crate owns index structure, distance arithmetic, and
//! distance-ordered candidate streams. Returned tuple ids must be
//! re-validated against the host's snapshot.

/// Global configuration constants: limits, defaults, and tuning parameters.
pub mod config;
/// Crate-wide error type and `Result` alias.
pub mod error;
/// HNSW approximate nearest neighbor index.
pub mod hnsw;
/// IVFFlat approximate nearest neighbor index.
pub mod ivf;
/// Build progress reporting.
pub mod progress;
/// Index-scan plumbing: ordered tuple streams.
pub mod scan;
/// Per-query options, cancellation, and the maintenance-memory budget.
pub mod session;
/// Host block-store boundary: pages, latches, WAL sink, tuple sources.
pub mod store;
/// Vector value type, distance kernels, text and binary codecs.
pub mod vector;

pub use error::{Result, VexError};
pub use hnsw::{HnswIndex, HnswOptions};
pub use ivf::{IvfIndex, IvfOptions};
pub use scan::{scan_hnsw, scan_ivf, OrderedHits};
pub use session::{InterruptFlag, MaintenanceBudget, SearchOptions};
pub use store::{MemStore, TupleId, TupleSource, VecSource};
pub use vector::distance::Distance;
pub use vector::Vector;
