//! Global configuration constants for vexcore.
//!
//! All tuning parameters and input validation limits are defined here.
//! Per-query settings (`probes`, `ef_search`) are runtime state and live in
//! [`crate::session::SearchOptions`].

/// Maximum dimension of a stored vector value.
pub const MAX_DIM: usize = 16_000;

/// Maximum dimension an index will accept.
///
/// Storage allows up to [`MAX_DIM`]; indexed search is capped lower because
/// neighbor-list and centroid pages must hold whole vectors.
pub const MAX_INDEXED_DIM: usize = 2_000;

/// Logical page size of the host block store, in bytes.
pub const PAGE_SIZE: usize = 8_192;

/// Minimum number of IVFFlat inverted lists.
pub const IVF_MIN_LISTS: usize = 1;

/// Maximum number of IVFFlat inverted lists.
pub const IVF_MAX_LISTS: usize = 32_768;

/// Default number of IVFFlat inverted lists.
pub const IVF_DEFAULT_LISTS: usize = 100;

/// Default number of inverted lists probed per IVFFlat query.
pub const IVF_DEFAULT_PROBES: usize = 1;

/// Training samples drawn per inverted list during k-means.
pub const KMEANS_SAMPLES_PER_LIST: usize = 50;

/// Upper bound on Lloyd iterations during IVFFlat training.
pub const KMEANS_MAX_ITERATIONS: usize = 500;

/// Training stops once fewer than this fraction of sample points change
/// assignment in one iteration.
pub const KMEANS_STOP_FRACTION: f64 = 0.001;

/// Fraction of lists that may end up empty after training before a notice
/// about degenerate training data is emitted.
pub const IVF_EMPTY_LIST_NOTICE_FRACTION: f64 = 0.5;

/// Minimum HNSW `m` (neighbors per element per layer).
pub const HNSW_MIN_M: usize = 2;

/// Maximum HNSW `m`.
pub const HNSW_MAX_M: usize = 100;

/// Default HNSW `m`.
pub const HNSW_DEFAULT_M: usize = 16;

/// Minimum HNSW `ef_construction`.
pub const HNSW_MIN_EF_CONSTRUCTION: usize = 4;

/// Maximum HNSW `ef_construction`.
pub const HNSW_MAX_EF_CONSTRUCTION: usize = 1_000;

/// Default HNSW `ef_construction` (beam width during insertion).
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 64;

/// Minimum HNSW `ef_search`.
pub const HNSW_MIN_EF_SEARCH: usize = 1;

/// Maximum HNSW `ef_search`.
pub const HNSW_MAX_EF_SEARCH: usize = 1_000;

/// Default HNSW `ef_search` (beam width during query).
pub const HNSW_DEFAULT_EF_SEARCH: usize = 40;

/// Hard cap on HNSW element levels. Levels are drawn from a geometric
/// distribution; with `m >= 2` the cap is effectively unreachable but bounds
/// the per-element neighbor-list storage.
pub const HNSW_MAX_LEVEL: usize = 31;

/// Units of work between cancellation checks inside bounded loops
/// (list-page scans, graph expansions, k-means passes).
pub const INTERRUPT_CHECK_OPS: usize = 1_024;

/// Default maintenance-memory budget when the host does not supply one.
pub const DEFAULT_MAINTENANCE_BYTES: usize = 64 * 1024 * 1024;
