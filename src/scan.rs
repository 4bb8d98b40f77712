//! Index-scan operator plumbing.
//!
//! Translates a "nearest k to `q` under distance `D`" request into index
//! calls and surfaces [`OrderedHits`]: a distance-ordered stream of tuple
//! ids. Returned tuple ids are candidates — the host re-validates them
//! against its transaction snapshot before surfacing rows.

use crate::error::{Result, VexError};
use crate::hnsw::HnswIndex;
use crate::ivf::IvfIndex;
use crate::session::{InterruptFlag, SearchOptions};
use crate::store::TupleId;
use crate::vector::distance::Distance;
use crate::vector::Vector;
use ordered_float::OrderedFloat;

/// Lazy, ascending-distance stream of `(distance, tuple_id)` pairs.
///
/// Distances are in the user-facing operator space (true Euclidean distance
/// for L2 indexes, not the squared comparison form). Rows whose distance is
/// `NaN` (cosine against the zero vector) sort after every finite row.
pub struct OrderedHits {
    hits: std::vec::IntoIter<(f64, TupleId)>,
}

impl OrderedHits {
    pub(crate) fn empty() -> Self {
        Self {
            hits: Vec::new().into_iter(),
        }
    }

    /// Sort comparison-space results and convert them to operator space.
    pub(crate) fn from_compare(mut hits: Vec<(f32, TupleId)>, distance: Distance) -> Self {
        // OrderedFloat's total order puts NaN greatest, i.e. last
        hits.sort_unstable_by_key(|&(d, tid)| (OrderedFloat(d), tid));
        Self {
            hits: hits
                .into_iter()
                .map(|(d, tid)| (distance.output(d), tid))
                .collect::<Vec<_>>()
                .into_iter(),
        }
    }

    /// Remaining results.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.len() == 0
    }
}

impl Iterator for OrderedHits {
    type Item = (f64, TupleId);

    fn next(&mut self) -> Option<Self::Item> {
        self.hits.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.hits.size_hint()
    }
}

impl ExactSizeIterator for OrderedHits {}

/// Reject a query whose distance operator is not the one the index was
/// built with. The planner should never produce such a scan; a direct
/// caller gets a clear error instead of silently wrong ordering.
fn check_distance(requested: Distance, bound: Distance) -> Result<()> {
    if requested != bound {
        return Err(VexError::unsupported(format!(
            "index is bound to {} distance, query requested {}",
            bound.as_str(),
            requested.as_str()
        )));
    }
    Ok(())
}

/// Ordered scan of an IVFFlat index.
pub fn scan_ivf(
    index: &IvfIndex,
    query: &Vector,
    requested: Distance,
    options: &SearchOptions,
    interrupt: &InterruptFlag,
) -> Result<OrderedHits> {
    check_distance(requested, index.distance())?;
    options.validate()?;
    index.search(query, options, interrupt)
}

/// Ordered scan of an HNSW index. `limit` is the host's row-limit hint;
/// the layer-0 beam is `max(ef_search, limit)`.
pub fn scan_hnsw(
    index: &HnswIndex,
    query: &Vector,
    requested: Distance,
    limit: usize,
    options: &SearchOptions,
    interrupt: &InterruptFlag,
) -> Result<OrderedHits> {
    check_distance(requested, index.distance())?;
    options.validate()?;
    index.search(query, limit, options, interrupt)
}
