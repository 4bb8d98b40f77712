//! IVFFlat probe-based search.
//!
//! A query computes its distance to every centroid, keeps the `probes`
//! closest, scans those lists' page chains, and yields all scanned entries
//! in ascending distance order. With `probes = lists` the scan is
//! exhaustive and returns exactly the sequential-scan answer set.

use crate::error::Result;
use crate::ivf::{self, IvfIndex};
use crate::scan::OrderedHits;
use crate::session::{InterruptFlag, SearchOptions};
use crate::store::{TupleId, INVALID_PAGE};
use crate::vector::Vector;
use ordered_float::OrderedFloat;
use std::collections::BinaryHeap;

pub(crate) fn search(
    index: &IvfIndex,
    query: &Vector,
    options: &SearchOptions,
    interrupt: &InterruptFlag,
) -> Result<OrderedHits> {
    if query.dims() != index.dims() {
        return Err(crate::error::VexError::DimensionMismatch {
            expected: index.dims(),
            actual: query.dims(),
        });
    }
    let dim = index.dims();
    let distance = index.distance();
    let probes = options.probes.min(index.lists());
    let q = query.as_slice();

    // Keep the `probes` nearest centroids with a bounded max-heap.
    let mut nearest: BinaryHeap<(OrderedFloat<f32>, usize)> = BinaryHeap::with_capacity(probes + 1);
    let centroids = index.centroids();
    for list in 0..index.lists() {
        let d = distance.compare(q, &centroids[list * dim..(list + 1) * dim]);
        nearest.push((OrderedFloat(d), list));
        if nearest.len() > probes {
            nearest.pop();
        }
    }

    let mut hits: Vec<(f32, TupleId)> = Vec::new();
    let mut buf: Vec<f32> = Vec::with_capacity(dim);
    for (_, list) in nearest.into_iter() {
        let mut page = index.head(list);
        while page != INVALID_PAGE {
            // Safe point: no latch held between pages
            interrupt.check()?;
            page = index.store().with_page(page, |data| {
                let count = ivf::page_count_entries(data);
                for slot in 0..count {
                    let tid = ivf::read_entry(data, slot, dim, &mut buf);
                    hits.push((distance.compare(q, &buf), tid));
                }
                ivf::page_next(data)
            })?;
        }
    }

    Ok(OrderedHits::from_compare(hits, distance))
}
