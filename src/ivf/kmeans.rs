//! IVFFlat centroid training: reservoir sampling, k-means++ seeding, and
//! Elkan-accelerated Lloyd iterations.
//!
//! Samples and centroids are kept in flat `Vec<f32>` arenas, one row per
//! `dim` components. Training geometry is Euclidean throughout — the
//! triangle-inequality bounds Elkan maintains require a metric — with
//! cosine indexes normalizing the sample up front and the centroids after
//! every update round, which makes Euclidean order coincide with cosine
//! order.

use crate::config;
use crate::error::{Result, VexError};
use crate::session::{InterruptFlag, MaintenanceBudget};
use crate::store::TupleSource;
use crate::vector::distance::{self, Distance};
use rand::rngs::StdRng;
use rand::Rng;

/// Flat row-major training sample.
pub(crate) struct Sample {
    pub data: Vec<f32>,
    pub rows: usize,
    /// Rows seen in the underlying scan, not just retained.
    pub scanned: u64,
    charged: usize,
}

impl Sample {
    #[inline]
    pub fn row(&self, i: usize, dim: usize) -> &[f32] {
        &self.data[i * dim..(i + 1) * dim]
    }

    /// Return the reservoir's budget charge. Call once training is done.
    pub fn release(&mut self, budget: &MaintenanceBudget) {
        budget.release(self.charged);
        self.charged = 0;
    }
}

/// Reservoir-sample up to `target` vectors of dimension `dim` from the
/// source. The reservoir is a mandatory structure and is charged against
/// the budget up front.
pub(crate) fn reservoir_sample(
    source: &mut dyn TupleSource,
    dim: usize,
    target: usize,
    budget: &MaintenanceBudget,
    interrupt: &InterruptFlag,
    rng: &mut StdRng,
) -> Result<Sample> {
    let charged = target * dim * std::mem::size_of::<f32>();
    budget.require(charged)?;

    let mut data: Vec<f32> = Vec::new();
    let mut rows = 0usize;
    let mut scanned = 0u64;

    while let Some((_, vector)) = source.next_tuple()? {
        if scanned % config::INTERRUPT_CHECK_OPS as u64 == 0 {
            interrupt.check()?;
        }
        if vector.dims() != dim {
            return Err(VexError::DimensionMismatch {
                expected: dim,
                actual: vector.dims(),
            });
        }
        scanned += 1;
        if rows < target {
            data.extend_from_slice(vector.as_slice());
            rows += 1;
        } else {
            let slot = rng.gen_range(0..scanned);
            if (slot as usize) < target {
                let i = slot as usize;
                data[i * dim..(i + 1) * dim].copy_from_slice(vector.as_slice());
            }
        }
    }

    Ok(Sample {
        data,
        rows,
        scanned,
        charged,
    })
}

/// k-means++ seeding: first centroid uniform, each subsequent proportional
/// to squared distance from the nearest already-chosen centroid.
fn seed_centroids(sample: &[f32], dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = sample.len() / dim;
    let mut centroids = vec![0.0f32; k * dim];
    debug_assert!(n > 0);

    let first = rng.gen_range(0..n);
    centroids[..dim].copy_from_slice(&sample[first * dim..(first + 1) * dim]);

    let mut min_dists = vec![f32::MAX; n];
    for ci in 1..k {
        let last = &centroids[(ci - 1) * dim..ci * dim];
        let mut total = 0.0f64;
        for i in 0..n {
            let point = &sample[i * dim..(i + 1) * dim];
            let d = distance::l2_squared(point, last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }

        if total < 1e-30 {
            // Every remaining point coincides with a chosen centroid;
            // duplicates are allowed
            let idx = rng.gen_range(0..n);
            centroids[ci * dim..(ci + 1) * dim]
                .copy_from_slice(&sample[idx * dim..(idx + 1) * dim]);
            continue;
        }
        let threshold = rng.gen::<f64>() * total;
        let mut cumulative = 0.0f64;
        let mut chosen = n - 1;
        for (i, &d) in min_dists.iter().enumerate() {
            cumulative += d as f64;
            if cumulative >= threshold {
                chosen = i;
                break;
            }
        }
        centroids[ci * dim..(ci + 1) * dim]
            .copy_from_slice(&sample[chosen * dim..(chosen + 1) * dim]);
    }

    centroids
}

#[inline]
fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    distance::l2_squared(a, b).sqrt()
}

fn normalize_rows(data: &mut [f32], dim: usize) {
    for row in data.chunks_mut(dim) {
        let norm = distance::norm_sq(row).sqrt() as f32;
        if norm > 0.0 {
            let inv = 1.0 / norm;
            for x in row.iter_mut() {
                *x *= inv;
            }
        }
    }
}

/// Train `k` centroids over the sample.
///
/// Returns a flat `k × dim` centroid table. An empty sample yields zeroed
/// centroids (the empty-table build case); a sample smaller than `k` copies
/// each point once, leaving the remainder zeroed, with no iterations.
pub(crate) fn train_centroids(
    sample: &mut Sample,
    dim: usize,
    k: usize,
    dist: Distance,
    budget: &MaintenanceBudget,
    interrupt: &InterruptFlag,
    rng: &mut StdRng,
) -> Result<Vec<f32>> {
    let n = sample.rows;
    if n == 0 {
        return Ok(vec![0.0f32; k * dim]);
    }
    if dist == Distance::Cosine {
        normalize_rows(&mut sample.data, dim);
    }
    if n <= k {
        let mut centroids = vec![0.0f32; k * dim];
        centroids[..n * dim].copy_from_slice(&sample.data[..n * dim]);
        return Ok(centroids);
    }

    // Elkan bound structures are mandatory; charge them before allocating.
    let f4 = std::mem::size_of::<f32>();
    let elkan_bytes = n * k * f4          // lower bounds
        + k * k * f4                      // half inter-centroid distances
        + k * f4                          // nearest-other-centroid radii
        + n * f4                          // upper bounds
        + n * std::mem::size_of::<u32>()  // assignments
        + k * dim * f4                    // next-round centroids
        + k * std::mem::size_of::<u64>()  // member counts
        + k * f4; // per-centroid shift
    budget.require(elkan_bytes)?;

    let mut centroids = seed_centroids(&sample.data, dim, k, rng);
    let mut lower = vec![0.0f32; n * k];
    let mut upper = vec![0.0f32; n];
    let mut assign = vec![0u32; n];

    // Initial exact assignment fills every bound.
    for i in 0..n {
        if i % config::INTERRUPT_CHECK_OPS == 0 {
            interrupt.check()?;
        }
        let point = sample.row(i, dim);
        let mut best = 0usize;
        let mut best_dist = f32::MAX;
        for c in 0..k {
            let d = euclidean(point, &centroids[c * dim..(c + 1) * dim]);
            lower[i * k + c] = d;
            if d < best_dist {
                best_dist = d;
                best = c;
            }
        }
        assign[i] = best as u32;
        upper[i] = best_dist;
    }

    let mut half_cc = vec![0.0f32; k * k];
    let mut radius = vec![0.0f32; k];
    let mut next = vec![0.0f32; k * dim];
    let mut counts = vec![0u64; k];
    let mut shift = vec![0.0f32; k];

    for _iter in 0..config::KMEANS_MAX_ITERATIONS {
        interrupt.check()?;

        // Half inter-centroid distances and each centroid's half distance
        // to its nearest sibling.
        for c in 0..k {
            radius[c] = f32::MAX;
        }
        for a in 0..k {
            for b in (a + 1)..k {
                let half =
                    0.5 * euclidean(&centroids[a * dim..(a + 1) * dim], &centroids[b * dim..(b + 1) * dim]);
                half_cc[a * k + b] = half;
                half_cc[b * k + a] = half;
                if half < radius[a] {
                    radius[a] = half;
                }
                if half < radius[b] {
                    radius[b] = half;
                }
            }
        }

        let mut changed = 0usize;
        for i in 0..n {
            if i % config::INTERRUPT_CHECK_OPS == 0 {
                interrupt.check()?;
            }
            let mut ax = assign[i] as usize;
            let mut ux = upper[i];
            if ux <= radius[ax] {
                continue;
            }
            let point = sample.row(i, dim);
            let mut tight = false;
            for c in 0..k {
                if c == ax {
                    continue;
                }
                let z = lower[i * k + c].max(half_cc[ax * k + c]);
                if ux <= z {
                    continue;
                }
                if !tight {
                    ux = euclidean(point, &centroids[ax * dim..(ax + 1) * dim]);
                    lower[i * k + ax] = ux;
                    tight = true;
                    if ux <= z {
                        continue;
                    }
                }
                let d = euclidean(point, &centroids[c * dim..(c + 1) * dim]);
                lower[i * k + c] = d;
                if d < ux {
                    ax = c;
                    ux = d;
                }
            }
            if ax != assign[i] as usize {
                assign[i] = ax as u32;
                changed += 1;
            }
            upper[i] = ux;
        }

        // Means of members; empty centroids hold position until repair.
        next.fill(0.0);
        counts.fill(0);
        for i in 0..n {
            let c = assign[i] as usize;
            counts[c] += 1;
            let point = sample.row(i, dim);
            let acc = &mut next[c * dim..(c + 1) * dim];
            for d in 0..dim {
                acc[d] += point[d];
            }
        }
        for c in 0..k {
            let row = &mut next[c * dim..(c + 1) * dim];
            if counts[c] > 0 {
                let inv = 1.0 / counts[c] as f32;
                for x in row.iter_mut() {
                    *x *= inv;
                }
            } else {
                row.copy_from_slice(&centroids[c * dim..(c + 1) * dim]);
            }
        }
        if dist == Distance::Cosine {
            normalize_rows(&mut next, dim);
        }

        // Bound maintenance from centroid movement.
        for c in 0..k {
            shift[c] = euclidean(&centroids[c * dim..(c + 1) * dim], &next[c * dim..(c + 1) * dim]);
        }
        for i in 0..n {
            upper[i] += shift[assign[i] as usize];
            for c in 0..k {
                let l = &mut lower[i * k + c];
                *l = (*l - shift[c]).max(0.0);
            }
        }
        centroids.copy_from_slice(&next);

        if (changed as f64) < (n as f64) * config::KMEANS_STOP_FRACTION {
            break;
        }
    }

    repair_empty_clusters(sample, dim, k, &mut centroids, &mut assign, interrupt)?;
    if dist == Distance::Cosine {
        normalize_rows(&mut centroids, dim);
    }

    budget.release(elkan_bytes);
    Ok(centroids)
}

/// Replace each assignee-less centroid with the farthest member of its
/// nearest populated sibling, then run one plain Lloyd round.
fn repair_empty_clusters(
    sample: &Sample,
    dim: usize,
    k: usize,
    centroids: &mut [f32],
    assign: &mut [u32],
    interrupt: &InterruptFlag,
) -> Result<()> {
    let n = sample.rows;
    let mut counts = vec![0u64; k];
    for &a in assign.iter() {
        counts[a as usize] += 1;
    }
    if counts.iter().all(|&c| c > 0) {
        return Ok(());
    }

    let mut repaired = false;
    for c in 0..k {
        if counts[c] > 0 {
            continue;
        }
        interrupt.check()?;
        // Nearest non-empty sibling of the empty centroid
        let mut donor = None;
        let mut donor_dist = f32::MAX;
        for other in 0..k {
            if other == c || counts[other] == 0 {
                continue;
            }
            let d = euclidean(
                &centroids[c * dim..(c + 1) * dim],
                &centroids[other * dim..(other + 1) * dim],
            );
            if d < donor_dist {
                donor_dist = d;
                donor = Some(other);
            }
        }
        let Some(donor) = donor else { continue };

        // Farthest member of the donor becomes the new centroid
        let mut far = None;
        let mut far_dist = -1.0f32;
        for i in 0..n {
            if assign[i] as usize != donor {
                continue;
            }
            let d = euclidean(sample.row(i, dim), &centroids[donor * dim..(donor + 1) * dim]);
            if d > far_dist {
                far_dist = d;
                far = Some(i);
            }
        }
        if let Some(i) = far {
            centroids[c * dim..(c + 1) * dim].copy_from_slice(sample.row(i, dim));
            counts[donor] -= 1;
            counts[c] += 1;
            assign[i] = c as u32;
            repaired = true;
        }
    }

    if !repaired {
        return Ok(());
    }

    // One follow-up Lloyd round settles the stolen points' neighbors.
    for i in 0..n {
        if i % config::INTERRUPT_CHECK_OPS == 0 {
            interrupt.check()?;
        }
        let point = sample.row(i, dim);
        let mut best = 0usize;
        let mut best_dist = f32::MAX;
        for c in 0..k {
            let d = euclidean(point, &centroids[c * dim..(c + 1) * dim]);
            if d < best_dist {
                best_dist = d;
                best = c;
            }
        }
        assign[i] = best as u32;
    }
    let mut sums = vec![0.0f32; k * dim];
    let mut counts = vec![0u64; k];
    for i in 0..n {
        let c = assign[i] as usize;
        counts[c] += 1;
        let point = sample.row(i, dim);
        let acc = &mut sums[c * dim..(c + 1) * dim];
        for d in 0..dim {
            acc[d] += point[d];
        }
    }
    for c in 0..k {
        if counts[c] > 0 {
            let inv = 1.0 / counts[c] as f32;
            let row = &mut sums[c * dim..(c + 1) * dim];
            for x in row.iter_mut() {
                *x *= inv;
            }
            centroids[c * dim..(c + 1) * dim].copy_from_slice(row);
        }
    }
    Ok(())
}

/// Index of the nearest centroid to `v` under the index's own distance.
pub(crate) fn nearest_centroid(centroids: &[f32], dim: usize, v: &[f32], dist: Distance) -> usize {
    let k = centroids.len() / dim;
    let mut best = 0usize;
    let mut best_dist = f32::MAX;
    for c in 0..k {
        let d = dist.compare(v, &centroids[c * dim..(c + 1) * dim]);
        // NaN (cosine against a zeroed centroid) never wins
        if d < best_dist {
            best_dist = d;
            best = c;
        }
    }
    best
}
