//! IVFFlat build pipeline.
//!
//! Four reported phases: `initializing` (option validation, page layout),
//! `performing k-means` (reservoir sample + training), `assigning tuples`
//! (a counting sweep that fixes `tuples_total` and surfaces degenerate
//! training), and `loading tuples` (the writing sweep, optionally spread
//! over workers that append through per-list tail latches). Worker errors
//! are re-raised on the leader.

use crate::config;
use crate::error::{Result, VexError};
use crate::ivf::{kmeans, IvfIndex, IvfMeta, IvfOptions, IVF_META_MAGIC};
use crate::progress::{BuildPhase, ProgressCounter, ProgressSink};
use crate::session::{InterruptFlag, MaintenanceBudget};
use crate::store::{MemStore, TupleId, TupleSource, INVALID_PAGE};
use crate::vector::Vector;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::mpsc;
use std::sync::Arc;

/// Tuples handed to loading workers per channel message.
const LOAD_BATCH: usize = 256;

#[allow(clippy::too_many_arguments)]
pub(crate) fn build(
    store: Arc<MemStore>,
    dim: usize,
    options: &IvfOptions,
    source: &mut dyn TupleSource,
    budget: &MaintenanceBudget,
    interrupt: &InterruptFlag,
    progress: Arc<dyn ProgressSink>,
    workers: usize,
) -> Result<IvfIndex> {
    progress.phase(BuildPhase::Initializing);
    options.validate()?;
    crate::vector::check_dim(dim)?;
    if dim > config::MAX_INDEXED_DIM {
        return Err(VexError::unsupported(format!(
            "column cannot have more than {} dimensions for ivfflat index",
            config::MAX_INDEXED_DIM
        )));
    }
    let lists = options.lists;
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    progress.phase(BuildPhase::PerformingKmeans);
    let target = lists.saturating_mul(config::KMEANS_SAMPLES_PER_LIST);
    let mut sample =
        kmeans::reservoir_sample(source, dim, target, budget, interrupt, &mut rng)?;
    let centroids = kmeans::train_centroids(
        &mut sample,
        dim,
        lists,
        options.distance,
        budget,
        interrupt,
        &mut rng,
    )?;
    let tuples_total = sample.scanned;
    sample.release(budget);

    let (directory_head, dir_pages) = IvfIndex::write_directory(&store, dim, &centroids)?;
    let index = IvfIndex {
        store: store.clone(),
        dim,
        lists,
        distance: options.distance,
        centroids,
        heads: (0..lists).map(|_| Mutex::new(INVALID_PAGE)).collect(),
        tails: (0..lists).map(|_| Mutex::new(INVALID_PAGE)).collect(),
        dir_pages,
    };

    // Counting sweep: fixes per-list populations before any page is written,
    // so training collapse surfaces before the expensive pass.
    progress.phase(BuildPhase::AssigningTuples);
    let counter = ProgressCounter::new(progress.clone(), tuples_total);
    let mut fills = vec![0u64; lists];
    source.rewind()?;
    let mut seen = 0u64;
    while let Some((_, vector)) = source.next_tuple()? {
        if seen % config::INTERRUPT_CHECK_OPS as u64 == 0 {
            interrupt.check()?;
        }
        seen += 1;
        if vector.dims() != dim {
            return Err(VexError::DimensionMismatch {
                expected: dim,
                actual: vector.dims(),
            });
        }
        let list =
            kmeans::nearest_centroid(index.centroids(), dim, vector.as_slice(), options.distance);
        fills[list] += 1;
        counter.advance(1);
    }

    let empty = fills.iter().filter(|&&c| c == 0).count();
    if seen > 0 && (empty as f64) > (lists as f64) * config::IVF_EMPTY_LIST_NOTICE_FRACTION {
        tracing::warn!(
            empty,
            lists,
            "most inverted lists are empty; consider rebuilding with fewer lists"
        );
    }

    progress.phase(BuildPhase::LoadingTuples);
    let counter = ProgressCounter::new(progress.clone(), seen);
    source.rewind()?;
    if workers <= 1 {
        let mut done = 0u64;
        while let Some((tid, vector)) = source.next_tuple()? {
            if done % config::INTERRUPT_CHECK_OPS as u64 == 0 {
                interrupt.check()?;
            }
            done += 1;
            let list = kmeans::nearest_centroid(
                index.centroids(),
                dim,
                vector.as_slice(),
                options.distance,
            );
            index.append(list, tid, vector.as_slice())?;
            counter.advance(1);
        }
    } else {
        load_parallel(&index, source, interrupt, &counter, workers)?;
    }

    crate::store::write_meta(
        &store,
        0,
        &IvfMeta {
            magic: IVF_META_MAGIC,
            version: 1,
            dim: dim as u16,
            lists: lists as u32,
            distance: options.distance,
            directory_head,
            tuples: seen,
        },
    )?;
    Ok(index)
}

/// Loading pass over a worker pool. The leader feeds batches through a
/// bounded channel; workers compute each tuple's list and append under that
/// list's tail latch, so cross-list appends proceed in parallel while
/// same-list appends serialize.
fn load_parallel(
    index: &IvfIndex,
    source: &mut dyn TupleSource,
    interrupt: &InterruptFlag,
    counter: &ProgressCounter,
    workers: usize,
) -> Result<()> {
    let failure: Mutex<Option<VexError>> = Mutex::new(None);
    let (tx, rx) = mpsc::sync_channel::<Vec<(TupleId, Vector)>>(workers * 2);
    let rx = Mutex::new(rx);

    std::thread::scope(|scope| -> Result<()> {
        // Move the sender into the scope so every exit path (including an
        // interrupt unwind) closes the channel and releases the workers.
        let tx = tx;
        for _ in 0..workers {
            let rx = &rx;
            let failure = &failure;
            let index = &*index;
            let interrupt = interrupt.clone();
            let counter = &*counter;
            scope.spawn(move || {
                loop {
                    let batch = {
                        let guard = rx.lock();
                        guard.recv()
                    };
                    let Ok(batch) = batch else { break };
                    if failure.lock().is_some() {
                        break;
                    }
                    let outcome = (|| -> Result<()> {
                        interrupt.check()?;
                        for (tid, vector) in &batch {
                            let list = kmeans::nearest_centroid(
                                index.centroids(),
                                index.dims(),
                                vector.as_slice(),
                                index.distance(),
                            );
                            index.append(list, *tid, vector.as_slice())?;
                        }
                        counter.advance(batch.len() as u64);
                        Ok(())
                    })();
                    if let Err(e) = outcome {
                        let mut slot = failure.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        break;
                    }
                }
            });
        }

        let mut batch = Vec::with_capacity(LOAD_BATCH);
        loop {
            interrupt.check()?;
            if failure.lock().is_some() {
                break;
            }
            match source.next_tuple()? {
                Some(row) => {
                    batch.push(row);
                    if batch.len() == LOAD_BATCH {
                        let full = std::mem::replace(&mut batch, Vec::with_capacity(LOAD_BATCH));
                        if tx.send(full).is_err() {
                            break;
                        }
                    }
                }
                None => break,
            }
        }
        if !batch.is_empty() && failure.lock().is_none() {
            let _ = tx.send(batch);
        }
        drop(tx);
        Ok(())
    })?;

    // Re-raise the first worker error on the leader
    if let Some(e) = failure.into_inner() {
        return Err(e);
    }
    Ok(())
}
