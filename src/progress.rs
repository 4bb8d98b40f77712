//! Build progress reporting.
//!
//! Index builds report a phase name and a `done/total` counter pair. The host
//! wires a [`ProgressSink`] into the build call; [`LogSink`] is the default
//! and forwards to `tracing`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Phases of an index build, in reporting order.
///
/// IVFFlat runs all four phases; HNSW runs `Initializing` and
/// `LoadingTuples` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Initializing,
    PerformingKmeans,
    AssigningTuples,
    LoadingTuples,
}

impl BuildPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Initializing => "initializing",
            BuildPhase::PerformingKmeans => "performing k-means",
            BuildPhase::AssigningTuples => "assigning tuples",
            BuildPhase::LoadingTuples => "loading tuples",
        }
    }
}

/// Receiver for build progress updates.
pub trait ProgressSink: Send + Sync {
    /// A new phase has begun. Resets the counter pair.
    fn phase(&self, _phase: BuildPhase) {}

    /// Counter update within the current phase.
    fn progress(&self, _done: u64, _total: u64) {}
}

/// Default sink: logs phase transitions and coarse progress via `tracing`.
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn phase(&self, phase: BuildPhase) {
        tracing::info!(phase = phase.as_str(), "index build phase");
    }

    fn progress(&self, done: u64, total: u64) {
        if total > 0 {
            tracing::debug!(done, total, pct = (done * 100) / total, "index build progress");
        }
    }
}

/// Sink that discards all updates.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {}

/// Shared counter pair that batches updates to a sink.
///
/// Workers advance the atomic counter; the sink only hears about it once per
/// `stride` increments so reporting never dominates the build.
pub struct ProgressCounter {
    sink: Arc<dyn ProgressSink>,
    done: AtomicU64,
    total: u64,
    stride: u64,
}

impl ProgressCounter {
    pub fn new(sink: Arc<dyn ProgressSink>, total: u64) -> Self {
        // Report roughly 100 times per phase.
        let stride = (total / 100).max(1);
        Self {
            sink,
            done: AtomicU64::new(0),
            total,
            stride,
        }
    }

    /// Advance the counter by `n`, forwarding to the sink on stride
    /// boundaries and at completion.
    pub fn advance(&self, n: u64) {
        let done = self.done.fetch_add(n, Ordering::Relaxed) + n;
        if done % self.stride < n || done >= self.total {
            self.sink.progress(done.min(self.total), self.total);
        }
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }
}
