//! Per-query and per-build session state.
//!
//! The host session layer writes into these objects; the index engines only
//! read them. Nothing here is global — settings travel with the request, the
//! interrupt flag and memory budget travel with the build.

use crate::config;
use crate::error::{Result, VexError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-query search settings.
///
/// `probes` applies to IVFFlat scans, `ef_search` to HNSW scans; each index
/// ignores the other's knob.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Number of nearest inverted lists scanned by an IVFFlat query.
    pub probes: usize,
    /// Beam width of the layer-0 HNSW search.
    pub ef_search: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            probes: config::IVF_DEFAULT_PROBES,
            ef_search: config::HNSW_DEFAULT_EF_SEARCH,
        }
    }
}

impl SearchOptions {
    /// Validate the settings against their documented ranges.
    pub fn validate(&self) -> Result<()> {
        if self.probes < 1 {
            return Err(VexError::bad_input("probes must be at least 1"));
        }
        if self.ef_search < config::HNSW_MIN_EF_SEARCH
            || self.ef_search > config::HNSW_MAX_EF_SEARCH
        {
            return Err(VexError::bad_input(format!(
                "ef_search must be between {} and {}",
                config::HNSW_MIN_EF_SEARCH,
                config::HNSW_MAX_EF_SEARCH
            )));
        }
        Ok(())
    }
}

/// Host-provided cancellation flag, checked at safe points inside every
/// bounded loop.
///
/// Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Loops observe the flag at their next safe point.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Return `Err(Interrupted)` if cancellation has been requested.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(VexError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Build-time memory budget ("maintenance memory").
///
/// Mandatory structures call [`require`](MaintenanceBudget::require) and fail
/// with [`VexError::Resource`] when the budget cannot cover them. Optional
/// structures call [`try_charge`](MaintenanceBudget::try_charge) and degrade
/// on refusal (the HNSW build arena falls back to page-sized allocation).
#[derive(Debug)]
pub struct MaintenanceBudget {
    limit: usize,
    used: AtomicUsize,
}

impl MaintenanceBudget {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit: limit_bytes,
            used: AtomicUsize::new(0),
        }
    }

    /// Budget with the default limit.
    pub fn default_limit() -> Self {
        Self::new(config::DEFAULT_MAINTENANCE_BYTES)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Attempt to charge `bytes` against the budget. Returns `false` without
    /// charging when the budget would be exceeded.
    pub fn try_charge(&self, bytes: usize) -> bool {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = match cur.checked_add(bytes) {
                Some(n) if n <= self.limit => n,
                _ => return false,
            };
            match self
                .used
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Charge `bytes`, failing with [`VexError::Resource`] when the budget is
    /// insufficient.
    pub fn require(&self, bytes: usize) -> Result<()> {
        if self.try_charge(bytes) {
            Ok(())
        } else {
            Err(VexError::Resource {
                needed: bytes,
                budget: self.limit,
            })
        }
    }

    /// Return previously charged bytes to the budget.
    pub fn release(&self, bytes: usize) {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_sub(bytes);
            match self
                .used
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }
}
