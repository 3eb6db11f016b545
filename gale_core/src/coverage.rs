use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::config::CoverageKind;
use crate::target::TargetAdapter;

/// One execution's worth of observed code locations. The IDs are opaque to
/// the core: basic-block starts, edge IDs, whatever the backend emits.
pub type CoverageSample = Vec<u64>;

/// Read-only view of the tracker, plus the payload handed to coverage
/// callbacks and the final report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoverageInfo {
    pub basic_blocks_hit: u64,
    pub edges_hit: u64,
    pub new_coverage: u64,
    pub hit_addresses: Vec<u64>,
    /// Defined only when the backend knows a universe size.
    pub coverage_percentage: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct CoverageSnapshot {
    pub total_seen: u64,
    pub last_sample_size: u64,
    pub last_new_count: u64,
    pub coverage_percentage: Option<f64>,
}

#[derive(Debug, Default)]
struct TrackerState {
    global: HashSet<u64>,
    last_sample_size: u64,
    last_new_count: u64,
    universe_size: Option<u64>,
}

/// Accumulates per-execution coverage samples into the session-global set.
///
/// The global set only grows between [`CoverageTracker::reset`] calls.
/// `merge` is atomic per call: two concurrent merges with overlapping new
/// IDs jointly report the correct total, never double-counting.
#[derive(Debug, Default)]
pub struct CoverageTracker {
    state: Mutex<TrackerState>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `sample` into the global set and returns how many of its IDs
    /// were never seen before this call. Zero means no novelty.
    pub fn merge(&self, sample: &[u64]) -> u64 {
        let mut state = self.state.lock().expect("coverage mutex poisoned");
        let mut new_count = 0u64;
        for id in sample {
            if state.global.insert(*id) {
                new_count += 1;
            }
        }
        state.last_sample_size = sample.len() as u64;
        state.last_new_count = new_count;
        new_count
    }

    pub fn snapshot(&self) -> CoverageSnapshot {
        let state = self.state.lock().expect("coverage mutex poisoned");
        let total_seen = state.global.len() as u64;
        CoverageSnapshot {
            total_seen,
            last_sample_size: state.last_sample_size,
            last_new_count: state.last_new_count,
            coverage_percentage: state.universe_size.map(|universe| {
                if universe == 0 {
                    0.0
                } else {
                    total_seen as f64 / universe as f64 * 100.0
                }
            }),
        }
    }

    /// The IDs seen so far, in no particular order.
    pub fn hit_ids(&self) -> Vec<u64> {
        let state = self.state.lock().expect("coverage mutex poisoned");
        state.global.iter().copied().collect()
    }

    pub fn contains(&self, id: u64) -> bool {
        let state = self.state.lock().expect("coverage mutex poisoned");
        state.global.contains(&id)
    }

    /// Lets a backend that knows its universe enable the percentage field.
    pub fn set_universe_size(&self, universe: Option<u64>) {
        let mut state = self.state.lock().expect("coverage mutex poisoned");
        state.universe_size = universe;
    }

    /// Clears all global state. Intended for session restart only.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("coverage mutex poisoned");
        state.global.clear();
        state.last_sample_size = 0;
        state.last_new_count = 0;
    }

    pub fn info(&self) -> CoverageInfo {
        let snapshot = self.snapshot();
        CoverageInfo {
            basic_blocks_hit: snapshot.total_seen,
            edges_hit: 0,
            new_coverage: snapshot.last_new_count,
            hit_addresses: self.hit_ids(),
            coverage_percentage: snapshot.coverage_percentage,
        }
    }
}

/// Extension point for coverage collection mechanisms (kernel tracing,
/// hardware trace, software breakpoints). The core consumes this interface;
/// adapters that can report coverage inline may bypass it entirely by
/// attaching a sample to `FuzzResult::Success`.
pub trait CoverageSource: Send + Sync {
    fn initialize(&mut self, target: &dyn TargetAdapter) -> Result<(), String>;
    fn enable(&mut self, kind: CoverageKind);
    fn disable(&mut self);
    fn is_enabled(&self) -> bool;
    fn start_collection(&mut self);
    fn stop_collection(&mut self);
    fn snapshot(&self) -> CoverageInfo;
    fn reset(&mut self);
}

/// Backend that never reports coverage. Conforms to the contract while
/// providing no signal; useful when a target has no tracing story yet.
#[derive(Debug, Default)]
pub struct NullCoverageSource {
    enabled: bool,
}

impl NullCoverageSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CoverageSource for NullCoverageSource {
    fn initialize(&mut self, _target: &dyn TargetAdapter) -> Result<(), String> {
        Ok(())
    }

    fn enable(&mut self, kind: CoverageKind) {
        self.enabled = kind != CoverageKind::None;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn start_collection(&mut self) {}

    fn stop_collection(&mut self) {}

    fn snapshot(&self) -> CoverageInfo {
        CoverageInfo::default()
    }

    fn reset(&mut self) {}
}
