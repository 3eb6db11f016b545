use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::config::{ConfigError, CoverageKind, FuzzConfig};
use crate::corpus::{CorpusError, CorpusManager, Provenance};
use crate::coverage::{CoverageInfo, CoverageTracker};
use crate::crash::CrashRecord;
use crate::mutator::MutationStrategy;
use crate::persist::{self, FinalReport};
use crate::scheduler::{CallbackSet, Scheduler, SharedState};
use crate::target::TargetAdapter;

/// Dictionary tokens outside 1..=4096 bytes are rejected.
pub const MAX_DICTIONARY_TOKEN_LEN: usize = 4096;

/// Errors surfaced by the engine's control surface. Per-iteration trouble
/// never appears here; it is logged and the loop continues.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("no target adapter has been set")]
    NoTarget,
    #[error("the engine is already running")]
    AlreadyRunning,
    #[error("target setup failed: {0}")]
    TargetSetup(String),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level façade over the fuzzing loop: owns the configuration, the
/// target reference, the callback slots, the corpus, the coverage tracker,
/// and (while running) the scheduler.
///
/// The intended call order is configure → set_target → seed → start; every
/// control operation is safe to call at any point, and `stop` is
/// idempotent. Callbacks are invoked from worker and monitor threads with
/// no engine lock held; the engine never re-enters itself through one.
pub struct FuzzEngine {
    config: FuzzConfig,
    target: Option<Arc<dyn TargetAdapter>>,
    corpus: Arc<CorpusManager>,
    coverage: Arc<CoverageTracker>,
    strategies: Vec<MutationStrategy>,
    dictionary: Vec<Vec<u8>>,
    callbacks: CallbackSet,
    seeds: Vec<Vec<u8>>,
    scheduler: Option<Scheduler>,
    shared: Option<Arc<SharedState>>,
    started_at: Option<Instant>,
}

impl FuzzEngine {
    pub fn new() -> Self {
        Self::with_config(FuzzConfig::default())
    }

    pub fn with_config(config: FuzzConfig) -> Self {
        Self {
            config,
            target: None,
            corpus: Arc::new(CorpusManager::new()),
            coverage: Arc::new(CoverageTracker::new()),
            strategies: Vec::new(),
            dictionary: Vec::new(),
            callbacks: CallbackSet::default(),
            seeds: Vec::new(),
            scheduler: None,
            shared: None,
            started_at: None,
        }
    }

    pub fn config(&self) -> &FuzzConfig {
        &self.config
    }

    /// Replaces the configuration. Ignored with a warning while running;
    /// the running session keeps the config it started with.
    pub fn set_config(&mut self, config: FuzzConfig) {
        if self.is_running() {
            warn!("Ignoring configuration change while the engine is running");
            return;
        }
        self.config = config;
    }

    /// Hands the engine the target to fuzz. The engine owns the adapter
    /// until `stop` completes.
    pub fn set_target(&mut self, target: Arc<dyn TargetAdapter>) {
        self.target = Some(target);
    }

    pub fn enable_coverage(&mut self, kind: CoverageKind) {
        self.config.collect_coverage = kind != CoverageKind::None;
        self.config.coverage_type = kind;
    }

    pub fn disable_coverage(&mut self) {
        self.config.collect_coverage = false;
    }

    pub fn coverage_info(&self) -> CoverageInfo {
        self.coverage.info()
    }

    /// Registers a seed input: it joins the corpus immediately and the
    /// initial work queue at start. Empty seeds are ignored.
    pub fn add_seed(&mut self, input: Vec<u8>) {
        if input.is_empty() {
            debug!("Ignoring empty seed input");
            return;
        }
        self.corpus
            .add_with_provenance(input.clone(), Provenance::Seed);
        self.seeds.push(input);
    }

    /// Appends every non-empty regular file under `dir` to the corpus.
    pub fn load_corpus_from_directory(&mut self, dir: &Path) -> Result<usize, EngineError> {
        let loaded = self.corpus.load_from_directory(dir)?;
        info!("Loaded {loaded} corpus entries from {dir:?}");
        Ok(loaded)
    }

    pub fn save_corpus_to_directory(&self, dir: &Path) -> Result<(), EngineError> {
        self.corpus.save_to_directory(dir)?;
        Ok(())
    }

    /// Adds a strategy to the pool workers draw from uniformly. With no
    /// strategy configured, workers default to `Random`.
    pub fn add_mutation_strategy(&mut self, strategy: MutationStrategy) {
        self.strategies.push(strategy);
    }

    /// Installs the mutation dictionary, dropping tokens that are empty or
    /// longer than [`MAX_DICTIONARY_TOKEN_LEN`].
    pub fn set_dictionary(&mut self, entries: Vec<Vec<u8>>) {
        self.dictionary = entries
            .into_iter()
            .filter(|token| {
                let keep = !token.is_empty() && token.len() <= MAX_DICTIONARY_TOKEN_LEN;
                if !keep {
                    debug!("Dropping dictionary token of length {}", token.len());
                }
                keep
            })
            .collect();
    }

    pub fn set_crash_callback(&mut self, callback: impl Fn(&CrashRecord) + Send + Sync + 'static) {
        self.callbacks.crash = Some(Arc::new(callback));
    }

    pub fn set_coverage_callback(
        &mut self,
        callback: impl Fn(&CoverageInfo) + Send + Sync + 'static,
    ) {
        self.callbacks.coverage = Some(Arc::new(callback));
    }

    pub fn set_progress_callback(&mut self, callback: impl Fn(u64, u64) + Send + Sync + 'static) {
        self.callbacks.progress = Some(Arc::new(callback));
    }

    /// Validates the configuration, prepares directories and the target,
    /// and spawns the workers and the monitor. Fails without side effects
    /// on configuration or setup errors.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.scheduler.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        self.config.validate()?;
        let target = self.target.clone().ok_or(EngineError::NoTarget)?;

        std::fs::create_dir_all(&self.config.corpus_dir)?;
        std::fs::create_dir_all(&self.config.crashes_dir)?;
        std::fs::create_dir_all(&self.config.logs_dir)?;

        target.setup().map_err(EngineError::TargetSetup)?;

        // A fresh session starts with a fresh global coverage set.
        self.coverage.reset();

        // Workers drain the seed queue first; with no seeds they get one
        // empty input, which the mutator treats as "generate fresh".
        let mut seed_queue: VecDeque<Vec<u8>> = self.seeds.iter().cloned().collect();
        if seed_queue.is_empty() {
            seed_queue.push_back(Vec::new());
        }

        info!(
            "Starting fuzzer: target '{}', {} workers, {} max iterations",
            target.name(),
            self.config.worker_threads,
            self.config.max_iterations
        );

        // Config-declared strategies first, then programmatic additions;
        // an empty pool means workers default to Random.
        let mut strategies = self.config.mutation_strategies.clone();
        strategies.extend(self.strategies.iter().copied());

        let shared = Arc::new(SharedState::new(
            self.config.clone(),
            target,
            Arc::clone(&self.corpus),
            Arc::clone(&self.coverage),
            strategies,
            Arc::new(self.dictionary.clone()),
            self.callbacks.clone(),
            seed_queue,
        ));

        self.started_at = Some(Instant::now());
        self.scheduler = Some(Scheduler::start(Arc::clone(&shared))?);
        self.shared = Some(shared);
        Ok(())
    }

    /// Joins all threads, cleans up the target, saves the corpus, and
    /// writes the final report. Calling it while stopped is a no-op.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        let Some(scheduler) = self.scheduler.take() else {
            return Ok(());
        };
        info!("Stopping fuzzer");
        scheduler.stop();

        if let Some(target) = &self.target {
            target.cleanup();
        }
        if let Err(e) = self.corpus.save_to_directory(&self.config.corpus_dir) {
            error!("Failed to save corpus on stop: {e}");
        }

        let report = self.build_final_report();
        match persist::write_final_report(&self.config.logs_dir, &report) {
            Ok(path) => info!("Final report written to {}", path.display()),
            Err(e) => error!("Failed to write final report: {e}"),
        }
        Ok(())
    }

    pub fn pause(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.resume();
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }

    pub fn iterations(&self) -> u64 {
        self.shared
            .as_ref()
            .map_or(0, |s| s.iterations.load(std::sync::atomic::Ordering::Relaxed))
    }

    pub fn crashes(&self) -> u64 {
        self.shared
            .as_ref()
            .map_or(0, |s| s.crashes.load(std::sync::atomic::Ordering::Relaxed))
    }

    pub fn hangs(&self) -> u64 {
        self.shared
            .as_ref()
            .map_or(0, |s| s.hangs.load(std::sync::atomic::Ordering::Relaxed))
    }

    pub fn corpus_size(&self) -> u64 {
        self.corpus.size() as u64
    }

    /// Whole-session average, not the monitor's windowed rate.
    pub fn execs_per_second(&self) -> f64 {
        let Some(started_at) = self.started_at else {
            return 0.0;
        };
        let elapsed = started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.iterations() as f64 / elapsed
        } else {
            0.0
        }
    }

    fn build_final_report(&self) -> FinalReport {
        let duration_secs = self
            .started_at
            .map_or(0, |started| started.elapsed().as_secs());
        let snapshot = self.coverage.snapshot();
        FinalReport {
            target_name: self
                .target
                .as_ref()
                .map_or_else(String::new, |t| t.name()),
            duration_secs,
            iterations: self.iterations(),
            crashes: self.crashes(),
            hangs: self.hangs(),
            execs_per_second: self.execs_per_second(),
            coverage_percentage: snapshot.coverage_percentage,
            basic_blocks: (snapshot.total_seen > 0).then_some(snapshot.total_seen),
        }
    }
}

impl Default for FuzzEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FuzzEngine {
    fn drop(&mut self) {
        if self.scheduler.is_some() {
            let _ = self.stop();
        }
    }
}
