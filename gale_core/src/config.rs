use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::mutator::MutationStrategy;

/// Hard cap on parallel workers; the engine refuses to start above it.
pub const MAX_WORKER_THREADS: u32 = 64;

/// Errors detected by [`FuzzConfig::validate`]. All of them are startup
/// errors: the engine refuses to start rather than limping along.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker_threads must be between 1 and {MAX_WORKER_THREADS}, got {0}")]
    WorkerThreads(u32),
    #[error("max_input_size must be at least 1")]
    MaxInputSize,
    #[error("max_iterations must be at least 1")]
    MaxIterations,
    #[error("timeout_ms must be at least 1")]
    TimeoutMs,
}

/// Tag handed to the coverage backend factory. The core treats it opaquely;
/// backends decide what collection mechanism each tag maps to.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageKind {
    None,
    #[default]
    User,
    Kernel,
    HardwareTrace,
    Breakpoint,
}

/// Engine configuration. Every field has a default, so an empty TOML table
/// (or `FuzzConfig::default()`) is a valid starting point.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzConfig {
    /// Workers exit once the shared iteration counter reaches this bound.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    /// Per-execution timeout handed to the target adapter. The core never
    /// preempts a running execution; enforcement lives in the adapter.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Number of parallel worker threads (1..=64).
    #[serde(default = "default_worker_threads")]
    pub worker_threads: u32,
    /// Mutation outputs are clamped to this many bytes, truncated at the tail.
    #[serde(default = "default_max_input_size")]
    pub max_input_size: usize,
    /// Where the corpus is loaded from and saved to.
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: PathBuf,
    /// Where `crash_<n>_<dedup-key>.bin` files are written.
    #[serde(default = "default_crashes_dir")]
    pub crashes_dir: PathBuf,
    /// Monitor output and the final report land here.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Advisory; the core does not minimize the corpus itself.
    #[serde(default = "default_true")]
    pub minimize_corpus: bool,
    /// If true, only the first crash per dedup-key is persisted.
    #[serde(default = "default_true")]
    pub deduplicate_crashes: bool,
    /// If false, every Success is treated as NoNewCoverage.
    #[serde(default = "default_true")]
    pub collect_coverage: bool,
    #[serde(default)]
    pub coverage_type: CoverageKind,
    /// Strategy pool workers draw from uniformly, merged with any
    /// strategies added programmatically. Empty means `Random`.
    #[serde(default)]
    pub mutation_strategies: Vec<MutationStrategy>,
    /// Pins worker RNG seeding for replayable runs. Workers derive their
    /// streams from this value and their worker index; when unset, each
    /// worker seeds itself from OS entropy.
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

pub fn default_max_iterations() -> u64 {
    1_000_000
}
pub fn default_timeout_ms() -> u64 {
    5_000
}
pub fn default_worker_threads() -> u32 {
    8
}
pub fn default_max_input_size() -> usize {
    65_536
}
fn default_corpus_dir() -> PathBuf {
    PathBuf::from("corpus")
}
fn default_crashes_dir() -> PathBuf {
    PathBuf::from("crashes")
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_true() -> bool {
    true
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            timeout_ms: default_timeout_ms(),
            worker_threads: default_worker_threads(),
            max_input_size: default_max_input_size(),
            corpus_dir: default_corpus_dir(),
            crashes_dir: default_crashes_dir(),
            logs_dir: default_logs_dir(),
            minimize_corpus: true,
            deduplicate_crashes: true,
            collect_coverage: true,
            coverage_type: CoverageKind::default(),
            mutation_strategies: Vec::new(),
            rng_seed: None,
        }
    }
}

impl FuzzConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Checks the numeric bounds the engine relies on. Called by
    /// `FuzzEngine::start`; never mutates the config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 || self.worker_threads > MAX_WORKER_THREADS {
            return Err(ConfigError::WorkerThreads(self.worker_threads));
        }
        if self.max_input_size == 0 {
            return Err(ConfigError::MaxInputSize);
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::MaxIterations);
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::TimeoutMs);
        }
        Ok(())
    }
}
