pub mod config;
pub mod corpus;
pub mod coverage;
pub mod crash;
pub mod engine;
pub mod mutator;
pub mod persist;
mod scheduler;
pub mod target;
pub mod util;

pub use config::{ConfigError, CoverageKind, FuzzConfig};
pub use corpus::{CorpusEntry, CorpusError, CorpusManager, Provenance};
pub use coverage::{
    CoverageInfo, CoverageSample, CoverageSource, CoverageTracker, NullCoverageSource,
};
pub use crash::{analyze, dedup_key, is_exploitable, CrashRecord, FaultContext};
pub use engine::{EngineError, FuzzEngine};
pub use mutator::MutationStrategy;
pub use persist::FinalReport;
pub use target::{Architecture, FuzzResult, InProcessTarget, TargetAdapter};
