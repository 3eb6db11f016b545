use gale_core::config::FuzzConfig;
use gale_core::engine::FuzzEngine;
use gale_core::mutator::MutationStrategy;
use gale_core::target::{FuzzResult, InProcessTarget};

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about = "gale: coverage-guided fuzzing engine", long_about = None)]
struct Cli {
    /// TOML configuration file; falls back to ./gale.toml, then defaults.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Override max-iterations from the config.
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Override worker-threads from the config.
    #[clap(short, long)]
    threads: Option<u32>,
    /// Override timeout-ms from the config.
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Override max-input-size from the config.
    #[clap(long)]
    max_input_size: Option<usize>,
    /// Override corpus-dir from the config.
    #[clap(long)]
    corpus_dir: Option<PathBuf>,
    /// Override crashes-dir from the config.
    #[clap(long)]
    crashes_dir: Option<PathBuf>,
    /// Override logs-dir from the config.
    #[clap(long)]
    logs_dir: Option<PathBuf>,
    /// Seed file to preload into the corpus; may be given multiple times.
    #[clap(long = "seed")]
    seed_files: Vec<PathBuf>,
    /// Dictionary file, one token per line.
    #[clap(long)]
    dict: Option<PathBuf>,
    /// Mutation strategy (random, deterministic, dictionary, havoc,
    /// splice); may be given multiple times.
    #[clap(long = "mutation")]
    mutations: Vec<String>,
    /// Pin worker RNG seeding for a replayable run.
    #[clap(long)]
    rng_seed: Option<u64>,
    /// Validate configuration and exit without fuzzing.
    #[clap(long)]
    dry_run: bool,
}

/// Demonstration harness: panics on a couple of byte prefixes so a fresh
/// checkout produces crashes within seconds.
fn demo_harness(data: &[u8]) -> FuzzResult {
    if data.starts_with(b"BAD") {
        panic!("BAD input detected by harness!");
    }
    if data.starts_with(b"CRAS") {
        panic!("CRASH input detected by harness!");
    }
    // Byte-prefix coverage: each distinct first byte counts as a location,
    // which is enough signal for the corpus to evolve.
    let coverage = data.first().map(|b| vec![u64::from(*b)]);
    FuzzResult::Success { coverage }
}

fn parse_strategy(name: &str) -> Result<MutationStrategy, anyhow::Error> {
    match name {
        "random" => Ok(MutationStrategy::Random),
        "deterministic" => Ok(MutationStrategy::Deterministic),
        "dictionary" => Ok(MutationStrategy::Dictionary),
        "havoc" => Ok(MutationStrategy::Havoc),
        "splice" => Ok(MutationStrategy::Splice),
        other => Err(anyhow::anyhow!("Unknown mutation strategy '{other}'")),
    }
}

fn load_dictionary(path: &PathBuf) -> Result<Vec<Vec<u8>>, anyhow::Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read dictionary {:?}: {}", path, e))?;
    Ok(content
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.as_bytes().to_vec())
        .collect())
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            FuzzConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("gale.toml");
            if default_config_path.exists() {
                println!("Loading default configuration file: {default_config_path:?}");
                FuzzConfig::load_from_file(&default_config_path)?
            } else {
                FuzzConfig::default()
            }
        }
    };

    if let Some(iterations) = cli.iterations {
        config.max_iterations = iterations;
    }
    if let Some(threads) = cli.threads {
        config.worker_threads = threads;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(max_input_size) = cli.max_input_size {
        config.max_input_size = max_input_size;
    }
    if let Some(corpus_dir) = cli.corpus_dir {
        config.corpus_dir = corpus_dir;
    }
    if let Some(crashes_dir) = cli.crashes_dir {
        config.crashes_dir = crashes_dir;
    }
    if let Some(logs_dir) = cli.logs_dir {
        config.logs_dir = logs_dir;
    }
    if cli.rng_seed.is_some() {
        config.rng_seed = cli.rng_seed;
    }

    config.validate()?;
    if cli.dry_run {
        println!("Configuration valid: {config:#?}");
        return Ok(());
    }

    let max_iterations = config.max_iterations;
    let mut engine = FuzzEngine::with_config(config);
    engine.set_target(Arc::new(InProcessTarget::new("demo-harness", demo_harness)));

    for strategy_name in &cli.mutations {
        engine.add_mutation_strategy(parse_strategy(strategy_name)?);
    }
    if let Some(dict_path) = &cli.dict {
        let dictionary = load_dictionary(dict_path)?;
        println!("Loaded {} dictionary tokens", dictionary.len());
        engine.set_dictionary(dictionary);
    }
    for seed_path in &cli.seed_files {
        let data = std::fs::read(seed_path)
            .map_err(|e| anyhow::anyhow!("Failed to read seed {:?}: {}", seed_path, e))?;
        engine.add_seed(data);
    }
    if engine.corpus_size() == 0 {
        engine.add_seed(b"INIT".to_vec());
    }

    engine.set_crash_callback(|record| {
        println!(
            "\n!!! CRASH {} (exploitable: {}) input of {} bytes !!!",
            record.dedup_key,
            record.exploitable,
            record.input.len()
        );
    });
    engine.set_coverage_callback(|coverage| {
        info!(
            "New coverage: {} locations total",
            coverage.basic_blocks_hit
        );
    });
    engine.set_progress_callback(|iterations, crashes| {
        info!("Progress: {iterations} iterations, {crashes} crashes");
    });

    println!(
        "Starting fuzz loop for {} iterations with {} initial corpus items...",
        max_iterations,
        engine.corpus_size()
    );
    let start_time = Instant::now();
    engine.start()?;

    while engine.iterations() < max_iterations {
        std::thread::sleep(Duration::from_secs(1));
        let elapsed = start_time.elapsed().as_secs_f64();
        let exec_per_sec = if elapsed > 0.0 {
            engine.iterations() as f64 / elapsed
        } else {
            0.0
        };
        print!(
            "\rIter: {}/{}, Corpus: {}, Crashes: {}, Hangs: {}, Execs/sec: {:.2}   ",
            engine.iterations(),
            max_iterations,
            engine.corpus_size(),
            engine.crashes(),
            engine.hangs(),
            exec_per_sec
        );
        use std::io::Write;
        std::io::stdout().flush()?;
    }
    engine.stop()?;

    let elapsed_total = start_time.elapsed();
    println!("\nFuzz loop finished in {elapsed_total:.2?}.");
    println!(
        "Total Iterations: {}, Corpus Size: {}, Crashes: {}, Hangs: {}",
        engine.iterations(),
        engine.corpus_size(),
        engine.crashes(),
        engine.hangs()
    );

    Ok(())
}
