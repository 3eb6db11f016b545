use log::{error, info, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::FuzzConfig;
use crate::corpus::CorpusManager;
use crate::coverage::{CoverageInfo, CoverageTracker};
use crate::crash::{self, CrashRecord};
use crate::mutator::{self, MutationStrategy};
use crate::persist;
use crate::target::{FuzzResult, TargetAdapter};

/// How often the monitor wakes to emit statistics.
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// User callback slots. All of them are invoked with no internal lock held,
/// from whichever worker (or the monitor) observed the event.
#[derive(Clone, Default)]
pub struct CallbackSet {
    pub crash: Option<Arc<dyn Fn(&CrashRecord) + Send + Sync>>,
    pub coverage: Option<Arc<dyn Fn(&CoverageInfo) + Send + Sync>>,
    pub progress: Option<Arc<dyn Fn(u64, u64) + Send + Sync>>,
}

/// State shared between the engine, the workers, and the monitor.
///
/// Locking discipline: the corpus, coverage, seed-queue, and dedup-registry
/// mutexes guard short critical sections and never nest. Counters are
/// relaxed atomics; the running flag uses acquire/release so a worker that
/// observes `false` also observes everything stop() did before clearing it.
pub(crate) struct SharedState {
    pub(crate) config: FuzzConfig,
    pub(crate) target: Arc<dyn TargetAdapter>,
    pub(crate) corpus: Arc<CorpusManager>,
    pub(crate) coverage: Arc<CoverageTracker>,
    pub(crate) strategies: Vec<MutationStrategy>,
    pub(crate) dictionary: Arc<Vec<Vec<u8>>>,
    pub(crate) callbacks: CallbackSet,

    pub(crate) running: AtomicBool,
    paused: Mutex<bool>,
    pause_cv: Condvar,
    stop_gate: Mutex<()>,
    stop_cv: Condvar,

    pub(crate) iterations: AtomicU64,
    pub(crate) crashes: AtomicU64,
    pub(crate) hangs: AtomicU64,
    /// Tickets claimed before executing, so the iteration bound is exact
    /// even when several workers race at the boundary.
    admitted: AtomicU64,

    seed_queue: Mutex<VecDeque<Vec<u8>>>,
    crash_keys: Mutex<HashSet<String>>,
    crash_sequence: AtomicU64,
}

impl SharedState {
    pub(crate) fn new(
        config: FuzzConfig,
        target: Arc<dyn TargetAdapter>,
        corpus: Arc<CorpusManager>,
        coverage: Arc<CoverageTracker>,
        strategies: Vec<MutationStrategy>,
        dictionary: Arc<Vec<Vec<u8>>>,
        callbacks: CallbackSet,
        seeds: VecDeque<Vec<u8>>,
    ) -> Self {
        Self {
            config,
            target,
            corpus,
            coverage,
            strategies,
            dictionary,
            callbacks,
            running: AtomicBool::new(true),
            paused: Mutex::new(false),
            pause_cv: Condvar::new(),
            stop_gate: Mutex::new(()),
            stop_cv: Condvar::new(),
            iterations: AtomicU64::new(0),
            crashes: AtomicU64::new(0),
            hangs: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            seed_queue: Mutex::new(seeds),
            crash_keys: Mutex::new(HashSet::new()),
            crash_sequence: AtomicU64::new(0),
        }
    }
}

/// Owns the worker threads and the monitor. Created by `start`, consumed by
/// `stop`. Cancellation is cooperative: nothing ever interrupts an in-flight
/// target execution, workers observe the running flag at loop boundaries.
pub(crate) struct Scheduler {
    shared: Arc<SharedState>,
    workers: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns `worker_threads` workers plus the monitor.
    pub(crate) fn start(shared: Arc<SharedState>) -> io::Result<Self> {
        let worker_count = shared.config.worker_threads;
        let mut workers = Vec::with_capacity(worker_count as usize);
        for worker_id in 0..worker_count {
            let shared_ref = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("gale-worker-{worker_id}"))
                .spawn(move || worker_loop(&shared_ref, worker_id))?;
            workers.push(handle);
        }

        let shared_ref = Arc::clone(&shared);
        let monitor = thread::Builder::new()
            .name("gale-monitor".to_string())
            .spawn(move || monitor_loop(&shared_ref))?;

        Ok(Self {
            shared,
            workers,
            monitor: Some(monitor),
        })
    }

    /// Workers observe the flag at their next loop head and block until
    /// resumed. In-flight executions are not interrupted.
    pub(crate) fn pause(&self) {
        let mut paused = self.shared.paused.lock().expect("pause mutex poisoned");
        *paused = true;
        info!("Fuzzing paused");
    }

    pub(crate) fn resume(&self) {
        let mut paused = self.shared.paused.lock().expect("pause mutex poisoned");
        *paused = false;
        drop(paused);
        self.shared.pause_cv.notify_all();
        info!("Fuzzing resumed");
    }

    /// Clears the running flag, wakes every waiting thread, and joins the
    /// workers and then the monitor. Target cleanup and corpus persistence
    /// belong to the engine, which calls this first.
    pub(crate) fn stop(mut self) {
        self.shared.running.store(false, Ordering::Release);
        // Notify under the respective mutexes so a thread between its
        // predicate check and its wait cannot miss the wakeup.
        {
            let _guard = self.shared.paused.lock().expect("pause mutex poisoned");
            self.shared.pause_cv.notify_all();
        }
        {
            let _guard = self.shared.stop_gate.lock().expect("stop gate poisoned");
            self.shared.stop_cv.notify_all();
        }

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("A worker thread panicked during shutdown");
            }
        }
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                error!("The monitor thread panicked during shutdown");
            }
        }
    }
}

fn make_worker_rng(config: &FuzzConfig, worker_id: u32) -> ChaCha8Rng {
    match config.rng_seed {
        Some(seed) => {
            // Decorrelate worker streams drawn from one user seed.
            ChaCha8Rng::seed_from_u64(seed ^ (u64::from(worker_id) + 1).wrapping_mul(0x9E3779B97F4A7C15))
        }
        None => ChaCha8Rng::from_rng(&mut rand::rng()),
    }
}

fn worker_loop(shared: &SharedState, worker_id: u32) {
    let mut rng = make_worker_rng(&shared.config, worker_id);
    let timeout = Duration::from_millis(shared.config.timeout_ms);
    info!("Worker {worker_id} started");

    loop {
        // Pause gate. Stop wins over pause so shutdown never deadlocks here.
        {
            let mut paused = shared.paused.lock().expect("pause mutex poisoned");
            while *paused && shared.running.load(Ordering::Acquire) {
                paused = shared
                    .pause_cv
                    .wait(paused)
                    .expect("pause mutex poisoned");
            }
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        let max_iterations = shared.config.max_iterations;
        let ticket = match shared
            .admitted
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |claimed| {
                (claimed < max_iterations).then_some(claimed + 1)
            }) {
            Ok(ticket) => ticket,
            Err(_) => {
                info!("Worker {worker_id} reached the iteration bound");
                break;
            }
        };

        let strategy = if shared.strategies.is_empty() {
            MutationStrategy::Random
        } else {
            shared.strategies[rng.random_range(0..shared.strategies.len())]
        };

        // Seeds are drained first; afterwards parents come from the corpus.
        // An empty parent tells the mutator to generate a fresh input.
        let queued_seed = {
            let mut queue = shared.seed_queue.lock().expect("seed queue poisoned");
            queue.pop_front()
        };
        let (parent, second_parent) = match queued_seed {
            Some(seed) => {
                // A queued seed still needs a splice partner from the corpus.
                let partner = (strategy == MutationStrategy::Splice)
                    .then(|| shared.corpus.sample_one(&mut rng).ok())
                    .flatten();
                (seed, partner)
            }
            // Both splice parents come from one consistent corpus snapshot.
            None if strategy == MutationStrategy::Splice => {
                match shared.corpus.sample_pair(&mut rng) {
                    Ok((first, second)) => (first, Some(second)),
                    Err(_) => (Vec::new(), None),
                }
            }
            None => (
                shared.corpus.sample_one(&mut rng).unwrap_or_default(),
                None,
            ),
        };

        // The admission ticket doubles as the deterministic strategy's
        // monotonic counter: unique and strictly increasing across workers.
        let mutant = mutator::mutate(
            &parent,
            second_parent.as_deref(),
            strategy,
            &mut rng,
            &shared.dictionary,
            ticket,
            shared.config.max_input_size,
        );

        // The adapter contract forbids panicking through execute; if one
        // does anyway, degrade it to a per-iteration error.
        let result = catch_unwind(AssertUnwindSafe(|| shared.target.execute(&mutant, timeout)))
            .unwrap_or_else(|_| FuzzResult::Error("target adapter panicked".to_string()));
        shared.iterations.fetch_add(1, Ordering::Relaxed);

        match result {
            FuzzResult::Success { coverage } => {
                let sample = if shared.config.collect_coverage {
                    coverage
                } else {
                    None
                };
                if let Some(sample) = sample {
                    if shared.coverage.merge(&sample) > 0 {
                        shared.corpus.add(mutant);
                        if let Some(callback) = &shared.callbacks.coverage {
                            let info = shared.coverage.info();
                            callback(&info);
                        }
                    }
                }
            }
            FuzzResult::NoNewCoverage => {}
            FuzzResult::Hang => {
                shared.hangs.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Hang detected on iteration {}",
                    shared.iterations.load(Ordering::Relaxed)
                );
            }
            FuzzResult::Crash(context) => {
                let record = crash::analyze(mutant, context);
                handle_crash(shared, record);
            }
            FuzzResult::Error(reason) => {
                warn!("Worker {worker_id} iteration error: {reason}");
            }
        }
    }

    info!("Worker {worker_id} stopped");
}

/// Persists (subject to dedup), counts, and reports one crash. The counter
/// moves on every crash; the file and the callback only on the first crash
/// per dedup-key when deduplication is on.
fn handle_crash(shared: &SharedState, record: CrashRecord) {
    let should_persist = if shared.config.deduplicate_crashes {
        let mut keys = shared.crash_keys.lock().expect("crash registry poisoned");
        keys.insert(record.dedup_key.clone())
    } else {
        true
    };

    if should_persist {
        let sequence = shared.crash_sequence.fetch_add(1, Ordering::Relaxed);
        match persist::write_crash(&shared.config.crashes_dir, sequence, &record) {
            Ok(path) => error!(
                "Crash {} (exploitable: {}) persisted to {}",
                record.dedup_key,
                record.exploitable,
                path.display()
            ),
            Err(e) => error!("Failed to persist crash {}: {e}", record.dedup_key),
        }
    }

    shared.crashes.fetch_add(1, Ordering::Relaxed);

    if should_persist {
        if let Some(callback) = &shared.callbacks.crash {
            callback(&record);
        }
    }
}

fn monitor_loop(shared: &SharedState) {
    info!("Monitor started");
    let mut last_iterations = shared.iterations.load(Ordering::Relaxed);
    let mut last_tick = Instant::now();

    loop {
        let gate = shared.stop_gate.lock().expect("stop gate poisoned");
        let (gate, wait) = shared
            .stop_cv
            .wait_timeout(gate, MONITOR_INTERVAL)
            .expect("stop gate poisoned");
        drop(gate);

        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        if !wait.timed_out() {
            // Spurious wakeup while still running; go back to sleep.
            continue;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last_tick).as_secs_f64();
        let iterations = shared.iterations.load(Ordering::Relaxed);
        let crashes = shared.crashes.load(Ordering::Relaxed);
        let hangs = shared.hangs.load(Ordering::Relaxed);
        let execs_per_second = if elapsed > 0.0 {
            (iterations - last_iterations) as f64 / elapsed
        } else {
            0.0
        };

        info!(
            "Stats - iterations: {iterations}, crashes: {crashes}, hangs: {hangs}, \
             exec/sec: {execs_per_second:.2}, corpus: {}",
            shared.corpus.size()
        );
        if let Some(callback) = &shared.callbacks.progress {
            callback(iterations, crashes);
        }

        last_iterations = iterations;
        last_tick = now;
    }

    info!("Monitor stopped");
}
