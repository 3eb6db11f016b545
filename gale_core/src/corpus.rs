use log::debug;
use rand::Rng;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

use crate::util;

/// Errors that can occur during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// Sampling was requested from a corpus with no entries.
    #[error("Corpus is empty, cannot sample an input")]
    Empty,
    /// An I/O error occurred while loading or saving corpus files.
    #[error("Corpus I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where a corpus entry came from. Advisory only: nothing in the engine
/// reads it for correctness, it exists for operators inspecting a corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Provided by the user before the session started.
    Seed,
    /// Kept because it produced at least one bit of new coverage.
    NewCoverage,
    /// Read back from a corpus directory.
    Loaded,
}

#[derive(Debug, Clone)]
pub struct CorpusEntry {
    pub input: Vec<u8>,
    pub provenance: Provenance,
}

/// The evolving set of inputs worth mutating.
///
/// Entries are only ever appended: the caller (the coverage path) has
/// already decided novelty before calling [`CorpusManager::add`], so no
/// content deduplication happens here. Every operation takes `&self` and is
/// safe under concurrent callers; the inner mutex guards short critical
/// sections only and must never be held across a target execution.
#[derive(Debug, Default)]
pub struct CorpusManager {
    entries: Mutex<Vec<CorpusEntry>>,
}

impl CorpusManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an input. Empty inputs are silently ignored, keeping the
    /// invariant that every corpus entry is non-empty.
    pub fn add(&self, input: Vec<u8>) {
        self.add_with_provenance(input, Provenance::NewCoverage);
    }

    pub fn add_with_provenance(&self, input: Vec<u8>, provenance: Provenance) {
        if input.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().expect("corpus mutex poisoned");
        entries.push(CorpusEntry { input, provenance });
    }

    /// Uniform sample over the current entries.
    pub fn sample_one(&self, rng: &mut impl Rng) -> Result<Vec<u8>, CorpusError> {
        let entries = self.entries.lock().expect("corpus mutex poisoned");
        if entries.is_empty() {
            return Err(CorpusError::Empty);
        }
        let index = rng.random_range(0..entries.len());
        Ok(entries[index].input.clone())
    }

    /// Two independent uniform samples from one consistent snapshot; both
    /// may refer to the same entry.
    pub fn sample_pair(&self, rng: &mut impl Rng) -> Result<(Vec<u8>, Vec<u8>), CorpusError> {
        let entries = self.entries.lock().expect("corpus mutex poisoned");
        if entries.is_empty() {
            return Err(CorpusError::Empty);
        }
        let first = rng.random_range(0..entries.len());
        let second = rng.random_range(0..entries.len());
        Ok((entries[first].input.clone(), entries[second].input.clone()))
    }

    /// Reads every regular file directly under `dir` and appends each
    /// non-empty file's bytes as an entry. Subdirectories are not
    /// traversed; unreadable and empty files are skipped silently.
    pub fn load_from_directory(&self, dir: &Path) -> Result<usize, CorpusError> {
        let read_dir = fs::read_dir(dir).map_err(|e| CorpusError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;

        let mut loaded = 0;
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match util::read_file(&path) {
                Ok(data) if !data.is_empty() => {
                    self.add_with_provenance(data, Provenance::Loaded);
                    loaded += 1;
                }
                Ok(_) => debug!("Skipping empty corpus file {path:?}"),
                Err(e) => debug!("Skipping unreadable corpus file {path:?}: {e}"),
            }
        }
        Ok(loaded)
    }

    /// Consistent snapshot of the current entries, in insertion order.
    pub fn entries(&self) -> Vec<CorpusEntry> {
        self.entries.lock().expect("corpus mutex poisoned").clone()
    }

    /// Writes each entry to `<dir>/input_<i>.bin` where `i` is the entry's
    /// zero-based position, creating `dir` if absent and overwriting files
    /// that already carry the same name.
    pub fn save_to_directory(&self, dir: &Path) -> Result<(), CorpusError> {
        fs::create_dir_all(dir).map_err(|e| CorpusError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;

        for (index, entry) in self.entries().iter().enumerate() {
            let path = dir.join(format!("input_{index}.bin"));
            util::write_file(&path, &entry.input).map_err(|e| CorpusError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.entries.lock().expect("corpus mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn add_appends_and_size_tracks_count() {
        let corpus = CorpusManager::new();
        assert!(corpus.is_empty());
        corpus.add(vec![1]);
        corpus.add(vec![2, 2]);
        corpus.add(vec![3, 3, 3]);
        assert_eq!(corpus.size(), 3);
    }

    #[test]
    fn entries_snapshot_preserves_insertion_order_and_provenance() {
        let corpus = CorpusManager::new();
        corpus.add_with_provenance(vec![1], Provenance::Seed);
        corpus.add(vec![2, 2]);
        let snapshot = corpus.entries();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].input, vec![1]);
        assert_eq!(snapshot[0].provenance, Provenance::Seed);
        assert_eq!(snapshot[1].input, vec![2, 2]);
        assert_eq!(snapshot[1].provenance, Provenance::NewCoverage);
    }

    #[test]
    fn add_empty_input_leaves_size_unchanged() {
        let corpus = CorpusManager::new();
        corpus.add(vec![1, 2]);
        corpus.add(Vec::new());
        assert_eq!(corpus.size(), 1, "Empty inputs must never enter the corpus");
    }

    #[test]
    fn sample_one_on_empty_corpus_fails_without_panicking() {
        let corpus = CorpusManager::new();
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        match corpus.sample_one(&mut rng) {
            Err(CorpusError::Empty) => {}
            other => panic!("Expected CorpusError::Empty, got {other:?}"),
        }
        match corpus.sample_pair(&mut rng) {
            Err(CorpusError::Empty) => {}
            other => panic!("Expected CorpusError::Empty, got {other:?}"),
        }
    }

    #[test]
    fn sample_one_covers_every_entry_eventually() {
        let corpus = CorpusManager::new();
        corpus.add(vec![b'a']);
        corpus.add(vec![b'b']);
        corpus.add(vec![b'c']);

        let mut rng = ChaCha8Rng::from_seed([42u8; 32]);
        let mut seen: HashMap<Vec<u8>, usize> = HashMap::new();
        for _ in 0..200 {
            let sampled = corpus.sample_one(&mut rng).unwrap();
            *seen.entry(sampled).or_insert(0) += 1;
        }
        assert_eq!(seen.len(), 3, "Uniform sampling should reach all entries");
    }

    #[test]
    fn sample_pair_may_return_the_same_entry_twice() {
        let corpus = CorpusManager::new();
        corpus.add(vec![7]);
        let mut rng = ChaCha8Rng::from_seed([9u8; 32]);
        let (a, b) = corpus.sample_pair(&mut rng).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn save_then_load_round_trips_the_corpus_as_a_multiset() {
        let corpus = CorpusManager::new();
        corpus.add(vec![1]);
        corpus.add(vec![2, 2]);
        corpus.add(vec![2, 2]);
        corpus.add(vec![3, 3, 3]);

        let dir = tempdir().unwrap();
        corpus.save_to_directory(dir.path()).unwrap();

        let reloaded = CorpusManager::new();
        let count = reloaded.load_from_directory(dir.path()).unwrap();
        assert_eq!(count, 4);
        assert_eq!(reloaded.size(), 4);

        let mut original: Vec<Vec<u8>> = (0..4)
            .map(|i| util::read_file(&dir.path().join(format!("input_{i}.bin"))).unwrap())
            .collect();
        let mut round_tripped: Vec<Vec<u8>> = reloaded
            .entries()
            .into_iter()
            .map(|e| e.input)
            .collect();
        original.sort();
        round_tripped.sort();
        assert_eq!(original, round_tripped);
        dir.close().unwrap();
    }

    #[test]
    fn load_from_directory_skips_subdirectories_and_empty_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("good.bin"), [1, 2, 3]).unwrap();
        fs::write(dir.path().join("empty.bin"), []).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("deep.bin"), [9]).unwrap();

        let corpus = CorpusManager::new();
        let loaded = corpus.load_from_directory(dir.path()).unwrap();
        assert_eq!(loaded, 1, "Only the non-empty top-level file counts");
        assert_eq!(corpus.size(), 1);
        dir.close().unwrap();
    }

    #[test]
    fn load_from_missing_directory_reports_io_error() {
        let corpus = CorpusManager::new();
        let missing = Path::new("/nonexistent/gale/corpus");
        match corpus.load_from_directory(missing) {
            Err(CorpusError::Io { .. }) => {}
            other => panic!("Expected CorpusError::Io, got {other:?}"),
        }
    }

    #[test]
    fn save_to_directory_creates_the_directory_and_overwrites() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("fresh");
        let corpus = CorpusManager::new();
        corpus.add(vec![0xAB]);
        corpus.save_to_directory(&target).unwrap();
        assert_eq!(util::read_file(&target.join("input_0.bin")).unwrap(), vec![0xAB]);

        // Second save with different content reuses the same filenames.
        let replacement = CorpusManager::new();
        replacement.add(vec![0xCD, 0xEF]);
        replacement.save_to_directory(&target).unwrap();
        assert_eq!(
            util::read_file(&target.join("input_0.bin")).unwrap(),
            vec![0xCD, 0xEF]
        );
        dir.close().unwrap();
    }

    #[test]
    fn concurrent_adds_all_land() {
        let corpus = Arc::new(CorpusManager::new());
        let mut handles = Vec::new();
        for thread_id in 0..4u8 {
            let corpus = Arc::clone(&corpus);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u8 {
                    corpus.add(vec![thread_id, i]);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(corpus.size(), 400);
    }
}
