//! The Hash Pre-Pass (HPP): pre-hashes files whose size collides with an
//! existing blob, using a fail-fast `rayon` worker pool.
//!
//! Results collect behind a `Mutex`, driven by
//! `par_iter().try_for_each_with`, the first error aborting the whole pool.

use std::sync::Mutex;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::catalog::CatalogSession;
use crate::hashing::{self, Fingerprint};
use crate::scan::ScanEntry;

/// Hashes every regular, non-reused scan entry whose size collides with an
/// existing blob. Returns the map HPP contributes to the run's `hashes`
/// pre-calc table. Runs nothing (and returns an empty map) when
/// `worker_count <= 1` — the pre-pass only runs when effective concurrency
/// is above 1.
pub fn run(
    cs: &CatalogSession,
    entries: &[ScanEntry],
    reused: &FxHashSet<Utf8PathBuf>,
    worker_count: usize,
) -> Result<FxHashMap<Utf8PathBuf, Fingerprint>> {
    if worker_count <= 1 {
        return Ok(FxHashMap::default());
    }

    let candidates: Vec<&ScanEntry> = entries
        .iter()
        .filter(|e| e.metadata.is_file() && !reused.contains(&e.abs_path))
        .collect();
    if candidates.is_empty() {
        return Ok(FxHashMap::default());
    }

    let distinct_sizes: Vec<u64> = candidates
        .iter()
        .map(|e| e.metadata.len())
        .collect::<FxHashSet<_>>()
        .into_iter()
        .collect();
    let existence = cs.has_blob_with_size_batched(&distinct_sizes)?;

    let colliding: Vec<&ScanEntry> = candidates
        .into_iter()
        .filter(|e| existence.get(&e.metadata.len()).copied().unwrap_or(false))
        .collect();
    debug!(
        "Hash pre-pass: {} of {} candidate files have a size collision",
        colliding.len(),
        distinct_sizes.len()
    );
    if colliding.is_empty() {
        return Ok(FxHashMap::default());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count)
        .build()
        .context("Couldn't build the hash pre-pass worker pool")?;

    let hashes = Mutex::new(FxHashMap::default());
    pool.install(|| {
        colliding.par_iter().try_for_each(|entry| -> Result<()> {
            let fp = hashing::hash_file(&entry.abs_path)?;
            hashes.lock().unwrap().insert(entry.abs_path.clone(), fp);
            Ok(())
        })
    })?;

    Ok(hashes.into_inner().unwrap())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compress::CompressMethod;
    use camino::Utf8Path;
    use std::fs;

    fn entry_for(path: &Utf8Path) -> ScanEntry {
        ScanEntry {
            abs_path: path.to_path_buf(),
            rel_path: Utf8PathBuf::from(path.file_name().unwrap()),
            metadata: fs::symlink_metadata(path).unwrap(),
        }
    }

    #[test]
    fn only_hashes_size_colliding_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let colliding = root.join("colliding");
        let unique = root.join("unique");
        fs::write(&colliding, b"abc")?;
        fs::write(&unique, b"abcdefgh")?;

        let cs = CatalogSession::open_in_memory()?;
        cs.create_blob_or_get(Fingerprint::hash(b"xyz"), CompressMethod::Plain, 3, 3)?;

        let entries = vec![entry_for(&colliding), entry_for(&unique)];
        let hashes = run(&cs, &entries, &FxHashSet::default(), 4)?;

        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes.get(&colliding), Some(&Fingerprint::hash(b"abc")));
        Ok(())
    }

    #[test]
    fn single_threaded_run_hashes_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let f = root.join("f");
        fs::write(&f, b"abc")?;
        let cs = CatalogSession::open_in_memory()?;
        let entries = vec![entry_for(&f)];
        let hashes = run(&cs, &entries, &FxHashSet::default(), 1)?;
        assert!(hashes.is_empty());
        Ok(())
    }

    #[test]
    fn reused_files_are_never_hashed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let f = root.join("f");
        fs::write(&f, b"abc")?;
        let cs = CatalogSession::open_in_memory()?;
        cs.create_blob_or_get(Fingerprint::hash(b"xyz"), CompressMethod::Plain, 3, 3)?;

        let mut reused = FxHashSet::default();
        reused.insert(f.clone());
        let entries = vec![entry_for(&f)];
        let hashes = run(&cs, &entries, &reused, 4)?;
        assert!(hashes.is_empty());
        Ok(())
    }
}
