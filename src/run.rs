//! Top-level backup run orchestration: wires the Scanner, Reuse Detector,
//! Hash Pre-Pass, and Ingest Coordinator together around one catalog
//! transaction, with rollback on any failure.
//!
//! One function owns the whole backup's lifetime and cleans up on error,
//! the same shape as this workspace's other top-level run entry points.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{Context, Result};
use camino::Utf8Path;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::blobstore::BlobStore;
use crate::catalog::CatalogSession;
use crate::catalog::model::BackupInfo;
use crate::config::Configuration;
use crate::{hashprepass, ingest, reuse, scan};

/// Per-stage wall-clock timings, logged at `debug!` when
/// [`Configuration::debug`] is set. Diagnostic only — nothing downstream
/// reads these back.
#[derive(Debug, Default)]
struct StageTimings {
    scan: std::time::Duration,
    reuse: std::time::Duration,
    hash_prepass: std::time::Duration,
    ingest: std::time::Duration,
    commit: std::time::Duration,
}

/// Runs one backup: scans `src`, reuses what it can from the prior backup,
/// hash-pre-passes size-colliding candidates, ingests everything else, and
/// commits one catalog transaction. Any error along the way rolls the
/// transaction back and best-effort deletes any blob files this run wrote.
#[allow(clippy::too_many_arguments)]
pub fn run(
    bs_root: &Utf8Path,
    catalog_path: &Utf8Path,
    src: &Utf8Path,
    config: &Configuration,
    creator: &str,
    comment: &str,
    tags: BTreeMap<String, String>,
) -> Result<BackupInfo> {
    let bs = BlobStore::open(bs_root).context("Couldn't open the blob store")?;
    bs.prepare_blob_directories()?;
    let mut cs = CatalogSession::open(catalog_path).context("Couldn't open the catalog")?;

    let mut timings = StageTimings::default();
    let rollback: Rc<RefCell<Vec<camino::Utf8PathBuf>>> = Rc::new(RefCell::new(Vec::new()));

    let result = run_inner(&bs, &mut cs, src, config, creator, comment, &tags, &mut timings, &rollback);

    if result.is_err() {
        warn!("Backup run failed, rolling back");
        if let Err(e) = cs.rollback() {
            warn!("Couldn't roll back the catalog transaction: {e:#}");
        }
        for path in rollback.borrow().iter() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Couldn't remove blob {path} while rolling back: {e:#}");
            }
        }
    }

    if config.debug {
        debug!(
            "Stage timings: scan={:?} reuse={:?} hash_prepass={:?} ingest={:?} commit={:?}",
            timings.scan, timings.reuse, timings.hash_prepass, timings.ingest, timings.commit
        );
    }

    result
}

#[allow(clippy::too_many_arguments)]
fn run_inner(
    bs: &BlobStore,
    cs: &mut CatalogSession,
    src: &Utf8Path,
    config: &Configuration,
    creator: &str,
    comment: &str,
    tags: &BTreeMap<String, String>,
    timings: &mut StageTimings,
    rollback: &Rc<RefCell<Vec<camino::Utf8PathBuf>>>,
) -> Result<BackupInfo> {
    let t0 = Instant::now();
    let scan_result = scan::scan(
        src,
        &config.backup.targets,
        &config.backup.ignore_patterns,
        config.backup.follow_target_symlink,
    )
    .context("Scan failed")?;
    timings.scan = t0.elapsed();
    info!("Scanned {} entries under {src}", scan_result.entries.len());

    // Must run before `create_backup` inserts the new (still-empty) backup
    // row: `get_last_backup` is an `ORDER BY id DESC LIMIT 1`, so once the
    // new row exists it would find itself instead of the prior backup.
    let t0 = Instant::now();
    let reused = if config.backup.reuse_stat_unchanged_file {
        reuse::detect(cs, &scan_result.entries)?
    } else {
        Default::default()
    };
    timings.reuse = t0.elapsed();
    info!("{} of {} entries reused by stat", reused.len(), scan_result.entries.len());

    cs.begin()?;
    let backup = cs.create_backup(creator, comment, &scan_result.root_targets, tags)?;

    let t0 = Instant::now();
    let reused_paths: FxHashSet<_> = reused.keys().cloned().collect();
    let precomputed = hashprepass::run(cs, &scan_result.entries, &reused_paths, config.effective_concurrency())?;
    timings.hash_prepass = t0.elapsed();

    let t0 = Instant::now();
    let files = ingest::run(
        bs,
        cs,
        config,
        backup.id,
        &scan_result.entries,
        &reused,
        &precomputed,
        rollback.clone(),
    )?;
    timings.ingest = t0.elapsed();
    info!("Ingested {} files into backup {}", files.len(), backup.id);

    let fingerprints: Vec<_> = files.iter().filter_map(|f| f.blob_fingerprint).collect();
    let (raw_bytes, stored_bytes) = cs.sum_blob_sizes(&fingerprints)?;

    let t0 = Instant::now();
    cs.commit()?;
    timings.commit = t0.elapsed();

    Ok(BackupInfo {
        id: backup.id,
        timestamp: backup.timestamp,
        file_count: files.len(),
        tags: backup.tags,
        raw_bytes,
        stored_bytes,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn backs_up_a_small_tree_end_to_end() -> Result<()> {
        let src = tempfile::tempdir()?;
        let root = Utf8Path::from_path(src.path()).unwrap();
        fs::write(root.join("a.txt"), b"hello")?;
        fs::create_dir(root.join("sub"))?;
        fs::write(root.join("sub/b.txt"), b"hello")?;

        let bs_dir = tempfile::tempdir()?;
        let bs_root = Utf8Path::from_path(bs_dir.path()).unwrap();
        let catalog_dir = tempfile::tempdir()?;
        let catalog_path = Utf8Path::from_path(catalog_dir.path()).unwrap().join("catalog.db");

        let mut config = Configuration::default();
        config.backup.targets = vec!["**".to_string()];

        let info = run(
            bs_root,
            &catalog_path,
            root,
            &config,
            "tester",
            "first backup",
            BTreeMap::new(),
        )?;
        assert_eq!(info.file_count, 3); // a.txt, sub, sub/b.txt
        assert!(info.raw_bytes > 0);

        // a.txt and sub/b.txt are identical, so only one blob gets stored.
        assert_eq!(count_blob_files(bs_root)?, 1);
        Ok(())
    }

    fn count_blob_files(root: &Utf8Path) -> Result<usize> {
        let mut count = 0;
        for top in fs::read_dir(root)? {
            let top = top?;
            if !top.file_type()?.is_dir() {
                continue;
            }
            for inner in fs::read_dir(top.path())? {
                let inner = inner?;
                if inner.file_type()?.is_file() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    #[test]
    fn second_backup_reuses_unchanged_files() -> Result<()> {
        let src = tempfile::tempdir()?;
        let root = Utf8Path::from_path(src.path()).unwrap();
        fs::write(root.join("a.txt"), b"hello")?;

        let bs_dir = tempfile::tempdir()?;
        let bs_root = Utf8Path::from_path(bs_dir.path()).unwrap();
        let catalog_dir = tempfile::tempdir()?;
        let catalog_path = Utf8Path::from_path(catalog_dir.path()).unwrap().join("catalog.db");
        let config = Configuration::default();

        let first = run(bs_root, &catalog_path, root, &config, "tester", "", BTreeMap::new())?;
        let second = run(bs_root, &catalog_path, root, &config, "tester", "", BTreeMap::new())?;
        assert_eq!(first.file_count, second.file_count);
        assert_eq!(first.raw_bytes, second.raw_bytes);
        Ok(())
    }
}
