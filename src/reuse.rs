//! The Reuse Detector: finds files whose stat signature is unchanged
//! since the most recent backup, so the Ingest Coordinator can bypass blob
//! creation entirely for them.
//!
//! Grounded on `src/ui/backup/walk.rs`'s file-changed comparator, inverted:
//! that code decides whether a file needs re-chunking; this decides whether
//! a file can skip ingestion altogether.

use std::os::unix::fs::MetadataExt;

use anyhow::Result;
use camino::Utf8PathBuf;
use rustc_hash::FxHashMap;

use crate::catalog::CatalogSession;
use crate::catalog::model::{File, ReuseKey};
use crate::scan::ScanEntry;
use crate::statutil::mtime_us;

/// Absolute scanned path → prior File row eligible for stat-based reuse.
pub fn detect(
    cs: &CatalogSession,
    entries: &[ScanEntry],
) -> Result<FxHashMap<Utf8PathBuf, File>> {
    let mut reused = FxHashMap::default();

    let Some(last_backup) = cs.get_last_backup()? else {
        return Ok(reused);
    };
    let prior_files = cs.get_backup_files(last_backup.id)?;

    let mut by_key: FxHashMap<ReuseKey, File> = FxHashMap::default();
    for file in prior_files {
        if let Some(key) = file.reuse_key() {
            by_key.insert(key, file);
        }
    }
    if by_key.is_empty() {
        return Ok(reused);
    }

    for entry in entries {
        if !entry.metadata.is_file() {
            continue;
        }
        let key = ReuseKey {
            path: entry.rel_path.clone(),
            size: entry.metadata.len(),
            mode: entry.metadata.mode(),
            uid: entry.metadata.uid(),
            gid: entry.metadata.gid(),
            mtime_us: mtime_us(&entry.metadata),
        };
        if let Some(prior) = by_key.get(&key) {
            reused.insert(entry.abs_path.clone(), prior.clone());
            crate::counters::bump(crate::counters::Op::StatReuseHit);
        } else {
            crate::counters::bump(crate::counters::Op::StatReuseMiss);
        }
    }

    Ok(reused)
}
