//! The Ingest Coordinator (IC): turns each non-reused scan entry into
//! a catalog `File` row, acquiring a blob for every regular file along the
//! way. Directories and symlinks never need a blob and are handled inline;
//! regular files run as cooperatively-scheduled tasks over the shared
//! [`Bqm`](crate::bqm::Bqm) (see [`sched`]).

pub mod policy;
pub mod sched;
pub mod task;

use std::cell::RefCell;
use std::future::Future;
use std::os::unix::fs::MetadataExt;
use std::pin::Pin;
use std::rc::Rc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::blobstore::BlobStore;
use crate::bqm::Bqm;
use crate::catalog::CatalogSession;
use crate::catalog::model::{BackupId, File, FileRole};
use crate::config::Configuration;
use crate::error::IngestError;
use crate::hashing::Fingerprint;
use crate::scan::{PatternSet, ScanEntry};
use crate::statutil::mtime_us;
use task::IngestContext;

/// Ingests every entry of `entries` in order, returning the `File` rows to
/// associate with `backup_id`. Entries present in `reused` are cloned from
/// their prior row without touching the blob store; everything else goes
/// through the reuse-free path below.
#[allow(clippy::too_many_arguments)]
pub fn run(
    bs: &BlobStore,
    cs: &CatalogSession,
    config: &Configuration,
    backup_id: BackupId,
    entries: &[ScanEntry],
    reused: &FxHashMap<Utf8PathBuf, File>,
    precomputed_hashes: &FxHashMap<Utf8PathBuf, Fingerprint>,
    rollback: Rc<RefCell<Vec<Utf8PathBuf>>>,
) -> Result<Vec<File>> {
    let skip_missing = if config.backup.creation_skip_missing_file_patterns.is_empty() {
        None
    } else {
        Some(PatternSet::compile(
            Utf8Path::new("/"),
            &config.backup.creation_skip_missing_file_patterns,
        )?)
    };

    let mut results: Vec<Option<File>> = entries.iter().map(|_| None).collect();
    let mut task_indices = Vec::new();
    let mut tasks: Vec<Pin<Box<dyn Future<Output = Result<File, IngestError>> + '_>>> = Vec::new();

    let bqm = Rc::new(RefCell::new(Bqm::new()));
    let ctx = IngestContext {
        bqm: bqm.clone(),
        bs,
        cs,
        config,
        backup_id,
        rollback,
    };

    for (i, entry) in entries.iter().enumerate() {
        if let Some(prior) = reused.get(&entry.abs_path) {
            results[i] = Some(cs.create_file_from(backup_id, prior)?);
            continue;
        }
        if entry.metadata.is_dir() {
            results[i] = Some(build_simple_file(cs, backup_id, entry, FileRole::Directory, None)?);
            continue;
        }
        if entry.metadata.is_symlink() {
            let target = std::fs::read_link(&entry.abs_path)?;
            let target = Utf8PathBuf::try_from(target)
                .map_err(|_| IngestError::NonUtf8SymlinkTarget(entry.abs_path.clone()))?;
            results[i] = Some(build_simple_file(
                cs,
                backup_id,
                entry,
                FileRole::Symlink,
                Some(target.as_str().as_bytes().to_vec()),
            )?);
            continue;
        }
        if !entry.metadata.is_file() {
            return Err(IngestError::UnsupportedFileFormat {
                path: entry.abs_path.clone(),
                mode: entry.metadata.mode(),
            }
            .into());
        }
        let precomputed = precomputed_hashes.get(&entry.abs_path).copied();
        task_indices.push(i);
        tasks.push(Box::pin(task::ingest_regular_file(&ctx, entry, precomputed)));
    }

    let task_results = sched::drive(bqm, cs, tasks)?;
    for (task_result, entry_idx) in task_results.into_iter().zip(task_indices) {
        match task_result {
            Ok(file) => results[entry_idx] = Some(file),
            Err(IngestError::SourceFileNotFound(path))
                if should_skip_missing(config, &skip_missing, &entries[entry_idx].rel_path) =>
            {
                warn!("{path}: vanished before it could be ingested, skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(results.into_iter().flatten().collect())
}

/// Whether a vanished source file should be silently dropped from the
/// backup rather than failing the whole run. With no configured patterns,
/// the feature flag alone governs: any missing file is eligible.
fn should_skip_missing(config: &Configuration, skip_missing: &Option<PatternSet>, rel: &Utf8Path) -> bool {
    if !config.backup.creation_skip_missing_file {
        return false;
    }
    match skip_missing {
        None => true,
        Some(patterns) => patterns.is_match(rel, false),
    }
}

fn build_simple_file(
    cs: &CatalogSession,
    backup_id: BackupId,
    entry: &ScanEntry,
    role: FileRole,
    content: Option<Vec<u8>>,
) -> Result<File> {
    let size = content.as_ref().map(|c| c.len() as u64).unwrap_or(0);
    cs.create_file(
        backup_id,
        &entry.rel_path,
        entry.metadata.mode(),
        entry.metadata.uid(),
        entry.metadata.gid(),
        mtime_us(&entry.metadata),
        size,
        content.as_deref(),
        None,
        role,
    )
}
