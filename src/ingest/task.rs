//! The per-file ingest task: acquires a blob for one regular file,
//! suspending only at a [`SizeQuery`](crate::bqm::SizeQuery) or
//! [`HashQuery`](crate::bqm::HashQuery) await, and retrying the whole
//! acquisition up to [`BLOB_CHANGED_RETRY_COUNT`] times if the file's
//! content turns out to have changed mid-read.
//!
//! Grounded on `src/file_util.rs`'s temp-then-rename write pattern for pack
//! files, generalized from "one pack body" to "one content-addressed blob".

use std::cell::RefCell;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, trace};

use crate::blobstore::BlobStore;
use crate::bqm::{Bqm, HashQuery, SizeQuery};
use crate::catalog::CatalogSession;
use crate::catalog::model::{Blob, BackupId, File, FileRole};
use crate::compress::{CompressMethod, CompressWriter};
use crate::config::{BLOB_CHANGED_RETRY_COUNT, Configuration, HASH_ONCE_THRESHOLD};
use crate::error::{IngestError, SizeHashExpectation};
use crate::hashing::{self, Fingerprint, HashingWriter};
use crate::ingest::policy;
use crate::ingest::policy::Policy;
use crate::scan::ScanEntry;

/// Shared, read-only state every in-flight task borrows: the single
/// [`Bqm`] instance, the blob store, the catalog, and the run's
/// configuration/rollback bookkeeping.
pub struct IngestContext<'a> {
    pub bqm: Rc<RefCell<Bqm>>,
    pub bs: &'a BlobStore,
    pub cs: &'a CatalogSession,
    pub config: &'a Configuration,
    pub backup_id: BackupId,
    /// Blob paths newly created this run, appended to as each commit lands,
    /// so a failed run can best-effort delete them.
    pub rollback: Rc<RefCell<Vec<Utf8PathBuf>>>,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_temp_path(ctx: &IngestContext, hint: &Utf8Path) -> Utf8PathBuf {
    let pid = rustix::process::getpid().as_raw_nonzero().get();
    let tid = rustix::thread::gettid().as_raw_nonzero().get();
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tag = hashing::path_uniqueness_tag(hint.as_str());
    ctx.config
        .temp_path
        .join(format!("ingest-{pid}-{tid}-{counter}-{tag}"))
}

/// Removes its temp file on drop unless [`disarm`](Self::disarm) was called,
/// so a task that bails out early (error, or dedup discovering the write was
/// unnecessary) never leaves stray files under the configured temp
/// directory.
struct TempGuard {
    path: Utf8PathBuf,
    armed: bool,
}

impl TempGuard {
    fn new(path: Utf8PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Where an [`acquire_blob`] call reads its bytes from.
enum Source<'a> {
    Bytes(Vec<u8>),
    Path(&'a Utf8Path),
}

/// How [`acquire_blob`] should get bytes into the temp file.
enum WriteMode {
    /// Stream-compress through `method`, used by the `hash_once`/`read_all`/
    /// non-cow `default` write paths.
    Stream(CompressMethod),
    /// Byte-for-byte copy, reflinked when `can_cow`, used by the
    /// `copy_hash`/cow `default` write paths. Always implies
    /// `CompressMethod::Plain`.
    CopyPlain { can_cow: bool },
}

/// Acquires a blob for `source`, writing it if necessary.
///
/// If `known_fingerprint` is `Some`, it's checked against the catalog
/// *before* writing anything (the `read_all`/precomputed-hash paths, where
/// the hash is already in hand and a dedup hit skips the write entirely),
/// and checked again *after* writing, where a mismatch means the source
/// changed underneath us and is reported as [`IngestError::BlobFileChanged`]
/// for the caller's retry loop to handle.
///
/// If `known_fingerprint` is `None`, the hash is only knowable once the
/// write finishes; if `postwrite_dedup_check` is also set, it's then checked
/// against the catalog *after* writing, discarding the freshly-written temp
/// file in favor of an existing blob on a dedup hit. `hash_once` passes
/// `false` here: §4.6.6 forbids a task from suspending on a BQM request
/// between policy selection and blob commit once `hash_once` is chosen,
/// since a concurrent task could otherwise observe the same size as
/// not-yet-existing and also pick `hash_once`, producing two blob files for
/// the same content. `hash_once` is only reachable when the size-existence
/// lookup already came back false, so a post-write hash hit would only ever
/// be another `hash_once`/`copy_hash` task racing this one — `create_blob_or_get`'s
/// upsert-or-get already resolves that race without needing a suspension here.
///
/// `expected_size` is the size observed by the caller's `stat` at the start
/// of this attempt; it's checked against the bytes actually read/copied
/// regardless of whether the hash was already known, since a file that
/// shrinks or grows mid-read can otherwise slip through as a silently wrong
/// blob when no precomputed hash was in hand to catch the mismatch.
async fn acquire_blob(
    ctx: &IngestContext<'_>,
    source: Source<'_>,
    mode: WriteMode,
    known_fingerprint: Option<Fingerprint>,
    postwrite_dedup_check: bool,
    expected_size: u64,
    error_path: &Utf8Path,
) -> Result<Blob, IngestError> {
    if let Some(fp) = known_fingerprint {
        if let Some(blob) = HashQuery::new(ctx.bqm.clone(), fp).await {
            trace!("{error_path}: dedup hit on precomputed hash {}", fp.short_name());
            crate::counters::bump(crate::counters::Op::DedupPrewriteHit);
            return Ok(blob);
        }
    }

    let temp_path = unique_temp_path(ctx, error_path);
    let guard = TempGuard::new(temp_path.clone());

    let (fingerprint, raw_size, stored_size, compress_method) = write_temp(&source, &mode, &temp_path)?;

    if raw_size != expected_size || known_fingerprint.is_some_and(|expected| expected != fingerprint) {
        let detail = SizeHashExpectation {
            expected_size,
            observed_size: raw_size,
            expected_hash: known_fingerprint,
            observed_hash: fingerprint,
        };
        return Err(IngestError::blob_file_changed(error_path.to_path_buf(), detail.to_string()));
    }

    if known_fingerprint.is_none() && postwrite_dedup_check {
        if let Some(blob) = HashQuery::new(ctx.bqm.clone(), fingerprint).await {
            trace!(
                "{error_path}: wrote a blob nobody needed, {} already exists",
                fingerprint.short_name()
            );
            crate::counters::bump(crate::counters::Op::DedupPostwriteHit);
            return Ok(blob);
        }
    }

    let blob_path = ctx.bs.get_blob_path(&fingerprint);
    crate::blobstore::rename_or_copy(&temp_path, &blob_path).map_err(IngestError::Other)?;
    guard.disarm();
    ctx.rollback.borrow_mut().push(blob_path.clone());

    let blob = ctx
        .cs
        .create_blob_or_get(fingerprint, compress_method, raw_size, stored_size)?;
    {
        let mut bqm = ctx.bqm.borrow_mut();
        bqm.record_size_exists(blob.raw_size);
        bqm.record_blob(fingerprint, blob.clone());
    }
    debug!("{error_path}: wrote blob {} ({} -> {} bytes)", fingerprint.short_name(), raw_size, stored_size);
    Ok(blob)
}

/// The actual (blocking, non-suspending) bytes-to-temp-file write. Returns
/// the computed fingerprint, raw size, stored size, and the compression
/// method actually used (always `Plain` for `CopyPlain`).
fn write_temp(
    source: &Source,
    mode: &WriteMode,
    temp_path: &Utf8Path,
) -> Result<(Fingerprint, u64, u64, CompressMethod), IngestError> {
    match mode {
        WriteMode::Stream(method) => {
            let out = fs::File::create(temp_path)
                .map_err(|e| IngestError::Other(anyhow::anyhow!(e).context(format!("Couldn't create {temp_path}"))))?;
            let mut writer = HashingWriter::new(CompressWriter::new(*method, out).map_err(IngestError::Other)?);
            match source {
                Source::Bytes(bytes) => writer.write_all(bytes)?,
                Source::Path(p) => {
                    let mut src = io::BufReader::new(fs::File::open(p).map_err(|e| {
                        if e.kind() == io::ErrorKind::NotFound {
                            IngestError::SourceFileNotFound(p.to_path_buf())
                        } else {
                            IngestError::Io(e)
                        }
                    })?);
                    io::copy(&mut src, &mut writer)?;
                }
            }
            let (fingerprint, raw_size, compressor) = writer.finalize();
            let file = compressor.finish().map_err(IngestError::Other)?;
            let stored_size = file.metadata()?.len();
            Ok((fingerprint, raw_size, stored_size, *method))
        }
        WriteMode::CopyPlain { can_cow } => {
            match source {
                Source::Bytes(bytes) => fs::write(temp_path, bytes)?,
                Source::Path(p) => {
                    crate::blobstore::copy_file_fast(p, temp_path, *can_cow).map_err(IngestError::Other)?;
                    if *can_cow {
                        crate::counters::bump(crate::counters::Op::CowCopy);
                    }
                }
            }
            let fingerprint = hashing::hash_file(temp_path).map_err(IngestError::Other)?;
            let size = fs::metadata(temp_path)?.len();
            Ok((fingerprint, size, size, CompressMethod::Plain))
        }
    }
}

/// Builds the `async fn`-shaped future for one regular file's blob
/// acquisition and catalog row, including the retry-on-`BlobFileChanged`
/// loop and the `copy_hash`-as-last-resort guarantee: a `last_chance`
/// attempt always succeeds, short of the file vanishing entirely, since it
/// never depends on a stat taken earlier.
pub async fn ingest_regular_file(
    ctx: &IngestContext<'_>,
    entry: &ScanEntry,
    precomputed: Option<Fingerprint>,
) -> Result<File, IngestError> {
    let path = &entry.abs_path;
    let mut precomputed = precomputed;

    for attempt in 1..=BLOB_CHANGED_RETRY_COUNT {
        let last_chance = attempt == BLOB_CHANGED_RETRY_COUNT;

        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(IngestError::SourceFileNotFound(path.clone()));
            }
            Err(e) => return Err(IngestError::Io(e)),
        };
        if !meta.is_file() {
            return Err(IngestError::UnsupportedFileFormat {
                path: path.clone(),
                mode: meta.mode(),
            });
        }
        let size = meta.len();
        let compress_method = ctx.config.backup.compress_method_for_size(size);
        let can_cow = ctx.bs.can_copy_on_write(compress_method, meta.dev());
        let has_hash = !last_chance && precomputed.is_some();

        let blob_with_size_exists = if policy::needs_size_lookup(last_chance, has_hash, can_cow, size) {
            SizeQuery::new(ctx.bqm.clone(), size).await
        } else {
            false
        };
        let policy = policy::select(last_chance, has_hash, can_cow, size, blob_with_size_exists);
        trace!("{path}: attempt {attempt} using policy {policy}");
        crate::counters::bump(match policy {
            Policy::ReadAll => crate::counters::Op::PolicyReadAll,
            Policy::HashOnce => crate::counters::Op::PolicyHashOnce,
            Policy::CopyHash => crate::counters::Op::PolicyCopyHash,
            Policy::Default => crate::counters::Op::PolicyDefault,
        });

        let result = match policy {
            Policy::ReadAll => match fs::read(path) {
                Ok(bytes) if bytes.len() as u64 == size => {
                    let fp = Fingerprint::hash(&bytes);
                    acquire_blob(ctx, Source::Bytes(bytes), WriteMode::Stream(compress_method), Some(fp), true, size, path).await
                }
                Ok(_) => Err(IngestError::blob_file_changed(path.clone(), "size changed during read_all")),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(IngestError::SourceFileNotFound(path.clone()));
                }
                Err(e) => Err(IngestError::Io(e)),
            },
            Policy::HashOnce => {
                // No post-write dedup yield: see `acquire_blob`'s doc comment.
                acquire_blob(ctx, Source::Path(path), WriteMode::Stream(compress_method), None, false, size, path).await
            }
            Policy::CopyHash => {
                acquire_blob(ctx, Source::Path(path), WriteMode::CopyPlain { can_cow }, None, true, size, path).await
            }
            Policy::Default if has_hash => {
                let fp = precomputed.expect("has_hash implies precomputed.is_some()");
                let mode = if can_cow {
                    WriteMode::CopyPlain { can_cow: true }
                } else {
                    WriteMode::Stream(compress_method)
                };
                acquire_blob(ctx, Source::Path(path), mode, Some(fp), true, size, path).await
            }
            Policy::Default => {
                let mode = if can_cow {
                    WriteMode::CopyPlain { can_cow: true }
                } else {
                    WriteMode::Stream(compress_method)
                };
                acquire_blob(ctx, Source::Path(path), mode, None, true, size, path).await
            }
        };

        match result {
            Ok(blob) => {
                return Ok(ctx.cs.create_file(
                    ctx.backup_id,
                    &entry.rel_path,
                    meta.mode(),
                    meta.uid(),
                    meta.gid(),
                    crate::statutil::mtime_us(&meta),
                    blob.raw_size,
                    None,
                    Some(blob.fingerprint),
                    FileRole::Regular,
                )?);
            }
            Err(IngestError::BlobFileChanged { path, detail }) => {
                debug!("{path}: {detail}, retrying (attempt {attempt})");
                crate::counters::bump(crate::counters::Op::BlobFileChangedRetry);
                precomputed = None;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(IngestError::VolatileBlobFile(path.clone()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blobstore::BlobStore;
    use crate::config::Configuration;
    use crate::ingest::sched;
    use camino::Utf8Path;
    use std::future::Future;
    use std::pin::Pin;

    struct Harness {
        _blob_dir: tempfile::TempDir,
        bs: BlobStore,
        cs: CatalogSession,
        config: Configuration,
        backup_id: BackupId,
    }

    impl Harness {
        fn new(temp_path: &Utf8Path) -> anyhow::Result<Self> {
            let blob_dir = tempfile::tempdir()?;
            let bs = BlobStore::open(Utf8Path::from_path(blob_dir.path()).unwrap())?;
            bs.prepare_blob_directories()?;
            let cs = CatalogSession::open_in_memory()?;
            let mut config = Configuration::default();
            config.temp_path = temp_path.to_path_buf();
            let backup = cs.create_backup("tester", "", &[], &Default::default())?;
            Ok(Self {
                _blob_dir: blob_dir,
                bs,
                cs,
                config,
                backup_id: backup.id,
            })
        }

        fn ingest_one(&self, entry: &ScanEntry, precomputed: Option<Fingerprint>) -> Result<File, IngestError> {
            let bqm = Rc::new(RefCell::new(Bqm::new()));
            let ctx = IngestContext {
                bqm: bqm.clone(),
                bs: &self.bs,
                cs: &self.cs,
                config: &self.config,
                backup_id: self.backup_id,
                rollback: Rc::new(RefCell::new(Vec::new())),
            };
            let tasks: Vec<Pin<Box<dyn Future<Output = Result<File, IngestError>> + '_>>> =
                vec![Box::pin(ingest_regular_file(&ctx, entry, precomputed))];
            let mut results = sched::drive(bqm, &self.cs, tasks).map_err(IngestError::Other)?;
            results.remove(0)
        }
    }

    fn entry_for(path: &Utf8Path, rel: &str) -> anyhow::Result<ScanEntry> {
        Ok(ScanEntry {
            abs_path: path.to_path_buf(),
            rel_path: Utf8PathBuf::from(rel),
            metadata: fs::symlink_metadata(path)?,
        })
    }

    #[test]
    fn small_file_is_read_all_and_committed() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        let temp = tempfile::tempdir()?;
        let f = Utf8Path::from_path(src.path()).unwrap().join("a.txt");
        fs::write(&f, b"hello")?;

        let harness = Harness::new(Utf8Path::from_path(temp.path()).unwrap())?;
        let entry = entry_for(&f, "a.txt")?;
        let file = harness.ingest_one(&entry, None)?;

        assert_eq!(file.size, 5);
        assert_eq!(file.blob_fingerprint, Some(Fingerprint::hash(b"hello")));
        let blob = harness
            .cs
            .get_blobs(&[file.blob_fingerprint.unwrap()])?
            .remove(&file.blob_fingerprint.unwrap())
            .unwrap();
        assert_eq!(blob.raw_size, 5);
        Ok(())
    }

    #[test]
    fn large_file_uses_hash_once_and_commits() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        let temp = tempfile::tempdir()?;
        let f = Utf8Path::from_path(src.path()).unwrap().join("big.bin");
        let bytes = vec![7u8; (HASH_ONCE_THRESHOLD + 1) as usize];
        fs::write(&f, &bytes)?;

        let harness = Harness::new(Utf8Path::from_path(temp.path()).unwrap())?;
        let entry = entry_for(&f, "big.bin")?;
        let file = harness.ingest_one(&entry, None)?;

        assert_eq!(file.size, bytes.len() as u64);
        assert_eq!(file.blob_fingerprint, Some(Fingerprint::hash(&bytes)));
        Ok(())
    }

    #[test]
    fn precomputed_hash_skips_rehashing_on_dedup_hit() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        let temp = tempfile::tempdir()?;
        let f = Utf8Path::from_path(src.path()).unwrap().join("dup.txt");
        fs::write(&f, b"shared")?;

        let harness = Harness::new(Utf8Path::from_path(temp.path()).unwrap())?;
        let fp = Fingerprint::hash(b"shared");
        harness.cs.create_blob_or_get(fp, CompressMethod::Plain, 6, 6)?;

        let entry = entry_for(&f, "dup.txt")?;
        let file = harness.ingest_one(&entry, Some(fp))?;
        assert_eq!(file.blob_fingerprint, Some(fp));
        Ok(())
    }

    #[test]
    fn missing_file_reports_source_file_not_found() -> anyhow::Result<()> {
        let src = tempfile::tempdir()?;
        let temp = tempfile::tempdir()?;
        let f = Utf8Path::from_path(src.path()).unwrap().join("gone.txt");
        fs::write(&f, b"temporary")?;
        let entry = entry_for(&f, "gone.txt")?;
        fs::remove_file(&f)?;

        let harness = Harness::new(Utf8Path::from_path(temp.path()).unwrap())?;
        let err = harness.ingest_one(&entry, None).unwrap_err();
        assert!(matches!(err, IngestError::SourceFileNotFound(_)));
        Ok(())
    }
}
