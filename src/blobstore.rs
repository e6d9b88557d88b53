//! The Blob Store (BS): a content-addressed directory layout mapping a
//! fingerprint to a file on disk, plus the filesystem capability probes
//! that feed the `can_copy_on_write` predicate.
//!
//! Atomic rename with an `EXDEV` copy-then-remove fallback, and a `{:02x}`
//! fan-out directory layout, the same pattern this workspace's other
//! on-disk stores use.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, trace, warn};

use crate::compress::CompressMethod;
use crate::hashing::Fingerprint;

pub struct BlobStore {
    root: Utf8PathBuf,
    /// `st_dev` of `BS_ROOT`, probed once at open time.
    dev: u64,
    /// Whether `BS_ROOT`'s filesystem supports reflink-style copy-on-write,
    /// probed once and cached for the run.
    cow_supported: bool,
}

impl BlobStore {
    pub fn open(root: &Utf8Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Couldn't create blob store root {root}"))?;
        let meta = fs::metadata(root)
            .with_context(|| format!("Couldn't stat blob store root {root}"))?;
        let dev = meta.dev();
        let cow_supported = probe_cow(root).unwrap_or_else(|e| {
            warn!("Reflink probe on {root} failed, assuming no COW support: {e:#}");
            false
        });
        debug!(
            "Blob store at {root} (dev {dev}, cow_supported={cow_supported})",
        );
        Ok(Self {
            root: root.to_path_buf(),
            dev,
            cow_supported,
        })
    }

    /// `prepare_blob_directories()`: create the fan-out directories
    /// idempotently before ingest.
    pub fn prepare_blob_directories(&self) -> Result<()> {
        for b in 0..=255u8 {
            let dir = self.root.join(format!("{b:02x}"));
            fs::create_dir_all(&dir)
                .with_context(|| format!("Couldn't create blob fan-out directory {dir}"))?;
        }
        Ok(())
    }

    /// `get_blob_path(H) = BS_ROOT / H[0:2] / H`.
    pub fn get_blob_path(&self, fingerprint: &Fingerprint) -> Utf8PathBuf {
        self.root
            .join(fingerprint.fanout_dir())
            .join(fingerprint.to_string())
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The `can_copy_on_write` predicate: platform supports reflink-style
    /// fast copy AND compression is `plain` AND the blob store's filesystem
    /// supports reflink AND the source file's `st_dev` equals the blob
    /// store's.
    pub fn can_copy_on_write(&self, compress_method: CompressMethod, source_dev: u64) -> bool {
        reflink_copy::reflink_or_copy_supported()
            && compress_method == CompressMethod::Plain
            && self.cow_supported
            && source_dev == self.dev
    }

    /// Lists every blob path currently on disk, used by tests asserting the
    /// "blob store directory listing is unchanged on rollback" property.
    #[cfg(test)]
    pub fn list_blob_paths(&self) -> Result<std::collections::BTreeSet<Utf8PathBuf>> {
        let mut out = std::collections::BTreeSet::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for inner in fs::read_dir(entry.path())? {
                let inner = inner?;
                if inner.file_type()?.is_file() {
                    out.insert(Utf8PathBuf::try_from(inner.path())?);
                }
            }
        }
        Ok(out)
    }
}

/// Best-effort reflink capability probe: write a small probe file under
/// `root`, try to reflink it, and clean up either way. Any error here falls
/// back to "no COW" rather than failing the open.
fn probe_cow(root: &Utf8Path) -> Result<bool> {
    let probe_src = root.join(".snapvault-cow-probe-src");
    let probe_dst = root.join(".snapvault-cow-probe-dst");
    let _ = fs::remove_file(&probe_src);
    let _ = fs::remove_file(&probe_dst);
    fs::write(&probe_src, b"cow probe")?;
    let result = reflink_copy::reflink(&probe_src, &probe_dst);
    let _ = fs::remove_file(&probe_src);
    let _ = fs::remove_file(&probe_dst);
    Ok(result.is_ok())
}

/// `copy_file_fast(src, dst, can_cow)`: uses a reflink if `can_cow` says
/// it's available, falling back to a regular copy on any
/// reflink failure (the filesystem capability probe is best-effort; a
/// false positive must not be fatal).
pub fn copy_file_fast(src: &Utf8Path, dst: &Utf8Path, can_cow: bool) -> Result<()> {
    if can_cow {
        match reflink_copy::reflink(src, dst) {
            Ok(()) => {
                trace!("Reflinked {src} to {dst}");
                return Ok(());
            }
            Err(e) => {
                trace!("Reflink {src} -> {dst} failed ({e:#}), falling back to a regular copy");
                let _ = fs::remove_file(dst);
            }
        }
    }
    fs::copy(src, dst).with_context(|| format!("Couldn't copy {src} to {dst}"))?;
    Ok(())
}

/// Renames `from` to `to`, falling back to copy-then-remove on a
/// cross-device rename (`EXDEV`), used by `hash_once`'s write path to land
/// a freshly-written temp file at its final blob path.
pub fn rename_or_copy(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => {
            debug!("Renamed {from} to {to}");
            Ok(())
        }
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
            trace!("Rename {from} -> {to} crossed devices, falling back to copy");
            copy_then_remove(from, to)
        }
        Err(e) => Err(e).with_context(|| format!("Couldn't rename {from} to {to}")),
    }
}

fn copy_then_remove(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    let tmp_dst = format!("{to}.part");
    let tmp_dst = Utf8Path::new(&tmp_dst);
    {
        let mut from_fh = File::open(from).with_context(|| format!("Couldn't open {from}"))?;
        let mut to_fh = File::create(tmp_dst).with_context(|| format!("Couldn't create {tmp_dst}"))?;
        io::copy(&mut from_fh, &mut to_fh)
            .with_context(|| format!("Couldn't copy {from} to {tmp_dst}"))?;
        to_fh
            .sync_all()
            .with_context(|| format!("Couldn't sync {tmp_dst}"))?;
    }
    fs::rename(tmp_dst, to).with_context(|| format!("Couldn't rename {tmp_dst} to {to}"))?;
    fs::remove_file(from).with_context(|| format!("Couldn't remove {from}"))?;
    Ok(())
}

/// `EXDEV`. `ErrorKind::CrossesDevices` isn't stable yet, so match the raw
/// errno the way `file_util.rs`'s `move_opened` does.
fn libc_exdev() -> i32 {
    18
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blob_path_uses_fanout_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let bs = BlobStore::open(root)?;
        let fp = Fingerprint::hash(b"hi\n");
        let path = bs.get_blob_path(&fp);
        assert_eq!(path.parent().unwrap().file_name().unwrap(), fp.fanout_dir());
        assert_eq!(path.file_name().unwrap(), fp.to_string());
        Ok(())
    }

    #[test]
    fn prepare_blob_directories_creates_all_256() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let bs = BlobStore::open(root)?;
        bs.prepare_blob_directories()?;
        for b in 0..=255u8 {
            assert!(root.join(format!("{b:02x}")).is_dir());
        }
        Ok(())
    }

    #[test]
    fn rename_or_copy_moves_file_within_one_device() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let from = root.join("from");
        let to = root.join("to");
        fs::write(&from, b"contents")?;
        rename_or_copy(&from, &to)?;
        assert!(!from.exists());
        assert_eq!(fs::read(&to)?, b"contents");
        Ok(())
    }
}
