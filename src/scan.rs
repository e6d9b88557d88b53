//! The Scanner (SC): walks the source tree, applies gitignore-style
//! include/exclude patterns, and yields scan entries with a cached `lstat`.
//!
//! A recursive-descent walk, with matching delegated to the `ignore`
//! crate's `Gitignore` matcher rather than a negated `regex::RegexSet`,
//! since gitignore patterns have precedence/negation rules a flat regex
//! set can't express.

use std::fs;
use std::io;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use rustc_hash::FxHashSet;
use tracing::warn;

/// A compiled set of gitignore-form patterns, anchored at one root. Shared
/// between the Scanner's `TGT`/`IGN` matching and the Ingest Coordinator's
/// skip-missing pattern set.
pub struct PatternSet(Gitignore);

impl PatternSet {
    pub fn compile(root: &Utf8Path, patterns: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root.as_std_path());
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .with_context(|| format!("Bad glob pattern {pattern:?}"))?;
        }
        Ok(Self(
            builder.build().context("Couldn't compile glob patterns")?,
        ))
    }

    pub fn is_match(&self, rel: &Utf8Path, is_dir: bool) -> bool {
        self.0.matched(rel.as_std_path(), is_dir).is_ignore()
    }
}

/// One emitted scan entry: an absolute path, its root-relative POSIX form,
/// and the `lstat` result SC already paid for.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub abs_path: Utf8PathBuf,
    pub rel_path: Utf8PathBuf,
    pub metadata: fs::Metadata,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub entries: Vec<ScanEntry>,
    /// POSIX-form root targets, deduplicated by insertion order.
    pub root_targets: Vec<Utf8PathBuf>,
}

/// Walks `src`, matching top-level entry names against `target_patterns`
/// (`TGT`) and every candidate's relative path against `ignore_patterns`
/// (`IGN`), following root-level symlinks once if `follow_root_symlink`.
pub fn scan(
    src: &Utf8Path,
    target_patterns: &[String],
    ignore_patterns: &[String],
    follow_root_symlink: bool,
) -> Result<ScanResult> {
    let tgt = PatternSet::compile(src, target_patterns)?;
    let ign = PatternSet::compile(src, ignore_patterns)?;

    let mut result = ScanResult::default();
    let mut visited = FxHashSet::default();
    let mut seen_targets = FxHashSet::default();

    let top = match fs::read_dir(src) {
        Ok(rd) => rd,
        Err(e) => {
            warn!("Couldn't read source root {src}: {e}");
            return Ok(result);
        }
    };

    for entry in top {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Couldn't read an entry of {src}: {e}");
                continue;
            }
        };
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(_) => {
                warn!("Skipping a non-UTF-8 entry name directly under {src}");
                continue;
            }
        };
        let rel = Utf8PathBuf::from(&name);
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !tgt.is_match(&rel, is_dir) {
            continue;
        }
        if seen_targets.insert(rel.clone()) {
            result.root_targets.push(rel.clone());
        }
        walk(
            &src.join(&name),
            src,
            true,
            &ign,
            follow_root_symlink,
            &mut visited,
            &mut result.entries,
        );
    }

    Ok(result)
}

/// One step of the descent algorithm, run once per candidate path.
fn walk(
    abs: &Utf8Path,
    src: &Utf8Path,
    is_root_target: bool,
    ign: &PatternSet,
    follow_root_symlink: bool,
    visited: &mut FxHashSet<Utf8PathBuf>,
    entries: &mut Vec<ScanEntry>,
) {
    let rel = match abs.strip_prefix(src) {
        Ok(r) => r.to_path_buf(),
        Err(_) => {
            warn!("{abs} isn't under {src}, skipping");
            return;
        }
    };

    if !visited.insert(abs.to_path_buf()) {
        return;
    }

    // lstat before the ignore check so directory-only patterns (a
    // trailing slash) see the right `is_dir`.
    let metadata = match fs::symlink_metadata(abs) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if is_root_target {
                warn!("Root target {abs} vanished before it could be scanned");
            }
            return;
        }
        Err(e) => {
            warn!("Couldn't stat {abs}: {e}");
            return;
        }
    };

    if ign.is_match(&rel, metadata.is_dir()) {
        if is_root_target {
            warn!("Root target {rel} matches an ignore pattern");
        }
        return;
    }

    let is_dir = metadata.is_dir();
    let is_symlink = metadata.is_symlink();
    entries.push(ScanEntry {
        abs_path: abs.to_path_buf(),
        rel_path: rel,
        metadata,
    });

    if is_dir {
        let children = match fs::read_dir(abs) {
            Ok(rd) => rd,
            Err(e) => {
                warn!("Couldn't read directory {abs}: {e}");
                return;
            }
        };
        for child in children {
            let child = match child {
                Ok(c) => c,
                Err(e) => {
                    warn!("Couldn't read an entry of {abs}: {e}");
                    continue;
                }
            };
            let name = match child.file_name().into_string() {
                Ok(n) => n,
                Err(_) => {
                    warn!("Skipping a non-UTF-8 entry name under {abs}");
                    continue;
                }
            };
            walk(
                &abs.join(&name),
                src,
                false,
                ign,
                follow_root_symlink,
                visited,
                entries,
            );
        }
    } else if is_root_target && is_symlink && follow_root_symlink {
        match fs::read_link(abs) {
            Ok(target) => {
                let resolved = if target.is_absolute() {
                    target
                } else {
                    abs.parent()
                        .map(|p| p.as_std_path().to_path_buf())
                        .unwrap_or_default()
                        .join(&target)
                };
                match Utf8PathBuf::try_from(resolved) {
                    Ok(resolved) => {
                        // Resolve once: the recursive call isn't allowed to
                        // follow root symlinks again.
                        walk(&resolved, src, true, ign, false, visited, entries);
                    }
                    Err(e) => warn!("Symlink target of {abs} isn't UTF-8: {e}"),
                }
            }
            Err(e) => warn!("Couldn't read link {abs}: {e}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn write(root: &std::path::Path, rel: &str, contents: &[u8]) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn scans_targets_and_skips_ignored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        write(root, "keep/a.txt", b"a");
        write(root, "keep/b.log", b"b");
        write(root, "skip_me/c.txt", b"c");

        let src = Utf8Path::from_path(root).unwrap();
        let result = scan(
            src,
            &["keep".to_string()],
            &["*.log".to_string()],
            false,
        )?;

        let rels: FxHashSet<String> = result
            .entries
            .iter()
            .map(|e| e.rel_path.to_string())
            .collect();
        assert!(rels.contains("keep"));
        assert!(rels.contains("keep/a.txt"));
        assert!(!rels.contains("keep/b.log"));
        assert!(!rels.iter().any(|r| r.starts_with("skip_me")));
        assert_eq!(result.root_targets, vec![Utf8PathBuf::from("keep")]);
        Ok(())
    }

    #[test]
    fn cycle_prevention_stops_self_referential_symlink() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("loop"))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(root.join("loop"), root.join("loop/self"))?;

        let src = Utf8Path::from_path(root).unwrap();
        let result = scan(src, &["**".to_string()], &[], false)?;
        // Must terminate and must not loop forever walking `loop/self/self/...`.
        assert!(result.entries.len() < 10);
        Ok(())
    }

    #[test]
    fn missing_target_is_skipped_without_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = Utf8Path::from_path(dir.path()).unwrap();
        let result = scan(src, &["**".to_string()], &[], false)?;
        assert!(result.entries.is_empty());
        Ok(())
    }
}
