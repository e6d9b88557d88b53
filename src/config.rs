//! Configuration loading.
//!
//! Follows the same shape as most of this codebase's config handling: a
//! `#[derive(Deserialize)]` struct with per-field defaults, a `Default`
//! impl, and a `load()` that reads a well-known path under the user's home
//! directory and falls back to defaults when the file doesn't exist.

use std::{fs, io};

use anyhow::{Context, Result, anyhow};
use byte_unit::Byte;
use camino::Utf8PathBuf;
use serde_derive::Deserialize;
use tracing::warn;

use crate::compress::CompressMethod;

/// `READ_ALL_THRESHOLD`: files this size or smaller are read entirely into
/// memory before hashing/compressing.
pub const READ_ALL_THRESHOLD: u64 = 8 * 1024;

/// `HASH_ONCE_THRESHOLD`: files larger than this, with a size that doesn't
/// collide with an existing blob, are streamed straight to their final blob
/// path without a separate pre-pass.
pub const HASH_ONCE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Largest batch the BQM will accumulate before flushing.
pub const MAX_BATCH_SIZE: usize = 100;

/// The BQM's soft batch-accumulation window.
pub const BATCH_WINDOW: std::time::Duration = std::time::Duration::from_millis(100);

/// Up to `N` attempts at blob acquisition before raising `VolatileBlobFile`.
pub const BLOB_CHANGED_RETRY_COUNT: u32 = 3;

fn default_targets() -> Vec<String> {
    vec!["**".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    num_cpus::get().max(1)
}

fn default_temp_path() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
        .join("snapvault")
}

/// A compression rule: files of at most `max_size` bytes use `method`. The
/// last rule in the table should have `max_size: None` as a catch-all.
/// Mirrors `backup.get_compress_method_from_size(size)`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompressRule {
    pub max_size: Option<Byte>,
    pub method: CompressMethod,
}

fn default_compress_table() -> Vec<CompressRule> {
    vec![CompressRule {
        max_size: None,
        method: CompressMethod::Zstd,
    }]
}

/// `backup.*` options.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,

    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Deprecated single-pattern form; merged into `ignore_patterns` by
    /// [`Configuration::load`].
    #[serde(default, rename = "ignore_pattern")]
    pub deprecated_ignore_pattern: Option<String>,

    #[serde(default)]
    pub follow_target_symlink: bool,

    #[serde(default = "default_true")]
    pub reuse_stat_unchanged_file: bool,

    #[serde(default = "default_true")]
    pub creation_skip_missing_file: bool,

    #[serde(default)]
    pub creation_skip_missing_file_patterns: Vec<String>,

    #[serde(default = "default_compress_table")]
    pub compress_table: Vec<CompressRule>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            targets: default_targets(),
            ignore_patterns: Vec::new(),
            deprecated_ignore_pattern: None,
            follow_target_symlink: false,
            reuse_stat_unchanged_file: true,
            creation_skip_missing_file: true,
            creation_skip_missing_file_patterns: Vec::new(),
            compress_table: default_compress_table(),
        }
    }
}

impl BackupConfig {
    /// `backup.get_compress_method_from_size(size)`: first matching rule,
    /// in table order, wins.
    pub fn compress_method_for_size(&self, size: u64) -> CompressMethod {
        for rule in &self.compress_table {
            match rule.max_size {
                Some(max) if size <= max.as_u64() => return rule.method,
                None => return rule.method,
                _ => continue,
            }
        }
        CompressMethod::Zstd
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_temp_path")]
    pub temp_path: Utf8PathBuf,

    #[serde(default)]
    pub debug: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            backup: BackupConfig::default(),
            concurrency: default_concurrency(),
            temp_path: default_temp_path(),
            debug: false,
        }
    }
}

impl Configuration {
    /// `get_effective_concurrency()`: at least 1; 1 means the Hash
    /// Pre-Pass is skipped entirely.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    fn merge_deprecated_ignore_pattern(mut self) -> Self {
        if let Some(pattern) = self.backup.deprecated_ignore_pattern.take() {
            warn!(
                "config field `backup.ignore_pattern` is deprecated; use `backup.ignore_patterns` instead"
            );
            self.backup.ignore_patterns.push(pattern);
        }
        self
    }
}

pub fn config_path() -> Result<Utf8PathBuf> {
    let mut path: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    path.extend([".config", "snapvault.toml"]);
    Ok(path)
}

pub fn load() -> Result<Configuration> {
    let path = config_path()?;
    let s = match fs::read_to_string(&path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Configuration::default());
        }
        found => found,
    }
    .with_context(|| format!("Couldn't open {path}"))?;
    let conf: Configuration =
        toml::from_str(&s).with_context(|| format!("Couldn't parse {path}"))?;
    Ok(conf.merge_deprecated_ignore_pattern())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_compress_table_always_matches() {
        let c = Configuration::default();
        assert_eq!(c.backup.compress_method_for_size(0), CompressMethod::Zstd);
        assert_eq!(
            c.backup.compress_method_for_size(u64::MAX),
            CompressMethod::Zstd
        );
    }

    #[test]
    fn compress_table_picks_first_matching_rule() {
        let table = vec![
            CompressRule {
                max_size: Some(Byte::from_u64(1024)),
                method: CompressMethod::Plain,
            },
            CompressRule {
                max_size: None,
                method: CompressMethod::Zstd,
            },
        ];
        let backup = BackupConfig {
            compress_table: table,
            ..BackupConfig::default()
        };
        assert_eq!(backup.compress_method_for_size(100), CompressMethod::Plain);
        assert_eq!(
            backup.compress_method_for_size(1024),
            CompressMethod::Plain
        );
        assert_eq!(backup.compress_method_for_size(1025), CompressMethod::Zstd);
    }

    #[test]
    fn deprecated_ignore_pattern_merges() {
        let mut conf = Configuration::default();
        conf.backup.deprecated_ignore_pattern = Some("*.tmp".to_string());
        let conf = conf.merge_deprecated_ignore_pattern();
        assert!(conf.backup.deprecated_ignore_pattern.is_none());
        assert_eq!(conf.backup.ignore_patterns, vec!["*.tmp".to_string()]);
    }
}
