//! Small stat-derived helpers shared between the Reuse Detector and the
//! Ingest Coordinator: the truncating microsecond conversion that both the
//! reuse comparator and the File rows it compares against must agree on.

use std::fs;
use std::os::unix::fs::MetadataExt;

/// `stat.mtime_ns // 1000`: truncating division, never rounding.
pub fn mtime_us(meta: &fs::Metadata) -> i64 {
    meta.mtime() * 1_000_000 + meta.mtime_nsec() / 1_000
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truncates_rather_than_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f");
        std::fs::write(&f, b"x").unwrap();
        let meta = fs::symlink_metadata(&f).unwrap();
        // Just exercise the formula; the exact value depends on the host
        // filesystem's mtime resolution.
        let us = mtime_us(&meta);
        assert_eq!(us, meta.mtime() * 1_000_000 + meta.mtime_nsec() / 1_000);
    }
}
