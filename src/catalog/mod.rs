//! The Catalog Session (CS): a transactional handle over a relational
//! catalog backed by SQLite, following the same conventions as this
//! codebase's existing local-cache module (`PRAGMA user_version` schema
//! gating, `STRICT` tables, WAL journal mode).
//!
//! The exact column layout is an implementation choice — the raw schema DDL
//! isn't mandated by anything upstream — but every catalog operation the
//! rest of the pipeline needs is implemented here, including the batched
//! lookups the BQM depends on.

pub mod model;

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use camino::Utf8Path;
use rusqlite::{Connection, OptionalExtension, params_from_iter};

use crate::compress::CompressMethod;
use crate::hashing::Fingerprint;
use model::{Backup, BackupId, Blob, File, FileRole};

pub struct CatalogSession {
    conn: Connection,
    in_transaction: bool,
}

impl CatalogSession {
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Couldn't open catalog at {path}"))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let ver: i32 = conn.query_row("PRAGMA user_version", (), |r| r.get(0))?;
        if ver < 1 {
            conn.execute_batch(
                "BEGIN;
                CREATE TABLE blobs (
                    fingerprint TEXT NOT NULL PRIMARY KEY,
                    compress_method TEXT NOT NULL,
                    raw_size INTEGER NOT NULL,
                    stored_size INTEGER NOT NULL
                ) STRICT;
                CREATE INDEX blobs_by_raw_size ON blobs(raw_size);
                CREATE TABLE backups (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    creator TEXT NOT NULL,
                    comment TEXT NOT NULL,
                    targets TEXT NOT NULL,
                    tags TEXT NOT NULL
                ) STRICT;
                CREATE TABLE files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    backup_id INTEGER NOT NULL REFERENCES backups(id),
                    path TEXT NOT NULL,
                    mode INTEGER NOT NULL,
                    uid INTEGER NOT NULL,
                    gid INTEGER NOT NULL,
                    mtime_us INTEGER NOT NULL,
                    size INTEGER NOT NULL,
                    content BLOB,
                    blob_fingerprint TEXT,
                    role TEXT NOT NULL
                ) STRICT;
                CREATE INDEX files_by_backup ON files(backup_id);
                COMMIT;",
            )?;
        }
        conn.execute_batch("PRAGMA user_version=1")?;

        let jm: String = conn.query_row("PRAGMA journal_mode=wal", (), |r| r.get(0))?;
        assert_eq!(jm, "wal");
        conn.execute_batch("PRAGMA foreign_keys=ON")?;

        Ok(())
    }

    // --- Transaction control ------------------------------------------------

    pub fn begin(&mut self) -> Result<()> {
        assert!(!self.in_transaction, "begin() called twice");
        self.conn.execute_batch("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    /// Commits the run's transaction. This is the backup's final step,
    /// timed separately from the rest of the pipeline.
    pub fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    /// Aborts the enclosing transaction. Safe to call even if no
    /// transaction is open (e.g. rollback ran twice).
    pub fn rollback(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute_batch("ROLLBACK")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    // --- Reads (reuse detector) ---------------------------------------------

    pub fn get_last_backup(&self) -> Result<Option<Backup>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, timestamp, creator, comment, targets, tags
                 FROM backups ORDER BY id DESC LIMIT 1",
                (),
                |r| {
                    Ok((
                        r.get::<_, BackupId>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, timestamp, creator, comment, targets, tags)) = row else {
            return Ok(None);
        };
        Ok(Some(Backup {
            id,
            timestamp: timestamp
                .parse()
                .with_context(|| format!("corrupt timestamp in catalog: {timestamp}"))?,
            creator,
            comment,
            targets: decode_lines(&targets),
            tags: decode_kv(&tags),
        }))
    }

    pub fn get_backup_files(&self, backup_id: BackupId) -> Result<Vec<File>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, backup_id, path, mode, uid, gid, mtime_us, size, content,
                    blob_fingerprint, role
             FROM files WHERE backup_id = ?1",
        )?;
        let rows = stmt
            .query_map([backup_id], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().collect()
    }

    /// `has_blob_with_size_batched`: does any blob of each given size exist?
    pub fn has_blob_with_size_batched(&self, sizes: &[u64]) -> Result<HashMap<u64, bool>> {
        let mut out: HashMap<u64, bool> = sizes.iter().map(|&s| (s, false)).collect();
        if sizes.is_empty() {
            return Ok(out);
        }
        let placeholders = placeholder_list(sizes.len());
        let sql = format!("SELECT DISTINCT raw_size FROM blobs WHERE raw_size IN ({placeholders})");
        let mut stmt = self.conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_from_iter(sizes.iter()), |r| r.get::<_, u64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for size in found {
            out.insert(size, true);
        }
        Ok(out)
    }

    /// `get_blobs`: fetch the Blob row for each fingerprint that has one.
    pub fn get_blobs(&self, hashes: &[Fingerprint]) -> Result<HashMap<Fingerprint, Blob>> {
        let mut out = HashMap::new();
        if hashes.is_empty() {
            return Ok(out);
        }
        let strs: Vec<String> = hashes.iter().map(|h| h.to_string()).collect();
        let placeholders = placeholder_list(strs.len());
        let sql = format!(
            "SELECT fingerprint, compress_method, raw_size, stored_size
             FROM blobs WHERE fingerprint IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(strs.iter()), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, u64>(2)?,
                    r.get::<_, u64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (fp, method, raw_size, stored_size) in rows {
            let fingerprint: Fingerprint = fp.parse()?;
            let compress_method: CompressMethod = method.parse()?;
            out.insert(
                fingerprint,
                Blob {
                    fingerprint,
                    compress_method,
                    raw_size,
                    stored_size,
                },
            );
        }
        Ok(out)
    }

    // --- Writes -------------------------------------------------------------

    pub fn create_backup(
        &self,
        creator: &str,
        comment: &str,
        targets: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<Backup> {
        let timestamp = jiff::Zoned::now();
        self.conn.execute(
            "INSERT INTO backups(timestamp, creator, comment, targets, tags)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                timestamp.to_string(),
                creator,
                comment,
                encode_lines(targets),
                encode_kv(tags),
            ),
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(Backup {
            id,
            timestamp,
            creator: creator.to_string(),
            comment: comment.to_string(),
            targets: targets.to_vec(),
            tags: tags.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_file(
        &self,
        backup_id: BackupId,
        path: &Utf8Path,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime_us: i64,
        size: u64,
        content: Option<&[u8]>,
        blob_fingerprint: Option<Fingerprint>,
        role: FileRole,
    ) -> Result<File> {
        self.conn.execute(
            "INSERT INTO files(backup_id, path, mode, uid, gid, mtime_us, size,
                                content, blob_fingerprint, role)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            (
                backup_id,
                path.as_str(),
                mode,
                uid,
                gid,
                mtime_us,
                size,
                content,
                blob_fingerprint.map(|f| f.to_string()),
                role.as_str(),
            ),
        )?;
        Ok(File {
            id: self.conn.last_insert_rowid(),
            backup_id,
            path: path.to_path_buf(),
            mode,
            uid,
            gid,
            mtime_us,
            size,
            content: content.map(|c| c.to_vec()),
            blob_fingerprint,
            role,
        })
    }

    /// Clones a prior File row verbatim into a new backup: the new row
    /// copies all prior columns and is associated with the new Backup.
    pub fn create_file_from(&self, backup_id: BackupId, prior: &File) -> Result<File> {
        self.create_file(
            backup_id,
            &prior.path,
            prior.mode,
            prior.uid,
            prior.gid,
            prior.mtime_us,
            prior.size,
            prior.content.as_deref(),
            prior.blob_fingerprint,
            prior.role,
        )
    }

    /// Sums `raw_size`/`stored_size` over a set of distinct fingerprints,
    /// used to compute a [`BackupInfo`](model::BackupInfo)'s aggregate byte
    /// counts without double-counting a blob shared by several files.
    pub fn sum_blob_sizes(&self, fingerprints: &[Fingerprint]) -> Result<(u64, u64)> {
        if fingerprints.is_empty() {
            return Ok((0, 0));
        }
        let strs: Vec<String> = fingerprints.iter().map(|h| h.to_string()).collect();
        let placeholders = placeholder_list(strs.len());
        let sql = format!(
            "SELECT COALESCE(SUM(raw_size), 0), COALESCE(SUM(stored_size), 0)
             FROM blobs WHERE fingerprint IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let (raw, stored) = stmt.query_row(params_from_iter(strs.iter()), |r| {
            Ok((r.get::<_, u64>(0)?, r.get::<_, u64>(1)?))
        })?;
        Ok((raw, stored))
    }

    /// Upsert-or-get: races between concurrent creators of the same blob
    /// resolve to whichever row actually landed.
    pub fn create_blob_or_get(
        &self,
        fingerprint: Fingerprint,
        compress_method: CompressMethod,
        raw_size: u64,
        stored_size: u64,
    ) -> Result<Blob> {
        self.conn.execute(
            "INSERT INTO blobs(fingerprint, compress_method, raw_size, stored_size)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(fingerprint) DO NOTHING",
            (
                fingerprint.to_string(),
                compress_method.to_string(),
                raw_size,
                stored_size,
            ),
        )?;
        let (method, raw, stored): (String, u64, u64) = self.conn.query_row(
            "SELECT compress_method, raw_size, stored_size FROM blobs WHERE fingerprint = ?1",
            [fingerprint.to_string()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        Ok(Blob {
            fingerprint,
            compress_method: method.parse()?,
            raw_size: raw,
            stored_size: stored,
        })
    }
}

fn row_to_file(r: &rusqlite::Row) -> rusqlite::Result<Result<File>> {
    let path: String = r.get(2)?;
    let blob_fingerprint: Option<String> = r.get(9)?;
    let role: String = r.get(10)?;
    Ok((|| {
        Ok(File {
            id: r.get(0)?,
            backup_id: r.get(1)?,
            path: camino::Utf8PathBuf::from(path),
            mode: r.get(3)?,
            uid: r.get(4)?,
            gid: r.get(5)?,
            mtime_us: r.get(6)?,
            size: r.get(7)?,
            content: r.get::<_, Option<Vec<u8>>>(8)?,
            blob_fingerprint: blob_fingerprint.map(|s| s.parse()).transpose()?,
            role: role.parse()?,
        })
    })())
}

fn placeholder_list(n: usize) -> String {
    std::iter::repeat_n("?", n).collect::<Vec<_>>().join(",")
}

/// Encodes a tag map as `key\x01value` lines joined by `\n`. The exact
/// on-disk schema/encoding is an implementation choice; nothing upstream
/// dictates the raw catalog schema DDL.
fn encode_kv(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}\u{1}{v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_kv(s: &str) -> BTreeMap<String, String> {
    s.lines()
        .filter_map(|line| line.split_once('\u{1}'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn encode_lines(items: &[String]) -> String {
    items.join("\n")
}

fn decode_lines(s: &str) -> Vec<String> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.lines().map(str::to_string).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use model::FileRole;

    #[test]
    fn empty_catalog_has_no_last_backup() -> Result<()> {
        let cs = CatalogSession::open_in_memory()?;
        assert!(cs.get_last_backup()?.is_none());
        Ok(())
    }

    #[test]
    fn create_backup_and_files_round_trip() -> Result<()> {
        let cs = CatalogSession::open_in_memory()?;
        let mut tags = BTreeMap::new();
        tags.insert("author".to_string(), "test".to_string());
        let backup = cs.create_backup("tester", "a comment", &["a".to_string()], &tags)?;

        let fp = Fingerprint::hash(b"hi\n");
        cs.create_blob_or_get(fp, CompressMethod::Plain, 3, 3)?;
        cs.create_file(
            backup.id,
            Utf8Path::new("hello.txt"),
            0o100644,
            1000,
            1000,
            123_456,
            3,
            None,
            Some(fp),
            FileRole::Regular,
        )?;

        let files = cs.get_backup_files(backup.id)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, Utf8Path::new("hello.txt"));
        assert_eq!(files[0].blob_fingerprint, Some(fp));

        let last = cs.get_last_backup()?.unwrap();
        assert_eq!(last.id, backup.id);
        assert_eq!(last.tags.get("author").unwrap(), "test");
        Ok(())
    }

    #[test]
    fn batched_size_lookup_reports_existing_and_missing() -> Result<()> {
        let cs = CatalogSession::open_in_memory()?;
        cs.create_blob_or_get(Fingerprint::hash(b"a"), CompressMethod::Plain, 1, 1)?;
        let result = cs.has_blob_with_size_batched(&[1, 2, 3])?;
        assert_eq!(result.get(&1), Some(&true));
        assert_eq!(result.get(&2), Some(&false));
        assert_eq!(result.get(&3), Some(&false));
        Ok(())
    }

    #[test]
    fn create_blob_or_get_is_idempotent_under_races() -> Result<()> {
        let cs = CatalogSession::open_in_memory()?;
        let fp = Fingerprint::hash(b"same content");
        let first = cs.create_blob_or_get(fp, CompressMethod::Zstd, 12, 9)?;
        let second = cs.create_blob_or_get(fp, CompressMethod::Zstd, 12, 9)?;
        assert_eq!(first, second);
        Ok(())
    }
}
