//! Master catalog.
//!
//! The single discovery entry point for resolvers: which collections exist,
//! what year they belong to, where their per-collection DB lives and how big
//! it was when last registered. The stored `(size, mtime)` signature is what
//! drift detection and incremental aggregation key on.
use std::path::PathBuf;

use duckdb::{params, Connection};
use log::{info, warn};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Error;

use super::layout;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS collections (
    collection TEXT PRIMARY KEY,
    year       INTEGER,
    db_path    TEXT,
    rows       BIGINT,
    size_bytes BIGINT,
    mtime_ns   BIGINT,
    indexed_at TIMESTAMP
);
";

#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub collection: String,
    pub year: i32,
    pub db_path: PathBuf,
    pub rows: i64,
}

pub fn open_master(cfg: &Config) -> Result<Connection, Error> {
    let path = layout::master_db_path(cfg);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(&path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Register every existing, non-empty per-collection DB. Empty or unreadable
/// DBs are dropped from the catalog. Returns the number of catalogued
/// collections.
pub fn build_master_index(cfg: &Config, cancel: &CancelToken) -> Result<usize, Error> {
    let mut conn = open_master(cfg)?;
    let mut registered = 0usize;

    for (collection, db_path) in layout::list_collection_dbs(cfg)? {
        cancel.check()?;
        let year = match layout::collection_year(&collection) {
            Some(y) => y,
            None => {
                warn!("skipping oddly named collection DB {:?}", db_path);
                continue;
            }
        };

        let rows = count_slice_rows(&db_path);
        let tx = conn.transaction()?;
        if rows <= 0 {
            tx.execute(
                "DELETE FROM collections WHERE collection = ?",
                params![collection],
            )?;
            tx.commit()?;
            continue;
        }
        let (size_bytes, mtime_ns) = layout::file_signature(&db_path)?;
        tx.execute(
            "INSERT OR REPLACE INTO collections
             (collection, year, db_path, rows, size_bytes, mtime_ns, indexed_at)
             VALUES (?, ?, ?, ?, ?, ?, now())",
            params![
                collection,
                year,
                db_path.to_string_lossy(),
                rows,
                size_bytes,
                mtime_ns
            ],
        )?;
        tx.commit()?;
        registered += 1;
    }

    info!("master catalog: {} collections registered", registered);
    Ok(registered)
}

fn count_slice_rows(db_path: &std::path::Path) -> i64 {
    let count = || -> Result<i64, Error> {
        let conn = Connection::open(db_path)?;
        let n = conn.query_row("SELECT count(*) FROM cc_domain_shards", [], |r| r.get(0))?;
        Ok(n)
    };
    match count() {
        Ok(n) => n,
        Err(e) => {
            warn!("{:?}: could not count slice rows: {}", db_path, e);
            0
        }
    }
}

/// Catalogued collections, newest first, optionally filtered by year.
pub fn list_collections(cfg: &Config, year: Option<i32>) -> Result<Vec<CollectionEntry>, Error> {
    let path = layout::master_db_path(cfg);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let conn = Connection::open(&path)?;
    let map = |row: &duckdb::Row<'_>| {
        Ok(CollectionEntry {
            collection: row.get(0)?,
            year: row.get(1)?,
            db_path: PathBuf::from(row.get::<_, String>(2)?),
            rows: row.get(3)?,
        })
    };
    let entries = match year {
        Some(y) => {
            let mut stmt = conn.prepare(
                "SELECT collection, year, db_path, rows FROM collections
                 WHERE year = ? ORDER BY collection DESC",
            )?;
            let rows = stmt.query_map(params![y], map)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT collection, year, db_path, rows FROM collections
                 ORDER BY collection DESC",
            )?;
            let rows = stmt.query_map([], map)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(entries)
}

/// Collections whose per-collection DB changed (or vanished) since they were
/// catalogued. A non-empty result means year/master aggregates are stale.
pub fn drifted_collections(cfg: &Config) -> Result<Vec<String>, Error> {
    let path = layout::master_db_path(cfg);

    let mut catalogued: Vec<(String, PathBuf, i64, i64)> = Vec::new();
    if path.exists() {
        let conn = Connection::open(&path)?;
        let mut stmt =
            conn.prepare("SELECT collection, db_path, size_bytes, mtime_ns FROM collections")?;
        catalogued = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    PathBuf::from(row.get::<_, String>(1)?),
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
    }

    let mut drifted = Vec::new();
    for (collection, db_path, size_bytes, mtime_ns) in &catalogued {
        match layout::file_signature(db_path) {
            Ok(sig) if sig == (*size_bytes, *mtime_ns) => {}
            _ => drifted.push(collection.clone()),
        }
    }
    // Collections on disk the master has never seen count as drift too.
    for (collection, _) in layout::list_collection_dbs(cfg)? {
        if !catalogued.iter().any(|(c, ..)| c == &collection) {
            drifted.push(collection);
        }
    }
    drifted.sort();
    drifted.dedup();
    Ok(drifted)
}

/// Invariant 5 check for one collection: its DB must be unchanged since the
/// master catalogued it (and the year/master aggregates were rebuilt).
pub fn verify_collection_fresh(cfg: &Config, collection: &str) -> Result<(), Error> {
    if drifted_collections(cfg)?.iter().any(|c| c == collection) {
        return Err(Error::IndexDrift {
            collection: collection.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::collection::build_collection_index;
    use crate::io::writer::{RowGroupPolicy, ShardWriter};
    use crate::sources::CaptureRecord;

    fn seed_collection(cfg: &Config, collection: &str) {
        let shard = layout::shard_parquet_path(cfg, collection, "cdx-00000.gz").unwrap();
        let mut w = ShardWriter::create(&shard, RowGroupPolicy::default()).unwrap();
        w.write(CaptureRecord {
            url: Some("https://example.com/".to_string()),
            host_rev: "com,example".to_string(),
            urlkey: None,
            timestamp: Some("20240101000000".to_string()),
            status: Some(200),
            mime: None,
            mime_detected: None,
            digest: None,
            length: None,
            warc_filename: Some("crawl-data/a.warc.gz".to_string()),
            warc_offset: 0,
            warc_length: 10,
            collection: Some(collection.to_string()),
            shard_file: Some("cdx-00000.gz".to_string()),
        })
        .unwrap();
        w.finish().unwrap();
        build_collection_index(cfg, collection, false, &CancelToken::new()).unwrap();
    }

    #[test]
    fn registers_and_lists() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
        seed_collection(&cfg, "CC-MAIN-2024-30");
        seed_collection(&cfg, "CC-MAIN-2023-40");

        let n = build_master_index(&cfg, &CancelToken::new()).unwrap();
        assert_eq!(n, 2);

        let all = list_collections(&cfg, None).unwrap();
        assert_eq!(all.len(), 2);
        // Newest first.
        assert_eq!(all[0].collection, "CC-MAIN-2024-30");

        let y2023 = list_collections(&cfg, Some(2023)).unwrap();
        assert_eq!(y2023.len(), 1);
        assert_eq!(y2023[0].collection, "CC-MAIN-2023-40");

        assert!(drifted_collections(&cfg).unwrap().is_empty());
    }

    #[test]
    fn detects_drift_after_rebuild() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
        seed_collection(&cfg, "CC-MAIN-2024-30");
        build_master_index(&cfg, &CancelToken::new()).unwrap();

        // Any rewrite of the per-collection DB changes its signature.
        build_collection_index(&cfg, "CC-MAIN-2024-30", true, &CancelToken::new()).unwrap();
        let drifted = drifted_collections(&cfg).unwrap();
        assert_eq!(drifted, vec!["CC-MAIN-2024-30".to_string()]);
    }
}
