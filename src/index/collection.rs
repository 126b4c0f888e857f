//! Per-collection pointer DB builder.
//!
//! For every sorted shard of a collection, scan the `host_rev` column row
//! group by row group, collapse it into contiguous runs and store one slice
//! row per run in `cc_domain_shards`. Each shard is replaced in its own
//! transaction, so reprocessing is idempotent and one bad shard never poisons
//! the rest. The whole DB is built in a `.building` file and renamed over the
//! final path once done.
use std::path::{Path, PathBuf};

use duckdb::{params, Connection};
use log::{info, warn};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Error;
use crate::io::reader::ShardReader;
use crate::io::writer::sorted_marker_path;

use super::layout;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cc_domain_shards (
    host_rev      TEXT NOT NULL,
    shard_relpath TEXT NOT NULL,
    row_group     INTEGER NOT NULL,
    row_start     BIGINT NOT NULL,
    row_end       BIGINT NOT NULL,
    capture_count BIGINT NOT NULL,
    collection    TEXT,
    year          INTEGER,
    shard_file    TEXT
);
CREATE TABLE IF NOT EXISTS shard_files (
    shard_relpath TEXT PRIMARY KEY,
    size_bytes    BIGINT,
    mtime_ns      BIGINT,
    row_groups    INTEGER,
    total_rows    BIGINT,
    indexed_at    TIMESTAMP
);
";

/// One contiguous `host_rev` run inside a single row group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRow {
    pub host_rev: String,
    pub row_group: usize,
    pub row_start: usize,
    pub row_end: usize,
}

#[derive(Debug)]
pub struct CollectionIndexReport {
    pub collection: String,
    pub db_path: PathBuf,
    pub shards_seen: usize,
    pub shards_indexed: usize,
    pub shards_skipped: usize,
    pub shards_failed: Vec<(PathBuf, String)>,
    pub slice_rows: u64,
    /// True only when every shard of the collection indexed cleanly.
    pub complete: bool,
}

/// Scan one sorted shard into slice rows, asserting the sort contract on the
/// way: non-decreasing `host_rev` inside each group, and a min/max chain
/// between groups.
pub fn scan_shard_slices(reader: &ShardReader) -> Result<Vec<SliceRow>, Error> {
    let stats = reader.row_group_stats()?;
    let mut prev_max: Option<String> = None;
    for rg in &stats {
        if let (Some(prev), Some(min)) = (&prev_max, &rg.host_rev_min) {
            if prev > min {
                return Err(Error::SortOrderViolated {
                    shard: reader.path().to_path_buf(),
                    detail: format!(
                        "row group {}: min {:?} precedes previous max {:?}",
                        rg.index, min, prev
                    ),
                });
            }
        }
        if rg.host_rev_max.is_some() {
            prev_max = rg.host_rev_max.clone();
        }
    }

    let mut slices = Vec::new();
    let mut prev_host: Option<String> = None;
    for rg in &stats {
        let hosts = reader.read_host_rev(rg.index)?;
        let mut run_start = 0usize;
        for i in 0..hosts.len() {
            if let Some(prev) = &prev_host {
                if prev.as_str() > hosts[i].as_str() {
                    return Err(Error::SortOrderViolated {
                        shard: reader.path().to_path_buf(),
                        detail: format!(
                            "row group {} row {}: {:?} after {:?}",
                            rg.index, i, hosts[i], prev
                        ),
                    });
                }
            }
            if i > 0 && hosts[i] != hosts[i - 1] {
                slices.push(SliceRow {
                    host_rev: hosts[i - 1].clone(),
                    row_group: rg.index,
                    row_start: run_start,
                    row_end: i,
                });
                run_start = i;
            }
            prev_host = Some(hosts[i].clone());
        }
        if !hosts.is_empty() {
            slices.push(SliceRow {
                host_rev: hosts[hosts.len() - 1].clone(),
                row_group: rg.index,
                row_start: run_start,
                row_end: hosts.len(),
            });
        }
    }
    Ok(slices)
}

/// Build (or refresh) the per-collection index DB.
///
/// Shards whose `(size, mtime)` signature is unchanged since the last build
/// are skipped unless `force` is set.
pub fn build_collection_index(
    cfg: &Config,
    collection: &str,
    force: bool,
    cancel: &CancelToken,
) -> Result<CollectionIndexReport, Error> {
    let year = layout::collection_year(collection)
        .ok_or_else(|| Error::Custom(format!("invalid collection name: {}", collection)))?;
    let db_path = layout::collection_db_path(cfg, collection);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let building = building_path(&db_path);
    let _ = std::fs::remove_file(&building);
    if db_path.exists() && !force {
        // Carry the previous registry over so unchanged shards can skip.
        std::fs::copy(&db_path, &building)?;
    }

    let mut report = CollectionIndexReport {
        collection: collection.to_string(),
        db_path: db_path.clone(),
        shards_seen: 0,
        shards_indexed: 0,
        shards_skipped: 0,
        shards_failed: Vec::new(),
        slice_rows: 0,
        complete: false,
    };

    let result = (|| -> Result<(), Error> {
        let mut conn = Connection::open(&building)?;
        conn.execute_batch(SCHEMA)?;

        for shard in layout::list_collection_shards(cfg, collection)? {
            cancel.check()?;
            report.shards_seen += 1;

            if !sorted_marker_path(&shard).exists() {
                warn!("{:?}: no .sorted marker, not indexing", shard);
                report
                    .shards_failed
                    .push((shard.clone(), "missing .sorted marker".to_string()));
                continue;
            }

            let relpath = layout::shard_relpath(cfg, &shard)?;
            let (size_bytes, mtime_ns) = layout::file_signature(&shard)?;
            if !force && shard_unchanged(&conn, &relpath, size_bytes, mtime_ns)? {
                report.shards_skipped += 1;
                continue;
            }

            match index_one_shard(
                &mut conn, collection, year, &shard, &relpath, size_bytes, mtime_ns,
            ) {
                Ok(rows) => {
                    report.shards_indexed += 1;
                    report.slice_rows += rows;
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("{:?}: indexing failed: {}", shard, e);
                    report.shards_failed.push((shard.clone(), e.to_string()));
                }
            }
        }

        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_domain_shards_host ON cc_domain_shards(host_rev);
             CREATE INDEX IF NOT EXISTS idx_domain_shards_shard ON cc_domain_shards(shard_relpath);",
        )?;
        conn.close().map_err(|(_, e)| Error::DuckDb(e))?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&building);
        return Err(e);
    }

    std::fs::rename(&building, &db_path)?;
    report.complete = report.shards_failed.is_empty();
    info!(
        "{}: indexed {} shards ({} skipped, {} failed), {} slice rows",
        collection,
        report.shards_indexed,
        report.shards_skipped,
        report.shards_failed.len(),
        report.slice_rows
    );
    Ok(report)
}

fn building_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(".building");
    PathBuf::from(os)
}

fn shard_unchanged(
    conn: &Connection,
    relpath: &str,
    size_bytes: i64,
    mtime_ns: i64,
) -> Result<bool, Error> {
    let mut stmt =
        conn.prepare("SELECT size_bytes, mtime_ns FROM shard_files WHERE shard_relpath = ?")?;
    let mut rows = stmt.query(params![relpath])?;
    if let Some(row) = rows.next()? {
        let (s, m): (i64, i64) = (row.get(0)?, row.get(1)?);
        return Ok(s == size_bytes && m == mtime_ns);
    }
    Ok(false)
}

fn index_one_shard(
    conn: &mut Connection,
    collection: &str,
    year: i32,
    shard: &Path,
    relpath: &str,
    size_bytes: i64,
    mtime_ns: i64,
) -> Result<u64, Error> {
    let reader = ShardReader::open(shard)?;
    let missing = reader.missing_columns();
    if missing.contains(&"collection") || missing.contains(&"shard_file") {
        return Err(Error::MissingColumn {
            shard: shard.to_path_buf(),
            column: if missing.contains(&"collection") {
                "collection"
            } else {
                "shard_file"
            },
        });
    }

    let slices = scan_shard_slices(&reader)?;
    let shard_file = shard
        .file_name()
        .map(|n| {
            let name = n.to_string_lossy();
            name.trim_end_matches(".parquet").to_string()
        })
        .unwrap_or_default();
    let row_groups = reader.num_row_groups() as i64;
    let total_rows = reader.num_rows();

    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM cc_domain_shards WHERE shard_relpath = ?",
        params![relpath],
    )?;
    tx.execute(
        "DELETE FROM shard_files WHERE shard_relpath = ?",
        params![relpath],
    )?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO cc_domain_shards
             (host_rev, shard_relpath, row_group, row_start, row_end, capture_count,
              collection, year, shard_file)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for s in &slices {
            debug_assert!(s.row_end > s.row_start);
            insert.execute(params![
                s.host_rev,
                relpath,
                s.row_group as i64,
                s.row_start as i64,
                s.row_end as i64,
                (s.row_end - s.row_start) as i64,
                collection,
                year,
                shard_file,
            ])?;
        }
        let mut reg = tx.prepare(
            "INSERT INTO shard_files
             (shard_relpath, size_bytes, mtime_ns, row_groups, total_rows, indexed_at)
             VALUES (?, ?, ?, ?, ?, now())",
        )?;
        reg.execute(params![relpath, size_bytes, mtime_ns, row_groups, total_rows])?;
    }
    tx.commit()?;

    Ok(slices.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::writer::{RowGroupPolicy, ShardWriter};
    use crate::sources::CaptureRecord;

    fn record(host: &str, url: &str, offset: i64) -> CaptureRecord {
        CaptureRecord {
            url: Some(url.to_string()),
            host_rev: host.to_string(),
            urlkey: None,
            timestamp: Some("20240101000000".to_string()),
            status: Some(200),
            mime: None,
            mime_detected: None,
            digest: None,
            length: None,
            warc_filename: Some("crawl-data/a.warc.gz".to_string()),
            warc_offset: offset,
            warc_length: 10,
            collection: Some("CC-MAIN-2024-30".to_string()),
            shard_file: Some("cdx-00000.gz".to_string()),
        }
    }

    fn write_sorted_shard(path: &Path, hosts: &[&str]) {
        let mut w = ShardWriter::create(path, RowGroupPolicy::default()).unwrap();
        for (i, host) in hosts.iter().enumerate() {
            w.write(record(host, &format!("https://x/{}", i), i as i64))
                .unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn scan_collapses_runs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("s.parquet");
        write_sorted_shard(&path, &["com,a", "com,a", "com,b", "com,c", "com,c"]);

        let reader = ShardReader::open(&path).unwrap();
        let slices = scan_shard_slices(&reader).unwrap();
        assert_eq!(
            slices,
            vec![
                SliceRow { host_rev: "com,a".into(), row_group: 0, row_start: 0, row_end: 2 },
                SliceRow { host_rev: "com,b".into(), row_group: 0, row_start: 2, row_end: 3 },
                SliceRow { host_rev: "com,c".into(), row_group: 0, row_start: 3, row_end: 5 },
            ]
        );
    }

    #[test]
    fn builds_and_skips_unchanged() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = crate::config::Config::new(
            dir.path().join("parquet"),
            dir.path().join("duckdb"),
        );
        let shard = layout::shard_parquet_path(&cfg, "CC-MAIN-2024-30", "cdx-00000.gz").unwrap();
        write_sorted_shard(&shard, &["com,a", "com,b", "com,b"]);

        let cancel = CancelToken::new();
        let r1 = build_collection_index(&cfg, "CC-MAIN-2024-30", false, &cancel).unwrap();
        assert_eq!(r1.shards_indexed, 1);
        assert_eq!(r1.slice_rows, 2);
        assert!(r1.complete);

        let r2 = build_collection_index(&cfg, "CC-MAIN-2024-30", false, &cancel).unwrap();
        assert_eq!(r2.shards_indexed, 0);
        assert_eq!(r2.shards_skipped, 1);
        assert!(r2.complete);

        let conn = Connection::open(layout::collection_db_path(&cfg, "CC-MAIN-2024-30")).unwrap();
        let n: i64 = conn
            .query_row("SELECT count(*) FROM cc_domain_shards", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 2);
        let host: String = conn
            .query_row(
                "SELECT host_rev FROM cc_domain_shards WHERE capture_count = 2",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(host, "com,b");
    }
}
