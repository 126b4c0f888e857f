//! Per-year meta-index.
//!
//! One DB per crawl year, the union of that year's per-collection slice
//! tables. Built by attaching each source DB read-only and bulk-inserting, so
//! a query for a whole year touches one small DB instead of dozens.
use std::path::{Path, PathBuf};

use duckdb::Connection;
use log::info;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Error;

use super::layout;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cc_domain_rowgroups (
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
";

fn sql_quote(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "''")
}

/// Rebuild the year DB from every per-collection DB of that year.
pub fn build_year_index(cfg: &Config, year: i32, cancel: &CancelToken) -> Result<PathBuf, Error> {
    let db_path = layout::year_db_path(cfg, year);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let building = {
        let mut os = db_path.as_os_str().to_owned();
        os.push(".building");
        PathBuf::from(os)
    };
    let _ = std::fs::remove_file(&building);

    let sources: Vec<(String, PathBuf)> = layout::list_collection_dbs(cfg)?
        .into_iter()
        .filter(|(c, _)| layout::collection_year(c) == Some(year))
        .collect();

    let result = (|| -> Result<(), Error> {
        let conn = Connection::open(&building)?;
        conn.execute_batch(SCHEMA)?;
        for (collection, src) in &sources {
            cancel.check()?;
            conn.execute_batch(&format!(
                "ATTACH '{}' AS src (READ_ONLY);
                 INSERT INTO cc_domain_rowgroups
                 SELECT host_rev, shard_relpath, row_group, row_start, row_end,
                        capture_count, collection, year, shard_file
                 FROM src.cc_domain_shards;
                 DETACH src;",
                sql_quote(src)
            ))?;
            info!("year {}: merged {}", year, collection);
        }
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_year_host ON cc_domain_rowgroups(host_rev);
             CREATE INDEX IF NOT EXISTS idx_year_collection ON cc_domain_rowgroups(collection);",
        )?;
        conn.close().map_err(|(_, e)| Error::DuckDb(e))?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&building);
        return Err(e);
    }
    std::fs::rename(&building, &db_path)?;
    Ok(db_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::collection::build_collection_index;
    use crate::io::writer::{RowGroupPolicy, ShardWriter};
    use crate::sources::CaptureRecord;
    use duckdb::params;

    fn record(host: &str, collection: &str) -> CaptureRecord {
        CaptureRecord {
            url: Some(format!("https://{}/", host)),
            host_rev: host.to_string(),
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
        }
    }

    #[test]
    fn merges_collections_of_a_year() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = crate::config::Config::new(
            dir.path().join("parquet"),
            dir.path().join("duckdb"),
        );
        let cancel = CancelToken::new();

        for collection in ["CC-MAIN-2024-30", "CC-MAIN-2024-33"] {
            let shard =
                layout::shard_parquet_path(&cfg, collection, "cdx-00000.gz").unwrap();
            let mut w = ShardWriter::create(&shard, RowGroupPolicy::default()).unwrap();
            w.write(record("com,example", collection)).unwrap();
            w.finish().unwrap();
            build_collection_index(&cfg, collection, false, &cancel).unwrap();
        }

        let db = build_year_index(&cfg, 2024, &cancel).unwrap();
        let conn = Connection::open(&db).unwrap();
        let n: i64 = conn
            .query_row("SELECT count(*) FROM cc_domain_rowgroups", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 2);
        let m: i64 = conn
            .query_row(
                "SELECT count(DISTINCT collection) FROM cc_domain_rowgroups WHERE host_rev = ?",
                params!["com,example"],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(m, 2);
    }
}
