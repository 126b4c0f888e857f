//! Invariant checks.
//!
//! Everything here is read-only; repairs and rebuilds are triggered by the
//! caller from the reported statuses.
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use duckdb::Connection;
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::Serialize;

use crate::config::Config;
use crate::error::Error;
use crate::fetch::{FetchOptions, WarcFetcher};
use crate::index::collection::scan_shard_slices;
use crate::index::layout;
use crate::io::reader::ShardReader;
use crate::sources::Pointer;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Unsorted,
    MissingColumns,
    NotIndexed,
    Dangling,
    Unreadable,
    /// Aggregates are older than this collection's DB.
    Stale,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardCheck {
    pub shard: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug)]
pub struct CollectionCheckReport {
    pub collection: String,
    pub checks: Vec<ShardCheck>,
}

impl CollectionCheckReport {
    pub fn ok(&self) -> bool {
        self.checks.iter().all(|c| c.status == CheckStatus::Ok)
    }

    /// One CSV row per shard, in the style of the corpus check reports.
    pub fn write_csv(&self, path: &Path) -> Result<(), Error> {
        let mut w = csv::Writer::from_path(path)?;
        for check in &self.checks {
            w.serialize(check)?;
        }
        w.flush()?;
        Ok(())
    }
}

/// Verify one shard's sort contract: row-group min/max chain plus
/// within-group monotonicity.
pub fn check_shard_sorted(path: &Path) -> Result<(), Error> {
    let reader = ShardReader::open(path)?;
    scan_shard_slices(&reader).map(|_| ())
}

/// Checks 1–3 for one collection: sort validity, schema completeness, and
/// index↔disk agreement in both directions.
pub fn check_collection(cfg: &Config, collection: &str) -> Result<CollectionCheckReport, Error> {
    let mut checks = Vec::new();
    let shards = layout::list_collection_shards(cfg, collection)?;
    let db_path = layout::collection_db_path(cfg, collection);

    let mut indexed: HashSet<String> = HashSet::new();
    if db_path.exists() {
        let conn = Connection::open(&db_path)?;
        let mut stmt = conn.prepare("SELECT shard_relpath FROM shard_files")?;
        for rel in stmt.query_map([], |row| row.get::<_, String>(0))? {
            indexed.insert(rel?);
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    for shard in &shards {
        let relpath = layout::shard_relpath(cfg, shard)?;
        seen.insert(relpath.clone());

        let reader = match ShardReader::open(shard) {
            Ok(r) => r,
            Err(e) => {
                checks.push(ShardCheck {
                    shard: relpath,
                    status: CheckStatus::Unreadable,
                    detail: e.to_string(),
                });
                continue;
            }
        };

        let missing = reader.missing_columns();
        if !missing.is_empty() {
            checks.push(ShardCheck {
                shard: relpath,
                status: CheckStatus::MissingColumns,
                detail: missing.join(","),
            });
            continue;
        }

        if let Err(e) = scan_shard_slices(&reader) {
            checks.push(ShardCheck {
                shard: relpath,
                status: CheckStatus::Unsorted,
                detail: e.to_string(),
            });
            continue;
        }

        if !indexed.contains(&relpath) {
            checks.push(ShardCheck {
                shard: relpath,
                status: CheckStatus::NotIndexed,
                detail: "shard absent from per-collection DB".to_string(),
            });
            continue;
        }

        checks.push(ShardCheck {
            shard: relpath,
            status: CheckStatus::Ok,
            detail: String::new(),
        });
    }

    // Index rows whose shard no longer exists on disk.
    for rel in indexed.difference(&seen) {
        checks.push(ShardCheck {
            shard: rel.clone(),
            status: CheckStatus::Dangling,
            detail: "indexed shard missing on disk".to_string(),
        });
    }

    // The DB itself may have outrun the year/master aggregates.
    if db_path.exists() {
        if let Err(e) = crate::index::master::verify_collection_fresh(cfg, collection) {
            checks.push(ShardCheck {
                shard: db_path.to_string_lossy().into_owned(),
                status: CheckStatus::Stale,
                detail: e.to_string(),
            });
        }
    }

    let report = CollectionCheckReport {
        collection: collection.to_string(),
        checks,
    };
    info!(
        "{}: {} shards checked, ok={}",
        collection,
        report.checks.len(),
        report.ok()
    );
    Ok(report)
}

#[derive(Debug)]
pub struct RetrievalSample {
    pub pointer: Pointer,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug)]
pub struct RetrievalReport {
    pub collection: String,
    pub sampled: usize,
    pub ok: usize,
    pub samples: Vec<RetrievalSample>,
}

/// Check 4: sample `n` pointers of a collection, fetch each by range and
/// confirm the bytes are a gzip member whose payload starts with `WARC/1.`.
pub fn verify_retrieval(
    cfg: &Config,
    collection: &str,
    n: usize,
) -> Result<RetrievalReport, Error> {
    let fetcher = WarcFetcher::new(cfg)?;
    let pointers = sample_pointers(cfg, collection, n)?;
    let mut report = RetrievalReport {
        collection: collection.to_string(),
        sampled: pointers.len(),
        ok: 0,
        samples: Vec::new(),
    };

    let opts = FetchOptions {
        include_raw: true,
        ..FetchOptions::default()
    };
    for pointer in pointers {
        let sample = match fetcher.fetch(&pointer, &opts) {
            Ok(rec) => {
                let raw = rec.raw.as_deref().unwrap_or_default();
                match retrieval_problem(raw, rec.bytes_returned, &pointer) {
                    None => RetrievalSample {
                        pointer,
                        ok: true,
                        detail: format!("sha256={}", rec.sha256),
                    },
                    Some(problem) => RetrievalSample {
                        pointer,
                        ok: false,
                        detail: problem,
                    },
                }
            }
            Err(e) => RetrievalSample {
                pointer,
                ok: false,
                detail: e.to_string(),
            },
        };
        if sample.ok {
            report.ok += 1;
        } else {
            warn!(
                "retrieval failed for {} @ {}: {}",
                sample.pointer.warc_filename, sample.pointer.warc_offset, sample.detail
            );
        }
        report.samples.push(sample);
    }
    Ok(report)
}

fn retrieval_problem(raw: &[u8], bytes_returned: usize, ptr: &Pointer) -> Option<String> {
    if bytes_returned as i64 != ptr.warc_length {
        return Some(format!(
            "got {} bytes, pointer says {}",
            bytes_returned, ptr.warc_length
        ));
    }
    if raw.len() < 2 || raw[..2] != GZIP_MAGIC {
        return Some("response does not start with a gzip header".to_string());
    }
    let mut prefix = [0u8; 7];
    let mut dec = flate2::read::GzDecoder::new(raw);
    if let Err(e) = dec.read_exact(&mut prefix) {
        return Some(format!("gzip payload unreadable: {}", e));
    }
    if &prefix != b"WARC/1." {
        return Some(format!(
            "payload starts with {:?}, not a WARC version line",
            String::from_utf8_lossy(&prefix)
        ));
    }
    None
}

/// Pull up to `n` random pointers out of a collection's shards.
fn sample_pointers(cfg: &Config, collection: &str, n: usize) -> Result<Vec<Pointer>, Error> {
    let shards = layout::list_collection_shards(cfg, collection)?;
    let mut rng = thread_rng();
    let mut out = Vec::new();

    let mut shuffled: Vec<PathBuf> = shards;
    shuffled.shuffle(&mut rng);
    for shard in shuffled {
        if out.len() >= n {
            break;
        }
        let reader = ShardReader::open(&shard)?;
        if reader.num_row_groups() == 0 {
            continue;
        }
        let rg = rand::Rng::gen_range(&mut rng, 0..reader.num_row_groups());
        let rows = reader.read_slice(
            rg,
            0,
            n.saturating_sub(out.len()),
            Some(&["warc_filename", "warc_offset", "warc_length"]),
        )?;
        out.extend(rows.iter().filter_map(|r| r.pointer()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::index::collection::build_collection_index;
    use crate::io::writer::{RowGroupPolicy, ShardWriter};
    use crate::sources::CaptureRecord;

    fn record(host: &str, offset: i64) -> CaptureRecord {
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
            warc_offset: offset,
            warc_length: 10,
            collection: Some("CC-MAIN-2024-30".to_string()),
            shard_file: Some("cdx-00000.gz".to_string()),
        }
    }

    #[test]
    fn clean_collection_checks_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
        let shard = layout::shard_parquet_path(&cfg, "CC-MAIN-2024-30", "cdx-00000.gz").unwrap();
        let mut w = ShardWriter::create(&shard, RowGroupPolicy::default()).unwrap();
        w.write(record("com,a", 0)).unwrap();
        w.write(record("com,b", 1)).unwrap();
        w.finish().unwrap();
        build_collection_index(&cfg, "CC-MAIN-2024-30", false, &CancelToken::new()).unwrap();
        crate::index::aggregate_all(&cfg, &CancelToken::new()).unwrap();

        let report = check_collection(&cfg, "CC-MAIN-2024-30").unwrap();
        assert!(report.ok());
        assert_eq!(report.checks.len(), 1);
    }

    #[test]
    fn unindexed_shard_is_flagged() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
        let shard = layout::shard_parquet_path(&cfg, "CC-MAIN-2024-30", "cdx-00000.gz").unwrap();
        let mut w = ShardWriter::create(&shard, RowGroupPolicy::default()).unwrap();
        w.write(record("com,a", 0)).unwrap();
        w.finish().unwrap();

        let report = check_collection(&cfg, "CC-MAIN-2024-30").unwrap();
        assert!(!report.ok());
        assert_eq!(report.checks[0].status, CheckStatus::NotIndexed);
    }

    #[test]
    fn dangling_index_rows_are_flagged() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
        let shard = layout::shard_parquet_path(&cfg, "CC-MAIN-2024-30", "cdx-00000.gz").unwrap();
        let mut w = ShardWriter::create(&shard, RowGroupPolicy::default()).unwrap();
        w.write(record("com,a", 0)).unwrap();
        w.finish().unwrap();
        build_collection_index(&cfg, "CC-MAIN-2024-30", false, &CancelToken::new()).unwrap();

        std::fs::remove_file(&shard).unwrap();
        std::fs::remove_file(crate::io::writer::sorted_marker_path(&shard)).unwrap();

        let report = check_collection(&cfg, "CC-MAIN-2024-30").unwrap();
        assert!(!report.ok());
        assert!(report
            .checks
            .iter()
            .any(|c| c.status == CheckStatus::Dangling));
    }

    #[test]
    fn retrieval_problem_detects_bad_payloads() {
        let ptr = Pointer {
            warc_filename: "a.warc.gz".to_string(),
            warc_offset: 0,
            warc_length: 4,
        };
        assert!(retrieval_problem(b"xxxx", 3, &ptr).is_some());
        assert!(retrieval_problem(b"xxxx", 4, &ptr)
            .unwrap()
            .contains("gzip header"));

        let member = {
            use flate2::write::GzEncoder;
            use std::io::Write;
            let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(b"WARC/1.0\r\n\r\n").unwrap();
            enc.finish().unwrap()
        };
        let ptr = Pointer {
            warc_filename: "a.warc.gz".to_string(),
            warc_offset: 0,
            warc_length: member.len() as i64,
        };
        assert!(retrieval_problem(&member, member.len(), &ptr).is_none());
    }
}
