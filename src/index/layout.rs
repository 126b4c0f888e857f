//! On-disk layout of shards and index DBs.
//!
//! ```text
//! <parquet_root>/cc_pointers_by_collection/<YYYY>/<collection>/cdx-NNNNN.gz.parquet
//! <duckdb_root>/cc_pointers_by_collection/<collection>.duckdb
//! <duckdb_root>/cc_pointers_by_year/<YYYY>.duckdb
//! <duckdb_root>/cc_pointers_master/cc_master_index.duckdb
//! ```
//!
//! Shard paths stored in index DBs are relative to `parquet_root`.
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Error;

pub const BY_COLLECTION: &str = "cc_pointers_by_collection";
pub const BY_YEAR: &str = "cc_pointers_by_year";
pub const MASTER_DIR: &str = "cc_pointers_master";
pub const MASTER_FILE: &str = "cc_master_index.duckdb";

/// `CC-MAIN-2024-30` → `2024`.
pub fn collection_year(collection: &str) -> Option<i32> {
    collection.split('-').nth(2)?.parse().ok()
}

pub fn collection_shard_dir(cfg: &Config, collection: &str) -> Result<PathBuf, Error> {
    let year = collection_year(collection)
        .ok_or_else(|| Error::Custom(format!("invalid collection name: {}", collection)))?;
    Ok(cfg
        .parquet_root
        .join(BY_COLLECTION)
        .join(year.to_string())
        .join(collection))
}

/// Parquet path for one raw shard (`cdx-00000.gz` → `cdx-00000.gz.parquet`).
pub fn shard_parquet_path(cfg: &Config, collection: &str, gz_name: &str) -> Result<PathBuf, Error> {
    Ok(collection_shard_dir(cfg, collection)?.join(format!("{}.parquet", gz_name)))
}

/// Path of a shard relative to `parquet_root`, as stored in index DBs.
pub fn shard_relpath(cfg: &Config, shard: &Path) -> Result<String, Error> {
    let rel = shard
        .strip_prefix(&cfg.parquet_root)
        .map_err(|_| Error::Custom(format!("{:?} is outside parquet_root", shard)))?;
    Ok(rel.to_string_lossy().replace('\\', "/"))
}

pub fn shard_abspath(cfg: &Config, relpath: &str) -> PathBuf {
    cfg.parquet_root.join(relpath)
}

/// Sorted Parquet shards of one collection.
pub fn list_collection_shards(cfg: &Config, collection: &str) -> Result<Vec<PathBuf>, Error> {
    let dir = collection_shard_dir(cfg, collection)?;
    let pattern = dir.join("cdx-*.gz.parquet");
    let mut out: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| Error::Custom(format!("bad glob pattern: {}", e)))?
        .filter_map(Result::ok)
        .collect();
    out.sort();
    Ok(out)
}

pub fn collection_db_path(cfg: &Config, collection: &str) -> PathBuf {
    cfg.duckdb_root
        .join(BY_COLLECTION)
        .join(format!("{}.duckdb", collection))
}

pub fn year_db_path(cfg: &Config, year: i32) -> PathBuf {
    cfg.duckdb_root.join(BY_YEAR).join(format!("{}.duckdb", year))
}

pub fn master_db_path(cfg: &Config) -> PathBuf {
    cfg.duckdb_root.join(MASTER_DIR).join(MASTER_FILE)
}

/// Existing per-collection DBs as `(collection, path)`, sorted by name.
pub fn list_collection_dbs(cfg: &Config) -> Result<Vec<(String, PathBuf)>, Error> {
    let dir = cfg.duckdb_root.join(BY_COLLECTION);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("duckdb") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push((stem.to_string(), path.clone()));
            }
        }
    }
    out.sort();
    Ok(out)
}

/// `(size_bytes, mtime_ns)` of a file, for change detection.
pub fn file_signature(path: &Path) -> Result<(i64, i64), Error> {
    let md = std::fs::metadata(path)?;
    let mtime_ns = md
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Ok((md.len() as i64, mtime_ns))
}
