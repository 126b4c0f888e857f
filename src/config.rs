//! Runtime configuration.
//!
//! A [Config] value is built in `main` (from an optional JSON file plus CLI
//! overrides) and passed down explicitly; no module holds global settings.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

fn default_row_group_target_bytes() -> u64 {
    32 * MIB
}

fn default_row_group_min_bytes() -> u64 {
    4 * MIB
}

fn default_row_group_domain_pct() -> u8 {
    90
}

fn default_sort_memory() -> u64 {
    4 * GIB
}

fn default_workers() -> usize {
    (num_cpus::get() / 2).max(1)
}

fn default_warc_origin_prefix() -> String {
    "https://data.commoncrawl.org/".to_string()
}

fn default_warc_range_max_bytes() -> u64 {
    2 * MIB
}

fn default_warc_cache_max_bytes() -> u64 {
    5 * 1024 * MIB
}

fn default_brave_cache_ttl_s() -> u64 {
    24 * 3600
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the columnar pointer shards.
    pub parquet_root: PathBuf,
    /// Root of the DuckDB index hierarchy.
    pub duckdb_root: PathBuf,

    #[serde(default = "default_row_group_target_bytes")]
    pub row_group_target_bytes: u64,
    #[serde(default = "default_row_group_min_bytes")]
    pub row_group_min_bytes: u64,
    #[serde(default = "default_row_group_domain_pct")]
    pub row_group_domain_pct: u8,

    #[serde(default = "default_sort_memory")]
    pub sort_memory_per_worker: u64,
    #[serde(default = "default_workers")]
    pub sort_workers: usize,
    #[serde(default = "default_workers")]
    pub index_workers: usize,
    /// Spill directory for external sorting. Defaults to `<parquet_root>/.spill`.
    #[serde(default)]
    pub spill_dir: Option<PathBuf>,

    #[serde(default = "default_warc_origin_prefix")]
    pub warc_origin_prefix: String,
    #[serde(default = "default_warc_range_max_bytes")]
    pub warc_range_max_bytes: u64,
    #[serde(default)]
    pub warc_cache_dir: Option<PathBuf>,
    #[serde(default = "default_warc_cache_max_bytes")]
    pub warc_cache_max_bytes: u64,

    #[serde(default)]
    pub brave_cache_path: Option<PathBuf>,
    #[serde(default = "default_brave_cache_ttl_s")]
    pub brave_cache_ttl_s: u64,

    /// Refuse in-place shard rewrites while filesystem snapshots exist on
    /// `snapshot_dataset`.
    #[serde(default = "default_true")]
    pub refuse_if_snapshots: bool,
    /// ZFS dataset backing `parquet_root`, if any.
    #[serde(default)]
    pub snapshot_dataset: Option<String>,
}

impl Config {
    pub fn new(parquet_root: PathBuf, duckdb_root: PathBuf) -> Self {
        // Round-trip through serde so every `default =` applies.
        let seed = serde_json::json!({
            "parquet_root": parquet_root,
            "duckdb_root": duckdb_root,
        });
        serde_json::from_value(seed).expect("config seed is deserializable")
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let f = std::fs::File::open(path)?;
        let cfg = serde_json::from_reader(std::io::BufReader::new(f))?;
        Ok(cfg)
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.spill_dir
            .clone()
            .unwrap_or_else(|| self.parquet_root.join(".spill"))
    }
}
