//! Per-shard state, derived from filesystem markers.
//!
//! The pipeline never keeps run state in memory between stages: a shard's
//! position in `INPUT_PRESENT → SORTED → INDEXED → AGGREGATED` is readable
//! from the `.sorted` marker, the collection DB registry and the master
//! catalog, which is what makes restarts resume where they left off.
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Error;
use crate::index::layout;
use crate::io::writer::sorted_marker_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Raw gz present, no sorted parquet yet.
    InputPresent,
    /// Sorted parquet and marker exist.
    Sorted,
}

/// Resolved paths for one raw shard.
#[derive(Debug, Clone)]
pub struct ShardPlan {
    pub collection: String,
    pub gz_path: PathBuf,
    pub parquet_path: PathBuf,
}

impl ShardPlan {
    pub fn new(cfg: &Config, collection: &str, gz_path: &Path) -> Result<Self, Error> {
        let gz_name = gz_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Custom(format!("bad shard path {:?}", gz_path)))?;
        Ok(Self {
            collection: collection.to_string(),
            gz_path: gz_path.to_path_buf(),
            parquet_path: layout::shard_parquet_path(cfg, collection, gz_name)?,
        })
    }

    pub fn marker_path(&self) -> PathBuf {
        sorted_marker_path(&self.parquet_path)
    }

    pub fn state(&self) -> ShardState {
        if self.parquet_path.exists() && self.marker_path().exists() {
            ShardState::Sorted
        } else {
            ShardState::InputPresent
        }
    }
}

/// Raw gz shards of one collection under the input root.
pub fn list_input_shards(input_root: &Path, collection: &str) -> Result<Vec<PathBuf>, Error> {
    let pattern = input_root.join(collection).join("cdx-*.gz");
    let mut out: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| Error::Custom(format!("bad glob pattern: {}", e)))?
        .filter_map(Result::ok)
        .collect();
    out.sort();
    Ok(out)
}

/// Collections found under the input root (directories holding cdx shards).
pub fn list_input_collections(input_root: &Path) -> Result<Vec<String>, Error> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(input_root)? {
        let path = entry?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if path.is_dir() && layout::collection_year(name).is_some() {
                out.push(name.to_string());
            }
        }
    }
    out.sort();
    Ok(out)
}
