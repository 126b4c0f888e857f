//! Parquet shard reading.
mod shardreader;

pub use shardreader::{RowGroupStats, ShardReader, POINTER_COLUMNS};
