//! Parquet shard writing.
mod shardwriter;

pub use shardwriter::{
    sorted_marker_path, tmp_path_for, RowGroupPolicy, ShardSummary, ShardWriter,
    CAPTURE_MESSAGE_TYPE,
};
