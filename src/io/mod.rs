/*!
# Shard IO

Columnar pointer-shard reading and writing.

[writer::ShardWriter] emits sorted Parquet shards with per-row-group
`host_rev` statistics; [reader::ShardReader] reads row-group slices back with
column projection.
!*/
pub mod reader;
pub mod writer;

pub use reader::{RowGroupStats, ShardReader, POINTER_COLUMNS};
pub use writer::{RowGroupPolicy, ShardSummary, ShardWriter};
