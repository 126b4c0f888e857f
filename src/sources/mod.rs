/*!
# Shard sources

Reading of raw Common Crawl index shards.

A shard is a gzipped, newline-delimited CDX file; [cdx::CdxShard] streams it
into typed [record::CaptureRecord]s, one outcome per line.
!*/
pub mod cdx;
pub mod record;

pub use cdx::{CdxShard, LineOutcome, SkipReason};
pub use record::{CaptureRecord, Pointer};
