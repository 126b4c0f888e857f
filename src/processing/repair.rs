//! Legacy shard repair.
//!
//! Early conversions wrote shards without the `collection` and `shard_file`
//! provenance columns. Repair streams such a shard through a fresh writer,
//! filling the missing columns from the shard's location; the WARC pointer
//! triple and the row order are carried over untouched.
use std::path::Path;

use log::{info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::index::layout;
use crate::io::reader::ShardReader;
use crate::io::writer::{RowGroupPolicy, ShardWriter};

/// Rewrite one shard if provenance columns are missing. Returns whether a
/// rewrite happened.
pub fn repair_shard(cfg: &Config, path: &Path, collection: &str) -> Result<bool, Error> {
    let reader = ShardReader::open(path)?;
    let missing = reader.missing_columns();
    if !missing.contains(&"collection") && !missing.contains(&"shard_file") {
        return Ok(false);
    }
    info!("{:?}: repairing missing columns {:?}", path, missing);

    let shard_file = path
        .file_name()
        .map(|n| n.to_string_lossy().trim_end_matches(".parquet").to_string())
        .unwrap_or_default();

    // The writer streams to `<path>.tmp` and renames over the original, so a
    // crash mid-repair leaves the legacy shard intact.
    let mut writer = ShardWriter::create(path, RowGroupPolicy::from_config(cfg))?;
    let mut rows = 0u64;
    for rg in 0..reader.num_row_groups() {
        for mut rec in reader.read_records(rg)? {
            if rec.collection.is_none() {
                rec.collection = Some(collection.to_string());
            }
            if rec.shard_file.is_none() {
                rec.shard_file = Some(shard_file.clone());
            }
            match writer.write(rec) {
                Ok(()) => rows += 1,
                Err(e) => {
                    // An unsorted legacy shard must go back through the
                    // sorter, not the repairer.
                    writer.abort();
                    return Err(e);
                }
            }
        }
    }
    let summary = writer.finish()?;
    info!("{:?}: repaired, {} rows rewritten", summary.path, rows);
    Ok(true)
}

/// Repair every legacy shard of a collection. Returns the repaired count.
pub fn repair_collection(cfg: &Config, collection: &str) -> Result<usize, Error> {
    let mut repaired = 0;
    for shard in layout::list_collection_shards(cfg, collection)? {
        match repair_shard(cfg, &shard, collection) {
            Ok(true) => repaired += 1,
            Ok(false) => {}
            Err(e) => warn!("{:?}: repair failed: {}", shard, e),
        }
    }
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::collection::scan_shard_slices;
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
            warc_length: 77,
            // Legacy rows: no provenance.
            collection: None,
            shard_file: None,
        }
    }

    /// A shard as the earliest conversions wrote them: sorted, but without
    /// the provenance columns in the schema at all.
    fn write_legacy_shard(path: &Path, rows: &[(&str, &str, i64)]) {
        use parquet::data_type::{ByteArray, ByteArrayType, Int64Type};
        use parquet::file::properties::WriterProperties;
        use parquet::file::writer::SerializedFileWriter;
        use parquet::schema::parser::parse_message_type;
        use std::sync::Arc;

        let schema = Arc::new(
            parse_message_type(
                "message capture {
                    optional binary url (UTF8);
                    required binary host_rev (UTF8);
                    required int64 warc_offset;
                    required int64 warc_length;
                }",
            )
            .unwrap(),
        );
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = std::fs::File::create(path).unwrap();
        let mut writer =
            SerializedFileWriter::new(file, schema, Arc::new(WriterProperties::builder().build()))
                .unwrap();
        let mut rg = writer.next_row_group().unwrap();

        let urls: Vec<ByteArray> = rows.iter().map(|(_, u, _)| ByteArray::from(*u)).collect();
        let defs = vec![1i16; rows.len()];
        let mut col = rg.next_column().unwrap().unwrap();
        col.typed::<ByteArrayType>()
            .write_batch(&urls, Some(&defs), None)
            .unwrap();
        col.close().unwrap();

        let hosts: Vec<ByteArray> = rows.iter().map(|(h, _, _)| ByteArray::from(*h)).collect();
        let mut col = rg.next_column().unwrap().unwrap();
        col.typed::<ByteArrayType>()
            .write_batch(&hosts, None, None)
            .unwrap();
        col.close().unwrap();

        let offsets: Vec<i64> = rows.iter().map(|(_, _, o)| *o).collect();
        let mut col = rg.next_column().unwrap().unwrap();
        col.typed::<Int64Type>()
            .write_batch(&offsets, None, None)
            .unwrap();
        col.close().unwrap();

        let lengths = vec![77i64; rows.len()];
        let mut col = rg.next_column().unwrap().unwrap();
        col.typed::<Int64Type>()
            .write_batch(&lengths, None, None)
            .unwrap();
        col.close().unwrap();

        rg.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn fills_missing_provenance_and_keeps_pointers() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
        let shard = layout::shard_parquet_path(&cfg, "CC-MAIN-2024-30", "cdx-00000.gz").unwrap();
        write_legacy_shard(
            &shard,
            &[
                ("com,a", "https://a.com/", 1234),
                ("com,b", "https://b.com/", 5678),
            ],
        );

        assert!(repair_shard(&cfg, &shard, "CC-MAIN-2024-30").unwrap());

        let reader = ShardReader::open(&shard).unwrap();
        assert!(reader.missing_columns().is_empty());
        let rows = reader.read_records(0).unwrap();
        assert_eq!(rows[0].warc_offset, 1234);
        assert_eq!(rows[0].warc_length, 77);
        assert_eq!(rows[0].collection.as_deref(), Some("CC-MAIN-2024-30"));
        assert_eq!(rows[0].shard_file.as_deref(), Some("cdx-00000.gz"));
        assert_eq!(rows[1].warc_offset, 5678);
        scan_shard_slices(&reader).unwrap();

        // Repair is idempotent.
        assert!(!repair_shard(&cfg, &shard, "CC-MAIN-2024-30").unwrap());
    }

    #[test]
    fn complete_shard_is_left_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
        let shard = layout::shard_parquet_path(&cfg, "CC-MAIN-2024-30", "cdx-00001.gz").unwrap();
        let mut w = ShardWriter::create(&shard, RowGroupPolicy::default()).unwrap();
        let mut rec = record("com,a", 1);
        rec.collection = Some("CC-MAIN-2024-30".to_string());
        rec.shard_file = Some("cdx-00001.gz".to_string());
        w.write(rec).unwrap();
        w.finish().unwrap();

        assert!(!repair_shard(&cfg, &shard, "CC-MAIN-2024-30").unwrap());
    }
}
