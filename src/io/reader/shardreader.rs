//! Pointer-shard reading.
//!
//! Readers never materialize more than one row-group slice at a time; the
//! query planner hands out `(row_group, row_start, row_end)` slices and this
//! module turns them back into [CaptureRecord]s with column projection.
use std::fs::File;
use std::path::{Path, PathBuf};

use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::statistics::Statistics;
use parquet::record::Field;
use parquet::schema::parser::parse_message_type;
use parquet::schema::types::Type;

use crate::error::Error;
use crate::sources::CaptureRecord;

/// Columns of the capture schema, in file order, with their projection
/// definitions.
const COLUMN_DEFS: &[(&str, &str)] = &[
    ("url", "optional binary url (UTF8);"),
    ("host_rev", "required binary host_rev (UTF8);"),
    ("urlkey", "optional binary urlkey (UTF8);"),
    ("timestamp", "optional binary timestamp (UTF8);"),
    ("status", "optional int32 status;"),
    ("mime", "optional binary mime (UTF8);"),
    ("mime_detected", "optional binary mime_detected (UTF8);"),
    ("digest", "optional binary digest (UTF8);"),
    ("length", "optional int64 length;"),
    ("warc_filename", "optional binary warc_filename (UTF8);"),
    ("warc_offset", "required int64 warc_offset;"),
    ("warc_length", "required int64 warc_length;"),
    ("collection", "optional binary collection (UTF8);"),
    ("shard_file", "optional binary shard_file (UTF8);"),
];

/// Default projection for query results.
pub const POINTER_COLUMNS: &[&str] = &[
    "url",
    "timestamp",
    "status",
    "warc_filename",
    "warc_offset",
    "warc_length",
];

#[derive(Debug, Clone)]
pub struct RowGroupStats {
    pub index: usize,
    pub num_rows: i64,
    pub host_rev_min: Option<String>,
    pub host_rev_max: Option<String>,
    pub compressed_bytes: i64,
}

pub struct ShardReader {
    reader: SerializedFileReader<File>,
    path: PathBuf,
}

impl ShardReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(&path)?;
        let reader = SerializedFileReader::new(file)?;
        Ok(Self {
            reader,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_row_groups(&self) -> usize {
        self.reader.metadata().num_row_groups()
    }

    pub fn num_rows(&self) -> i64 {
        self.reader.metadata().file_metadata().num_rows()
    }

    /// Names of the columns present in the file.
    pub fn column_names(&self) -> Vec<String> {
        let schema = self.reader.metadata().file_metadata().schema_descr();
        (0..schema.num_columns())
            .map(|i| schema.column(i).name().to_string())
            .collect()
    }

    /// Columns of [COLUMN_DEFS] missing from this file, if any.
    pub fn missing_columns(&self) -> Vec<&'static str> {
        let present = self.column_names();
        COLUMN_DEFS
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| !present.iter().any(|p| p == name))
            .collect()
    }

    /// Per-row-group `host_rev` min/max statistics and row counts.
    pub fn row_group_stats(&self) -> Result<Vec<RowGroupStats>, Error> {
        let md = self.reader.metadata();
        let schema = md.file_metadata().schema_descr();
        let host_idx = (0..schema.num_columns())
            .find(|i| schema.column(*i).name() == "host_rev")
            .ok_or(Error::MissingColumn {
                shard: self.path.clone(),
                column: "host_rev",
            })?;

        let mut out = Vec::with_capacity(md.num_row_groups());
        for i in 0..md.num_row_groups() {
            let rg = md.row_group(i);
            let col = rg.column(host_idx);
            let (min, max) = match col.statistics() {
                Some(Statistics::ByteArray(s)) => (
                    s.min_opt().and_then(|v| v.as_utf8().ok().map(String::from)),
                    s.max_opt().and_then(|v| v.as_utf8().ok().map(String::from)),
                ),
                _ => (None, None),
            };
            out.push(RowGroupStats {
                index: i,
                num_rows: rg.num_rows(),
                host_rev_min: min,
                host_rev_max: max,
                compressed_bytes: rg.compressed_size(),
            });
        }
        Ok(out)
    }

    /// Read the `host_rev` column of one row group.
    pub fn read_host_rev(&self, row_group: usize) -> Result<Vec<String>, Error> {
        let rows = self.read_slice(row_group, 0, usize::MAX, Some(&["host_rev"]))?;
        Ok(rows.into_iter().map(|r| r.host_rev).collect())
    }

    /// Read every column of one row group.
    pub fn read_records(&self, row_group: usize) -> Result<Vec<CaptureRecord>, Error> {
        self.read_slice(row_group, 0, usize::MAX, None)
    }

    /// Read rows `[row_start, row_end)` of one row group, optionally projected
    /// to a subset of columns. Absent columns come back as `None`.
    pub fn read_slice(
        &self,
        row_group: usize,
        row_start: usize,
        row_end: usize,
        columns: Option<&[&str]>,
    ) -> Result<Vec<CaptureRecord>, Error> {
        if row_group >= self.num_row_groups() {
            return Err(Error::Custom(format!(
                "{:?}: row group {} out of range",
                self.path, row_group
            )));
        }
        let rg = self.reader.get_row_group(row_group)?;
        let projection = match columns {
            Some(cols) => Some(projection_for(cols, &self.column_names())?),
            None => None,
        };
        let iter = rg.get_row_iter(projection)?;

        let take = row_end.saturating_sub(row_start);
        let mut out = Vec::new();
        for row in iter.skip(row_start).take(take) {
            let row = row?;
            let mut rec = empty_record();
            for (name, field) in row.get_column_iter() {
                fill_field(&mut rec, name, field);
            }
            out.push(rec);
        }
        Ok(out)
    }
}

/// Build a projection message type for a subset of columns, in file order.
/// Requesting a column the file lacks is [Error::MissingColumn].
fn projection_for(columns: &[&str], present: &[String]) -> Result<Type, Error> {
    for want in columns {
        if !COLUMN_DEFS.iter().any(|(name, _)| name == want) {
            return Err(Error::Custom(format!("unknown column {:?}", want)));
        }
    }
    let mut message = String::from("message capture {\n");
    for (name, def) in COLUMN_DEFS {
        if columns.contains(name) {
            if !present.iter().any(|p| p == name) {
                return Err(Error::MissingColumn {
                    shard: PathBuf::new(),
                    column: name,
                });
            }
            message.push_str("    ");
            message.push_str(def);
            message.push('\n');
        }
    }
    message.push('}');
    Ok(parse_message_type(&message)?)
}

fn empty_record() -> CaptureRecord {
    CaptureRecord {
        url: None,
        host_rev: String::new(),
        urlkey: None,
        timestamp: None,
        status: None,
        mime: None,
        mime_detected: None,
        digest: None,
        length: None,
        warc_filename: None,
        warc_offset: 0,
        warc_length: 0,
        collection: None,
        shard_file: None,
    }
}

fn fill_field(rec: &mut CaptureRecord, name: &str, field: &Field) {
    match (name, field) {
        ("url", Field::Str(s)) => rec.url = Some(s.clone()),
        ("host_rev", Field::Str(s)) => rec.host_rev = s.clone(),
        ("urlkey", Field::Str(s)) => rec.urlkey = Some(s.clone()),
        ("timestamp", Field::Str(s)) => rec.timestamp = Some(s.clone()),
        ("status", Field::Int(v)) => rec.status = Some(*v),
        ("mime", Field::Str(s)) => rec.mime = Some(s.clone()),
        ("mime_detected", Field::Str(s)) => rec.mime_detected = Some(s.clone()),
        ("digest", Field::Str(s)) => rec.digest = Some(s.clone()),
        ("length", Field::Long(v)) => rec.length = Some(*v),
        ("warc_filename", Field::Str(s)) => rec.warc_filename = Some(s.clone()),
        ("warc_offset", Field::Long(v)) => rec.warc_offset = *v,
        ("warc_length", Field::Long(v)) => rec.warc_length = *v,
        ("collection", Field::Str(s)) => rec.collection = Some(s.clone()),
        ("shard_file", Field::Str(s)) => rec.shard_file = Some(s.clone()),
        // Nulls keep the empty-record default.
        _ => {}
    }
}
