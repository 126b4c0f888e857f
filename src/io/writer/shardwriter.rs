//! Sorted pointer-shard writer.
//!
//! Rows are written in the order supplied (the sorter owns ordering; the
//! writer only asserts it). Row groups are cut by an adaptive policy: flush at
//! the compressed byte target, or earlier once the group spans a configured
//! share of the domains seen so far, never below the byte minimum. Each flush
//! records `host_rev` min/max chunk statistics so readers can skip groups.
//!
//! Output is atomic: the file streams to `<path>.tmp`, is fsynced, then
//! renamed; a `<path>.sorted` sidecar marker is dropped last.
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use log::debug;
use parquet::basic::{Compression, ZstdLevel};
use parquet::data_type::{ByteArray, ByteArrayType, Int32Type, Int64Type};
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use parquet::file::writer::{SerializedFileWriter, SerializedRowGroupWriter};
use parquet::schema::parser::parse_message_type;
use parquet::schema::types::Type;

use crate::config::Config;
use crate::error::Error;
use crate::sources::CaptureRecord;

/// Fixed shard schema. `host_rev` and the pointer pair are required; the
/// decoder never emits a record without them.
pub const CAPTURE_MESSAGE_TYPE: &str = "
message capture {
    optional binary url (UTF8);
    required binary host_rev (UTF8);
    optional binary urlkey (UTF8);
    optional binary timestamp (UTF8);
    optional int32 status;
    optional binary mime (UTF8);
    optional binary mime_detected (UTF8);
    optional binary digest (UTF8);
    optional int64 length;
    optional binary warc_filename (UTF8);
    required int64 warc_offset;
    required int64 warc_length;
    optional binary collection (UTF8);
    optional binary shard_file (UTF8);
}
";

lazy_static! {
    static ref CAPTURE_SCHEMA: Arc<Type> = Arc::new(
        parse_message_type(CAPTURE_MESSAGE_TYPE).expect("capture message type parses")
    );
}

/// Row-group sizing knobs, see the module docs.
#[derive(Debug, Clone, Copy)]
pub struct RowGroupPolicy {
    pub target_bytes: u64,
    pub min_bytes: u64,
    /// Percentage of the domains seen so far that one group may span.
    pub domain_pct: u8,
}

impl RowGroupPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            target_bytes: cfg.row_group_target_bytes,
            min_bytes: cfg.row_group_min_bytes,
            domain_pct: cfg.row_group_domain_pct,
        }
    }
}

impl Default for RowGroupPolicy {
    fn default() -> Self {
        Self {
            target_bytes: 32 * 1024 * 1024,
            min_bytes: 4 * 1024 * 1024,
            domain_pct: 90,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardSummary {
    pub path: PathBuf,
    pub rows: u64,
    pub row_groups: usize,
    pub bytes_written: u64,
}

pub struct ShardWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<SerializedFileWriter<File>>,
    policy: RowGroupPolicy,
    buf: Vec<CaptureRecord>,

    raw_in_group: u64,
    group_domains: u64,
    total_domains: u64,
    last_host: Option<String>,
    last_key: Option<(String, String, String)>,

    // Observed compressed/raw ratio, refined after each flushed group.
    ratio: f64,
    raw_flushed: u64,
    compressed_flushed: u64,

    rows: u64,
    row_groups: usize,
}

// First-group guess until a real compressed/raw ratio is observed.
const INITIAL_RATIO: f64 = 0.35;

impl ShardWriter {
    pub fn create<P: AsRef<Path>>(path: P, policy: RowGroupPolicy) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_path_for(&path);
        let file = File::create(&tmp_path)?;
        let props = Arc::new(
            WriterProperties::builder()
                .set_compression(Compression::ZSTD(ZstdLevel::default()))
                .set_statistics_enabled(EnabledStatistics::Chunk)
                .build(),
        );
        let writer = SerializedFileWriter::new(file, CAPTURE_SCHEMA.clone(), props)?;
        Ok(Self {
            path,
            tmp_path,
            writer: Some(writer),
            policy,
            buf: Vec::new(),
            raw_in_group: 0,
            group_domains: 0,
            total_domains: 0,
            last_host: None,
            last_key: None,
            ratio: INITIAL_RATIO,
            raw_flushed: 0,
            compressed_flushed: 0,
            rows: 0,
            row_groups: 0,
        })
    }

    pub fn write(&mut self, rec: CaptureRecord) -> Result<(), Error> {
        {
            let key = rec.sort_key();
            if let Some(last) = &self.last_key {
                if (last.0.as_str(), last.1.as_str(), last.2.as_str()) > key {
                    return Err(Error::SortOrderViolated {
                        shard: self.path.clone(),
                        detail: format!("{:?} after {:?}", key, last),
                    });
                }
            }
            self.last_key = Some((key.0.to_string(), key.1.to_string(), key.2.to_string()));
        }

        let host_changed = self.last_host.as_deref() != Some(rec.host_rev.as_str());
        if host_changed && !self.buf.is_empty() && self.flush_due() {
            self.flush_group()?;
        }
        if host_changed {
            self.group_domains += 1;
            self.total_domains += 1;
            self.last_host = Some(rec.host_rev.clone());
        }

        self.raw_in_group += rec.approx_size() as u64;
        self.buf.push(rec);

        // Hard cap: a single giant domain must not grow a group unbounded.
        if self.est_compressed() >= self.policy.target_bytes.saturating_mul(2) {
            self.flush_group()?;
        }
        Ok(())
    }

    fn est_compressed(&self) -> u64 {
        (self.raw_in_group as f64 * self.ratio) as u64
    }

    /// Whether the buffered group is ready to cut at a host boundary.
    fn flush_due(&self) -> bool {
        let est = self.est_compressed();
        if est < self.policy.min_bytes {
            return false;
        }
        if est >= self.policy.target_bytes {
            return true;
        }
        let pct = self.policy.domain_pct;
        if pct > 0 && pct < 100 && self.total_domains >= 16 {
            let span = self.group_domains as f64 / self.total_domains as f64;
            if span >= pct as f64 / 100.0 {
                return true;
            }
        }
        false
    }

    fn flush_group(&mut self) -> Result<(), Error> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Custom("writer already finished".to_string()))?;
        let mut rg = writer.next_row_group()?;
        write_group_columns(&mut rg, &self.buf)?;
        let md = rg.close()?;

        self.rows += self.buf.len() as u64;
        self.row_groups += 1;
        self.raw_flushed += self.raw_in_group;
        self.compressed_flushed += md.compressed_size().max(0) as u64;
        if self.raw_flushed > 0 && self.compressed_flushed > 0 {
            self.ratio = self.compressed_flushed as f64 / self.raw_flushed as f64;
        }
        debug!(
            "{:?}: row group {} with {} rows (~{} compressed bytes)",
            self.path,
            self.row_groups - 1,
            self.buf.len(),
            md.compressed_size()
        );

        self.buf.clear();
        self.raw_in_group = 0;
        self.group_domains = 0;
        self.last_host = None;
        Ok(())
    }

    /// Flush, fsync, rename into place and drop the `.sorted` marker.
    pub fn finish(mut self) -> Result<ShardSummary, Error> {
        self.flush_group()?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| Error::Custom("writer already finished".to_string()))?;
        let file = writer.into_inner()?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&self.tmp_path, &self.path)?;
        std::fs::write(
            sorted_marker_path(&self.path),
            format!("sorted_at={}\n", Utc::now().to_rfc3339()),
        )?;

        let bytes_written = std::fs::metadata(&self.path)?.len();
        Ok(ShardSummary {
            path: self.path.clone(),
            rows: self.rows,
            row_groups: self.row_groups,
            bytes_written,
        })
    }

    /// Discard everything written so far. No marker, no output file.
    pub fn abort(mut self) {
        self.writer.take();
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        // A writer that was neither finished nor aborted leaves no temp file.
        if self.writer.is_some() {
            self.writer.take();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

pub fn sorted_marker_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".sorted");
    PathBuf::from(os)
}

fn write_group_columns(
    rg: &mut SerializedRowGroupWriter<'_, File>,
    rows: &[CaptureRecord],
) -> Result<(), Error> {
    // Column order must follow CAPTURE_MESSAGE_TYPE exactly.
    write_opt_str(rg, rows.iter().map(|r| r.url.as_deref()))?;
    write_req_str(rg, rows.iter().map(|r| r.host_rev.as_str()))?;
    write_opt_str(rg, rows.iter().map(|r| r.urlkey.as_deref()))?;
    write_opt_str(rg, rows.iter().map(|r| r.timestamp.as_deref()))?;
    write_opt_i32(rg, rows.iter().map(|r| r.status))?;
    write_opt_str(rg, rows.iter().map(|r| r.mime.as_deref()))?;
    write_opt_str(rg, rows.iter().map(|r| r.mime_detected.as_deref()))?;
    write_opt_str(rg, rows.iter().map(|r| r.digest.as_deref()))?;
    write_opt_i64(rg, rows.iter().map(|r| r.length))?;
    write_opt_str(rg, rows.iter().map(|r| r.warc_filename.as_deref()))?;
    write_req_i64(rg, rows.iter().map(|r| r.warc_offset))?;
    write_req_i64(rg, rows.iter().map(|r| r.warc_length))?;
    write_opt_str(rg, rows.iter().map(|r| r.collection.as_deref()))?;
    write_opt_str(rg, rows.iter().map(|r| r.shard_file.as_deref()))?;
    Ok(())
}

fn next_col<'a>(
    rg: &'a mut SerializedRowGroupWriter<'_, File>,
) -> Result<parquet::file::writer::SerializedColumnWriter<'a>, Error> {
    rg.next_column()?
        .ok_or_else(|| Error::Custom("schema exhausted while writing columns".to_string()))
}

fn write_opt_str<'a>(
    rg: &mut SerializedRowGroupWriter<'_, File>,
    vals: impl Iterator<Item = Option<&'a str>>,
) -> Result<(), Error> {
    let mut defs = Vec::new();
    let mut data = Vec::new();
    for v in vals {
        match v {
            Some(s) => {
                defs.push(1i16);
                data.push(ByteArray::from(s));
            }
            None => defs.push(0i16),
        }
    }
    let mut col = next_col(rg)?;
    col.typed::<ByteArrayType>()
        .write_batch(&data, Some(&defs), None)?;
    col.close()?;
    Ok(())
}

fn write_req_str<'a>(
    rg: &mut SerializedRowGroupWriter<'_, File>,
    vals: impl Iterator<Item = &'a str>,
) -> Result<(), Error> {
    let data: Vec<ByteArray> = vals.map(ByteArray::from).collect();
    let mut col = next_col(rg)?;
    col.typed::<ByteArrayType>().write_batch(&data, None, None)?;
    col.close()?;
    Ok(())
}

fn write_opt_i32(
    rg: &mut SerializedRowGroupWriter<'_, File>,
    vals: impl Iterator<Item = Option<i32>>,
) -> Result<(), Error> {
    let mut defs = Vec::new();
    let mut data = Vec::new();
    for v in vals {
        match v {
            Some(x) => {
                defs.push(1i16);
                data.push(x);
            }
            None => defs.push(0i16),
        }
    }
    let mut col = next_col(rg)?;
    col.typed::<Int32Type>().write_batch(&data, Some(&defs), None)?;
    col.close()?;
    Ok(())
}

fn write_opt_i64(
    rg: &mut SerializedRowGroupWriter<'_, File>,
    vals: impl Iterator<Item = Option<i64>>,
) -> Result<(), Error> {
    let mut defs = Vec::new();
    let mut data = Vec::new();
    for v in vals {
        match v {
            Some(x) => {
                defs.push(1i16);
                data.push(x);
            }
            None => defs.push(0i16),
        }
    }
    let mut col = next_col(rg)?;
    col.typed::<Int64Type>().write_batch(&data, Some(&defs), None)?;
    col.close()?;
    Ok(())
}

fn write_req_i64(
    rg: &mut SerializedRowGroupWriter<'_, File>,
    vals: impl Iterator<Item = i64>,
) -> Result<(), Error> {
    let data: Vec<i64> = vals.collect();
    let mut col = next_col(rg)?;
    col.typed::<Int64Type>().write_batch(&data, None, None)?;
    col.close()?;
    Ok(())
}
