//! CDX shard decoder.
//!
//! Streams a gzipped CDX shard and emits one [LineOutcome] per record line.
//! Both shapes found in the wild are handled:
//!
//! - CDXJ: `<surt> <timestamp> [<url>] <json-object>`
//! - legacy whitespace CDX: positional fields with the WARC file, offset and
//!   length in the trailing metadata tokens
//!
//! Blank lines and `#` comments are ignored. A malformed line is skipped and
//! counted, never fatal; only a gzip stream that dies before the first record
//! is [Error::SourceUnreadable].
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use log::warn;
use serde_json::Value;

use crate::error::Error;
use crate::hostrev;

use super::record::CaptureRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoHost,
    NoPointer,
    BadJson,
    TooFewFields,
}

/// Per-line decode outcome. `Skipped` lines are counted by the shard reader;
/// fatal conditions surface as the iterator's `Err` side.
#[derive(Debug)]
pub enum LineOutcome {
    Parsed(Box<CaptureRecord>),
    Skipped(SkipReason),
}

pub struct CdxShard {
    reader: BufReader<MultiGzDecoder<File>>,
    path: PathBuf,
    collection: String,
    shard_file: String,
    line: String,
    emitted: u64,
    malformed: u64,
    truncated: bool,
    done: bool,
}

impl CdxShard {
    pub fn from_path_gzip<P: AsRef<Path>>(path: P, collection: &str) -> std::io::Result<Self> {
        let file = File::open(&path)?;
        let shard_file = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            reader: BufReader::new(MultiGzDecoder::new(file)),
            path: path.as_ref().to_path_buf(),
            collection: collection.to_string(),
            shard_file,
            line: String::new(),
            emitted: 0,
            malformed: 0,
            truncated: false,
            done: false,
        })
    }

    /// Records emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Malformed lines skipped so far.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// True when the gzip stream ended mid-file after at least one record.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for CdxShard {
    type Item = Result<LineOutcome, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    if self.emitted == 0 {
                        return Some(Err(Error::SourceUnreadable(self.path.clone())));
                    }
                    warn!("{:?}: gzip stream truncated after {} records: {}", self.path, self.emitted, e);
                    self.truncated = true;
                    return None;
                }
            }

            let trimmed = self.line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match parse_line(trimmed) {
                LineOutcome::Parsed(mut rec) => {
                    rec.collection = Some(self.collection.clone());
                    rec.shard_file = Some(self.shard_file.clone());
                    self.emitted += 1;
                    return Some(Ok(LineOutcome::Parsed(rec)));
                }
                LineOutcome::Skipped(reason) => {
                    self.malformed += 1;
                    return Some(Ok(LineOutcome::Skipped(reason)));
                }
            }
        }
    }
}

/// Parse one record line, dispatching on the presence of a JSON object.
pub fn parse_line(line: &str) -> LineOutcome {
    match line.find('{') {
        Some(pos) => parse_cdxj(line, pos),
        None => parse_legacy(line),
    }
}

fn parse_cdxj(line: &str, json_pos: usize) -> LineOutcome {
    let meta: Value = match serde_json::from_str(line[json_pos..].trim()) {
        Ok(v) => v,
        Err(_) => return LineOutcome::Skipped(SkipReason::BadJson),
    };

    let mut pre = line[..json_pos].split_whitespace();
    let surt = pre.next();
    let timestamp = pre.next();
    let url = pre
        .next()
        .map(|s| s.to_string())
        .or_else(|| meta.get("url").and_then(Value::as_str).map(|s| s.to_string()));

    let host_rev = match url.as_deref().and_then(hostrev::host_rev_from_url) {
        Some(h) => h,
        // Some variants omit the URL everywhere; the SURT preamble still
        // carries the reversed host before its `)`.
        None => match surt.and_then(host_rev_from_surt) {
            Some(h) => h,
            None => return LineOutcome::Skipped(SkipReason::NoHost),
        },
    };

    let offset = meta.get("offset").and_then(value_as_i64);
    let length = meta.get("length").and_then(value_as_i64);
    let (offset, length) = match (offset, length) {
        (Some(o), Some(l)) => (o, l),
        _ => return LineOutcome::Skipped(SkipReason::NoPointer),
    };

    let get_str = |k: &str| meta.get(k).and_then(Value::as_str).map(|s| s.to_string());

    LineOutcome::Parsed(Box::new(CaptureRecord {
        url,
        host_rev,
        urlkey: surt.map(|s| s.to_string()),
        timestamp: timestamp.map(|s| s.to_string()),
        status: meta.get("status").and_then(value_as_i64).map(|v| v as i32),
        mime: get_str("mime"),
        mime_detected: get_str("mime-detected"),
        digest: get_str("digest"),
        length: Some(length),
        warc_filename: get_str("filename"),
        warc_offset: offset,
        warc_length: length,
        collection: None,
        shard_file: None,
    }))
}

fn parse_legacy(line: &str) -> LineOutcome {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 {
        return LineOutcome::Skipped(SkipReason::TooFewFields);
    }

    let urlkey = tokens[0];
    let timestamp = tokens[1];
    let url = tokens[2];

    let host_rev = match hostrev::host_rev_from_url(url).or_else(|| host_rev_from_surt(urlkey)) {
        Some(h) => h,
        None => return LineOutcome::Skipped(SkipReason::NoHost),
    };

    let dash = |t: &str| if t == "-" { None } else { Some(t.to_string()) };

    // Classic 11-field CDX: urlkey ts url mime status digest redirect meta
    // length offset filename.
    if tokens.len() >= 11 {
        if let (Ok(length), Ok(offset)) = (tokens[8].parse::<i64>(), tokens[9].parse::<i64>()) {
            return LineOutcome::Parsed(Box::new(CaptureRecord {
                url: Some(url.to_string()),
                host_rev,
                urlkey: Some(urlkey.to_string()),
                timestamp: Some(timestamp.to_string()),
                status: tokens[4].parse().ok(),
                mime: dash(tokens[3]),
                mime_detected: None,
                digest: dash(tokens[5]),
                length: Some(length),
                warc_filename: Some(tokens[10].to_string()),
                warc_offset: offset,
                warc_length: length,
                collection: None,
                shard_file: None,
            }));
        }
    }

    // Key-value trailer variant: `... <warc-file> ... offset:<n> length:<n>`.
    let mut filename = None;
    let mut offset = None;
    let mut length = None;
    for t in &tokens[3..] {
        if let Some(v) = t.strip_prefix("offset:") {
            offset = v.parse::<i64>().ok();
        } else if let Some(v) = t.strip_prefix("length:") {
            length = v.parse::<i64>().ok();
        } else if filename.is_none() && (t.contains(".warc") || t.starts_with("crawl-data/")) {
            filename = Some(t.to_string());
        }
    }
    let (offset, length) = match (offset, length) {
        (Some(o), Some(l)) => (o, l),
        _ => return LineOutcome::Skipped(SkipReason::NoPointer),
    };

    LineOutcome::Parsed(Box::new(CaptureRecord {
        url: Some(url.to_string()),
        host_rev,
        urlkey: Some(urlkey.to_string()),
        timestamp: Some(timestamp.to_string()),
        status: None,
        mime: None,
        mime_detected: None,
        digest: None,
        length: Some(length),
        warc_filename: filename,
        warc_offset: offset,
        warc_length: length,
        collection: None,
        shard_file: None,
    }))
}

/// `com,example)/path` → `com,example`; ports after the host are dropped.
fn host_rev_from_surt(surt: &str) -> Option<String> {
    let head = surt.split(')').next()?;
    let head = head.split(':').next()?.trim().to_lowercase();
    if head.is_empty() || !head.contains(',') && head.contains('/') {
        return None;
    }
    Some(head)
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
