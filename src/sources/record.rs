//! Capture records and WARC pointers.
use serde::{Deserialize, Serialize};

/// One archived URL capture: where it lives in the corpus and how to fetch it.
///
/// This is the single record layout used from decode to query; the CDX wire
/// shapes are converted into it at the decoder and never travel further.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub url: Option<String>,
    /// Reversed-label host, e.g. `com,example,www`. Sort and index key.
    pub host_rev: String,
    pub urlkey: Option<String>,
    /// 14-digit `YYYYMMDDHHMMSS`.
    pub timestamp: Option<String>,
    pub status: Option<i32>,
    pub mime: Option<String>,
    pub mime_detected: Option<String>,
    pub digest: Option<String>,
    pub length: Option<i64>,
    pub warc_filename: Option<String>,
    pub warc_offset: i64,
    pub warc_length: i64,
    pub collection: Option<String>,
    pub shard_file: Option<String>,
}

impl CaptureRecord {
    /// Composite sort key. Absent fields compare as empty strings.
    pub fn sort_key(&self) -> (&str, &str, &str) {
        (
            self.host_rev.as_str(),
            self.url.as_deref().unwrap_or(""),
            self.timestamp.as_deref().unwrap_or(""),
        )
    }

    /// Rough in-memory footprint, used for sort memory budgeting.
    pub fn approx_size(&self) -> usize {
        fn s(v: &Option<String>) -> usize {
            v.as_ref().map(|x| x.len()).unwrap_or(0)
        }
        128 + self.host_rev.len()
            + s(&self.url)
            + s(&self.urlkey)
            + s(&self.timestamp)
            + s(&self.mime)
            + s(&self.mime_detected)
            + s(&self.digest)
            + s(&self.warc_filename)
            + s(&self.collection)
            + s(&self.shard_file)
    }

    /// The WARC pointer triple, when the record carries a filename.
    pub fn pointer(&self) -> Option<Pointer> {
        self.warc_filename.as_ref().map(|f| Pointer {
            warc_filename: f.clone(),
            warc_offset: self.warc_offset,
            warc_length: self.warc_length,
        })
    }
}

/// Address of one gzip member inside a public WARC file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    pub warc_filename: String,
    pub warc_offset: i64,
    pub warc_length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(host: &str, url: &str, ts: &str) -> CaptureRecord {
        CaptureRecord {
            url: Some(url.to_string()),
            host_rev: host.to_string(),
            urlkey: None,
            timestamp: Some(ts.to_string()),
            status: Some(200),
            mime: None,
            mime_detected: None,
            digest: None,
            length: None,
            warc_filename: Some("crawl-data/x.warc.gz".to_string()),
            warc_offset: 0,
            warc_length: 10,
            collection: None,
            shard_file: None,
        }
    }

    #[test]
    fn sort_key_orders_by_host_then_url_then_ts() {
        let a = record("com,example", "https://example.com/a", "20240101000000");
        let b = record("com,example", "https://example.com/b", "20230101000000");
        let c = record("com,example,www", "https://www.example.com/a", "20220101000000");
        assert!(a.sort_key() < b.sort_key());
        assert!(b.sort_key() < c.sort_key());
    }

    #[test]
    fn pointer_requires_filename() {
        let mut r = record("com,example", "https://example.com/", "20240101000000");
        assert!(r.pointer().is_some());
        r.warc_filename = None;
        assert!(r.pointer().is_none());
    }
}
