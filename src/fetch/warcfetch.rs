//! Ranged WARC record fetcher.
//!
//! Each pointer addresses one gzip member, so the ranged slice is itself a
//! valid gzip stream: decompress, split WARC headers from payload, then parse
//! the payload as HTTP when the record is a `response`.
use std::io::{BufReader, Read};
use std::time::Duration;

use flate2::read::GzDecoder;
use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use warc::{WarcHeader, WarcReader};

use crate::config::Config;
use crate::error::Error;
use crate::sources::Pointer;

use super::cache::WarcCache;
use super::http::{parse_http_response, HttpEnvelope};

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_ATTEMPTS: usize = 4;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_bytes: usize,
    pub max_preview_chars: usize,
    /// Carry the raw (still compressed) bytes in the result.
    pub include_raw: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_bytes: 2 * 1024 * 1024,
            max_preview_chars: 40_000,
            include_raw: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Ranged,
    Cache,
}

#[derive(Debug)]
pub struct FetchedRecord {
    pub url: String,
    pub source: FetchSource,
    pub bytes_requested: usize,
    pub bytes_returned: usize,
    /// SHA-256 of the raw fetched bytes, hex encoded.
    pub sha256: String,
    pub warc_headers: Vec<(String, String)>,
    pub warc_type: Option<String>,
    pub http: Option<HttpEnvelope>,
    pub raw: Option<Vec<u8>>,
}

pub struct WarcFetcher {
    client: Client,
    prefix: String,
    range_max_bytes: u64,
    cache: Option<WarcCache>,
}

impl WarcFetcher {
    pub fn new(cfg: &Config) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .connect_timeout(Duration::from_secs(20))
            .build()?;
        let mut prefix = cfg.warc_origin_prefix.clone();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let cache = cfg
            .warc_cache_dir
            .as_ref()
            .map(|dir| WarcCache::new(dir.clone(), cfg.warc_cache_max_bytes));
        Ok(Self {
            client,
            prefix,
            range_max_bytes: cfg.warc_range_max_bytes,
            cache,
        })
    }

    pub fn record_url(&self, ptr: &Pointer) -> String {
        format!(
            "{}{}",
            self.prefix,
            ptr.warc_filename.trim_start_matches('/')
        )
    }

    /// Fetch and decode one WARC record.
    pub fn fetch(&self, ptr: &Pointer, opts: &FetchOptions) -> Result<FetchedRecord, Error> {
        let url = self.record_url(ptr);
        let requested = (ptr.warc_length as usize)
            .min(opts.max_bytes)
            .min(self.range_max_bytes as usize);

        let (raw, source) = match &self.cache {
            Some(cache) => {
                match cache.fetch_range(&self.client, &url, ptr, requested)? {
                    Some(bytes) => (bytes, FetchSource::Cache),
                    // File above the cache cap; fall back to a ranged GET.
                    None => (self.fetch_ranged(&url, ptr, requested)?, FetchSource::Ranged),
                }
            }
            None => (self.fetch_ranged(&url, ptr, requested)?, FetchSource::Ranged),
        };

        let sha256 = hex_digest(&raw);
        let decompressed = decompress_member(&raw, opts.max_bytes)?;
        let (warc_headers, warc_type, payload) = parse_warc_member(&decompressed)?;

        let http = if warc_type.as_deref() == Some("response") {
            match parse_http_response(&payload, opts.max_bytes, opts.max_preview_chars) {
                Ok(env) => Some(env),
                Err(Error::MalformedHttp(msg)) => {
                    warn!("{}: payload is not parseable HTTP: {}", url, msg);
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(FetchedRecord {
            url,
            source,
            bytes_requested: requested,
            bytes_returned: raw.len(),
            sha256,
            warc_headers,
            warc_type,
            http,
            raw: if opts.include_raw { Some(raw) } else { None },
        })
    }

    /// `Range: bytes=<offset>-<offset+len-1>` GET with retry on transport
    /// errors. 404 and 416 are returned as-is, without retrying.
    fn fetch_ranged(&self, url: &str, ptr: &Pointer, len: usize) -> Result<Vec<u8>, Error> {
        let start = ptr.warc_offset as u64;
        let end = start + len as u64 - 1;
        let range = format!("bytes={}-{}", start, end);

        let mut last_err = String::new();
        for delay in ExponentialBackoff::from_millis(100).take(RETRY_ATTEMPTS) {
            let resp = match self
                .client
                .get(url)
                .header(reqwest::header::RANGE, range.as_str())
                .send()
            {
                Ok(r) => r,
                Err(e) => {
                    last_err = e.to_string();
                    debug!("{}: transport error, retrying in {:?}: {}", url, delay, e);
                    std::thread::sleep(delay);
                    continue;
                }
            };

            match resp.status() {
                StatusCode::NOT_FOUND => return Err(Error::NotFound(url.to_string())),
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    return Err(Error::RangeNotSatisfiable(url.to_string()))
                }
                s if s == StatusCode::OK || s == StatusCode::PARTIAL_CONTENT => {
                    let full = s == StatusCode::OK;
                    let body = match resp.bytes() {
                        Ok(b) => b,
                        Err(e) => {
                            last_err = e.to_string();
                            std::thread::sleep(delay);
                            continue;
                        }
                    };
                    // A 200 means the server ignored the range header and
                    // returned the whole object.
                    let bytes = if full && body.len() as u64 > len as u64 {
                        let lo = (start as usize).min(body.len());
                        let hi = (lo + len).min(body.len());
                        body[lo..hi].to_vec()
                    } else {
                        body.to_vec()
                    };
                    if bytes.len() != len {
                        warn!(
                            "{}: expected {} bytes from range {}, got {}",
                            url,
                            len,
                            range,
                            bytes.len()
                        );
                    }
                    return Ok(bytes);
                }
                s => {
                    last_err = format!("HTTP {}", s);
                    std::thread::sleep(delay);
                }
            }
        }
        Err(Error::NetworkError(format!("{}: {}", url, last_err)))
    }
}

fn decompress_member(raw: &[u8], max_bytes: usize) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut decoder = GzDecoder::new(raw).take(max_bytes as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::GzipError(format!("record gzip member: {}", e)))?;
    out.truncate(max_bytes);
    Ok(out)
}

/// Split a decompressed member into WARC headers and payload.
fn parse_warc_member(bytes: &[u8]) -> Result<(Vec<(String, String)>, Option<String>, Vec<u8>), Error> {
    let mut reader = WarcReader::new(BufReader::new(bytes));
    let mut records = reader.iter_records();
    let record = records
        .next()
        .ok_or_else(|| Error::MalformedWarc("empty WARC member".to_string()))?
        .map_err(|e| Error::MalformedWarc(e.to_string()))?;

    let (raw_header, body) = record.into_raw_parts();
    let warc_type = raw_header
        .headers
        .get(&WarcHeader::WarcType)
        .map(|v| String::from_utf8_lossy(v).into_owned());
    let mut headers: Vec<(String, String)> = raw_header
        .headers
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v).into_owned()))
        .collect();
    headers.sort();
    Ok((headers, warc_type, body.to_vec()))
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Doubling backoff with a ceiling.
pub(crate) struct ExponentialBackoff {
    next_millis: u64,
    limit_millis: u64,
}

impl ExponentialBackoff {
    pub fn from_millis(millis: u64) -> Self {
        Self {
            next_millis: millis,
            limit_millis: 30_000,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next_millis;
        self.next_millis = (self.next_millis * 2).min(self.limit_millis);
        Some(Duration::from_millis(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    pub(crate) fn warc_gz_member(http_bytes: &[u8]) -> Vec<u8> {
        let warc_head = format!(
            "WARC/1.0\r\n\
             WARC-Type: response\r\n\
             WARC-Record-ID: <urn:uuid:00000000-0000-0000-0000-000000000000>\r\n\
             WARC-Date: 2024-07-22T12:00:00Z\r\n\
             WARC-Target-URI: https://example.test/\r\n\
             Content-Length: {}\r\n\
             \r\n",
            http_bytes.len()
        );
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(warc_head.as_bytes()).unwrap();
        enc.write_all(http_bytes).unwrap();
        enc.write_all(b"\r\n\r\n").unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn member_round_trip() {
        let http = b"HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n<html><body>Hello</body></html>";
        let gz = warc_gz_member(http);

        let decompressed = decompress_member(&gz, 1 << 20).unwrap();
        assert!(decompressed.starts_with(b"WARC/1.0"));

        let (headers, warc_type, payload) = parse_warc_member(&decompressed).unwrap();
        assert_eq!(warc_type.as_deref(), Some("response"));
        assert!(headers
            .iter()
            .any(|(k, v)| k.to_lowercase() == "warc-target-uri" && v == "https://example.test/"));

        let env = parse_http_response(&payload, 1 << 20, 1024).unwrap();
        assert_eq!(env.status, 200);
        assert!(env.is_html);
        assert!(env.body_preview.unwrap().starts_with("<html"));
    }

    #[test]
    fn truncated_member_is_gzip_error() {
        let http = b"HTTP/1.1 200 OK\r\n\r\nbody";
        let gz = warc_gz_member(http);
        let err = decompress_member(&gz[..gz.len() / 2], 1 << 20).unwrap_err();
        assert!(matches!(err, Error::GzipError(_)));
    }

    #[test]
    fn digest_is_hex_sha256() {
        // sha256("") well-known value.
        assert_eq!(
            hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn backoff_doubles_to_ceiling() {
        let delays: Vec<_> = ExponentialBackoff::from_millis(100).take(3).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }
}
