//! HTTP envelope parsing for archived responses.
//!
//! WARC `response` payloads are raw HTTP/1.x bytes: status line, headers,
//! body. Bodies may additionally be chunked and/or content-encoded; both are
//! undone here into bounded buffers.
use std::io::Read;

use chardetng::EncodingDetector;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use mime::Mime;
use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Clone, Serialize)]
pub struct HttpEnvelope {
    pub status: u16,
    pub status_line: String,
    /// Header names lowercased; order preserved.
    pub headers: Vec<(String, String)>,
    /// Decoded text, bounded by `max_preview_chars`.
    pub body_preview: Option<String>,
    /// Decoded body length in bytes (after un-chunking and decompression).
    pub body_bytes: usize,
    pub mime: Option<String>,
    pub charset: Option<String>,
    pub is_html: bool,
}

impl HttpEnvelope {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse one archived HTTP response.
pub fn parse_http_response(
    payload: &[u8],
    max_body_bytes: usize,
    max_preview_chars: usize,
) -> Result<HttpEnvelope, Error> {
    let (head, body) = split_head(payload)
        .ok_or_else(|| Error::MalformedHttp("no header/body separator".to_string()))?;
    let head = String::from_utf8_lossy(head);
    let mut lines = head.lines();

    let status_line = lines
        .next()
        .ok_or_else(|| Error::MalformedHttp("empty head".to_string()))?
        .trim()
        .to_string();
    let mut parts = status_line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| Error::MalformedHttp("empty status line".to_string()))?;
    if !version.starts_with("HTTP/") {
        return Err(Error::MalformedHttp(format!(
            "not an HTTP status line: {:?}",
            status_line
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| Error::MalformedHttp(format!("bad status code in {:?}", status_line)))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_lowercase(), value.trim().to_string()))
            }
            // Tolerate stray continuation junk instead of failing the record.
            None => continue,
        }
    }

    let find = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    };

    let mut body = body.to_vec();
    if find("transfer-encoding")
        .map(|v| v.to_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        body = decode_chunked(&body, max_body_bytes)?;
    }
    match find("content-encoding").map(|v| v.to_lowercase()) {
        Some(enc) if enc.contains("gzip") => {
            body = bounded_decompress(GzDecoder::new(&body[..]), max_body_bytes)?;
        }
        Some(enc) if enc.contains("deflate") => {
            // Servers ship both zlib-wrapped and raw deflate under this name.
            body = match bounded_decompress(ZlibDecoder::new(&body[..]), max_body_bytes) {
                Ok(b) => b,
                Err(_) => bounded_decompress(DeflateDecoder::new(&body[..]), max_body_bytes)?,
            };
        }
        _ => {}
    }
    if body.len() > max_body_bytes {
        body.truncate(max_body_bytes);
    }

    let (mime_str, charset_hint) = match find("content-type").and_then(|v| v.parse::<Mime>().ok()) {
        Some(m) => (
            Some(m.essence_str().to_string()),
            m.get_param(mime::CHARSET).map(|c| c.to_string()),
        ),
        None => (None, None),
    };
    let is_html = mime_str.as_deref() == Some("text/html")
        || mime_str.as_deref() == Some("application/xhtml+xml");

    let charset = charset_hint.or_else(|| {
        if body.is_empty() {
            None
        } else {
            let mut det = EncodingDetector::new();
            det.feed(&body, true);
            Some(det.guess(None, true).name().to_string())
        }
    });

    let body_preview = if body.is_empty() {
        None
    } else {
        Some(decode_preview(&body, charset.as_deref(), max_preview_chars))
    };

    Ok(HttpEnvelope {
        status,
        status_line,
        headers,
        body_bytes: body.len(),
        body_preview,
        mime: mime_str,
        charset,
        is_html,
    })
}

fn split_head(payload: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(pos) = find_subsequence(payload, b"\r\n\r\n") {
        return Some((&payload[..pos], &payload[pos + 4..]));
    }
    find_subsequence(payload, b"\n\n").map(|pos| (&payload[..pos], &payload[pos + 2..]))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn decode_chunked(body: &[u8], max: usize) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let line_end = find_subsequence(rest, b"\r\n")
            .ok_or_else(|| Error::MalformedHttp("chunk size line missing CRLF".to_string()))?;
        let size_str = std::str::from_utf8(&rest[..line_end])
            .map_err(|_| Error::MalformedHttp("chunk size not ASCII".to_string()))?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::MalformedHttp(format!("bad chunk size {:?}", size_str)))?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            break;
        }
        if rest.len() < size {
            return Err(Error::MalformedHttp("chunk shorter than declared".to_string()));
        }
        out.extend_from_slice(&rest[..size]);
        if out.len() > max {
            out.truncate(max);
            return Ok(out);
        }
        rest = &rest[size..];
        if rest.starts_with(b"\r\n") {
            rest = &rest[2..];
        }
    }
    Ok(out)
}

fn bounded_decompress<R: Read>(mut decoder: R, max: usize) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut limited = (&mut decoder).take(max as u64 + 1);
    limited
        .read_to_end(&mut out)
        .map_err(|e| Error::GzipError(e.to_string()))?;
    out.truncate(max);
    Ok(out)
}

fn decode_preview(body: &[u8], charset: Option<&str>, max_chars: usize) -> String {
    let text = match charset.and_then(|c| encoding_rs::Encoding::for_label(c.as_bytes())) {
        Some(enc) => enc.decode(body).0.into_owned(),
        None => String::from_utf8_lossy(body).into_owned(),
    };
    if text.chars().count() > max_chars {
        text.chars().take(max_chars).collect()
    } else {
        text
    }
}
