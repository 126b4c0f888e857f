/*!
# WARC record fetching

Turns a pointer `(warc_filename, warc_offset, warc_length)` into the decoded
archived HTTP response. Each pointer addresses one standalone gzip member of a
public WARC file, fetched either with a ranged GET or from a full-file disk
cache, then split into WARC headers and an HTTP envelope.
!*/
mod cache;
mod http;
mod warcfetch;

pub use cache::WarcCache;
pub use http::{parse_http_response, HttpEnvelope};
pub use warcfetch::{FetchOptions, FetchSource, FetchedRecord, WarcFetcher};
