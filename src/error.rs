//! Crate-wide error type.
//!
//! Local failures (one CDX line, one shard) are contained by the stages that
//! observe them; the variants here are the ones that cross stage boundaries.
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Parquet(parquet::errors::ParquetError),
    DuckDb(duckdb::Error),
    Reqwest(reqwest::Error),
    Serde(serde_json::Error),
    Csv(csv::Error),

    /// Gzip stream unreadable before the first record of a shard.
    SourceUnreadable(PathBuf),
    /// Spill directory filled while sorting; temporaries are already removed.
    SpillExhausted(PathBuf),
    /// A shard violates the (host_rev, url, timestamp) ordering contract.
    SortOrderViolated { shard: PathBuf, detail: String },
    /// A legacy shard lacks required columns and must be repaired.
    MissingColumn { shard: PathBuf, column: &'static str },
    /// A per-collection DB changed after its year/master aggregate was built.
    IndexDrift { collection: String },

    /// HTTP 404 from the WARC origin.
    NotFound(String),
    /// HTTP 416 from the WARC origin.
    RangeNotSatisfiable(String),
    /// Transport failure after the retry budget is exhausted.
    NetworkError(String),
    GzipError(String),
    MalformedWarc(String),
    MalformedHttp(String),

    UpstreamSearchUnavailable(String),

    Cancelled,
    Custom(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(e: parquet::errors::ParquetError) -> Error {
        Error::Parquet(e)
    }
}

impl From<duckdb::Error> for Error {
    fn from(e: duckdb::Error) -> Error {
        Error::DuckDb(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Error {
        Error::Reqwest(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Serde(e)
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Error {
        Error::Csv(e)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error::Custom(s)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}
