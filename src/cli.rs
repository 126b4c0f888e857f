//! Command line arguments and parameters management/parsing.
use std::path::PathBuf;

use structopt::StructOpt;

use crate::config::Config;
use crate::error::Error;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "ccpointer",
    about = "Pointer-index pipeline and lookup engine for the Common Crawl corpus"
)]
pub enum CcPointer {
    #[structopt(about = "Convert+sort raw CDX shards of one collection")]
    Convert(Convert),
    #[structopt(about = "Run the full write pipeline (sort, index, aggregate)")]
    Pipeline(Pipeline),
    #[structopt(about = "Build per-collection pointer DBs")]
    Index(Index),
    #[structopt(about = "Rebuild stale year DBs and the master catalog")]
    Aggregate(Aggregate),
    #[structopt(about = "List collections known to the master catalog")]
    Collections(Collections),
    #[structopt(about = "Find WARC pointers for a domain")]
    Search(Search),
    #[structopt(about = "List the parquet shards a domain search would touch")]
    Shards(Shards),
    #[structopt(about = "Fetch and decode one WARC record by pointer")]
    Fetch(Fetch),
    #[structopt(about = "Check shard/index invariants for a collection")]
    Validate(Validate),
    #[structopt(about = "Sample pointers and verify ranged retrievability")]
    VerifyRetrieval(VerifyRetrieval),
    #[structopt(about = "Rewrite legacy shards missing provenance columns")]
    Repair(Repair),
    #[structopt(about = "Brave web search resolved to corpus pointers")]
    Websearch(Websearch),
}

/// Options shared by every subcommand: where the roots live.
#[derive(Debug, StructOpt)]
pub struct CommonOpts {
    #[structopt(long = "config", parse(from_os_str), help = "JSON config file")]
    pub config: Option<PathBuf>,
    #[structopt(long = "parquet-root", parse(from_os_str), help = "Root of columnar shards")]
    pub parquet_root: Option<PathBuf>,
    #[structopt(long = "duckdb-root", parse(from_os_str), help = "Root of index DBs")]
    pub duckdb_root: Option<PathBuf>,
}

impl CommonOpts {
    /// Merge the config file (if any) with CLI overrides.
    pub fn resolve(&self) -> Result<Config, Error> {
        let mut cfg = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => {
                let parquet_root = self.parquet_root.clone().ok_or_else(|| {
                    Error::Custom("--parquet-root (or --config) is required".to_string())
                })?;
                let duckdb_root = self.duckdb_root.clone().ok_or_else(|| {
                    Error::Custom("--duckdb-root (or --config) is required".to_string())
                })?;
                Config::new(parquet_root, duckdb_root)
            }
        };
        if let Some(p) = &self.parquet_root {
            cfg.parquet_root = p.clone();
        }
        if let Some(d) = &self.duckdb_root {
            cfg.duckdb_root = d.clone();
        }
        Ok(cfg)
    }
}

#[derive(Debug, StructOpt)]
pub struct Convert {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(parse(from_os_str), help = "Directory containing <collection>/cdx-*.gz")]
    pub input_root: PathBuf,
    #[structopt(help = "Collection name, e.g. CC-MAIN-2024-30")]
    pub collection: String,
    #[structopt(long, help = "Re-sort shards that already carry a .sorted marker")]
    pub force: bool,
}

#[derive(Debug, StructOpt)]
pub struct Pipeline {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(parse(from_os_str), help = "Directory containing <collection>/cdx-*.gz")]
    pub input_root: PathBuf,
    #[structopt(
        long = "collection",
        help = "Collections to process (default: every one under the input root)"
    )]
    pub collections: Vec<String>,
    #[structopt(long, help = "Redo work that markers say is already done")]
    pub force: bool,
}

#[derive(Debug, StructOpt)]
pub struct Index {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(help = "Collections to index")]
    pub collections: Vec<String>,
    #[structopt(long, help = "Reindex shards even when their signature is unchanged")]
    pub force: bool,
}

#[derive(Debug, StructOpt)]
pub struct Aggregate {
    #[structopt(flatten)]
    pub common: CommonOpts,
}

#[derive(Debug, StructOpt)]
pub struct Collections {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(long, help = "Only collections of this crawl year")]
    pub year: Option<i32>,
}

#[derive(Debug, StructOpt)]
pub struct Search {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(help = "Domain or URL, e.g. example.com")]
    pub domain: String,
    #[structopt(long = "max-matches", default_value = "200")]
    pub max_matches: usize,
    #[structopt(long, help = "Only collections of this crawl year")]
    pub year: Option<i32>,
    #[structopt(long = "strict-host", help = "Exclude subdomains")]
    pub strict_host: bool,
    #[structopt(long = "bare-domain", help = "Strip a leading www. from the query")]
    pub bare_domain: bool,
}

#[derive(Debug, StructOpt)]
pub struct Shards {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(help = "Collection name")]
    pub collection: String,
    #[structopt(help = "Domain or URL")]
    pub domain: String,
}

#[derive(Debug, StructOpt)]
pub struct Fetch {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(long = "warc-filename", help = "Corpus-relative WARC path")]
    pub warc_filename: String,
    #[structopt(long, help = "Byte offset of the record's gzip member")]
    pub offset: i64,
    #[structopt(long, help = "Byte length of the record's gzip member")]
    pub length: i64,
    #[structopt(long = "max-bytes", default_value = "2097152")]
    pub max_bytes: usize,
    #[structopt(long = "max-preview-chars", default_value = "40000")]
    pub max_preview_chars: usize,
}

#[derive(Debug, StructOpt)]
pub struct Validate {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(help = "Collection name")]
    pub collection: String,
    #[structopt(long = "csv", parse(from_os_str), help = "Write a per-shard CSV report")]
    pub csv: Option<PathBuf>,
}

#[derive(Debug, StructOpt)]
pub struct VerifyRetrieval {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(help = "Collection name")]
    pub collection: String,
    #[structopt(long, default_value = "10", help = "Pointers to sample")]
    pub samples: usize,
}

#[derive(Debug, StructOpt)]
pub struct Repair {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(help = "Collection name")]
    pub collection: String,
}

#[derive(Debug, StructOpt)]
pub struct Websearch {
    #[structopt(flatten)]
    pub common: CommonOpts,
    #[structopt(help = "Free-text query")]
    pub query: Option<String>,
    #[structopt(long, default_value = "10")]
    pub count: u32,
    #[structopt(long = "cache-stats", help = "Print search cache stats and exit")]
    pub cache_stats: bool,
    #[structopt(long = "cache-clear", help = "Clear the search cache and exit")]
    pub cache_clear: bool,
}
