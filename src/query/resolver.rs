//! Domain resolver.
//!
//! Traversal order is fixed: newest collection first, then shard relpath,
//! then row group, then row offset; within a slice, rows keep shard-sort
//! order. Only one row-group slice is materialized at a time, and a missing
//! shard or an unreadable row group degrades to a warning instead of failing
//! the whole search.
use std::path::Path;
use std::time::Instant;

use duckdb::{params, AccessMode, Connection};
use itertools::Itertools;
use log::warn;

use crate::config::Config;
use crate::error::Error;
use crate::hostrev;
use crate::index::master::{self, CollectionEntry};
use crate::index::layout;
use crate::io::reader::{ShardReader, POINTER_COLUMNS};
use crate::sources::CaptureRecord;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_matches: usize,
    pub year: Option<i32>,
    /// Match the host exactly, excluding subdomains.
    pub strict_host: bool,
    /// Strip a leading `www.` from the query before matching.
    pub bare_domain: bool,
    /// Columns to materialize; `None` means the pointer column set.
    pub columns: Option<Vec<String>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_matches: 200,
            year: None,
            strict_host: false,
            bare_domain: false,
            columns: None,
        }
    }
}

/// One slice row as returned by an index DB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRef {
    pub collection: String,
    pub shard_relpath: String,
    pub row_group: usize,
    pub row_start: usize,
    pub row_end: usize,
}

#[derive(Debug)]
pub struct SearchOutcome {
    pub domain: String,
    pub host_rev: String,
    pub collections_considered: usize,
    pub records: Vec<CaptureRecord>,
    pub truncated: bool,
    /// Shard relpaths that were indexed but absent on disk.
    pub missing_shards: Vec<String>,
    /// `(shard_relpath, row_group)` pairs that failed to read.
    pub quarantined: Vec<(String, usize)>,
    pub elapsed_ms: u128,
}

/// F.1: collections known to the master catalog.
pub fn list_collections(cfg: &Config, year: Option<i32>) -> Result<Vec<CollectionEntry>, Error> {
    master::list_collections(cfg, year)
}

/// F.2: all pointers for a domain (and, by default, its subdomains).
pub fn search_domain(
    cfg: &Config,
    domain: &str,
    opts: &SearchOptions,
) -> Result<SearchOutcome, Error> {
    let started = Instant::now();
    let normalized = hostrev::normalize_domain(domain, opts.bare_domain);
    let host_rev = hostrev::host_to_rev(&normalized);
    if host_rev.is_empty() {
        return Err(Error::Custom(format!("empty domain in query: {:?}", domain)));
    }

    let collections = master::list_collections(cfg, opts.year)?;
    let mut outcome = SearchOutcome {
        domain: normalized,
        host_rev: host_rev.clone(),
        collections_considered: collections.len(),
        records: Vec::new(),
        truncated: false,
        missing_shards: Vec::new(),
        quarantined: Vec::new(),
        elapsed_ms: 0,
    };

    let columns: Vec<&str> = match &opts.columns {
        Some(cols) => cols.iter().map(|s| s.as_str()).collect(),
        None => POINTER_COLUMNS.to_vec(),
    };

    'collections: for entry in &collections {
        if !entry.db_path.exists() {
            warn!("{}: per-collection DB missing at {:?}", entry.collection, entry.db_path);
            continue;
        }
        let slices = match slices_for_host(&entry.db_path, &entry.collection, &host_rev, opts.strict_host) {
            Ok(s) => s,
            Err(e) => {
                warn!("{}: slice query failed: {}", entry.collection, e);
                continue;
            }
        };

        // One reader per shard; slices of a shard arrive grouped and ordered.
        for (relpath, shard_slices) in &slices.into_iter().group_by(|s| s.shard_relpath.clone()) {
            let abspath = layout::shard_abspath(cfg, &relpath);
            if !abspath.exists() {
                warn!("indexed shard missing on disk: {:?}", abspath);
                outcome.missing_shards.push(relpath.clone());
                continue;
            }
            let reader = match ShardReader::open(&abspath) {
                Ok(r) => r,
                Err(e) => {
                    warn!("{:?}: open failed: {}", abspath, e);
                    outcome.missing_shards.push(relpath.clone());
                    continue;
                }
            };
            for slice in shard_slices {
                let remaining = opts.max_matches.saturating_sub(outcome.records.len());
                if remaining == 0 {
                    outcome.truncated = true;
                    break 'collections;
                }
                let rows = match reader.read_slice(
                    slice.row_group,
                    slice.row_start,
                    slice.row_end,
                    Some(&columns),
                ) {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(
                            "{:?} row group {}: read failed, quarantining: {}",
                            abspath, slice.row_group, e
                        );
                        outcome.quarantined.push((relpath.clone(), slice.row_group));
                        continue;
                    }
                };
                if rows.len() > remaining {
                    outcome.records.extend(rows.into_iter().take(remaining));
                    outcome.truncated = true;
                    break 'collections;
                }
                outcome.records.extend(rows);
            }
        }
    }

    outcome.elapsed_ms = started.elapsed().as_millis();
    Ok(outcome)
}

/// F.3: distinct shard relpaths a domain search would touch, without reading
/// them.
pub fn shards_for_domain(
    cfg: &Config,
    collection: &str,
    domain: &str,
) -> Result<Vec<String>, Error> {
    let normalized = hostrev::normalize_domain(domain, false);
    let host_rev = hostrev::host_to_rev(&normalized);
    let db_path = layout::collection_db_path(cfg, collection);
    if !db_path.exists() {
        return Err(Error::Custom(format!(
            "no index DB for collection {}",
            collection
        )));
    }
    let conn = open_read_only(&db_path)?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT shard_relpath FROM cc_domain_shards
         WHERE host_rev = ? OR host_rev LIKE ?
         ORDER BY shard_relpath",
    )?;
    let rows = stmt
        .query_map(
            params![host_rev, hostrev::subdomain_like_pattern(&host_rev)],
            |row| row.get::<_, String>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn open_read_only(path: &Path) -> Result<Connection, Error> {
    let config = duckdb::Config::default().access_mode(AccessMode::ReadOnly)?;
    Ok(Connection::open_with_flags(path, config)?)
}

fn slices_for_host(
    db_path: &Path,
    collection: &str,
    host_rev: &str,
    strict: bool,
) -> Result<Vec<SliceRef>, Error> {
    let conn = open_read_only(db_path)?;
    let sql_strict = "SELECT shard_relpath, row_group, row_start, row_end
                      FROM cc_domain_shards WHERE host_rev = ?
                      ORDER BY shard_relpath, row_group, row_start";
    let sql_prefix = "SELECT shard_relpath, row_group, row_start, row_end
                      FROM cc_domain_shards
                      WHERE host_rev = ? OR host_rev LIKE ?
                      ORDER BY shard_relpath, row_group, row_start";

    let map = |row: &duckdb::Row<'_>| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    };
    let raw: Vec<(String, i64, i64, i64)> = if strict {
        let mut stmt = conn.prepare(sql_strict)?;
        let rows = stmt.query_map(params![host_rev], map)?;
        rows.collect::<Result<Vec<_>, _>>()?
    } else {
        let mut stmt = conn.prepare(sql_prefix)?;
        let rows = stmt.query_map(
            params![host_rev, hostrev::subdomain_like_pattern(host_rev)],
            map,
        )?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    Ok(raw
        .into_iter()
        .map(|(relpath, rg, start, end)| SliceRef {
            collection: collection.to_string(),
            shard_relpath: relpath,
            row_group: rg as usize,
            row_start: start as usize,
            row_end: end as usize,
        })
        .collect())
}
