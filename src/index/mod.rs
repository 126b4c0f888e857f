/*!
# Pointer index hierarchy

Three DuckDB tiers over the Parquet shards:

- per-collection DBs (`cc_domain_shards`): one slice row per contiguous
  `host_rev` run inside a row group,
- per-year DBs (`cc_domain_rowgroups`): union of a year's collections,
- the master catalog (`collections`): discovery entry point for resolvers.

Builders write to temporary DB files and swap them in with a rename, so
readers never observe a half-built index.
!*/
pub mod collection;
pub mod layout;
pub mod master;
pub mod year;

use log::info;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Error;

/// Outcome of one `aggregate` pass.
#[derive(Debug, Default)]
pub struct AggregateReport {
    pub years_rebuilt: Vec<i32>,
    pub years_skipped: Vec<i32>,
    pub collections_registered: usize,
}

/// Rebuild stale per-year DBs, then refresh the master catalog.
///
/// A year is stale when its DB is missing or any of its per-collection DBs
/// changed since the master last recorded them.
pub fn aggregate_all(cfg: &Config, cancel: &CancelToken) -> Result<AggregateReport, Error> {
    let mut report = AggregateReport::default();

    let mut years: Vec<i32> = layout::list_collection_dbs(cfg)?
        .iter()
        .filter_map(|(collection, _)| layout::collection_year(collection))
        .collect();
    years.sort_unstable();
    years.dedup();

    let drifted = master::drifted_collections(cfg)?;
    for year in years {
        cancel.check()?;
        let stale = !layout::year_db_path(cfg, year).exists()
            || drifted
                .iter()
                .any(|c| layout::collection_year(c) == Some(year));
        if stale {
            year::build_year_index(cfg, year, cancel)?;
            report.years_rebuilt.push(year);
        } else {
            report.years_skipped.push(year);
        }
    }

    report.collections_registered = master::build_master_index(cfg, cancel)?;
    info!(
        "aggregate: {} years rebuilt, {} skipped, {} collections in master",
        report.years_rebuilt.len(),
        report.years_skipped.len(),
        report.collections_registered
    );
    Ok(report)
}
