use log::LevelFilter;
use structopt::StructOpt;

use ccpointer::cancel::CancelToken;
use ccpointer::cli::CcPointer;
use ccpointer::error::Error;
use ccpointer::fetch::{FetchOptions, WarcFetcher};
use ccpointer::pipelines::{Pipeline, PointerPipeline};
use ccpointer::pipelines::pointers::sort_one_shard;
use ccpointer::pipelines::pointers::state::list_input_shards;
use ccpointer::processing;
use ccpointer::query::{self, SearchOptions};
use ccpointer::search::{BraveSearch, SearchParams};
use ccpointer::index;
use ccpointer::sources::Pointer;

fn main() -> Result<(), Error> {
    // default log level is info
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_env("RUST_LOG");
    builder.init();

    let opt = CcPointer::from_args();
    log::debug!("cli args\n{:#?}", opt);
    let cancel = CancelToken::new();

    match opt {
        CcPointer::Convert(c) => {
            let cfg = c.common.resolve()?;
            let shards = list_input_shards(&c.input_root, &c.collection)?;
            if shards.is_empty() {
                return Err(Error::Custom(format!(
                    "no cdx-*.gz shards for {} under {:?}",
                    c.collection, c.input_root
                )));
            }
            let mut sorted = 0u64;
            let mut skipped = 0u64;
            for gz in &shards {
                let out = sort_one_shard(&cfg, &c.collection, gz, c.force, &cancel, None)?;
                if out.skipped {
                    skipped += 1;
                } else {
                    sorted += 1;
                }
            }
            println!("done sorted={} skipped={}", sorted, skipped);
        }

        CcPointer::Pipeline(p) => {
            let cfg = p.common.resolve()?;
            let pipeline =
                PointerPipeline::new(cfg, p.input_root, p.collections, p.force, cancel)?;
            let report = pipeline.run()?;
            for c in &report.collections {
                println!(
                    "{}: shards={} sorted={} skipped={} failed={} records={} malformed={}",
                    c.collection,
                    c.shards_total,
                    c.shards_sorted,
                    c.shards_skipped,
                    c.shards_failed.len(),
                    c.records,
                    c.malformed
                );
            }
            println!(
                "aggregate: years_rebuilt={:?} collections={}",
                report.aggregate.years_rebuilt, report.aggregate.collections_registered
            );
        }

        CcPointer::Index(i) => {
            let cfg = i.common.resolve()?;
            for collection in &i.collections {
                let report =
                    index::collection::build_collection_index(&cfg, collection, i.force, &cancel)?;
                println!(
                    "{}: indexed={} skipped={} failed={} slice_rows={} complete={}",
                    collection,
                    report.shards_indexed,
                    report.shards_skipped,
                    report.shards_failed.len(),
                    report.slice_rows,
                    report.complete
                );
            }
        }

        CcPointer::Aggregate(a) => {
            let cfg = a.common.resolve()?;
            let report = index::aggregate_all(&cfg, &cancel)?;
            println!(
                "years_rebuilt={:?} years_skipped={:?} collections={}",
                report.years_rebuilt, report.years_skipped, report.collections_registered
            );
        }

        CcPointer::Collections(c) => {
            let cfg = c.common.resolve()?;
            for entry in query::list_collections(&cfg, c.year)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.collection,
                    entry.year,
                    entry.rows,
                    entry.db_path.display()
                );
            }
        }

        CcPointer::Search(s) => {
            let cfg = s.common.resolve()?;
            let opts = SearchOptions {
                max_matches: s.max_matches,
                year: s.year,
                strict_host: s.strict_host,
                bare_domain: s.bare_domain,
                columns: None,
            };
            let outcome = query::search_domain(&cfg, &s.domain, &opts)?;
            for rec in &outcome.records {
                println!("{}", serde_json::to_string(rec)?);
            }
            eprintln!(
                "domain={} host_rev={} collections={} emitted={} truncated={} elapsed_ms={}",
                outcome.domain,
                outcome.host_rev,
                outcome.collections_considered,
                outcome.records.len(),
                outcome.truncated,
                outcome.elapsed_ms
            );
        }

        CcPointer::Shards(s) => {
            let cfg = s.common.resolve()?;
            for relpath in query::shards_for_domain(&cfg, &s.collection, &s.domain)? {
                let abspath = cfg.parquet_root.join(&relpath);
                let (exists, bytes) = match std::fs::metadata(&abspath) {
                    Ok(md) => ("yes", md.len()),
                    Err(_) => ("NO", 0),
                };
                println!("{}\texists={}\tbytes={}", relpath, exists, bytes);
            }
        }

        CcPointer::Fetch(f) => {
            let cfg = f.common.resolve()?;
            let fetcher = WarcFetcher::new(&cfg)?;
            let ptr = Pointer {
                warc_filename: f.warc_filename.clone(),
                warc_offset: f.offset,
                warc_length: f.length,
            };
            let opts = FetchOptions {
                max_bytes: f.max_bytes,
                max_preview_chars: f.max_preview_chars,
                include_raw: false,
            };
            let rec = fetcher.fetch(&ptr, &opts)?;
            let out = serde_json::json!({
                "url": rec.url,
                "bytes_requested": rec.bytes_requested,
                "bytes_returned": rec.bytes_returned,
                "sha256": rec.sha256,
                "warc_type": rec.warc_type,
                "warc_headers": rec.warc_headers,
                "http": rec.http,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        CcPointer::Validate(v) => {
            let cfg = v.common.resolve()?;
            let report = processing::check_collection(&cfg, &v.collection)?;
            for check in &report.checks {
                println!("{:?}\t{}\t{}", check.status, check.shard, check.detail);
            }
            if let Some(csv) = &v.csv {
                report.write_csv(csv)?;
            }
            if !report.ok() {
                return Err(Error::Custom(format!(
                    "{}: invariant checks failed",
                    v.collection
                )));
            }
        }

        CcPointer::VerifyRetrieval(v) => {
            let cfg = v.common.resolve()?;
            let report = processing::verify_retrieval(&cfg, &v.collection, v.samples)?;
            for s in &report.samples {
                println!(
                    "{} {} offset={} length={} {}",
                    if s.ok { "OK" } else { "FAIL" },
                    s.pointer.warc_filename,
                    s.pointer.warc_offset,
                    s.pointer.warc_length,
                    s.detail
                );
            }
            eprintln!("checked={} ok={}", report.sampled, report.ok);
        }

        CcPointer::Repair(r) => {
            let cfg = r.common.resolve()?;
            let repaired = processing::repair_collection(&cfg, &r.collection)?;
            println!("{}: {} shards repaired", r.collection, repaired);
        }

        CcPointer::Websearch(w) => {
            let cfg = w.common.resolve()?;
            let search = BraveSearch::from_env(&cfg)?;
            if w.cache_stats {
                match search.cache() {
                    Some(cache) => {
                        let stats = cache.stats();
                        println!(
                            "path={} entries={} bytes={}",
                            stats.path.display(),
                            stats.entries,
                            stats.bytes
                        );
                    }
                    None => println!("cache disabled"),
                }
                return Ok(());
            }
            if w.cache_clear {
                if let Some(cache) = search.cache() {
                    cache.clear()?;
                }
                println!("cache cleared");
                return Ok(());
            }
            let query_text = w.query.ok_or_else(|| {
                Error::Custom("a query is required unless --cache-stats/--cache-clear".to_string())
            })?;
            let mut params = SearchParams::new(&query_text);
            params.count = w.count;
            for hit in search.search_with_pointers(&cfg, &params)? {
                println!("{}", serde_json::to_string(&hit)?);
            }
        }
    };
    Ok(())
}
