//! Pointer pipeline.
//!
//! Drives the write path for one or many collections:
//!
//! 1. every raw shard not yet `SORTED` is decoded, externally sorted and
//!    written as a Parquet pointer shard (rayon pool, `sort_workers` wide),
//! 2. every collection is (re)indexed into its per-collection DB
//!    (`index_workers` wide; unchanged shards skip via the DB registry),
//! 3. stale year DBs and the master catalog are rebuilt.
//!
//! All state lives in markers and DBs, so a crashed or cancelled run resumes
//! from the furthest committed stage.
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use log::{error, info, warn};
use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Error;
use crate::index::collection::{build_collection_index, CollectionIndexReport};
use crate::index::{aggregate_all, AggregateReport};
use crate::io::writer::{RowGroupPolicy, ShardWriter};
use crate::sort::ExternalSorter;
use crate::sources::{CdxShard, LineOutcome};

use super::super::pipeline::Pipeline;
use super::events::{EventLog, ProgressEvent, Stage};
use super::state::{list_input_collections, list_input_shards, ShardPlan, ShardState};

#[derive(Debug, Clone)]
pub struct ShardSortOutcome {
    pub shard: PathBuf,
    pub records: u64,
    pub malformed: u64,
    pub bytes_written: u64,
    pub skipped: bool,
}

#[derive(Debug)]
pub struct CollectionRunReport {
    pub collection: String,
    pub shards_total: usize,
    pub shards_sorted: usize,
    pub shards_skipped: usize,
    pub shards_failed: Vec<(PathBuf, String)>,
    pub records: u64,
    pub malformed: u64,
    pub index: Option<CollectionIndexReport>,
}

#[derive(Debug)]
pub struct PipelineReport {
    pub collections: Vec<CollectionRunReport>,
    pub aggregate: AggregateReport,
}

pub struct PointerPipeline {
    cfg: Config,
    input_root: PathBuf,
    collections: Vec<String>,
    force: bool,
    cancel: CancelToken,
    events: Arc<EventLog>,
}

impl PointerPipeline {
    pub fn new(
        cfg: Config,
        input_root: PathBuf,
        collections: Vec<String>,
        force: bool,
        cancel: CancelToken,
    ) -> Result<Self, Error> {
        let events = Arc::new(EventLog::open(cfg.duckdb_root.join("pipeline_events.jsonl"))?);
        Ok(Self {
            cfg,
            input_root,
            collections,
            force,
            cancel,
            events,
        })
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    fn snapshot_guard(&self) -> Result<(), Error> {
        let dataset = match (&self.cfg.snapshot_dataset, self.cfg.refuse_if_snapshots) {
            (Some(d), true) => d,
            _ => return Ok(()),
        };
        let count = snapshot_count(dataset);
        if count > 0 {
            return Err(Error::Custom(format!(
                "dataset {} has {} snapshots; in-place shard rewrites would pin freed blocks. \
                 Prune them or set refuse_if_snapshots=false.",
                dataset, count
            )));
        }
        Ok(())
    }

    fn run_collection_sort(&self, collection: &str) -> Result<CollectionRunReport, Error> {
        let shards = list_input_shards(&self.input_root, collection)?;
        let mut report = CollectionRunReport {
            collection: collection.to_string(),
            shards_total: shards.len(),
            shards_sorted: 0,
            shards_skipped: 0,
            shards_failed: Vec::new(),
            records: 0,
            malformed: 0,
            index: None,
        };

        let outcomes: Vec<(PathBuf, Result<ShardSortOutcome, Error>)> = shards
            .par_iter()
            .map(|gz| {
                let res = sort_one_shard(
                    &self.cfg,
                    collection,
                    gz,
                    self.force,
                    &self.cancel,
                    Some(&self.events),
                );
                (gz.clone(), res)
            })
            .collect();

        for (gz, res) in outcomes {
            match res {
                Ok(o) if o.skipped => report.shards_skipped += 1,
                Ok(o) => {
                    report.shards_sorted += 1;
                    report.records += o.records;
                    report.malformed += o.malformed;
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!("{:?}: {}", gz, e);
                    self.events.emit(
                        ProgressEvent::new(Stage::Failed, collection)
                            .shard(&gz)
                            .detail(e.to_string()),
                    );
                    report.shards_failed.push((gz, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

impl Pipeline<PipelineReport> for PointerPipeline {
    fn run(&self) -> Result<PipelineReport, Error> {
        self.snapshot_guard()?;

        let collections = if self.collections.is_empty() {
            list_input_collections(&self.input_root)?
        } else {
            self.collections.clone()
        };
        if collections.is_empty() {
            return Err(Error::Custom(format!(
                "no collections under {:?}",
                self.input_root
            )));
        }
        info!("pipeline over {} collections", collections.len());

        // Stage 1: sort. One pool, every shard of every collection.
        let sort_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.cfg.sort_workers.max(1))
            .build()
            .map_err(|e| Error::Custom(e.to_string()))?;
        let mut reports: Vec<CollectionRunReport> = sort_pool.install(|| {
            collections
                .iter()
                .map(|c| self.run_collection_sort(c))
                .collect::<Result<Vec<_>, _>>()
        })?;

        // Stage 2: index, collections in parallel (one writer per DB).
        let index_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.cfg.index_workers.max(1))
            .build()
            .map_err(|e| Error::Custom(e.to_string()))?;
        let index_results: Vec<Result<CollectionIndexReport, Error>> = index_pool.install(|| {
            reports
                .par_iter()
                .map(|r| {
                    self.events
                        .emit(ProgressEvent::new(Stage::Index, &r.collection));
                    build_collection_index(&self.cfg, &r.collection, self.force, &self.cancel)
                })
                .collect()
        });
        for (report, res) in reports.iter_mut().zip(index_results) {
            match res {
                Ok(ix) => {
                    self.events.emit(
                        ProgressEvent::new(Stage::Index, &report.collection)
                            .records(ix.slice_rows)
                            .detail(if ix.complete { "complete" } else { "partial" }),
                    );
                    report.index = Some(ix);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!("{}: index build failed: {}", report.collection, e);
                    self.events.emit(
                        ProgressEvent::new(Stage::Failed, &report.collection)
                            .detail(e.to_string()),
                    );
                }
            }
        }

        // Stage 3: aggregates.
        self.events.emit(ProgressEvent::new(Stage::Aggregate, "*"));
        let aggregate = aggregate_all(&self.cfg, &self.cancel)?;

        Ok(PipelineReport {
            collections: reports,
            aggregate,
        })
    }
}

/// Decode, sort and write one raw shard. Skips work the markers already
/// committed unless `force` is set.
pub fn sort_one_shard(
    cfg: &Config,
    collection: &str,
    gz_path: &std::path::Path,
    force: bool,
    cancel: &CancelToken,
    events: Option<&EventLog>,
) -> Result<ShardSortOutcome, Error> {
    let plan = ShardPlan::new(cfg, collection, gz_path)?;
    if plan.state() == ShardState::Sorted && !force {
        return Ok(ShardSortOutcome {
            shard: plan.parquet_path,
            records: 0,
            malformed: 0,
            bytes_written: 0,
            skipped: true,
        });
    }
    cancel.check()?;
    info!("sorting shard {:?}", gz_path);
    if let Some(ev) = events {
        ev.emit(ProgressEvent::new(Stage::Sort, collection).shard(gz_path));
    }

    // Isolated spill subdirectory per worker and shard.
    let worker = rayon::current_thread_index().unwrap_or(0);
    let shard_name = gz_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "shard".to_string());
    let spill = cfg
        .spill_dir()
        .join(format!("worker-{:02}", worker))
        .join(&shard_name);

    let gz_bytes = std::fs::metadata(gz_path)?.len();
    let sorter = ExternalSorter::new(spill, cfg.sort_memory_per_worker, cancel.clone());
    sorter.check_free_space(gz_bytes)?;

    let mut shard = CdxShard::from_path_gzip(gz_path, collection)?;
    let mut writer = ShardWriter::create(&plan.parquet_path, RowGroupPolicy::from_config(cfg))?;

    let input = shard.by_ref().filter_map(|res| match res {
        Ok(LineOutcome::Parsed(rec)) => Some(Ok(*rec)),
        Ok(LineOutcome::Skipped(_)) => None,
        Err(e) => Some(Err(e)),
    });

    let sorted = {
        let writer = &mut writer;
        sorter.sort_into(input, |rec| writer.write(rec))
    };
    let records = match sorted {
        Ok(n) => n,
        Err(e) => {
            writer.abort();
            return Err(e);
        }
    };
    let summary = writer.finish()?;
    let malformed = shard.malformed();
    if malformed > 0 {
        warn!("{:?}: {} malformed lines skipped", gz_path, malformed);
    }
    if let Some(ev) = events {
        ev.emit(
            ProgressEvent::new(Stage::Write, collection)
                .shard(&summary.path)
                .records(summary.rows)
                .bytes(summary.bytes_written),
        );
    }
    info!(
        "sorted {:?}: {} records, {} row groups, {} bytes ({} gz in, ratio {:.3})",
        summary.path,
        summary.rows,
        summary.row_groups,
        summary.bytes_written,
        gz_bytes,
        summary.bytes_written as f64 / gz_bytes.max(1) as f64
    );

    Ok(ShardSortOutcome {
        shard: summary.path,
        records,
        malformed,
        bytes_written: summary.bytes_written,
        skipped: false,
    })
}

fn snapshot_count(dataset: &str) -> usize {
    let out = Command::new("zfs")
        .args(["list", "-H", "-t", "snapshot", "-o", "name", "-r", dataset])
        .output();
    match out {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count(),
        // No zfs binary or no such dataset: nothing to refuse over.
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_gz_shard(path: &std::path::Path, lines: &[String]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let f = std::fs::File::create(path).unwrap();
        let mut enc = GzEncoder::new(f, Compression::default());
        for l in lines {
            enc.write_all(l.as_bytes()).unwrap();
            enc.write_all(b"\n").unwrap();
        }
        enc.finish().unwrap();
    }

    fn cdxj(surt: &str, url: &str, offset: u64) -> String {
        format!(
            r#"{} 20240722120000 {{"url": "{}", "status": "200", "mime": "text/html", "length": "100", "offset": "{}", "filename": "crawl-data/CC-MAIN-2024-30/a.warc.gz"}}"#,
            surt, url, offset
        )
    }

    #[test]
    fn sorts_one_shard_end_to_end() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
        let gz = dir.path().join("in/CC-MAIN-2024-30/cdx-00000.gz");
        write_gz_shard(
            &gz,
            &[
                cdxj("org,example,api)/", "https://api.example.org/", 300),
                cdxj("com,example)/b", "https://example.com/b", 200),
                "garbage { line".to_string(),
                cdxj("com,example)/a", "https://example.com/a", 100),
            ],
        );

        let out = sort_one_shard(
            &cfg,
            "CC-MAIN-2024-30",
            &gz,
            false,
            &CancelToken::new(),
            None,
        )
        .unwrap();
        assert!(!out.skipped);
        assert_eq!(out.records, 3);
        assert_eq!(out.malformed, 1);

        let reader = crate::io::reader::ShardReader::open(&out.shard).unwrap();
        let rows = reader.read_records(0).unwrap();
        let hosts: Vec<_> = rows.iter().map(|r| r.host_rev.as_str()).collect();
        assert_eq!(hosts, vec!["com,example", "com,example", "org,example,api"]);
        assert_eq!(rows[0].url.as_deref(), Some("https://example.com/a"));

        // Second run resumes from the marker.
        let again = sort_one_shard(
            &cfg,
            "CC-MAIN-2024-30",
            &gz,
            false,
            &CancelToken::new(),
            None,
        )
        .unwrap();
        assert!(again.skipped);
    }

    #[test]
    fn cancelled_sort_leaves_no_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
        let gz = dir.path().join("in/CC-MAIN-2024-30/cdx-00000.gz");
        write_gz_shard(&gz, &[cdxj("com,example)/a", "https://example.com/a", 100)]);

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = sort_one_shard(&cfg, "CC-MAIN-2024-30", &gz, false, &cancel, None).unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let plan = ShardPlan::new(&cfg, "CC-MAIN-2024-30", &gz).unwrap();
        assert!(!plan.parquet_path.exists());
        assert!(!plan.marker_path().exists());
        // Input untouched, spill cleaned.
        assert!(gz.exists());
        assert!(!cfg.spill_dir().join("worker-00").join("cdx-00000.gz").exists());
    }
}
