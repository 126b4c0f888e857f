//! End-to-end write-path tests: raw gz shard → sorted parquet → index DBs →
//! domain search.
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use ccpointer::cancel::CancelToken;
use ccpointer::config::Config;
use ccpointer::index::{self, collection::build_collection_index, layout};
use ccpointer::io::reader::ShardReader;
use ccpointer::pipelines::pointers::sort_one_shard;
use ccpointer::query::{self, SearchOptions};

fn cdxj_line(surt: &str, url: &str, offset: u64) -> String {
    format!(
        r#"{} 20240722120000 {{"url": "{}", "status": "200", "mime": "text/html", "digest": "AAAABBBB", "length": "100", "offset": "{}", "filename": "crawl-data/CC-MAIN-2024-30/segments/x/warc/y.warc.gz"}}"#,
        surt, url, offset
    )
}

fn write_gz_shard(path: &Path, lines: &[String]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let f = std::fs::File::create(path).unwrap();
    let mut enc = GzEncoder::new(f, Compression::default());
    for l in lines {
        enc.write_all(l.as_bytes()).unwrap();
        enc.write_all(b"\n").unwrap();
    }
    enc.finish().unwrap();
}

struct Fixture {
    _dir: tempfile::TempDir,
    cfg: Config,
    input_root: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
    let input_root = dir.path().join("ccindex");
    Fixture {
        cfg,
        input_root,
        _dir: dir,
    }
}

fn run_write_path(fx: &Fixture, collection: &str, lines: &[String]) {
    let gz = fx.input_root.join(collection).join("cdx-00000.gz");
    write_gz_shard(&gz, lines);
    let cancel = CancelToken::new();
    sort_one_shard(&fx.cfg, collection, &gz, false, &cancel, None).unwrap();
    build_collection_index(&fx.cfg, collection, false, &cancel).unwrap();
    index::aggregate_all(&fx.cfg, &cancel).unwrap();
}

#[test]
fn tiny_crawl_sorts_and_resolves() {
    let fx = fixture();
    // Deliberately out of order on input.
    run_write_path(
        &fx,
        "CC-MAIN-2024-30",
        &[
            cdxj_line("com,example,www)/a", "https://www.example.com/a", 300),
            cdxj_line("com,example)/a", "https://example.com/a", 100),
            cdxj_line("org,example,api)/", "https://api.example.org/", 400),
            cdxj_line("com,example)/b", "https://example.com/b", 200),
        ],
    );

    // Shard row order follows (host_rev, url, timestamp).
    let shard =
        layout::shard_parquet_path(&fx.cfg, "CC-MAIN-2024-30", "cdx-00000.gz").unwrap();
    let reader = ShardReader::open(&shard).unwrap();
    let urls: Vec<String> = (0..reader.num_row_groups())
        .flat_map(|rg| reader.read_records(rg).unwrap())
        .map(|r| r.url.unwrap())
        .collect();
    assert_eq!(
        urls,
        vec![
            "https://example.com/a",
            "https://example.com/b",
            "https://www.example.com/a",
            "https://api.example.org/",
        ]
    );

    // Subdomain semantics: example.com covers www, not example.org.
    let outcome = query::search_domain(&fx.cfg, "example.com", &SearchOptions::default()).unwrap();
    assert_eq!(outcome.host_rev, "com,example");
    let got: Vec<_> = outcome
        .records
        .iter()
        .map(|r| r.url.clone().unwrap())
        .collect();
    assert_eq!(
        got,
        vec![
            "https://example.com/a",
            "https://example.com/b",
            "https://www.example.com/a",
        ]
    );
    assert!(!outcome.truncated);

    // Strict host mode drops the subdomain row.
    let strict = SearchOptions {
        strict_host: true,
        ..SearchOptions::default()
    };
    let outcome = query::search_domain(&fx.cfg, "example.com", &strict).unwrap();
    let got: Vec<_> = outcome
        .records
        .iter()
        .map(|r| r.url.clone().unwrap())
        .collect();
    assert_eq!(got, vec!["https://example.com/a", "https://example.com/b"]);
}

#[test]
fn malformed_line_is_counted_not_fatal() {
    let fx = fixture();
    let gz = fx.input_root.join("CC-MAIN-2024-30").join("cdx-00000.gz");
    write_gz_shard(
        &gz,
        &[
            cdxj_line("com,a)/", "https://a.com/", 1),
            "com,broken)/ 20240101000000 {\"url\": \"https://broken.example/\"".to_string(),
            cdxj_line("com,b)/", "https://b.com/", 2),
        ],
    );
    let out = sort_one_shard(
        &fx.cfg,
        "CC-MAIN-2024-30",
        &gz,
        false,
        &CancelToken::new(),
        None,
    )
    .unwrap();
    assert_eq!(out.records, 2);
    assert_eq!(out.malformed, 1);

    let reader = ShardReader::open(&out.shard).unwrap();
    ccpointer::index::collection::scan_shard_slices(&reader).unwrap();
}

#[test]
fn subdomain_fanout_excludes_sibling_domains() {
    let fx = fixture();
    run_write_path(
        &fx,
        "CC-MAIN-2024-30",
        &[
            cdxj_line("gov,ca)/", "https://ca.gov/", 1),
            cdxj_line("gov,ca,dmv)/", "https://dmv.ca.gov/", 2),
            cdxj_line("gov,california)/", "https://california.gov/", 3),
        ],
    );

    let outcome = query::search_domain(&fx.cfg, "ca.gov", &SearchOptions::default()).unwrap();
    let got: Vec<_> = outcome
        .records
        .iter()
        .map(|r| r.url.clone().unwrap())
        .collect();
    assert_eq!(got, vec!["https://ca.gov/", "https://dmv.ca.gov/"]);
}

#[test]
fn pipeline_is_resumable_and_idempotent() {
    let fx = fixture();
    let lines = vec![
        cdxj_line("com,example)/a", "https://example.com/a", 100),
        cdxj_line("com,example)/b", "https://example.com/b", 200),
    ];
    run_write_path(&fx, "CC-MAIN-2024-30", &lines);

    let outcome1 =
        query::search_domain(&fx.cfg, "example.com", &SearchOptions::default()).unwrap();

    // Run the whole write path again: sorted marker short-circuits the sort,
    // signatures short-circuit the index, and results are unchanged.
    let gz = fx.input_root.join("CC-MAIN-2024-30").join("cdx-00000.gz");
    let cancel = CancelToken::new();
    let again = sort_one_shard(&fx.cfg, "CC-MAIN-2024-30", &gz, false, &cancel, None).unwrap();
    assert!(again.skipped);
    let report = build_collection_index(&fx.cfg, "CC-MAIN-2024-30", false, &cancel).unwrap();
    assert_eq!(report.shards_indexed, 0);
    assert_eq!(report.shards_skipped, 1);
    index::aggregate_all(&fx.cfg, &cancel).unwrap();

    let outcome2 =
        query::search_domain(&fx.cfg, "example.com", &SearchOptions::default()).unwrap();
    assert_eq!(outcome1.records, outcome2.records);
}
