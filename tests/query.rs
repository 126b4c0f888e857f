//! Read-path tests across multiple collections and years.
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use ccpointer::cancel::CancelToken;
use ccpointer::config::Config;
use ccpointer::index::{self, collection::build_collection_index};
use ccpointer::pipelines::pointers::sort_one_shard;
use ccpointer::query::{self, SearchOptions};

fn cdxj_line(surt: &str, url: &str, ts: &str, offset: u64) -> String {
    format!(
        r#"{} {} {{"url": "{}", "status": "200", "length": "50", "offset": "{}", "filename": "crawl-data/w.warc.gz"}}"#,
        surt, ts, url, offset
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

fn fixture_with_two_years() -> Fixture {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = Config::new(dir.path().join("parquet"), dir.path().join("duckdb"));
    let input_root = dir.path().join("ccindex");
    let cancel = CancelToken::new();

    let collections = [
        (
            "CC-MAIN-2023-40",
            vec![cdxj_line("com,example)/old", "https://example.com/old", "20231001000000", 10)],
        ),
        (
            "CC-MAIN-2024-30",
            vec![
                cdxj_line("com,example)/new", "https://example.com/new", "20240722000000", 20),
                cdxj_line("com,example,www)/", "https://www.example.com/", "20240722000000", 30),
            ],
        ),
    ];
    for (collection, lines) in &collections {
        let gz = input_root.join(collection).join("cdx-00000.gz");
        write_gz_shard(&gz, lines);
        sort_one_shard(&cfg, collection, &gz, false, &cancel, None).unwrap();
        build_collection_index(&cfg, collection, false, &cancel).unwrap();
    }
    index::aggregate_all(&cfg, &cancel).unwrap();

    Fixture {
        cfg,
        input_root,
        _dir: dir,
    }
}

#[test]
fn master_lists_collections_newest_first() {
    let fx = fixture_with_two_years();
    let all = query::list_collections(&fx.cfg, None).unwrap();
    let names: Vec<_> = all.iter().map(|e| e.collection.as_str()).collect();
    assert_eq!(names, vec!["CC-MAIN-2024-30", "CC-MAIN-2023-40"]);

    let only_2023 = query::list_collections(&fx.cfg, Some(2023)).unwrap();
    assert_eq!(only_2023.len(), 1);
    assert_eq!(only_2023[0].year, 2023);
}

#[test]
fn search_traverses_newest_collection_first() {
    let fx = fixture_with_two_years();
    let outcome = query::search_domain(&fx.cfg, "example.com", &SearchOptions::default()).unwrap();
    let urls: Vec<_> = outcome
        .records
        .iter()
        .map(|r| r.url.clone().unwrap())
        .collect();
    assert_eq!(
        urls,
        vec![
            "https://example.com/new",
            "https://www.example.com/",
            "https://example.com/old",
        ]
    );
    assert_eq!(outcome.collections_considered, 2);
}

#[test]
fn year_filter_restricts_collections() {
    let fx = fixture_with_two_years();
    let opts = SearchOptions {
        year: Some(2023),
        ..SearchOptions::default()
    };
    let outcome = query::search_domain(&fx.cfg, "example.com", &opts).unwrap();
    let urls: Vec<_> = outcome
        .records
        .iter()
        .map(|r| r.url.clone().unwrap())
        .collect();
    assert_eq!(urls, vec!["https://example.com/old"]);
}

#[test]
fn max_matches_truncates_and_flags() {
    let fx = fixture_with_two_years();
    let opts = SearchOptions {
        max_matches: 2,
        ..SearchOptions::default()
    };
    let outcome = query::search_domain(&fx.cfg, "example.com", &opts).unwrap();
    assert_eq!(outcome.records.len(), 2);
    assert!(outcome.truncated);
}

#[test]
fn shards_helper_names_files_without_reading_rows() {
    let fx = fixture_with_two_years();
    let relpaths =
        query::shards_for_domain(&fx.cfg, "CC-MAIN-2024-30", "example.com").unwrap();
    assert_eq!(relpaths.len(), 1);
    assert!(relpaths[0].ends_with("cdx-00000.gz.parquet"));
    assert!(fx.input_root.exists());

    let none = query::shards_for_domain(&fx.cfg, "CC-MAIN-2024-30", "unknown.test").unwrap();
    assert!(none.is_empty());
}

#[test]
fn unknown_domain_is_empty_not_error() {
    let fx = fixture_with_two_years();
    let outcome =
        query::search_domain(&fx.cfg, "never-crawled.example", &SearchOptions::default()).unwrap();
    assert!(outcome.records.is_empty());
    assert!(!outcome.truncated);
}
