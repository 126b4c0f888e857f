//! Progress event log.
//!
//! A single-writer, append-only JSONL file. Consumers (HUDs, watchers) tail
//! it by byte offset; nothing in-process subscribes, so there is no registry
//! or callback state to keep consistent.
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Sort,
    Write,
    Index,
    Aggregate,
    Validate,
    Repair,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub at: String,
    pub stage: Stage,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, collection: &str) -> Self {
        Self {
            at: Utc::now().to_rfc3339(),
            stage,
            collection: collection.to_string(),
            shard: None,
            records: None,
            bytes: None,
            detail: None,
        }
    }

    pub fn shard(mut self, shard: &Path) -> Self {
        self.shard = shard
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        self
    }

    pub fn records(mut self, n: u64) -> Self {
        self.records = Some(n);
        self
    }

    pub fn bytes(mut self, n: u64) -> Self {
        self.bytes = Some(n);
        self
    }

    pub fn detail(mut self, d: impl Into<String>) -> Self {
        self.detail = Some(d.into());
        self
    }
}

pub struct EventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Emission failures are logged, never propagated; a
    /// broken HUD must not kill the pipeline.
    pub fn emit(&self, event: ProgressEvent) {
        let write = || -> Result<(), Error> {
            let mut file = self
                .file
                .lock()
                .map_err(|_| Error::Custom("event log mutex poisoned".to_string()))?;
            serde_json::to_writer(&mut *file, &event)?;
            file.write_all(b"\n")?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!("could not append progress event: {}", e);
        }
    }

    /// Read events from `offset`, returning them plus the next offset to
    /// resume from.
    pub fn tail(path: &Path, offset: u64) -> Result<(Vec<ProgressEvent>, u64), Error> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut consumed = offset;
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            // A partially written trailing line is left for the next tail.
            if !line.ends_with('\n') {
                break;
            }
            match serde_json::from_str::<ProgressEvent>(line.trim_end()) {
                Ok(ev) => events.push(ev),
                Err(e) => warn!("skipping unparseable event line: {}", e),
            }
            consumed += n as u64;
        }
        Ok((events, consumed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_and_tails_by_offset() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::open(&path).unwrap();

        log.emit(ProgressEvent::new(Stage::Sort, "CC-MAIN-2024-30").records(10));
        log.emit(ProgressEvent::new(Stage::Index, "CC-MAIN-2024-30"));

        let (events, offset) = EventLog::tail(&path, 0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stage, Stage::Sort);
        assert_eq!(events[0].records, Some(10));

        // Nothing new: tail from the returned offset is empty.
        let (rest, offset2) = EventLog::tail(&path, offset).unwrap();
        assert!(rest.is_empty());
        assert_eq!(offset, offset2);

        log.emit(ProgressEvent::new(Stage::Aggregate, "CC-MAIN-2024-30"));
        let (more, _) = EventLog::tail(&path, offset).unwrap();
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].stage, Stage::Aggregate);
    }
}
