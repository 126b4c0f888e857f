use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::sources::CaptureRecord;

const CANCEL_CHECK_EVERY: u64 = 4096;

/// External merge sorter for one shard.
///
/// `memory_budget` bounds the in-memory buffer (approximate record sizes);
/// `spill_dir` must be exclusive to this sorter and is deleted when the sorter
/// is done, one way or another.
pub struct ExternalSorter {
    spill_dir: PathBuf,
    memory_budget: u64,
    cancel: CancelToken,
}

impl ExternalSorter {
    pub fn new(spill_dir: PathBuf, memory_budget: u64, cancel: CancelToken) -> Self {
        Self {
            spill_dir,
            memory_budget,
            cancel,
        }
    }

    /// Refuse to start when the spill filesystem cannot hold the budget plus
    /// a copy of the shard.
    pub fn check_free_space(&self, shard_bytes: u64) -> Result<(), Error> {
        std::fs::create_dir_all(&self.spill_dir)?;
        let free = fs2::available_space(&self.spill_dir)?;
        let need = self.memory_budget.saturating_add(shard_bytes);
        if free < need {
            let _ = std::fs::remove_dir_all(&self.spill_dir);
            return Err(Error::SpillExhausted(self.spill_dir.clone()));
        }
        Ok(())
    }

    /// Sort `input` and hand each record, in key order, to `sink`.
    ///
    /// The error side of `input` aborts the sort (cleaning up spill files);
    /// this matches the decoder contract where only fatal shard conditions
    /// surface as errors.
    pub fn sort_into<I, F>(self, input: I, mut sink: F) -> Result<u64, Error>
    where
        I: Iterator<Item = Result<CaptureRecord, Error>>,
        F: FnMut(CaptureRecord) -> Result<(), Error>,
    {
        let result = self.run(input, &mut sink);
        let _ = std::fs::remove_dir_all(&self.spill_dir);
        result
    }

    fn run<I, F>(&self, input: I, sink: &mut F) -> Result<u64, Error>
    where
        I: Iterator<Item = Result<CaptureRecord, Error>>,
        F: FnMut(CaptureRecord) -> Result<(), Error>,
    {
        std::fs::create_dir_all(&self.spill_dir)?;

        let mut runs: Vec<PathBuf> = Vec::new();
        let mut buf: Vec<(CaptureRecord, u64)> = Vec::new();
        let mut buf_bytes: u64 = 0;
        let mut seq: u64 = 0;

        for rec in input {
            let rec = rec?;
            if seq % CANCEL_CHECK_EVERY == 0 {
                self.cancel.check()?;
            }
            buf_bytes += rec.approx_size() as u64;
            buf.push((rec, seq));
            seq += 1;

            if buf_bytes >= self.memory_budget {
                sort_buffer(&mut buf);
                runs.push(self.spill_run(runs.len(), &buf)?);
                buf.clear();
                buf_bytes = 0;
            }
        }
        self.cancel.check()?;

        let total = seq;
        if runs.is_empty() {
            // Everything fit in memory; no merge needed.
            sort_buffer(&mut buf);
            for (rec, _) in buf {
                sink(rec)?;
            }
            return Ok(total);
        }

        if !buf.is_empty() {
            sort_buffer(&mut buf);
            runs.push(self.spill_run(runs.len(), &buf)?);
            buf.clear();
        }

        debug!("merging {} spill runs ({} records)", runs.len(), total);
        self.merge_runs(&runs, sink)?;
        Ok(total)
    }

    fn spill_run(&self, index: usize, buf: &[(CaptureRecord, u64)]) -> Result<PathBuf, Error> {
        let path = self.spill_dir.join(format!("run-{:05}.jsonl", index));
        let write = || -> Result<(), Error> {
            let mut w = BufWriter::new(File::create(&path)?);
            for (rec, _) in buf {
                serde_json::to_writer(&mut w, rec)?;
                w.write_all(b"\n")?;
            }
            w.flush()?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!("spill to {:?} failed: {}", path, e);
            return Err(match e {
                Error::Io(_) => Error::SpillExhausted(self.spill_dir.clone()),
                other => other,
            });
        }
        Ok(path)
    }

    fn merge_runs<F>(&self, runs: &[PathBuf], sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(CaptureRecord) -> Result<(), Error>,
    {
        let mut readers: Vec<SortedRun> = runs
            .iter()
            .map(|p| SortedRun::open(p))
            .collect::<Result<_, _>>()?;

        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        for (run, reader) in readers.iter_mut().enumerate() {
            if let Some(rec) = reader.next_record()? {
                heap.push(HeapEntry { rec, run });
            }
        }

        let mut emitted: u64 = 0;
        while let Some(HeapEntry { rec, run }) = heap.pop() {
            if emitted % CANCEL_CHECK_EVERY == 0 {
                self.cancel.check()?;
            }
            sink(rec)?;
            emitted += 1;
            if let Some(next) = readers[run].next_record()? {
                heap.push(HeapEntry { rec: next, run });
            }
        }
        Ok(())
    }
}

fn sort_buffer(buf: &mut [(CaptureRecord, u64)]) {
    buf.sort_unstable_by(|(a, sa), (b, sb)| a.sort_key().cmp(&b.sort_key()).then(sa.cmp(sb)));
}

/// One spilled run, read back lazily line by line.
pub struct SortedRun {
    reader: BufReader<File>,
    line: String,
}

impl SortedRun {
    pub fn open(path: &Path) -> Result<Self, Error> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            line: String::new(),
        })
    }

    pub fn next_record(&mut self) -> Result<Option<CaptureRecord>, Error> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        let rec = serde_json::from_str(self.line.trim_end())?;
        Ok(Some(rec))
    }
}

/// Min-heap entry: `BinaryHeap` is a max-heap, so the ordering is reversed.
/// Run index breaks ties to keep merges deterministic.
struct HeapEntry {
    rec: CaptureRecord,
    run: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rec
            .sort_key()
            .cmp(&self.rec.sort_key())
            .then(other.run.cmp(&self.run))
    }
}
