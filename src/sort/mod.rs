/*!
# External sorting

Bounded-memory sort of capture records by `(host_rev, url, timestamp)`.

Records are buffered up to the memory budget, sorted in place and spilled as
JSON-line runs into a spill directory owned exclusively by this sorter. When
the input is exhausted the runs are merged with a min-heap and streamed to the
caller in key order. Ties inside a run keep input order (the buffer sort is
keyed on `(key, seq)`), and the merge breaks equal keys by run index, so output
is deterministic for a given input.

The spill directory is removed on success, failure and cancellation alike.
!*/
mod sorter;

pub use sorter::{ExternalSorter, SortedRun};
