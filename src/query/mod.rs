/*!
# Query planning

Domain → `host_rev` → candidate collections (master) → slice rows
(per-collection DBs) → bounded Parquet slice reads.
!*/
mod resolver;

pub use resolver::{SearchOptions, SearchOutcome, SliceRef};
pub use resolver::{list_collections, search_domain, shards_for_domain};
