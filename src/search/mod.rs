/*!
# Web search bridge

Brave Search API client with an on-disk result cache, plus resolution of
result URLs back into corpus pointers through the query planner.
!*/
mod brave;
mod cache;

pub use brave::{BraveSearch, SearchParams, WebHit};
pub use cache::{CacheStats, SearchCache};
