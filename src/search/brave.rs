//! Brave Search API client.
//!
//! Thin bridge from a free-text query to corpus pointers: call the API (or
//! the disk cache), then resolve each result URL's bare domain through the
//! query planner and attach the newest matching pointer.
use std::time::Duration;

use log::{debug, warn};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::Error;
use crate::query::{self, SearchOptions};
use crate::sources::CaptureRecord;

use super::cache::SearchCache;

const ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const TOKEN_ENV: &str = "BRAVE_SEARCH_API_KEY";
const CACHE_PATH_ENV: &str = "BRAVE_SEARCH_CACHE_PATH";
const CACHE_DISABLE_ENV: &str = "BRAVE_SEARCH_CACHE_DISABLE";
/// Pointers per result URL to inspect when picking the newest capture.
const POINTER_PROBE: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    pub count: u32,
    pub offset: u32,
    pub country: String,
    pub safesearch: String,
}

impl SearchParams {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            count: 10,
            offset: 0,
            country: "us".to_string(),
            safesearch: "moderate".to_string(),
        }
    }

    fn cache_key(&self) -> String {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(serialized.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebHit {
    pub title: String,
    pub url: String,
    pub description: String,
    /// Newest capture of the result's domain, when the index knows it.
    pub pointer: Option<CaptureRecord>,
}

pub struct BraveSearch {
    client: Client,
    token: String,
    cache: Option<SearchCache>,
}

impl BraveSearch {
    /// Token comes from `BRAVE_SEARCH_API_KEY`; the cache location from the
    /// config, overridable (and disableable) via environment.
    pub fn from_env(cfg: &Config) -> Result<Self, Error> {
        let token = std::env::var(TOKEN_ENV)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::UpstreamSearchUnavailable(format!("missing {} in environment", TOKEN_ENV))
            })?;

        let cache = if std::env::var(CACHE_DISABLE_ENV).is_ok() {
            None
        } else {
            let path = std::env::var(CACHE_PATH_ENV)
                .ok()
                .map(std::path::PathBuf::from)
                .or_else(|| cfg.brave_cache_path.clone())
                .unwrap_or_else(|| std::env::temp_dir().join("ccpointer_brave_cache.json"));
            Some(SearchCache::new(path, cfg.brave_cache_ttl_s))
        };

        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(20)).build()?,
            token,
            cache,
        })
    }

    pub fn cache(&self) -> Option<&SearchCache> {
        self.cache.as_ref()
    }

    /// Raw web search: `(title, url, description)` triples, cached on disk.
    pub fn search(&self, params: &SearchParams) -> Result<Vec<WebHit>, Error> {
        if params.query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let key = params.cache_key();
        if let Some(cache) = &self.cache {
            if let Some(hits) = cache.get(&key) {
                debug!("search cache hit for {:?}", params.query);
                return Ok(hits);
            }
        }

        let hits = self.call_api(params)?;
        if let Some(cache) = &self.cache {
            cache.put(&key, &hits);
        }
        Ok(hits)
    }

    /// Search, then attach the newest pointer for each result's bare domain.
    pub fn search_with_pointers(
        &self,
        cfg: &Config,
        params: &SearchParams,
    ) -> Result<Vec<WebHit>, Error> {
        let mut hits = self.search(params)?;
        for hit in &mut hits {
            hit.pointer = best_pointer(cfg, &hit.url);
        }
        Ok(hits)
    }

    fn call_api(&self, params: &SearchParams) -> Result<Vec<WebHit>, Error> {
        let resp = self
            .client
            .get(ENDPOINT)
            .query(&[
                ("q", params.query.as_str()),
                ("count", &params.count.to_string()),
                ("offset", &params.offset.to_string()),
                ("country", params.country.as_str()),
                ("safesearch", params.safesearch.as_str()),
            ])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.token)
            .send()
            .map_err(|e| Error::UpstreamSearchUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::UpstreamSearchUnavailable(format!(
                "HTTP {} from search API",
                resp.status()
            )));
        }
        let data: Value = resp
            .json()
            .map_err(|e| Error::UpstreamSearchUnavailable(e.to_string()))?;
        Ok(parse_results(&data))
    }
}

fn parse_results(data: &Value) -> Vec<WebHit> {
    let items = data
        .get("web")
        .and_then(|w| w.get("results"))
        .and_then(Value::as_array);
    let mut out = Vec::new();
    if let Some(items) = items {
        for it in items {
            let get = |k: &str| {
                it.get(k)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let url = get("url");
            if url.is_empty() {
                continue;
            }
            out.push(WebHit {
                title: get("title"),
                url,
                description: get("description"),
                pointer: None,
            });
        }
    }
    out
}

/// Newest capture for the bare domain of `url`, if any collection has it.
fn best_pointer(cfg: &Config, url: &str) -> Option<CaptureRecord> {
    let opts = SearchOptions {
        max_matches: POINTER_PROBE,
        bare_domain: true,
        ..SearchOptions::default()
    };
    match query::search_domain(cfg, url, &opts) {
        Ok(outcome) => outcome
            .records
            .into_iter()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp)),
        Err(e) => {
            warn!("pointer resolution for {:?} failed: {}", url, e);
            None
        }
    }
}
