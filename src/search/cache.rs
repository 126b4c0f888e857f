//! On-disk cache for web-search results.
//!
//! A single JSON file keyed by a digest of the full query parameter tuple.
//! Entries expire by TTL; the file is pruned oldest-first past the entry cap.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::brave::WebHit;

const MAX_ENTRIES: usize = 1000;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    at_unix: i64,
    results: Vec<WebHit>,
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub path: PathBuf,
    pub entries: usize,
    pub bytes: u64,
}

pub struct SearchCache {
    path: PathBuf,
    ttl_s: i64,
}

impl SearchCache {
    pub fn new(path: PathBuf, ttl_s: u64) -> Self {
        Self {
            path,
            ttl_s: ttl_s as i64,
        }
    }

    fn load(&self) -> CacheFile {
        let read = || -> Result<CacheFile, Error> {
            let data = std::fs::read(&self.path)?;
            Ok(serde_json::from_slice(&data)?)
        };
        match read() {
            Ok(f) => f,
            Err(_) => CacheFile::default(),
        }
    }

    fn store(&self, file: &CacheFile) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Vec<WebHit>> {
        let file = self.load();
        let entry = file.entries.get(key)?;
        let age = Utc::now().timestamp() - entry.at_unix;
        if age > self.ttl_s {
            debug!("cache entry for {} expired ({}s old)", key, age);
            return None;
        }
        Some(entry.results.clone())
    }

    pub fn put(&self, key: &str, results: &[WebHit]) {
        let mut file = self.load();
        file.entries.insert(
            key.to_string(),
            CacheEntry {
                at_unix: Utc::now().timestamp(),
                results: results.to_vec(),
            },
        );
        while file.entries.len() > MAX_ENTRIES {
            let oldest = file
                .entries
                .iter()
                .min_by_key(|(_, e)| e.at_unix)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    file.entries.remove(&k);
                }
                None => break,
            }
        }
        if let Err(e) = self.store(&file) {
            warn!("could not persist search cache {:?}: {}", self.path, e);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let file = self.load();
        CacheStats {
            path: self.path.clone(),
            entries: file.entries.len(),
            bytes: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        }
    }

    pub fn clear(&self) -> Result<(), Error> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
