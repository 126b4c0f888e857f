//! Full-WARC disk cache.
//!
//! Files are addressed by their corpus-relative name under the cache root.
//! Concurrent downloaders coalesce through a rename lock: the winner streams
//! into `<name>.downloading` and renames on completion, everyone else polls
//! for the final file.
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::blocking::Client;

use crate::error::Error;
use crate::sources::Pointer;

const LOCK_POLL: Duration = Duration::from_millis(250);
const LOCK_WAIT_MAX: Duration = Duration::from_secs(600);

pub struct WarcCache {
    dir: PathBuf,
    max_bytes: u64,
}

impl WarcCache {
    pub fn new(dir: PathBuf, max_bytes: u64) -> Self {
        Self { dir, max_bytes }
    }

    /// Read `len` bytes at the pointer offset, downloading the whole WARC
    /// first if it is not cached yet. Returns `Ok(None)` when the remote file
    /// exceeds the cache cap and the caller should fall back to a ranged GET.
    pub fn fetch_range(
        &self,
        client: &Client,
        url: &str,
        ptr: &Pointer,
        len: usize,
    ) -> Result<Option<Vec<u8>>, Error> {
        let local = match self.ensure(client, url, &ptr.warc_filename)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let mut file = File::open(&local)?;
        file.seek(SeekFrom::Start(ptr.warc_offset as u64))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(|e| {
            Error::MalformedWarc(format!(
                "{:?}: short read at offset {}: {}",
                local, ptr.warc_offset, e
            ))
        })?;
        Ok(Some(buf))
    }

    fn local_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename.trim_start_matches('/'))
    }

    fn ensure(&self, client: &Client, url: &str, filename: &str) -> Result<Option<PathBuf>, Error> {
        let local = self.local_path(filename);
        if local.exists() {
            return Ok(Some(local));
        }

        // Size check before committing disk space.
        let head = client.head(url).send()?;
        if head.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(url.to_string()));
        }
        let remote_size = head.content_length().unwrap_or(u64::MAX);
        if remote_size > self.max_bytes {
            debug!(
                "{}: {} bytes exceeds cache cap {}, using ranged reads",
                url, remote_size, self.max_bytes
            );
            return Ok(None);
        }

        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = {
            let mut os = local.as_os_str().to_owned();
            os.push(".downloading");
            PathBuf::from(os)
        };

        match OpenOptions::new().write(true).create_new(true).open(&lock) {
            Ok(mut f) => {
                info!("caching {} ({} bytes)", url, remote_size);
                let result = (|| -> Result<(), Error> {
                    let mut resp = client.get(url).send()?.error_for_status()?;
                    resp.copy_to(&mut f)?;
                    f.sync_all()?;
                    Ok(())
                })();
                match result {
                    Ok(()) => {
                        drop(f);
                        std::fs::rename(&lock, &local)?;
                        Ok(Some(local))
                    }
                    Err(e) => {
                        drop(f);
                        let _ = std::fs::remove_file(&lock);
                        Err(e)
                    }
                }
            }
            // Someone else is downloading; wait for the rename.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                self.wait_for(&local, &lock)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn wait_for(&self, local: &Path, lock: &Path) -> Result<Option<PathBuf>, Error> {
        let started = Instant::now();
        while started.elapsed() < LOCK_WAIT_MAX {
            if local.exists() {
                return Ok(Some(local.to_path_buf()));
            }
            if !lock.exists() {
                // Downloader died without renaming; caller may retry.
                warn!("{:?}: download lock vanished without a result", lock);
                return Err(Error::NetworkError(format!(
                    "concurrent download of {:?} failed",
                    local
                )));
            }
            std::thread::sleep(LOCK_POLL);
        }
        Err(Error::NetworkError(format!(
            "timed out waiting for concurrent download of {:?}",
            local
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_ranges_from_cached_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = WarcCache::new(dir.path().to_path_buf(), u64::MAX);

        // Pre-seed the cache as if a download already completed.
        let name = "crawl-data/CC-MAIN-2024-30/a.warc.gz";
        let local = cache.local_path(name);
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, b"0123456789abcdef").unwrap();

        let ptr = Pointer {
            warc_filename: name.to_string(),
            warc_offset: 4,
            warc_length: 6,
        };
        let client = Client::new();
        let got = cache
            .fetch_range(&client, "http://unused.invalid/x", &ptr, 6)
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"456789");
    }

    #[test]
    fn short_file_is_malformed() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = WarcCache::new(dir.path().to_path_buf(), u64::MAX);
        let name = "a.warc.gz";
        std::fs::write(cache.local_path(name), b"tiny").unwrap();

        let ptr = Pointer {
            warc_filename: name.to_string(),
            warc_offset: 2,
            warc_length: 100,
        };
        let client = Client::new();
        let err = cache
            .fetch_range(&client, "http://unused.invalid/x", &ptr, 100)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedWarc(_)));
    }
}
