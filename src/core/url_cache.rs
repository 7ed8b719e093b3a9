//! Content-addressed download cache for remote media
//!
//! Layout: `<media_dir>/<hex(sha256(url))>[.<ext>]`, where `ext` comes from
//! the URL path. The file on disk *is* the cache entry; there is no index
//! and nothing is ever evicted.
//!
//! # Concurrency
//!
//! Downloads are gated per URL: a second `get` for a URL that is already
//! downloading waits for the first one and then finds the file. Different
//! URLs download in parallel. The cache never touches the media registry.
//!
//! # Atomicity
//!
//! Payloads stream into `<name>.part` and are renamed into place when
//! complete, so a failed download never looks cached.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

/// Streaming chunk size
const CHUNK_SIZE: usize = 4096;

pub struct UrlCache {
    dir: PathBuf,
    client: reqwest::blocking::Client,
    /// url -> gate held while that url downloads
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UrlCache {
    /// Create the cache, making `dir` if needed
    ///
    /// * `timeout` - overall limit for one download
    /// * `user_agent` - sent with every request
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration, user_agent: &str) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create media cache directory: {}", dir.display()))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;

        debug!("UrlCache ready: {} (timeout {:?})", dir.display(), timeout);

        Ok(Self {
            dir,
            client,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a command path should go through the cache
    pub fn is_url(path: &str) -> bool {
        path.starts_with("http://") || path.starts_with("https://")
    }

    /// `<lowercase hex sha256>[.<ext>]`
    pub fn file_name(url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        let mut name = hex::encode(digest);
        if let Some(ext) = url_extension(url) {
            name.push('.');
            name.push_str(&ext);
        }
        name
    }

    /// Where `url` lives (or would live) on disk. Never downloads.
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(Self::file_name(url))
    }

    /// Local path of `url`, downloading it on a miss
    pub fn get(&self, url: &str) -> Result<PathBuf> {
        let path = self.path_for(url);
        if path.exists() {
            return Ok(path);
        }

        let gate = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(inflight.entry(url.to_string()).or_default())
        };

        let result = {
            let _guard = gate.lock().unwrap_or_else(|e| e.into_inner());
            // Someone else may have finished while we waited
            if path.exists() {
                Ok(())
            } else {
                self.download(url, &path)
            }
        };

        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            // Gates are only cloned and dropped under this lock, so the
            // last caller out sees the map as the sole holder
            drop(gate);
            if inflight.get(url).is_some_and(|g| Arc::strong_count(g) == 1) {
                inflight.remove(url);
            }
        }

        result.map(|_| path)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        info!("Downloading {} -> {}", url, dest.display());

        let part = dest.with_file_name(format!(
            "{}.part",
            dest.file_name().and_then(|s| s.to_str()).unwrap_or("download")
        ));

        let result = self.fetch_into(url, &part).and_then(|bytes| {
            std::fs::rename(&part, dest)
                .with_context(|| format!("Failed to move {} into place", part.display()))?;
            Ok(bytes)
        });

        match result {
            Ok(bytes) => {
                debug!("Downloaded {} bytes from {}", bytes, url);
                Ok(())
            }
            Err(e) => {
                if part.exists() {
                    if let Err(rm) = std::fs::remove_file(&part) {
                        warn!("Failed to remove partial download {}: {}", part.display(), rm);
                    }
                }
                Err(e)
            }
        }
    }

    /// GET `url` and stream the body into `path`; returns the byte count
    fn fetch_into(&self, url: &str, path: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("GET {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("GET {} returned {}", url, status);
        }

        let mut file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let mut buf = [0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = response
                .read(&mut buf)
                .with_context(|| format!("Reading body of {} failed", url))?;
            if n == 0 {
                break;
            }
            let written = file
                .write(&buf[..n])
                .with_context(|| format!("Writing {} failed", path.display()))?;
            if written != n {
                bail!("Short write to {} ({} of {} bytes)", path.display(), written, n);
            }
            total += n as u64;
        }

        file.sync_all()
            .with_context(|| format!("Failed to flush {}", path.display()))?;
        Ok(total)
    }
}

/// Extension of the URL's path component, if it has a sane one
fn url_extension(url: &str) -> Option<String> {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        // Not a full URL: strip query/fragment by hand
        Err(_) => url.split(['?', '#']).next().unwrap_or("").to_string(),
    };

    let ext = Path::new(&path).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_string())
}
