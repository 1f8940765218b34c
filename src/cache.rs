//! Two-level histogram specification cache.
//!
//! Level A maps a revision key (URL-shaped string) to a loaded spec; a
//! present-but-empty entry is a negative cache that suppresses retries
//! for revisions the server answered non-200 for. Level B dedupes by
//! MD5 of the raw JSON, since many revisions serve identical content.
//! A disk tier under `cache_dir` persists fetched bodies across runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION};

use crate::histogram::HistogramSpec;
use crate::metrics::CacheMetrics;

/// Bounded deadline for the synchronous revision fetch.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HistogramCache {
    /// `host:port` of the histogram server, as configured.
    server: String,
    client: reqwest::blocking::Client,
    cache_dir: PathBuf,
    revisions: HashMap<String, Option<Arc<HistogramSpec>>>,
    content: HashMap<[u8; 16], Arc<HistogramSpec>>,
    pub metrics: CacheMetrics,
}

impl HistogramCache {
    pub fn new(histogram_server: &str, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        default_headers.insert(CONNECTION, HeaderValue::from_static("close"));

        let client = reqwest::blocking::Client::builder()
            .default_headers(default_headers)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("building histogram HTTP client")?;

        Ok(HistogramCache {
            server: histogram_server.to_string(),
            client,
            cache_dir: cache_dir.into(),
            revisions: HashMap::new(),
            content: HashMap::new(),
            metrics: CacheMetrics::default(),
        })
    }

    /// Look up the specification for a revision key.
    ///
    /// `None` covers invalid revisions, negative-cached revisions, and
    /// load failures; the caller drops the record either way.
    pub fn find(&mut self, revision: &str) -> Option<Arc<HistogramSpec>> {
        if !revision.starts_with("http") {
            self.metrics.invalid_revisions += 1;
            return None;
        }

        if let Some(entry) = self.revisions.get(revision) {
            self.metrics.cache_hits += 1;
            return entry.clone();
        }

        self.metrics.cache_misses += 1;
        self.load(revision)
    }

    /// Load a spec from the disk tier or the histogram server.
    fn load(&mut self, revision: &str) -> Option<Arc<HistogramSpec>> {
        let tmp_path = self
            .cache_dir
            .join(format!("{}.json", revision.replace('/', "-")));

        let json = match std::fs::read(&tmp_path) {
            Ok(bytes) => bytes,
            Err(_) => {
                let body = self.fetch(revision)?;
                if let Err(e) = std::fs::write(&tmp_path, &body) {
                    tracing::warn!(
                        path = %tmp_path.display(),
                        error = %e,
                        "failed to write histogram cache file"
                    );
                }
                body
            }
        };

        let digest = md5::compute(&json);
        if let Some(spec) = self.content.get(&digest.0) {
            let spec = Arc::clone(spec);
            self.revisions
                .insert(revision.to_string(), Some(Arc::clone(&spec)));
            return Some(spec);
        }

        match HistogramSpec::parse(&json) {
            Ok(spec) => {
                let spec = Arc::new(spec);
                self.content.insert(digest.0, Arc::clone(&spec));
                self.revisions
                    .insert(revision.to_string(), Some(Arc::clone(&spec)));
                Some(spec)
            }
            Err(e) => {
                self.metrics.invalid_histograms += 1;
                tracing::warn!(revision, error = %e, "invalid histogram specification");
                None
            }
        }
    }

    /// Synchronous GET against the histogram server.
    ///
    /// Non-200 responses are negative-cached; connection-level failures
    /// are not, so a later record may retry.
    fn fetch(&mut self, revision: &str) -> Option<Vec<u8>> {
        // The revision is embedded raw; the server expects it unencoded.
        let url = format!(
            "http://{}/histogram_buckets?revision={}",
            self.server, revision
        );

        let response = match self.client.get(&url).send() {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                self.metrics.connection_errors += 1;
                tracing::warn!(revision, error = %e, "histogram server unreachable");
                return None;
            }
            Err(e) => {
                self.metrics.http_errors += 1;
                tracing::warn!(revision, error = %e, "histogram request failed");
                return None;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            self.metrics.http_errors += 1;
            tracing::warn!(revision, status = %response.status(), "histogram fetch rejected");
            // prevent retries for this revision
            self.revisions.insert(revision.to_string(), None);
            return None;
        }

        match response.bytes() {
            Ok(body) => Some(body.to_vec()),
            Err(e) => {
                self.metrics.connection_errors += 1;
                tracing::warn!(revision, error = %e, "histogram body read failed");
                None
            }
        }
    }
}
