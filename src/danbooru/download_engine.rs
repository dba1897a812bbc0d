//! Download Engine for the Danbooru downloader
//!
//! This module provides an async download engine that:
//! 1. Bounds concurrency across a wave with a Semaphore
//! 2. Retries every failed attempt after a fixed short delay
//! 3. Writes the image first, then its sidecar tag file
//! 4. Reports every candidate as a success or a failure, never raising

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use indicatif::ProgressBar;
use reqwest::{Client, Proxy, StatusCode};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::danbooru::catalog_client::CandidateRecord;
use crate::danbooru::config_loader::AppConfig;

/// Extension of sidecar tag files.
pub const TAG_EXTENSION: &str = "txt";

/// Error types for the download engine
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    Status(StatusCode),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for download operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// An image and its sidecar tag file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedAsset {
    pub candidate_id: u64,
    pub image_path: PathBuf,
    pub tag_path: PathBuf,
    pub tag_string: String,
}

/// Result of fetching one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Success(DownloadedAsset),
    Failure { candidate_id: u64, last_error: String },
}

impl DownloadOutcome {
    pub fn candidate_id(&self) -> u64 {
        match self {
            DownloadOutcome::Success(asset) => asset.candidate_id,
            DownloadOutcome::Failure { candidate_id, .. } => *candidate_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DownloadOutcome::Success(_))
    }
}

/// How base names are derived from candidate ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileNaming {
    /// `<id>_<stamp>`; one stamp per run, so repeated runs create new files.
    Timestamped(i64),
    /// `<id>`; repeated runs overwrite.
    Identifier,
}

impl FileNaming {
    pub fn from_config(config: &AppConfig) -> Self {
        match config.files.naming.as_str() {
            "id" => FileNaming::Identifier,
            _ => FileNaming::Timestamped(chrono::Utc::now().timestamp()),
        }
    }

    pub fn base_name(&self, candidate_id: u64) -> String {
        match self {
            FileNaming::Timestamped(stamp) => format!("{}_{}", candidate_id, stamp),
            FileNaming::Identifier => candidate_id.to_string(),
        }
    }

    /// Image path and sidecar tag path for a candidate.
    pub fn paths(&self, candidate: &CandidateRecord, destination: &Path) -> (PathBuf, PathBuf) {
        let base = self.base_name(candidate.id);
        let ext = if candidate.file_ext.is_empty() { "jpg" } else { candidate.file_ext.as_str() };

        (
            destination.join(format!("{}.{}", base, ext)),
            destination.join(format!("{}.{}", base, TAG_EXTENSION)),
        )
    }
}

/// One HTTP GET for an asset. The engine owns retries; implementors never retry.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch_bytes(&self, url: &str, timeout: Duration) -> DownloadResult<Vec<u8>>;
}

/// `AssetFetcher` over a shared reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn from_config(config: &AppConfig) -> DownloadResult<Self> {
        let mut builder = Client::builder()
            .user_agent(&config.network.user_agent)
            .pool_max_idle_per_host(config.network.concurrency)
            .tcp_nodelay(true);

        // Only the configured proxy is used; environment proxies are ignored.
        builder = match config.proxy_url() {
            Some(proxy_url) => {
                debug!("Routing downloads through proxy {}", proxy_url);
                builder.proxy(Proxy::all(&proxy_url)?)
            }
            None => builder.no_proxy(),
        };

        Ok(Self { client: builder.build()? })
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch_bytes(&self, url: &str, timeout: Duration) -> DownloadResult<Vec<u8>> {
        let attempt = async {
            let response = self.client.get(url).send().await?;

            if response.status() != StatusCode::OK {
                return Err(DownloadError::Status(response.status()));
            }

            Ok(response.bytes().await?.to_vec())
        };

        // Bounds connect, headers and body together.
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout(timeout)),
        }
    }
}

/// Download engine configuration
#[derive(Debug, Clone)]
pub struct DownloadEngineConfig {
    pub max_concurrent_downloads: usize,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub naming: FileNaming,
}

impl DownloadEngineConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_concurrent_downloads: config.network.concurrency.max(1),
            retry_delay: Duration::from_millis(config.network.retry_delay_ms),
            timeout: Duration::from_secs(config.network.timeout_secs),
            naming: FileNaming::from_config(config),
        }
    }
}

impl Default for DownloadEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 5,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            naming: FileNaming::Identifier,
        }
    }
}

/// Bounded-concurrency fetcher of candidates to a destination directory.
pub struct DownloadEngine<F: AssetFetcher> {
    config: DownloadEngineConfig,
    fetcher: Arc<F>,
    semaphore: Arc<Semaphore>,
    progress_bar: ProgressBar,
}

impl<F: AssetFetcher> DownloadEngine<F> {
    pub fn new(config: DownloadEngineConfig, fetcher: F) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1)));

        Self {
            config,
            fetcher: Arc::new(fetcher),
            semaphore,
            progress_bar: ProgressBar::hidden(),
        }
    }

    /// Ticks `progress_bar` once per resolved candidate.
    pub fn with_progress(mut self, progress_bar: ProgressBar) -> Self {
        self.progress_bar = progress_bar;
        self
    }

    pub fn config(&self) -> &DownloadEngineConfig {
        &self.config
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn progress_bar(&self) -> &ProgressBar {
        &self.progress_bar
    }

    /// Fetches a whole wave. Resolves once every candidate has resolved; outcomes
    /// are returned in input order.
    pub async fn fetch_wave(
        &self,
        candidates: &[CandidateRecord],
        destination: &Path,
        retry_budget: usize,
    ) -> Vec<DownloadOutcome> {
        self.progress_bar.set_length(candidates.len() as u64);
        self.progress_bar.set_position(0);

        let tasks = candidates
            .iter()
            .map(|candidate| self.fetch(candidate, destination, retry_budget));
        let outcomes = join_all(tasks).await;

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        info!(
            "Wave finished: {} succeeded, {} failed",
            succeeded,
            outcomes.len() - succeeded
        );

        outcomes
    }

    /// Fetches one candidate with up to `retry_budget + 1` attempts.
    #[instrument(skip(self, candidate, destination), fields(post_id = candidate.id))]
    pub async fn fetch(&self, candidate: &CandidateRecord, destination: &Path, retry_budget: usize) -> DownloadOutcome {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return DownloadOutcome::Failure {
                    candidate_id: candidate.id,
                    last_error: format!("Download slots closed: {}", e),
                };
            }
        };

        let outcome = self.fetch_with_retries(candidate, destination, retry_budget).await;
        self.progress_bar.inc(1);
        outcome
    }

    async fn fetch_with_retries(
        &self,
        candidate: &CandidateRecord,
        destination: &Path,
        retry_budget: usize,
    ) -> DownloadOutcome {
        let (image_path, tag_path) = self.config.naming.paths(candidate, destination);
        let tag_string = candidate.sidecar_tags();
        let max_attempts = retry_budget + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self
                .try_once(candidate, destination, &image_path, &tag_path, &tag_string)
                .await
            {
                Ok(()) => {
                    debug!("Downloaded: {}", image_path.display());
                    return DownloadOutcome::Success(DownloadedAsset {
                        candidate_id: candidate.id,
                        image_path,
                        tag_path,
                        tag_string,
                    });
                }
                Err(e) => {
                    warn!(
                        "Failed to download: {} ({}) (Attempt {}/{})",
                        candidate.file_url, e, attempt, max_attempts
                    );
                    last_error = e.to_string();

                    if attempt < max_attempts {
                        sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        error!("Failed to download: {} after {} attempts", candidate.file_url, max_attempts);
        DownloadOutcome::Failure {
            candidate_id: candidate.id,
            last_error,
        }
    }

    async fn try_once(
        &self,
        candidate: &CandidateRecord,
        destination: &Path,
        image_path: &Path,
        tag_path: &Path,
        tag_string: &str,
    ) -> DownloadResult<()> {
        let bytes = self.fetcher.fetch_bytes(&candidate.file_url, self.config.timeout).await?;

        fs::create_dir_all(destination).await?;
        fs::write(image_path, &bytes).await?;

        if let Err(e) = fs::write(tag_path, tag_string.as_bytes()).await {
            // No image without its sidecar.
            let _ = fs::remove_file(image_path).await;
            return Err(e.into());
        }

        Ok(())
    }
}
