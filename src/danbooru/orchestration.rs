//! Orchestration layer for the Danbooru downloader
//!
//! Drives one run end to end:
//! 1. Collects candidates page by page until the requested limit is covered
//! 2. Runs the primary, retry and backfill download waves, validating every file
//! 3. Cleans the destination folder (duplicates first, then corrupted images)
//! 4. Produces a summary of what happened

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::danbooru::catalog_client::{
    CandidateRecord, CatalogClient, CatalogError, CatalogPage, CatalogSource, FilterCriteria,
};
use crate::danbooru::config_loader::AppConfig;
use crate::danbooru::dedup::{dedupe, DedupReport};
use crate::danbooru::download_engine::{
    AssetFetcher, DownloadEngine, DownloadEngineConfig, DownloadError, DownloadOutcome, DownloadedAsset,
    HttpFetcher,
};
use crate::danbooru::integrity::{is_corrupted, remove_with_sidecar, sweep};

/// Summary line when the catalog yields nothing to download.
pub const NO_CANDIDATES_MESSAGE: &str = "No candidates found matching the criteria.";

/// Error types for the orchestration layer
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Destination {} is not writable: {source}", path.display())]
    Destination { path: PathBuf, source: io::Error },

    #[error("Catalog client error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Download engine error: {0}")]
    Download(#[from] DownloadError),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

/// Result type for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Download waves, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wave {
    Primary,
    Retry,
    Backfill,
}

impl fmt::Display for Wave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wave::Primary => write!(f, "primary"),
            Wave::Retry => write!(f, "retry"),
            Wave::Backfill => write!(f, "backfill"),
        }
    }
}

/// A candidate that has not (yet) produced a valid file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub candidate_id: u64,
    pub wave: Wave,
    pub last_error: String,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub requested: usize,
    pub collected: usize,
    pub attempted: usize,
    pub downloaded: usize,
    /// Candidates attempted that never produced a valid file.
    pub failed: usize,
    /// Failed or invalid results across all waves, counting a candidate once per wave.
    pub failed_attempts: usize,
    pub initial_invalid: usize,
    pub final_invalid: usize,
    pub redownloaded: usize,
    pub backfilled: usize,
    pub duplicates_removed: usize,
    pub swept_invalid: usize,
    /// This run's assets still on disk after cleanup.
    pub kept: usize,
    pub failures: Vec<FailureRecord>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.collected == 0 {
            return write!(f, "{}", NO_CANDIDATES_MESSAGE);
        }

        if self.downloaded == 0 {
            write!(f, "No images were downloaded. ")?;
        }

        write!(
            f,
            "Downloaded {} of {} requested images ({} kept), {} failed, initial invalid {}, \
             final invalid {}, re-downloaded {}, backfilled {}, duplicates removed {}.",
            self.downloaded,
            self.requested,
            self.kept,
            self.failed,
            self.initial_invalid,
            self.final_invalid + self.swept_invalid,
            self.redownloaded,
            self.backfilled,
            self.duplicates_removed
        )
    }
}

/// What a run hands back to its caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Assets of this run still on disk, at most `requested` of them.
    pub assets: Vec<DownloadedAsset>,
    pub message: String,
}

/// Working set of a single run.
#[derive(Default)]
struct RunState {
    candidates: Vec<CandidateRecord>,
    collected_ids: HashSet<u64>,
    next_page: u32,
    exhausted: bool,
    attempted: HashSet<u64>,
    downloaded_ids: HashSet<u64>,
    assets: Vec<DownloadedAsset>,
    failures: HashMap<u64, FailureRecord>,
    summary: RunSummary,
}

impl RunState {
    fn new(requested: usize) -> Self {
        Self {
            next_page: 1,
            summary: RunSummary {
                requested,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Collected candidates not yet submitted to any wave, in collection order.
    fn unseen(&self, count: usize) -> Vec<CandidateRecord> {
        self.candidates
            .iter()
            .filter(|c| !self.attempted.contains(&c.id) && !self.downloaded_ids.contains(&c.id))
            .take(count)
            .cloned()
            .collect()
    }
}

/// Runs the fetch-filter-download-validate-dedup pipeline over one configuration snapshot.
pub struct Orchestrator<C: CatalogSource, F: AssetFetcher> {
    config: AppConfig,
    criteria: FilterCriteria,
    catalog: C,
    engine: DownloadEngine<F>,
}

impl Orchestrator<CatalogClient, HttpFetcher> {
    /// Wires the HTTP catalog client and downloader from a configuration snapshot.
    pub fn from_config(config: &AppConfig, progress_bar: ProgressBar) -> OrchestratorResult<Self> {
        let catalog = CatalogClient::from_config(config)?;
        let fetcher = HttpFetcher::from_config(config)?;

        let mut orchestrator = Self::new(config.clone(), catalog, fetcher);
        orchestrator.engine = orchestrator.engine.with_progress(progress_bar);
        Ok(orchestrator)
    }
}

impl<C: CatalogSource, F: AssetFetcher> Orchestrator<C, F> {
    pub fn new(config: AppConfig, catalog: C, fetcher: F) -> Self {
        let config = config.validated();
        let criteria = FilterCriteria::from_config(&config);
        let engine = DownloadEngine::new(DownloadEngineConfig::from_config(&config), fetcher);

        Self {
            config,
            criteria,
            catalog,
            engine,
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn engine(&self) -> &DownloadEngine<F> {
        &self.engine
    }

    pub fn destination(&self) -> PathBuf {
        PathBuf::from(&self.config.paths.save_path)
    }

    /// Runs the whole pipeline. Only an unusable destination (or a panicked cleanup
    /// task) aborts; every network or validation failure ends up in the summary.
    pub async fn run(&self) -> OrchestratorResult<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> OrchestratorResult<RunReport> {
        let destination = self.destination();
        prepare_destination(&destination)?;

        let limit = self.config.query.limit.max(1);
        let mut state = RunState::new(limit);

        info!("Collecting candidates for tags '{}'", self.criteria.query_tags());
        self.collect_until(&mut state, limit).await;
        state.summary.collected = state.candidates.len();

        if state.candidates.is_empty() {
            warn!("No posts found matching the criteria.");
            return Ok(RunReport {
                message: state.summary.to_string(),
                summary: state.summary,
                assets: Vec::new(),
            });
        }

        let primary: Vec<_> = state.candidates.iter().take(limit).cloned().collect();
        let failed = self
            .run_wave(&mut state, Wave::Primary, primary, self.config.network.primary_retries)
            .await?;

        if !failed.is_empty() {
            info!("Retrying {} failed downloads", failed.len());
            self.run_wave(&mut state, Wave::Retry, failed, self.config.network.retry_wave_retries)
                .await?;
        }

        // Computed once; the backfill wave does not re-evaluate it.
        let shortfall = limit.saturating_sub(state.assets.len());
        if shortfall > 0 {
            info!("Retrying to download {} more images", shortfall);
            let mut backfill = state.unseen(shortfall);
            if backfill.len() < shortfall && !state.exhausted {
                let target = state.candidates.len() + (shortfall - backfill.len());
                self.collect_until(&mut state, target).await;
                state.summary.collected = state.candidates.len();
                backfill = state.unseen(shortfall);
            }

            if backfill.is_empty() {
                warn!("No more candidates available for backfill");
            } else {
                self.run_wave(&mut state, Wave::Backfill, backfill, self.config.network.primary_retries)
                    .await?;
            }
        }

        self.cleanup(&mut state, destination).await?;

        Ok(self.finish(state))
    }

    /// Pages through the catalog until `target` candidates are held or the catalog
    /// runs dry. Failed or short pages end collection for the rest of the run.
    async fn collect_until(&self, state: &mut RunState, target: usize) {
        let page_size = self.config.network.page_size;

        while state.candidates.len() < target && !state.exhausted {
            if state.next_page > self.config.network.max_pages {
                warn!("Reached the page limit of {}", self.config.network.max_pages);
                state.exhausted = true;
                break;
            }

            let page = state.next_page;
            state.next_page += 1;

            let result = match self.catalog.search(&self.criteria, page_size, page).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(page, "Catalog page returned no results: {}", e);
                    CatalogPage::default()
                }
            };

            if result.fetched == 0 {
                info!("No more posts found matching the criteria.");
                state.exhausted = true;
                break;
            }

            for candidate in result.candidates {
                if state.collected_ids.insert(candidate.id) {
                    state.candidates.push(candidate);
                }
            }

            if result.fetched < page_size {
                info!(page, "Short page, catalog exhausted");
                state.exhausted = true;
            }
        }
    }

    /// Downloads `batch`, validates every new file and classifies the results.
    /// Returns the candidates that did not produce a valid file.
    async fn run_wave(
        &self,
        state: &mut RunState,
        wave: Wave,
        batch: Vec<CandidateRecord>,
        retry_budget: usize,
    ) -> OrchestratorResult<Vec<CandidateRecord>> {
        let batch: Vec<_> = batch
            .into_iter()
            .filter(|c| !state.downloaded_ids.contains(&c.id))
            .collect();
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        for candidate in &batch {
            state.attempted.insert(candidate.id);
        }

        info!(%wave, "Starting {} wave with {} candidates", wave, batch.len());
        self.engine.progress_bar().set_message(wave.to_string());

        let destination = self.destination();
        let outcomes = self.engine.fetch_wave(&batch, &destination, retry_budget).await;
        let corrupted = self.validate(&outcomes).await?;

        let mut failed = Vec::new();
        for ((candidate, outcome), corrupt) in batch.into_iter().zip(outcomes).zip(corrupted) {
            let error = match outcome {
                DownloadOutcome::Success(asset) if !corrupt => {
                    match wave {
                        Wave::Primary => {}
                        Wave::Retry => state.summary.redownloaded += 1,
                        Wave::Backfill => state.summary.backfilled += 1,
                    }
                    state.downloaded_ids.insert(candidate.id);
                    state.failures.remove(&candidate.id);
                    state.assets.push(asset);
                    continue;
                }
                DownloadOutcome::Success(asset) => {
                    if let Err(e) = remove_with_sidecar(&asset.image_path) {
                        warn!("Failed to remove invalid image {}: {}", asset.image_path.display(), e);
                    }
                    match wave {
                        Wave::Primary => state.summary.initial_invalid += 1,
                        Wave::Retry | Wave::Backfill => state.summary.final_invalid += 1,
                    }
                    "downloaded image failed validation".to_string()
                }
                DownloadOutcome::Failure { last_error, .. } => last_error,
            };

            state.summary.failed_attempts += 1;
            state.failures.insert(
                candidate.id,
                FailureRecord {
                    candidate_id: candidate.id,
                    wave,
                    last_error: error,
                },
            );
            failed.push(candidate);
        }

        Ok(failed)
    }

    /// Integrity flags for every outcome, in order; failures count as not corrupted.
    async fn validate(&self, outcomes: &[DownloadOutcome]) -> OrchestratorResult<Vec<bool>> {
        let paths: Vec<Option<PathBuf>> = outcomes
            .iter()
            .map(|outcome| match outcome {
                DownloadOutcome::Success(asset) => Some(asset.image_path.clone()),
                DownloadOutcome::Failure { .. } => None,
            })
            .collect();

        tokio::task::spawn_blocking(move || {
            paths
                .iter()
                .map(|path| path.as_deref().map(is_corrupted).unwrap_or(false))
                .collect()
        })
        .await
        .map_err(|e| OrchestratorError::TaskJoin(e.to_string()))
    }

    /// One dedup pass, then one integrity sweep, over the whole destination.
    async fn cleanup(&self, state: &mut RunState, destination: PathBuf) -> OrchestratorResult<()> {
        let (dedup_result, sweep_result) = tokio::task::spawn_blocking(move || {
            let dedup_result = dedupe(&destination);
            let sweep_result = sweep(&destination);
            (dedup_result, sweep_result)
        })
        .await
        .map_err(|e| OrchestratorError::TaskJoin(e.to_string()))?;

        match dedup_result {
            Ok(DedupReport { deleted, .. }) => state.summary.duplicates_removed = deleted,
            Err(e) => warn!("Duplicate elimination failed: {}", e),
        }

        match sweep_result {
            Ok(deleted) => state.summary.swept_invalid = deleted,
            Err(e) => warn!("Integrity sweep failed: {}", e),
        }

        Ok(())
    }

    fn finish(&self, mut state: RunState) -> RunReport {
        let requested = state.summary.requested;
        state.assets.truncate(requested);

        let downloaded = state.assets.len();
        let assets: Vec<DownloadedAsset> = state
            .assets
            .into_iter()
            .filter(|asset| asset.image_path.exists())
            .collect();

        let mut failures: Vec<FailureRecord> = state.failures.into_values().collect();
        failures.sort_by_key(|f| f.candidate_id);

        let summary = RunSummary {
            attempted: state.attempted.len(),
            downloaded,
            failed: failures.len(),
            kept: assets.len(),
            failures,
            ..state.summary
        };

        info!(
            downloaded = summary.downloaded,
            failed = summary.failed,
            initial_invalid = summary.initial_invalid,
            final_invalid = summary.final_invalid,
            redownloaded = summary.redownloaded,
            duplicates_removed = summary.duplicates_removed,
            "{}",
            summary
        );

        RunReport {
            message: summary.to_string(),
            summary,
            assets,
        }
    }
}

/// Creates the destination and proves it is writable.
fn prepare_destination(path: &Path) -> OrchestratorResult<()> {
    let to_error = |source: io::Error| OrchestratorError::Destination {
        path: path.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(path).map_err(to_error)?;

    let probe = path.join(".write_probe");
    std::fs::write(&probe, b"").map_err(to_error)?;
    std::fs::remove_file(&probe).map_err(to_error)?;

    Ok(())
}
