//! In-memory stand-ins for the catalog and the asset host, plus image fixtures.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::danbooru::catalog_client::{
    CandidateRecord, CatalogError, CatalogPage, CatalogResult, CatalogSource, FilterCriteria,
};
use crate::danbooru::download_engine::{AssetFetcher, DownloadError, DownloadResult};

pub fn candidate(id: u64, tags: &str) -> CandidateRecord {
    CandidateRecord {
        id,
        file_url: format!("https://cdn.example/{}.png", id),
        tag_string: tags.to_string(),
        score: 10,
        file_ext: "png".to_string(),
    }
}

/// A small uniform PNG whose gray level is `shade`; distinct shades fingerprint differently.
pub fn png_bytes(shade: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(24, 24, Rgb([shade, shade, shade]));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
    bytes
}

/// A PNG cut in half: the header parses, the pixel data does not.
pub fn truncated_png_bytes(shade: u8) -> Vec<u8> {
    let mut bytes = png_bytes(shade);
    bytes.truncate(bytes.len() / 2);
    bytes
}

pub fn write_image(dir: &Path, name: &str, bytes: &[u8]) {
    std::fs::write(dir.join(name), bytes).unwrap();
    let tag_name = Path::new(name).with_extension("txt");
    std::fs::write(dir.join(tag_name), "solo").unwrap();
}

#[derive(Debug, Clone)]
pub enum Response {
    Ok(Vec<u8>),
    Status(u16),
    Timeout,
}

/// Replays scripted responses per URL; the last scripted response repeats.
pub struct FakeFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Response>>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(&self, url: &str, responses: Vec<Response>) {
        self.scripts.lock().insert(url.to_string(), responses.into());
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_response(&self, url: &str) -> Response {
        *self.calls.lock().entry(url.to_string()).or_insert(0) += 1;

        let mut scripts = self.scripts.lock();
        match scripts.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Response::Status(404)),
            Some(queue) => queue.front().cloned().unwrap_or(Response::Status(404)),
            None => Response::Status(404),
        }
    }
}

#[async_trait]
impl AssetFetcher for FakeFetcher {
    async fn fetch_bytes(&self, url: &str, timeout: Duration) -> DownloadResult<Vec<u8>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let response = self.next_response(url);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match response {
            Response::Ok(bytes) => Ok(bytes),
            Response::Status(code) => Err(DownloadError::Status(
                StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            )),
            Response::Timeout => Err(DownloadError::Timeout(timeout)),
        }
    }
}

/// Serves fixed pages of records; pages past the end are empty.
pub struct FakeCatalog {
    pages: Vec<CatalogResult<Vec<CandidateRecord>>>,
    requested_pages: Mutex<Vec<u32>>,
}

impl FakeCatalog {
    pub fn new(pages: Vec<Vec<CandidateRecord>>) -> Self {
        Self {
            pages: pages.into_iter().map(Ok).collect(),
            requested_pages: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failing_page(mut self, index: usize) -> Self {
        if index < self.pages.len() {
            self.pages[index] = Err(CatalogError::Service(StatusCode::SERVICE_UNAVAILABLE));
        }
        self
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested_pages.lock().clone()
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn search(&self, criteria: &FilterCriteria, page_size: usize, page: u32) -> CatalogResult<CatalogPage> {
        self.requested_pages.lock().push(page);

        let index = page.saturating_sub(1) as usize;
        match self.pages.get(index) {
            Some(Ok(records)) => {
                let fetched = records.len().min(page_size);
                let candidates = records
                    .iter()
                    .take(page_size)
                    .filter(|record| criteria.is_valid(record))
                    .cloned()
                    .collect();
                Ok(CatalogPage { candidates, fetched })
            }
            Some(Err(_)) => Err(CatalogError::Service(StatusCode::SERVICE_UNAVAILABLE)),
            None => Ok(CatalogPage::default()),
        }
    }
}
