//! Maintenance tools for a downloaded corpus
//!
//! These operate on sidecar tag files after the fact: removing every image carrying a
//! tag, escaping parentheses for trainers that treat them as weights, and rewriting
//! tags according to the catalog's tag taxonomy.

use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::Path;

use futures::stream::{self, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::danbooru::catalog_client::TagCategorySource;
use crate::danbooru::download_engine::TAG_EXTENSION;
use crate::danbooru::integrity::{extension_of, SWEEP_EXTENSIONS};

/// Artist tags are prefixed with `artist:`.
pub const ARTIST_CATEGORY: i64 = 1;
/// Copyright and meta tags are dropped.
pub const DROPPED_CATEGORIES: [i64; 2] = [3, 5];

/// Concurrent taxonomy lookups per file.
pub const LOOKUP_CONCURRENCY: usize = 3;

const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Error types for the tag tools
#[derive(Error, Debug)]
pub enum TagToolsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

pub type TagToolsResult<T> = Result<T, TagToolsError>;

fn is_sidecar(path: &Path) -> bool {
    extension_of(path).as_deref() == Some(TAG_EXTENSION)
}

fn split_tags(content: &str) -> Vec<String> {
    content
        .split(',')
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Deletes every sidecar under `directory` (recursively) that carries `tag`, together
/// with the image sharing its base name. Returns the number of images deleted.
pub fn delete_by_tag(directory: &Path, tag: &str) -> TagToolsResult<usize> {
    let tag = tag.trim();
    let mut deleted = 0;

    for entry in WalkDir::new(directory).sort_by_file_name() {
        let entry = entry?;
        let tag_path = entry.path();
        if !entry.file_type().is_file() || !is_sidecar(tag_path) {
            continue;
        }

        let content = fs::read_to_string(tag_path)?;
        if !split_tags(&content).iter().any(|t| t == tag) {
            continue;
        }

        for ext in SWEEP_EXTENSIONS {
            let image_path = tag_path.with_extension(ext);
            if image_path.is_file() {
                info!("Deleting {} (tagged '{}')", image_path.display(), tag);
                fs::remove_file(&image_path)?;
                deleted += 1;
            }
        }

        fs::remove_file(tag_path)?;
    }

    info!("Deleted {} images tagged '{}'", deleted, tag);
    Ok(deleted)
}

/// Escapes every `(` and `)` not already preceded by a backslash.
pub fn escape_parentheses(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    let mut previous = None;

    for c in text.chars() {
        if (c == '(' || c == ')') && previous != Some('\\') {
            escaped.push('\\');
        }
        escaped.push(c);
        previous = Some(c);
    }

    escaped
}

/// Escapes parentheses in every sidecar under `directory`. Returns how many files changed.
pub fn escape_tag_files(directory: &Path) -> TagToolsResult<usize> {
    let mut changed = 0;

    for entry in WalkDir::new(directory).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || !is_sidecar(path) {
            continue;
        }

        let content = fs::read_to_string(path)?;
        let escaped = escape_parentheses(&content);
        if escaped != content {
            fs::write(path, escaped)?;
            debug!("Successfully processed: {}", path.display());
            changed += 1;
        }
    }

    Ok(changed)
}

/// Rewrites sidecar tags by taxonomy category, memoizing lookups.
pub struct TagClassifier<S: TagCategorySource> {
    source: S,
    cache: Mutex<LruCache<String, Option<i64>>>,
}

impl<S: TagCategorySource> TagClassifier<S> {
    pub fn new(source: S) -> Self {
        Self::with_capacity(source, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(source: S, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Category of `tag`; lookup failures resolve to `None` and are cached too.
    pub async fn category(&self, tag: &str) -> Option<i64> {
        if let Some(category) = self.cache.lock().get(tag) {
            return *category;
        }

        let category = match self.source.tag_category(tag).await {
            Ok(category) => category,
            Err(e) => {
                warn!("Tag lookup failed for '{}': {}", tag, e);
                None
            }
        };

        self.cache.lock().put(tag.to_string(), category);
        category
    }

    /// The rewritten tag, or `None` if it should be dropped.
    pub async fn classify_tag(&self, tag: &str) -> Option<String> {
        match self.category(tag).await {
            Some(ARTIST_CATEGORY) => Some(format!("artist:{}", tag)),
            Some(category) if DROPPED_CATEGORIES.contains(&category) => None,
            _ => Some(tag.to_string()),
        }
    }

    /// Classifies tags in their original order.
    pub async fn classify_tags(&self, tags: &[String]) -> Vec<String> {
        stream::iter(tags.iter().map(|tag| self.classify_tag(tag)))
            .buffered(LOOKUP_CONCURRENCY)
            .filter_map(|tag| async move { tag })
            .collect()
            .await
    }

    /// Rewrites every sidecar in the top level of `directory`. Returns how many files
    /// were processed.
    pub async fn reclassify_dir(&self, directory: &Path) -> TagToolsResult<usize> {
        let mut processed = 0;

        for entry in WalkDir::new(directory).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file() || !is_sidecar(path) {
                continue;
            }

            let content = tokio::fs::read_to_string(path).await?;
            let tags = self.classify_tags(&split_tags(&content)).await;
            tokio::fs::write(path, tags.join(",")).await?;
            processed += 1;
        }

        info!("Reclassified tags in {} files", processed);
        Ok(processed)
    }
}
