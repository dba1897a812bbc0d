//! Perceptual duplicate elimination
//!
//! Each image is decoded, reduced to grayscale, downsampled to a 10x10 grid and the
//! resulting bytes hashed with SHA-256. Files are visited in filename order; the first
//! file with a given fingerprint is kept and every later match is deleted along with
//! its sidecar tag file.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::danbooru::integrity::{extension_of, open_image, remove_with_sidecar};

/// Extensions considered for fingerprinting.
pub const DEDUP_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif"];

/// Side of the square grid images are reduced to before hashing.
pub const FINGERPRINT_GRID: u32 = 10;

/// Outcome of one dedup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub deleted: usize,
    pub kept: usize,
    pub skipped: usize,
    pub deleted_paths: Vec<PathBuf>,
}

impl fmt::Display for DedupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Process completed. Kept {} unique images and deleted {} duplicates.",
            self.kept, self.deleted
        )
    }
}

/// Coarse perceptual fingerprint, or `None` if the file cannot be decoded.
pub fn fingerprint(path: &Path) -> Option<String> {
    let img = match open_image(path).and_then(|reader| reader.decode()) {
        Ok(img) => img,
        Err(e) => {
            warn!("Error processing {}: {}", path.display(), e);
            return None;
        }
    };

    let gray = img.grayscale().resize_exact(FINGERPRINT_GRID, FINGERPRINT_GRID, FilterType::Triangle);
    let digest = Sha256::digest(gray.to_luma8().as_raw());

    Some(hex::encode(digest))
}

/// Images in the top level of `directory`, sorted by file name.
fn image_files(directory: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(directory).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let is_image = extension_of(entry.path())
            .map(|ext| DEDUP_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);
        if is_image {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

/// Removes later duplicates within `directory`. Assumes nothing else touches the
/// directory during the call.
pub fn dedupe(directory: &Path) -> io::Result<DedupReport> {
    let files = image_files(directory)?;

    // Fingerprints are computed in parallel; the keep/delete decision walks them in order.
    let fingerprints: Vec<Option<String>> = files.par_iter().map(|path| fingerprint(path)).collect();

    let mut first_seen: HashMap<String, PathBuf> = HashMap::new();
    let mut report = DedupReport::default();

    for (path, hash) in files.into_iter().zip(fingerprints) {
        let Some(hash) = hash else {
            report.skipped += 1;
            continue;
        };

        match first_seen.get(&hash) {
            Some(original) => {
                info!("Deleting duplicate: {} (same as {})", path.display(), original.display());
                remove_with_sidecar(&path)?;
                report.deleted += 1;
                report.deleted_paths.push(path);
            }
            None => {
                debug!("Keeping {}", path.display());
                first_seen.insert(hash, path);
                report.kept += 1;
            }
        }
    }

    info!("{}", report);
    Ok(report)
}
