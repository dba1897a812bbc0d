//! Image integrity checks
//!
//! A file is corrupted if it is missing, its header cannot be parsed, or its pixel
//! data cannot be fully decoded. The same predicate gates freshly downloaded files
//! and drives the bulk sweep of a download folder.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use image::ImageReader;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::danbooru::download_engine::TAG_EXTENSION;

/// Extensions the sweep treats as images.
pub const SWEEP_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff"];

/// Sidecar tag file for an image: same base name, tag extension.
pub fn sidecar_path(image_path: &Path) -> PathBuf {
    image_path.with_extension(TAG_EXTENSION)
}

/// Lowercase extension of `path`, if any.
pub(crate) fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Deletes an image and, if present, its sidecar tag file.
pub fn remove_with_sidecar(image_path: &Path) -> io::Result<()> {
    if image_path.exists() {
        fs::remove_file(image_path)?;
    }

    let tag_path = sidecar_path(image_path);
    if tag_path.exists() {
        debug!("Removing associated text file: {}", tag_path.display());
        fs::remove_file(&tag_path)?;
    }

    Ok(())
}

/// Reader for `path` with the decoder's allocation limits lifted. Catalog assets are
/// routinely larger than the default limit and still decode fine.
pub(crate) fn open_image(path: &Path) -> image::ImageResult<ImageReader<BufReader<File>>> {
    let mut reader = ImageReader::open(path)?.with_guessed_format()?;
    reader.no_limits();
    Ok(reader)
}

/// Structural check, then a full decode.
fn verify(path: &Path) -> image::ImageResult<()> {
    open_image(path)?.into_dimensions()?;
    open_image(path)?.decode()?;
    Ok(())
}

pub fn is_corrupted(path: &Path) -> bool {
    if !path.is_file() {
        warn!("File does not exist: {}", path.display());
        return true;
    }

    match verify(path) {
        Ok(()) => false,
        Err(e) => {
            warn!("Image {} is corrupted: {}", path.display(), e);
            true
        }
    }
}

/// Deletes every corrupted image in the top level of `directory`, with its sidecar.
/// Returns how many images were deleted.
pub fn sweep(directory: &Path) -> io::Result<usize> {
    let mut deleted_count = 0;

    for entry in WalkDir::new(directory).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();

        if !entry.file_type().is_file() {
            continue;
        }

        let is_image = extension_of(path)
            .map(|ext| SWEEP_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);

        if is_image && is_corrupted(path) {
            info!("Removing corrupted image: {}", path.display());
            remove_with_sidecar(path)?;
            deleted_count += 1;
        }
    }

    Ok(deleted_count)
}
