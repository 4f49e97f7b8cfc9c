//! Plain image folders and single image files.
//!
//! Entry identifiers are the image file paths themselves.

use super::{sort_naturally, ArchiveBackend, EntryListing, Password};
use crate::detect::is_image_name;
use crate::error::{ComicError, Result};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Backend for a directory of images, walked recursively.
pub struct FolderBackend;

/// Backend for a single image: its pages are the images beside it.
pub struct ImageFileBackend;

/// Naturally sorted image files below `root`, down to `max_depth` levels.
pub fn list_images(root: &Path, max_depth: usize) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(max_depth).follow_links(true) {
        let entry = entry.map_err(|e| ComicError::corrupt(root, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let hidden = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        if !hidden && entry.file_name().to_str().map(is_image_name).unwrap_or(false) {
            images.push(entry.into_path());
        }
    }
    images.sort_by(|a, b| natord::compare_ignore_case(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(images)
}

fn to_entries(paths: Vec<PathBuf>) -> Vec<String> {
    let mut entries: Vec<String> = paths
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    sort_naturally(&mut entries);
    entries
}

fn not_found(container: &Path, entry: &str) -> ComicError {
    ComicError::EntryNotFound {
        path: container.to_path_buf(),
        entry: entry.to_string(),
    }
}

/// Entries may only name files below their container, without `..` hops.
fn escapes(entry: &Path) -> bool {
    entry.components().any(|c| c == Component::ParentDir)
}

fn read_image(container: &Path, entry: &str) -> Result<Vec<u8>> {
    let file = Path::new(entry);
    if !file.is_file() {
        return Err(not_found(container, entry));
    }
    Ok(std::fs::read(file)?)
}

fn copy_images(root: &Path, images: &[PathBuf], dest: &Path) -> Result<usize> {
    for image in images {
        let relative = image.strip_prefix(root).unwrap_or(image.as_path());
        let relative = match relative.file_name() {
            Some(_) if relative.is_relative() => relative.to_path_buf(),
            _ => PathBuf::from(image.file_name().unwrap_or_default()),
        };
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(image, &target)?;
    }
    Ok(images.len())
}

impl ArchiveBackend for FolderBackend {
    fn name(&self) -> &str {
        "folder"
    }

    fn list_page_entries(&self, path: &Path, _password: &Password) -> Result<EntryListing> {
        let images = list_images(path, usize::MAX)?;
        debug!("{:?}: {} images", path, images.len());
        Ok(EntryListing::open(to_entries(images)))
    }

    fn extract_entry(&self, path: &Path, entry: &str, _password: &Password) -> Result<Vec<u8>> {
        let file = Path::new(entry);
        if !file.starts_with(path) || escapes(file) {
            return Err(not_found(path, entry));
        }
        read_image(path, entry)
    }

    fn extract_all(&self, path: &Path, dest: &Path, _password: &Password) -> Result<usize> {
        let images = list_images(path, usize::MAX)?;
        copy_images(path, &images, dest)
    }
}

impl ImageFileBackend {
    fn folder_of(path: &Path) -> PathBuf {
        path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl ArchiveBackend for ImageFileBackend {
    fn name(&self) -> &str {
        "image"
    }

    fn list_page_entries(&self, path: &Path, _password: &Password) -> Result<EntryListing> {
        if !path.is_file() {
            return Err(ComicError::corrupt(path, "image file not found"));
        }
        let images = list_images(&Self::folder_of(path), 1)?;
        Ok(EntryListing::open(to_entries(images)))
    }

    fn extract_entry(&self, path: &Path, entry: &str, _password: &Password) -> Result<Vec<u8>> {
        let file = Path::new(entry);
        if file.parent() != Some(Self::folder_of(path).as_path()) || escapes(file) {
            return Err(not_found(path, entry));
        }
        read_image(path, entry)
    }

    fn extract_all(&self, path: &Path, dest: &Path, _password: &Password) -> Result<usize> {
        let folder = Self::folder_of(path);
        let images = list_images(&folder, 1)?;
        copy_images(&folder, &images, dest)
    }
}
