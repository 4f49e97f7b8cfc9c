//! Image-only EPUB backend.
//!
//! Pages are the images referenced by the spine, in spine order: chapter
//! documents are scanned for `<img src>` and SVG `<image href>` references,
//! and spine items that are themselves images count directly. Books with no
//! such references fall back to every image in the container.

use super::zip::{map_zip_error, open_archive, read_entry};
use super::{is_page_entry, sort_naturally, write_entry, ArchiveBackend, EntryListing, Password};
use crate::error::{ComicError, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Backend for EPUB books whose pages are images.
pub struct EpubBackend;

struct ManifestItem {
    href: String,
    media_type: String,
}

fn image_reference_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r#"(?is)<(?:img\b[^>]*?\bsrc|image\b[^>]*?\b(?:xlink:)?href)\s*=\s*["']([^"']+)["']"#,
            )
            .ok()
        })
        .as_ref()
}

fn read_text<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    path: &Path,
    name: &str,
) -> Result<String> {
    let bytes = read_entry(archive, name, None).map_err(|e| match e {
        ZipError::FileNotFound => ComicError::corrupt(path, format!("missing '{}'", name)),
        other => map_zip_error(path, other),
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Locate the package document through `META-INF/container.xml`.
fn package_path<R: Read + Seek>(archive: &mut ZipArchive<R>, path: &Path) -> Result<String> {
    let container = read_text(archive, path, CONTAINER_PATH)?;
    let document =
        roxmltree::Document::parse(&container).map_err(|e| ComicError::corrupt(path, e))?;
    document
        .descendants()
        .find(|n| n.tag_name().name() == "rootfile")
        .and_then(|n| n.attribute("full-path"))
        .map(str::to_string)
        .ok_or_else(|| ComicError::corrupt(path, "container.xml has no rootfile"))
}

/// Spine-ordered page image paths inside the container.
fn spine_images(archive: &mut ZipArchive<BufReader<File>>, path: &Path) -> Result<Vec<String>> {
    let opf_path = package_path(archive, path)?;
    let opf = read_text(archive, path, &opf_path)?;
    let document = roxmltree::Document::parse(&opf).map_err(|e| ComicError::corrupt(path, e))?;

    let mut manifest = HashMap::new();
    for item in document.descendants().filter(|n| n.tag_name().name() == "item") {
        if let (Some(id), Some(href)) = (item.attribute("id"), item.attribute("href")) {
            manifest.insert(
                id.to_string(),
                ManifestItem {
                    href: resolve_href(&opf_path, href),
                    media_type: item.attribute("media-type").unwrap_or_default().to_string(),
                },
            );
        }
    }

    let spine: Vec<&str> = document
        .descendants()
        .filter(|n| n.tag_name().name() == "itemref")
        .filter_map(|n| n.attribute("idref"))
        .collect();

    let mut seen = HashSet::new();
    let mut images = Vec::new();
    for idref in spine {
        let Some(item) = manifest.get(idref) else {
            warn!("{:?}: spine references unknown item '{}'", path, idref);
            continue;
        };
        if item.media_type.starts_with("image/") {
            if seen.insert(item.href.clone()) {
                images.push(item.href.clone());
            }
            continue;
        }
        let chapter = match read_text(archive, path, &item.href) {
            Ok(text) => text,
            Err(e) => {
                warn!("{:?}: skipping chapter '{}': {}", path, item.href, e);
                continue;
            }
        };
        for reference in image_references(&chapter) {
            let resolved = resolve_href(&item.href, &reference);
            if seen.insert(resolved.clone()) {
                images.push(resolved);
            }
        }
    }

    let present: HashSet<&str> = archive.file_names().collect();
    images.retain(|name| present.contains(name.as_str()) && is_page_entry(name));
    Ok(images)
}

/// Image references in a chapter document, in document order.
fn image_references(markup: &str) -> Vec<String> {
    let Some(pattern) = image_reference_pattern() else {
        return Vec::new();
    };
    pattern
        .captures_iter(markup)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|href| !href.is_empty() && !href.contains(':'))
        .collect()
}

/// Resolve an href relative to the document that contains it.
fn resolve_href(current: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or_default();
    let decoded = percent_encoding::percent_decode_str(href).decode_utf8_lossy();
    let joined = if let Some(absolute) = decoded.strip_prefix('/') {
        PathBuf::from(absolute)
    } else {
        let mut base = PathBuf::from(current);
        base.pop();
        base.join(decoded.as_ref())
    };

    let mut parts: Vec<String> = Vec::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => {}
        }
    }
    parts.join("/")
}

fn all_images(archive: &ZipArchive<BufReader<File>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|name| is_page_entry(name))
        .map(str::to_string)
        .collect();
    sort_naturally(&mut names);
    names
}

fn page_entries(path: &Path) -> Result<(ZipArchive<BufReader<File>>, Vec<String>)> {
    let mut archive = open_archive(path)?;
    let mut pages = spine_images(&mut archive, path)?;
    if pages.is_empty() {
        debug!("{:?}: no spine images, using every image in the book", path);
        pages = all_images(&archive);
    }
    Ok((archive, pages))
}

impl ArchiveBackend for EpubBackend {
    fn name(&self) -> &str {
        "epub"
    }

    fn list_page_entries(&self, path: &Path, _password: &Password) -> Result<EntryListing> {
        let (_, pages) = page_entries(path)?;
        debug!("{:?}: {} page images", path, pages.len());
        Ok(EntryListing::open(pages))
    }

    fn extract_entry(&self, path: &Path, entry: &str, password: &Password) -> Result<Vec<u8>> {
        let mut archive = open_archive(path)?;
        read_entry(&mut archive, entry, password.as_str()).map_err(|e| match e {
            ZipError::FileNotFound => ComicError::EntryNotFound {
                path: path.to_path_buf(),
                entry: entry.to_string(),
            },
            other => map_zip_error(path, other),
        })
    }

    fn extract_all(&self, path: &Path, dest: &Path, password: &Password) -> Result<usize> {
        let (mut archive, pages) = page_entries(path)?;
        for (index, name) in pages.iter().enumerate() {
            let data = read_entry(&mut archive, name, password.as_str())
                .map_err(|e| map_zip_error(path, e))?;
            let file_name = name.rsplit('/').next().unwrap_or(name);
            write_entry(path, dest, &format!("{:04}_{}", index + 1, file_name), &data)?;
        }
        Ok(pages.len())
    }
}
