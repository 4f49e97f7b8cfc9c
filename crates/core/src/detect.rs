//! File kind detection from directories, magic bytes and extensions.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Page image extensions recognized inside containers and folders.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "avif"];

/// Bytes sniffed from the head of a file. `%PDF-` may appear anywhere in this window.
const SNIFF_LEN: u64 = 1024;

const EPUB_MIMETYPE: &[u8] = b"mimetypeapplication/epub+zip";

/// Kind of source a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// A single image file.
    Image,
    /// A directory of images.
    ImageFolder,
    /// ZIP / CBZ archive.
    Zip,
    /// RAR / CBR archive.
    Rar,
    /// 7z / CB7 archive.
    SevenZip,
    /// EPUB book.
    Epub,
    /// PDF document.
    Pdf,
}

impl FileKind {
    /// Kinds that hold several pages in one file.
    pub fn is_container(&self) -> bool {
        !matches!(self, FileKind::Image | FileKind::ImageFolder)
    }

    /// Kind implied by a file extension alone.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        match ext.as_str() {
            "cbz" | "zip" => Some(FileKind::Zip),
            "cbr" | "rar" => Some(FileKind::Rar),
            "cb7" | "7z" => Some(FileKind::SevenZip),
            "epub" => Some(FileKind::Epub),
            "pdf" => Some(FileKind::Pdf),
            _ if is_image_extension(&ext) => Some(FileKind::Image),
            _ => None,
        }
    }
}

/// Classify a path. Directories win, then magic bytes, then the extension.
///
/// Never fails: unreadable or unrecognized paths yield `None`.
pub fn detect_kind(path: &Path) -> Option<FileKind> {
    if path.is_dir() {
        return Some(FileKind::ImageFolder);
    }

    let extension_kind = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(FileKind::from_extension);

    let head = match read_head(path) {
        Some(head) => head,
        None => {
            debug!("Cannot read {:?}, not a known kind", path);
            return None;
        }
    };

    match detect_from_bytes(&head) {
        Some(FileKind::Zip) if extension_kind == Some(FileKind::Epub) => Some(FileKind::Epub),
        Some(kind) => Some(kind),
        None => extension_kind,
    }
}

/// Classify the leading bytes of a file.
pub fn detect_from_bytes(data: &[u8]) -> Option<FileKind> {
    match data {
        [0x50, 0x4B, 0x03, 0x04, ..] | [0x50, 0x4B, 0x05, 0x06, ..] | [0x50, 0x4B, 0x07, 0x08, ..] => {
            if data.len() >= 30 + EPUB_MIMETYPE.len() && data[30..].starts_with(EPUB_MIMETYPE) {
                Some(FileKind::Epub)
            } else {
                Some(FileKind::Zip)
            }
        }
        [b'R', b'a', b'r', b'!', 0x1A, 0x07, ..] => Some(FileKind::Rar),
        [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, ..] => Some(FileKind::SevenZip),
        _ if sniff_image_mime(data).is_some() => Some(FileKind::Image),
        _ if contains(data, b"%PDF-") => Some(FileKind::Pdf),
        _ => None,
    }
}

/// MIME type of an encoded image, from its signature.
pub fn sniff_image_mime(data: &[u8]) -> Option<&'static str> {
    match data {
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some("image/png"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [b'B', b'M', ..] if data.len() >= 14 => Some("image/bmp"),
        [_, _, _, _, b'f', b't', b'y', b'p', b'a', b'v', b'i', b'f' | b's', ..] => {
            Some("image/avif")
        }
        _ => None,
    }
}

/// MIME type implied by an image file name.
pub fn mime_from_name(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "avif" => Some("image/avif"),
        _ => None,
    }
}

/// Check if a file extension is a page image extension.
pub fn is_image_extension(ext: &str) -> bool {
    IMAGE_EXTENSIONS.iter().any(|&e| e.eq_ignore_ascii_case(ext))
}

/// Whether an entry or file name looks like a page image.
pub fn is_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(is_image_extension)
        .unwrap_or(false)
}

fn read_head(path: &Path) -> Option<Vec<u8>> {
    let file = File::open(path).ok()?;
    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    file.take(SNIFF_LEN).read_to_end(&mut head).ok()?;
    Some(head)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detect_zip_bytes() {
        let header = [0x50, 0x4B, 0x03, 0x04, 0x14, 0x00, 0x00, 0x00];
        assert_eq!(detect_from_bytes(&header), Some(FileKind::Zip));
    }

    #[test]
    fn test_detect_epub_bytes() {
        let mut header = vec![0x50, 0x4B, 0x03, 0x04];
        header.resize(30, 0);
        header.extend_from_slice(EPUB_MIMETYPE);
        assert_eq!(detect_from_bytes(&header), Some(FileKind::Epub));
    }

    #[test]
    fn test_detect_rar_bytes() {
        let rar4 = b"Rar!\x1A\x07\x00\xCF";
        let rar5 = b"Rar!\x1A\x07\x01\x00";
        assert_eq!(detect_from_bytes(rar4), Some(FileKind::Rar));
        assert_eq!(detect_from_bytes(rar5), Some(FileKind::Rar));
    }

    #[test]
    fn test_detect_sevenzip_bytes() {
        let header = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00, 0x04];
        assert_eq!(detect_from_bytes(&header), Some(FileKind::SevenZip));
    }

    #[test]
    fn test_detect_pdf_with_leading_garbage() {
        let mut data = vec![0u8; 100];
        data.extend_from_slice(b"%PDF-1.7\n");
        assert_eq!(detect_from_bytes(&data), Some(FileKind::Pdf));
    }

    #[test]
    fn test_sniff_image_mime() {
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(
            sniff_image_mime(b"\x89PNG\r\n\x1a\n\0\0"),
            Some("image/png")
        );
        assert_eq!(sniff_image_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_image_mime(b"\0\0\0\x1cftypavif"), Some("image/avif"));
        assert_eq!(sniff_image_mime(b"hello"), None);
    }

    #[test]
    fn test_detect_unknown_bytes() {
        assert_eq!(detect_from_bytes(b"just some text"), None);
        assert_eq!(detect_from_bytes(&[]), None);
    }

    #[test]
    fn test_detect_directory_is_image_folder() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_kind(dir.path()), Some(FileKind::ImageFolder));
    }

    #[test]
    fn test_detect_falls_back_to_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.cbr");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(detect_kind(&path), Some(FileKind::Rar));
    }

    #[test]
    fn test_magic_bytes_win_over_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mislabeled.cbr");
        std::fs::write(&path, [0x50, 0x4B, 0x03, 0x04, 0, 0, 0, 0]).unwrap();
        assert_eq!(detect_kind(&path), Some(FileKind::Zip));
    }

    #[test]
    fn test_detect_missing_file_is_none() {
        assert_eq!(detect_kind(Path::new("/nonexistent/book.cbz")), None);
    }

    #[test]
    fn test_detect_unknown_extension_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"plain text").unwrap();
        assert_eq!(detect_kind(&path), None);
    }

    #[test]
    fn test_is_image_name() {
        assert!(is_image_name("page01.JPG"));
        assert!(is_image_name("dir/p2.webp"));
        assert!(!is_image_name("ComicInfo.xml"));
        assert!(!is_image_name("folder/"));
    }

    #[test]
    fn test_from_extension() {
        assert_eq!(FileKind::from_extension("CB7"), Some(FileKind::SevenZip));
        assert_eq!(FileKind::from_extension("avif"), Some(FileKind::Image));
        assert_eq!(FileKind::from_extension("doc"), None);
        assert!(FileKind::Zip.is_container());
        assert!(!FileKind::ImageFolder.is_container());
    }
}
