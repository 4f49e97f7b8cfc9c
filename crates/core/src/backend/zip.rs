//! ZIP / CBZ backend.
//!
//! The zip stack decodes ZipCrypto only. AES entries are found by scanning the
//! central directory before the archive is opened, so AES archives are reported
//! as `UnsupportedEncryption` whatever password is supplied.

use super::{
    is_page_entry, password_check_entry, sort_naturally, write_entry, ArchiveBackend,
    EntryListing, Password,
};
use crate::error::{ComicError, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
const ZIP64_EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x06, 0x06];
const ZIP64_LOCATOR_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x06, 0x07];
const ZIP64_LOCATOR_LEN: usize = 20;
const ZIP64_EOCD_LEN: usize = 56;
const CENTRAL_HEADER_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];
const EOCD_MIN_LEN: usize = 22;
const EOCD_SEARCH_LEN: u64 = 0xFFFF + EOCD_MIN_LEN as u64;
const CENTRAL_HEADER_LEN: usize = 46;
const METHOD_AES: u16 = 99;

/// Encryption used by the entries of a zip file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZipEncryption {
    None,
    ZipCrypto,
    Aes,
}

/// Backend for ZIP and CBZ archives.
pub struct ZipBackend;

impl ArchiveBackend for ZipBackend {
    fn name(&self) -> &str {
        "zip"
    }

    fn list_page_entries(&self, path: &Path, password: &Password) -> Result<EntryListing> {
        reject_aes(path)?;
        let mut archive = open_archive(path)?;

        let mut entries = Vec::new();
        let mut encrypted = HashSet::new();
        for index in 0..archive.len() {
            let file = archive
                .by_index_raw(index)
                .map_err(|e| map_zip_error(path, e))?;
            if is_page_entry(file.name()) {
                if file.encrypted() {
                    encrypted.insert(file.name().to_string());
                }
                entries.push(file.name().to_string());
            }
        }
        sort_naturally(&mut entries);
        debug!(
            "{:?}: {} page entries, {} encrypted",
            path,
            entries.len(),
            encrypted.len()
        );

        let Some(check) = password_check_entry(&entries, &encrypted).map(str::to_string) else {
            return Ok(EntryListing::open(entries));
        };

        match password.as_str() {
            None => Ok(EntryListing {
                entries,
                password_required: true,
            }),
            Some(secret) => {
                // The ZipCrypto header check passes for roughly 1 in 256 wrong
                // passwords, so a full decode of one entry is the real test.
                read_entry(&mut archive, &check, Some(secret)).map_err(|e| {
                    debug!("Password check on {:?}/{} failed: {}", path, check, e);
                    ComicError::PasswordRequired(path.to_path_buf())
                })?;
                Ok(EntryListing::open(entries))
            }
        }
    }

    fn extract_entry(&self, path: &Path, entry: &str, password: &Password) -> Result<Vec<u8>> {
        reject_aes(path)?;
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
        reject_aes(path)?;
        let mut archive = open_archive(path)?;
        let names: Vec<String> = archive
            .file_names()
            .filter(|name| is_page_entry(name))
            .map(str::to_string)
            .collect();

        for name in &names {
            let data = read_entry(&mut archive, name, password.as_str())
                .map_err(|e| map_zip_error(path, e))?;
            write_entry(path, dest, name, &data)?;
        }
        Ok(names.len())
    }
}

pub(super) fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(path).map_err(|e| ComicError::corrupt(path, e))?;
    ZipArchive::new(BufReader::new(file)).map_err(|e| map_zip_error(path, e))
}

pub(super) fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
    password: Option<&str>,
) -> std::result::Result<Vec<u8>, ZipError> {
    let mut file = match password {
        Some(secret) => archive.by_name_decrypt(name, secret.as_bytes())?,
        None => archive.by_name(name)?,
    };
    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;
    Ok(data)
}

pub(super) fn map_zip_error(path: &Path, error: ZipError) -> ComicError {
    match error {
        ZipError::InvalidPassword => ComicError::PasswordRequired(path.to_path_buf()),
        ZipError::UnsupportedArchive(msg) if msg == ZipError::PASSWORD_REQUIRED => {
            ComicError::PasswordRequired(path.to_path_buf())
        }
        ZipError::UnsupportedArchive(msg) if msg.contains("AES") => {
            ComicError::UnsupportedEncryption {
                path: path.to_path_buf(),
                scheme: "AES".to_string(),
            }
        }
        other => ComicError::corrupt(path, other),
    }
}

fn reject_aes(path: &Path) -> Result<()> {
    match scan_encryption(path) {
        Ok(ZipEncryption::Aes) => Err(ComicError::UnsupportedEncryption {
            path: path.to_path_buf(),
            scheme: "AES".to_string(),
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("Cannot scan central directory of {:?}: {}", path, e);
            Ok(())
        }
    }
}

/// Read the central directory and report the strongest encryption in use.
///
/// Zip64 directories are located through the Zip64 end record. Files without
/// a readable directory report `None`; the zip crate then decides how to
/// handle them.
pub(crate) fn scan_encryption(path: &Path) -> std::io::Result<ZipEncryption> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let tail_len = len.min(EOCD_SEARCH_LEN);
    let tail_start = len - tail_len;
    file.seek(SeekFrom::Start(tail_start))?;
    let mut tail = vec![0u8; tail_len as usize];
    file.read_exact(&mut tail)?;

    let Some(eocd) = tail.windows(4).rposition(|w| w == EOCD_SIGNATURE) else {
        return Ok(ZipEncryption::None);
    };
    let record = &tail[eocd..];
    if record.len() < EOCD_MIN_LEN {
        return Ok(ZipEncryption::None);
    }
    let mut cd_size = u64::from(read_u32(record, 12));
    let mut cd_offset = u64::from(read_u32(record, 16));
    if cd_size == u64::from(u32::MAX) || cd_offset == u64::from(u32::MAX) {
        match zip64_directory(&mut file, &tail, tail_start, eocd)? {
            Some((size, offset)) => {
                cd_size = size;
                cd_offset = offset;
            }
            None => return Ok(ZipEncryption::None),
        }
    }
    if cd_offset.saturating_add(cd_size) > len {
        return Ok(ZipEncryption::None);
    }

    file.seek(SeekFrom::Start(cd_offset))?;
    let mut directory = vec![0u8; cd_size as usize];
    file.read_exact(&mut directory)?;
    Ok(scan_central_directory(&directory))
}

/// `(size, offset)` of the central directory from the Zip64 end record that
/// the locator before the classic end record points at.
fn zip64_directory(
    file: &mut File,
    tail: &[u8],
    tail_start: u64,
    eocd: usize,
) -> std::io::Result<Option<(u64, u64)>> {
    let Some(locator) = eocd
        .checked_sub(ZIP64_LOCATOR_LEN)
        .map(|at| &tail[at..eocd])
        .filter(|l| l[..4] == ZIP64_LOCATOR_SIGNATURE)
    else {
        return Ok(None);
    };
    let record_offset = read_u64(locator, 8);
    if record_offset >= tail_start + eocd as u64 {
        return Ok(None);
    }

    file.seek(SeekFrom::Start(record_offset))?;
    let mut record = [0u8; ZIP64_EOCD_LEN];
    file.read_exact(&mut record)?;
    if record[..4] != ZIP64_EOCD_SIGNATURE {
        return Ok(None);
    }
    Ok(Some((read_u64(&record, 40), read_u64(&record, 48))))
}

fn scan_central_directory(directory: &[u8]) -> ZipEncryption {
    let mut found = ZipEncryption::None;
    let mut pos = 0;
    while pos + CENTRAL_HEADER_LEN <= directory.len()
        && directory[pos..pos + 4] == CENTRAL_HEADER_SIGNATURE
    {
        let flags = read_u16(directory, pos + 8);
        let method = read_u16(directory, pos + 10);
        if flags & 1 != 0 {
            if method == METHOD_AES {
                return ZipEncryption::Aes;
            }
            found = ZipEncryption::ZipCrypto;
        }
        let name_len = read_u16(directory, pos + 28) as usize;
        let extra_len = read_u16(directory, pos + 30) as usize;
        let comment_len = read_u16(directory, pos + 32) as usize;
        pos += CENTRAL_HEADER_LEN + name_len + extra_len + comment_len;
    }
    found
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        aes_zip64_bytes, aes_zip_bytes, png_bytes, write_encrypted_zip, write_mixed_zip,
        write_zip,
    };
    use tempfile::TempDir;

    #[test]
    fn test_list_filters_and_sorts_naturally() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.cbz");
        write_zip(
            &path,
            &[
                ("p10.jpg", b"x"),
                ("p2.jpg", b"x"),
                ("ComicInfo.xml", b"<ComicInfo/>"),
                ("extras/", b""),
                ("p1.jpg", b"x"),
                ("__MACOSX/._p1.jpg", b"x"),
            ],
        );

        let listing = ZipBackend.list_page_entries(&path, &Password::None).unwrap();
        assert_eq!(listing.entries, vec!["p1.jpg", "p2.jpg", "p10.jpg"]);
        assert!(!listing.password_required);
    }

    #[test]
    fn test_extract_entry_reads_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.cbz");
        let page = png_bytes(4, 4);
        write_zip(&path, &[("a.png", &page)]);

        let data = ZipBackend.extract_entry(&path, "a.png", &Password::None).unwrap();
        assert_eq!(data, page);
    }

    #[test]
    fn test_extract_missing_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.cbz");
        write_zip(&path, &[("a.png", b"x")]);

        let result = ZipBackend.extract_entry(&path, "zzz.png", &Password::None);
        assert!(matches!(result, Err(ComicError::EntryNotFound { .. })));
    }

    #[test]
    fn test_zipcrypto_without_password_flags_listing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.cbz");
        write_encrypted_zip(&path, "secret", &[("p1.jpg", b"page one")]);

        let listing = ZipBackend.list_page_entries(&path, &Password::None).unwrap();
        assert!(listing.password_required);
        assert_eq!(listing.entries, vec!["p1.jpg"]);
    }

    #[test]
    fn test_zipcrypto_wrong_password() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.cbz");
        write_encrypted_zip(&path, "secret", &[("p1.jpg", b"page one")]);

        let result = ZipBackend.list_page_entries(&path, &Password::from("wrong"));
        assert!(matches!(result, Err(ComicError::PasswordRequired(_))));
    }

    #[test]
    fn test_zipcrypto_correct_password() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.cbz");
        write_encrypted_zip(&path, "secret", &[("p2.jpg", b"two"), ("p1.jpg", b"one")]);

        let password = Password::from("secret");
        let listing = ZipBackend.list_page_entries(&path, &password).unwrap();
        assert_eq!(listing.entries, vec!["p1.jpg", "p2.jpg"]);
        assert!(!listing.password_required);

        let data = ZipBackend.extract_entry(&path, "p2.jpg", &password).unwrap();
        assert_eq!(data, b"two");
    }

    #[test]
    fn test_mixed_archive_checks_password_on_encrypted_page() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mixed.cbz");
        write_mixed_zip(
            &path,
            "secret",
            &[("a.jpg", b"cover")],
            &[("b.jpg", b"page two")],
        );

        let listing = ZipBackend.list_page_entries(&path, &Password::None).unwrap();
        assert!(listing.password_required);

        let wrong = ZipBackend.list_page_entries(&path, &Password::from("wrong"));
        assert!(matches!(wrong, Err(ComicError::PasswordRequired(_))), "got {:?}", wrong);

        let password = Password::from("secret");
        let listing = ZipBackend.list_page_entries(&path, &password).unwrap();
        assert_eq!(listing.entries, vec!["a.jpg", "b.jpg"]);
        assert_eq!(
            ZipBackend.extract_entry(&path, "b.jpg", &password).unwrap(),
            b"page two"
        );
    }

    #[test]
    fn test_aes_is_unsupported_regardless_of_password() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aes.cbz");
        std::fs::write(&path, aes_zip_bytes("p1.jpg")).unwrap();

        for password in [Password::None, Password::from("anything")] {
            let result = ZipBackend.list_page_entries(&path, &password);
            assert!(
                matches!(result, Err(ComicError::UnsupportedEncryption { .. })),
                "got {:?}",
                result
            );
        }
    }

    #[test]
    fn test_scan_encryption_kinds() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain.zip");
        write_zip(&plain, &[("a.jpg", b"x")]);
        let crypto = dir.path().join("crypto.zip");
        write_encrypted_zip(&crypto, "pw", &[("a.jpg", b"x")]);
        let aes = dir.path().join("aes.zip");
        std::fs::write(&aes, aes_zip_bytes("a.jpg")).unwrap();

        assert_eq!(scan_encryption(&plain).unwrap(), ZipEncryption::None);
        assert_eq!(scan_encryption(&crypto).unwrap(), ZipEncryption::ZipCrypto);
        assert_eq!(scan_encryption(&aes).unwrap(), ZipEncryption::Aes);
    }

    #[test]
    fn test_zip64_directory_is_scanned() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aes64.cbz");
        std::fs::write(&path, aes_zip64_bytes("p1.jpg")).unwrap();

        assert_eq!(scan_encryption(&path).unwrap(), ZipEncryption::Aes);
        let result = ZipBackend.list_page_entries(&path, &Password::None);
        assert!(matches!(result, Err(ComicError::UnsupportedEncryption { .. })));
    }

    #[test]
    fn test_aes_read_error_maps_to_unsupported_encryption() {
        let error = ZipError::UnsupportedArchive(
            "AES encrypted files cannot be decrypted without the aes-crypto feature.",
        );
        assert!(matches!(
            map_zip_error(Path::new("x.cbz"), error),
            ComicError::UnsupportedEncryption { .. }
        ));
        assert!(matches!(
            map_zip_error(Path::new("x.cbz"), ZipError::InvalidPassword),
            ComicError::PasswordRequired(_)
        ));
    }

    #[test]
    fn test_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.cbz");
        std::fs::write(&path, b"PK\x03\x04 not really a zip").unwrap();

        let result = ZipBackend.list_page_entries(&path, &Password::None);
        assert!(matches!(result, Err(ComicError::CorruptOrUnreadable { .. })));
    }

    #[test]
    fn test_extract_all_writes_pages_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.cbz");
        write_zip(
            &path,
            &[("ch1/p1.jpg", b"1"), ("ch1/p2.jpg", b"2"), ("notes.txt", b"n")],
        );
        let dest = dir.path().join("out");

        let count = ZipBackend.extract_all(&path, &dest, &Password::None).unwrap();
        assert_eq!(count, 2);
        assert_eq!(std::fs::read(dest.join("ch1/p1.jpg")).unwrap(), b"1");
        assert!(!dest.join("notes.txt").exists());
    }
}
