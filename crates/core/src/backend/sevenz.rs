//! 7z / CB7 backend.
//!
//! 7z archives are often solid, so reading one entry decodes everything that
//! precedes it in its block. Pages are still served one by one for browsing.

use super::{
    is_page_entry, normalize_entry_name, sort_naturally, write_entry, ArchiveBackend,
    EntryListing, Password,
};
use crate::error::{ComicError, Result};
use sevenz_rust::{Error as SevenZError, Password as SevenZPassword, SevenZReader};
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Backend for 7z and CB7 archives.
pub struct SevenZipBackend;

fn to_sevenz_password(password: &Password) -> SevenZPassword {
    password
        .as_str()
        .map(SevenZPassword::from)
        .unwrap_or_else(SevenZPassword::empty)
}

fn map_sevenz_error(path: &Path, error: SevenZError) -> ComicError {
    match error {
        SevenZError::PasswordRequired | SevenZError::MaybeBadPassword(_) => {
            ComicError::PasswordRequired(path.to_path_buf())
        }
        other => ComicError::corrupt(path, other),
    }
}

/// Open the archive. With encrypted headers a wrong password surfaces as
/// garbage while decoding them, so a failed open is retried without one to
/// tell a bad password from a broken archive.
fn open_reader(path: &Path, password: &Password) -> Result<SevenZReader<File>> {
    match SevenZReader::open(path, to_sevenz_password(password)) {
        Ok(reader) => Ok(reader),
        Err(e) if password.is_set() => match SevenZReader::open(path, SevenZPassword::empty()) {
            Err(SevenZError::PasswordRequired) => {
                debug!("Password rejected for encrypted headers of {:?}", path);
                Err(ComicError::PasswordRequired(path.to_path_buf()))
            }
            _ => Err(map_sevenz_error(path, e)),
        },
        Err(e) => Err(map_sevenz_error(path, e)),
    }
}

/// Stream every page entry through `each`, stopping when it returns `false`.
fn for_each_page<F>(path: &Path, password: &Password, mut each: F) -> Result<()>
where
    F: FnMut(&str, Vec<u8>) -> Result<bool>,
{
    let mut reader = open_reader(path, password)?;
    let mut failure = None;
    let outcome = reader.for_each_entries(|entry, data| {
        let name = normalize_entry_name(entry.name());
        if entry.is_directory() || !is_page_entry(&name) {
            std::io::copy(data, &mut std::io::sink())
                .map_err(|e| SevenZError::other(e.to_string()))?;
            return Ok(true);
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        data.read_to_end(&mut bytes)
            .map_err(|e| SevenZError::other(e.to_string()))?;
        match each(&name, bytes) {
            Ok(more) => Ok(more),
            Err(e) => {
                failure = Some(e);
                Ok(false)
            }
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    outcome.map_err(|e| {
        if password.is_set() {
            match e {
                SevenZError::PasswordRequired | SevenZError::MaybeBadPassword(_) => {
                    ComicError::PasswordRequired(path.to_path_buf())
                }
                other => ComicError::extraction(path, other),
            }
        } else {
            map_sevenz_error(path, e)
        }
    })
}

impl ArchiveBackend for SevenZipBackend {
    fn name(&self) -> &str {
        "7z"
    }

    fn list_page_entries(&self, path: &Path, password: &Password) -> Result<EntryListing> {
        let reader = match open_reader(path, password) {
            Ok(reader) => reader,
            // Encrypted headers hide the entry names until unlocked.
            Err(ComicError::PasswordRequired(_)) if !password.is_set() => {
                return Ok(EntryListing {
                    entries: Vec::new(),
                    password_required: true,
                })
            }
            Err(e) => return Err(e),
        };
        let mut entries: Vec<String> = reader
            .archive()
            .files
            .iter()
            .filter(|entry| !entry.is_directory())
            .map(|entry| normalize_entry_name(entry.name()))
            .filter(|name| is_page_entry(name))
            .collect();
        sort_naturally(&mut entries);
        debug!("{:?}: {} page entries", path, entries.len());

        // Content-only encryption lists fine; decoding one page tells.
        match for_each_page(path, password, |_, _| Ok(false)) {
            Ok(()) => Ok(EntryListing::open(entries)),
            Err(ComicError::PasswordRequired(_)) if !password.is_set() => Ok(EntryListing {
                entries,
                password_required: true,
            }),
            Err(e) => Err(e),
        }
    }

    fn extract_entry(&self, path: &Path, entry: &str, password: &Password) -> Result<Vec<u8>> {
        let target = normalize_entry_name(entry);
        let mut found = None;
        for_each_page(path, password, |name, bytes| {
            if name == target {
                found = Some(bytes);
                Ok(false)
            } else {
                Ok(true)
            }
        })?;
        found.ok_or_else(|| ComicError::EntryNotFound {
            path: path.to_path_buf(),
            entry: entry.to_string(),
        })
    }

    fn extract_all(&self, path: &Path, dest: &Path, password: &Password) -> Result<usize> {
        let mut count = 0;
        for_each_page(path, password, |name, bytes| {
            write_entry(path, dest, name, &bytes)?;
            count += 1;
            Ok(true)
        })?;
        Ok(count)
    }
}
