//! RAR / CBR backend on top of the unrar library.

use super::{
    is_page_entry, normalize_entry_name, password_check_entry, sort_naturally, write_entry,
    ArchiveBackend, EntryListing, Password,
};
use crate::error::{ComicError, Result};
use std::collections::HashSet;
use std::fmt::Display;
use std::path::Path;
use tracing::debug;
use unrar::Archive;

/// Backend for RAR and CBR archives.
pub struct RarBackend;

/// How an unrar failure should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RarFailure {
    Password,
    Corrupt,
}

fn classify(error: &impl Display) -> RarFailure {
    let msg = error.to_string();
    let password_markers = ["MissingPassword", "BadPassword", "ERAR_BAD_PASSWORD", "password"];
    if password_markers.iter().any(|m| msg.contains(m)) {
        RarFailure::Password
    } else {
        RarFailure::Corrupt
    }
}

fn map_rar_error(path: &Path, error: impl Display) -> ComicError {
    match classify(&error) {
        RarFailure::Password => ComicError::PasswordRequired(path.to_path_buf()),
        RarFailure::Corrupt => ComicError::corrupt(path, error),
    }
}

fn archive<'a>(path: &'a Path, password: &'a Password) -> Archive<'a> {
    match password.as_str() {
        Some(secret) => Archive::with_password(path, secret),
        None => Archive::new(path),
    }
}

impl RarBackend {
    /// Walk the archive in order. For each page entry `visit` is called with
    /// `None` to decide whether to read it, then with the bytes once read.
    fn process<F>(&self, path: &Path, password: &Password, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, Option<Vec<u8>>) -> Result<Step>,
    {
        let mut cursor = archive(path, password)
            .open_for_processing()
            .map_err(|e| map_rar_error(path, e))?;

        loop {
            let header = match cursor.read_header().map_err(|e| map_rar_error(path, e))? {
                Some(header) => header,
                None => return Ok(()),
            };
            let name = normalize_entry_name(&header.entry().filename.to_string_lossy());
            let wanted = !header.entry().is_directory() && is_page_entry(&name);

            if !wanted {
                cursor = header.skip().map_err(|e| map_rar_error(path, e))?;
                continue;
            }

            match visit(&name, None)? {
                Step::Skip => {
                    cursor = header.skip().map_err(|e| map_rar_error(path, e))?;
                }
                Step::Read => {
                    let (data, next) = header.read().map_err(|e| {
                        // A wrong password on RAR4 surfaces as a CRC failure.
                        if password.is_set() {
                            ComicError::PasswordRequired(path.to_path_buf())
                        } else {
                            map_rar_error(path, e)
                        }
                    })?;
                    if let Step::Stop = visit(&name, Some(data))? {
                        return Ok(());
                    }
                    cursor = next;
                }
                Step::Stop => return Ok(()),
            }
        }
    }
}

/// Decision returned by the visitor of [`RarBackend::process`].
enum Step {
    Skip,
    Read,
    Stop,
}

impl ArchiveBackend for RarBackend {
    fn name(&self) -> &str {
        "rar"
    }

    fn list_page_entries(&self, path: &Path, password: &Password) -> Result<EntryListing> {
        let listing = archive(path, password)
            .open_for_listing()
            .map_err(|e| map_rar_error(path, e))?;

        let mut entries = Vec::new();
        let mut encrypted = HashSet::new();
        for header in listing {
            let header = header.map_err(|e| map_rar_error(path, e))?;
            let name = normalize_entry_name(&header.filename.to_string_lossy());
            if !header.is_directory() && is_page_entry(&name) {
                if header.is_encrypted() {
                    encrypted.insert(name.clone());
                }
                entries.push(name);
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
        if !password.is_set() {
            return Ok(EntryListing {
                entries,
                password_required: true,
            });
        }

        // Decode the first encrypted page to prove the password.
        let mut verified = false;
        self.process(path, password, |name, data| match data {
            None if name == check => Ok(Step::Read),
            None => Ok(Step::Skip),
            Some(_) => {
                verified = true;
                Ok(Step::Stop)
            }
        })
        .map_err(|_| ComicError::PasswordRequired(path.to_path_buf()))?;
        if !verified {
            return Err(ComicError::PasswordRequired(path.to_path_buf()));
        }
        Ok(EntryListing::open(entries))
    }

    fn extract_entry(&self, path: &Path, entry: &str, password: &Password) -> Result<Vec<u8>> {
        let target = normalize_entry_name(entry);
        let mut found = None;
        self.process(path, password, |name, data| match data {
            None if name == target => Ok(Step::Read),
            None => Ok(Step::Skip),
            Some(bytes) => {
                found = Some(bytes);
                Ok(Step::Stop)
            }
        })?;
        found.ok_or_else(|| ComicError::EntryNotFound {
            path: path.to_path_buf(),
            entry: entry.to_string(),
        })
    }

    fn extract_all(&self, path: &Path, dest: &Path, password: &Password) -> Result<usize> {
        let mut count = 0;
        self.process(path, password, |name, data| match data {
            None => Ok(Step::Read),
            Some(bytes) => {
                write_entry(path, dest, name, &bytes)?;
                count += 1;
                Ok(Step::Read)
            }
        })?;
        Ok(count)
    }
}
