//! Error types for comic archive access and conversion.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the comic-core library.
#[derive(Error, Debug)]
pub enum ComicError {
    /// The container is encrypted and no password, or a wrong one, was supplied.
    #[error("Password required for '{0}'")]
    PasswordRequired(PathBuf),

    /// The container uses an encryption scheme the archive stack cannot decode.
    #[error("Unsupported encryption in '{path}': {scheme}")]
    UnsupportedEncryption { path: PathBuf, scheme: String },

    /// The container could not be opened or parsed.
    #[error("Cannot read '{path}': {message}")]
    CorruptOrUnreadable { path: PathBuf, message: String },

    /// The path is not a recognized comic or e-book format.
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(PathBuf),

    /// A page entry was requested that the container does not hold.
    #[error("Entry '{entry}' not found in '{path}'")]
    EntryNotFound { path: PathBuf, entry: String },

    /// Extracting entries to disk failed.
    #[error("Extraction failed for '{path}': {message}")]
    ExtractionFailed { path: PathBuf, message: String },

    /// Re-encoding or packing failed.
    #[error("Conversion failed for '{path}': {message}")]
    ConversionFailed { path: PathBuf, message: String },

    /// The running job was canceled.
    #[error("Operation canceled")]
    Canceled,

    /// A conversion job is already running on this converter.
    #[error("A conversion job is already running")]
    JobAlreadyRunning,

    /// PDF rendering failed.
    #[error("PDF rendering failed: {0}")]
    PdfRenderError(String),

    /// Pdfium library error.
    #[error("Pdfium error: {0}")]
    PdfiumError(String),

    /// PNG encoding failed.
    #[error("PNG encoding failed: {0}")]
    PngEncodingError(String),

    /// Image decoding or encoding failed.
    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Channel communication error.
    #[error("Internal channel error: {0}")]
    ChannelError(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComicError {
    /// Whether the caller can recover by prompting for a password and retrying.
    pub fn is_password_required(&self) -> bool {
        matches!(self, ComicError::PasswordRequired(_))
    }

    pub(crate) fn corrupt(path: &std::path::Path, message: impl ToString) -> Self {
        ComicError::CorruptOrUnreadable {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }

    pub(crate) fn extraction(path: &std::path::Path, message: impl ToString) -> Self {
        ComicError::ExtractionFailed {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }

    pub(crate) fn conversion(path: &std::path::Path, message: impl ToString) -> Self {
        ComicError::ConversionFailed {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, ComicError>;

impl From<async_channel::RecvError> for ComicError {
    fn from(_: async_channel::RecvError) -> Self {
        ComicError::ChannelError("Channel closed".to_string())
    }
}

impl<T> From<async_channel::SendError<T>> for ComicError {
    fn from(_: async_channel::SendError<T>) -> Self {
        ComicError::ChannelError("Channel closed".to_string())
    }
}

impl From<tokio::task::JoinError> for ComicError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            ComicError::Canceled
        } else {
            ComicError::ChannelError(format!("Blocking task panicked: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_password_required() {
        let err = ComicError::PasswordRequired(PathBuf::from("/comics/locked.cbz"));
        let msg = format!("{}", err);
        assert!(msg.contains("Password required"));
        assert!(msg.contains("/comics/locked.cbz"));
    }

    #[test]
    fn test_error_display_unsupported_encryption() {
        let err = ComicError::UnsupportedEncryption {
            path: PathBuf::from("aes.cbz"),
            scheme: "AES".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("aes.cbz"));
        assert!(msg.contains("AES"));
    }

    #[test]
    fn test_error_display_corrupt() {
        let err = ComicError::corrupt(std::path::Path::new("broken.cbr"), "bad header");
        let msg = format!("{}", err);
        assert!(msg.contains("broken.cbr"));
        assert!(msg.contains("bad header"));
    }

    #[test]
    fn test_error_display_entry_not_found() {
        let err = ComicError::EntryNotFound {
            path: PathBuf::from("book.cbz"),
            entry: "p10.jpg".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("p10.jpg"));
        assert!(msg.contains("book.cbz"));
    }

    #[test]
    fn test_error_display_invalid_config() {
        let err = ComicError::InvalidConfig("scale must be between 25 and 400".to_string());
        let msg = format!("{}", err);
        assert!(msg.contains("scale must be between 25 and 400"));
    }

    #[test]
    fn test_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ComicError = io_err.into();
        assert!(matches!(err, ComicError::Io(_)));
    }

    #[test]
    fn test_error_from_recv_error() {
        let recv_err = async_channel::RecvError;
        let err: ComicError = recv_err.into();
        match err {
            ComicError::ChannelError(msg) => {
                assert!(msg.contains("closed"));
            }
            _ => panic!("Expected ChannelError"),
        }
    }

    #[test]
    fn test_is_password_required() {
        assert!(ComicError::PasswordRequired(PathBuf::from("a.cbz")).is_password_required());
        assert!(!ComicError::Canceled.is_password_required());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);

        fn returns_error() -> Result<i32> {
            Err(ComicError::JobAlreadyRunning)
        }
        assert!(returns_error().is_err());
    }
}
